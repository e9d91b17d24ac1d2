//! Shapefile downloads of a department's stations or districts.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};
use shapefile::{Point, Polygon, PolygonRing};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::geometry::{Geometry, Ring, WGS84_PRJ};
use crate::models::{Apparatus, ExportRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryField {
    Stations,
    Districts,
}

impl GeometryField {
    /// Maps the `geometry_field` path segment; `geom` is the station point.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "geom" => Some(GeometryField::Stations),
            "district" => Some(GeometryField::Districts),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            GeometryField::Stations => "stations",
            GeometryField::Districts => "districts",
        }
    }

    fn accepts(self, geometry: &Geometry) -> bool {
        match self {
            GeometryField::Stations => geometry.is_point(),
            GeometryField::Districts => !geometry.is_point(),
        }
    }
}

pub fn export_filename(department_id: i64, slug: &str, field: GeometryField) -> String {
    format!("{department_id}-{slug}-{}", field.tag())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Text(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    fn integer(name: &str) -> Self {
        Column {
            name: name.to_string(),
            kind: ColumnKind::Integer,
        }
    }

    fn text(name: &str, width: u8) -> Self {
        Column {
            name: name.to_string(),
            kind: ColumnKind::Text(width),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffingColumn {
    pub apparatus: Apparatus,
    pub index: usize,
    pub name: String,
}

fn fixed_columns() -> Vec<Column> {
    vec![
        Column::integer("id"),
        Column::text("name", 254),
        Column::integer("department"),
        Column::integer("station_nu"),
        Column::text("address_l1", 100),
        Column::text("address_l2", 100),
        Column::text("city", 50),
        Column::text("state", 40),
        Column::text("zipcode", 10),
        Column::text("country", 2),
    ]
}

/// One column per apparatus unit, sized by the station with the most units
/// of each type. Every type gets at least its base column.
pub fn staffing_columns(rows: &[ExportRow]) -> Vec<StaffingColumn> {
    let mut columns = Vec::new();
    for apparatus in Apparatus::ALL {
        let widest = rows
            .iter()
            .map(|row| {
                row.staffing
                    .iter()
                    .filter(|record| record.apparatus == apparatus)
                    .count()
            })
            .max()
            .unwrap_or(0)
            .max(1);
        for index in 0..widest {
            let alias = apparatus.shapefile_alias();
            let name = if index == 0 {
                alias.to_string()
            } else {
                format!("{alias}_{index}")
            };
            columns.push(StaffingColumn {
                apparatus,
                index,
                name,
            });
        }
    }
    columns
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Integer(Option<i64>),
    Text(Option<String>),
}

impl AttributeValue {
    fn text(value: Option<&String>) -> Self {
        AttributeValue::Text(value.filter(|v| !v.trim().is_empty()).cloned())
    }

    fn into_field_value(self) -> FieldValue {
        match self {
            AttributeValue::Integer(value) => FieldValue::Numeric(value.map(|v| v as f64)),
            AttributeValue::Text(value) => FieldValue::Character(value),
        }
    }
}

/// Attribute values for one station. Staffing columns beyond the station's
/// own unit count are left unset.
pub fn feature_attributes(
    row: &ExportRow,
    staffing: &[StaffingColumn],
) -> BTreeMap<String, AttributeValue> {
    let station = &row.station;
    let address = station.address.clone().unwrap_or_default();
    let mut attributes = BTreeMap::new();
    attributes.insert("id".to_string(), AttributeValue::Integer(Some(station.id)));
    attributes.insert(
        "name".to_string(),
        AttributeValue::text(Some(&station.name)),
    );
    attributes.insert(
        "department".to_string(),
        AttributeValue::Integer(station.department_id),
    );
    attributes.insert(
        "station_nu".to_string(),
        AttributeValue::Integer(station.station_number.map(i64::from)),
    );
    attributes.insert(
        "address_l1".to_string(),
        AttributeValue::text(address.address_line1.as_ref()),
    );
    attributes.insert(
        "address_l2".to_string(),
        AttributeValue::text(address.address_line2.as_ref()),
    );
    attributes.insert("city".to_string(), AttributeValue::text(address.city.as_ref()));
    attributes.insert(
        "state".to_string(),
        AttributeValue::text(address.state_province.as_ref()),
    );
    attributes.insert(
        "zipcode".to_string(),
        AttributeValue::text(address.postal_code.as_ref()),
    );
    attributes.insert(
        "country".to_string(),
        AttributeValue::text(address.country.as_ref()),
    );

    for column in staffing {
        let personnel = row
            .staffing
            .iter()
            .filter(|record| record.apparatus == column.apparatus)
            .nth(column.index)
            .and_then(|record| record.personnel)
            .map(i64::from);
        attributes.insert(column.name.clone(), AttributeValue::Integer(personnel));
    }

    attributes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Remove the working directory right away and the archive after
    /// `retention`.
    Deferred { retention: Duration },
    /// Leave files in place, as test runs do.
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub work_dir: PathBuf,
    pub archive: PathBuf,
    pub features_written: usize,
}

#[derive(Debug, Clone)]
pub struct ShapefileExporter {
    output_dir: PathBuf,
    work_root: PathBuf,
}

impl ShapefileExporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            work_root: std::env::temp_dir(),
        }
    }

    /// Parent of the per-export working directories.
    pub fn with_work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
        self.work_root = work_root.into();
        self
    }

    /// Writes `rows` as a WGS84 shapefile layer and zips it into the output
    /// directory. Blocking; run it off the async executor.
    ///
    /// The working directory is removed when any step fails; on success it
    /// is handed to the caller inside the artifact.
    pub fn export(
        &self,
        rows: &[ExportRow],
        field: GeometryField,
        filename: &str,
    ) -> anyhow::Result<ExportArtifact> {
        let work = tempfile::Builder::new()
            .prefix("firecares-export-")
            .tempdir_in(&self.work_root)
            .context("failed to create export working directory")?;
        let layer_dir = work.path().join(filename);
        fs::create_dir_all(&layer_dir)
            .with_context(|| format!("failed to create {}", layer_dir.display()))?;

        let staffing = staffing_columns(rows);
        let mut columns = fixed_columns();
        columns.extend(staffing.iter().map(|column| Column::integer(&column.name)));

        let mut table = TableWriterBuilder::new();
        for column in &columns {
            let name = FieldName::try_from(column.name.as_str())
                .map_err(|err| anyhow!("invalid shapefile column {}: {err:?}", column.name))?;
            table = match column.kind {
                ColumnKind::Integer => table.add_numeric_field(name, 10, 0),
                ColumnKind::Text(width) => table.add_character_field(name, width),
            };
        }

        let shp_path = layer_dir.join(format!("{filename}.shp"));
        let mut writer = shapefile::Writer::from_path(&shp_path, table)
            .with_context(|| format!("failed to create {}", shp_path.display()))?;

        let mut features_written = 0usize;
        for row in rows {
            let Some(geometry) = row.geometry.as_ref() else {
                continue;
            };
            if !field.accepts(geometry) {
                tracing::warn!(station_id = row.station.id, "skipping geometry of unexpected type");
                continue;
            }

            let mut record = Record::default();
            for (name, value) in feature_attributes(row, &staffing) {
                record.insert(name, value.into_field_value());
            }

            match geometry {
                Geometry::Point([x, y]) => writer.write_shape_and_record(&Point::new(*x, *y), &record),
                other => writer.write_shape_and_record(&to_polygon(other), &record),
            }
            .with_context(|| format!("failed to write station {}", row.station.id))?;
            features_written += 1;
        }
        drop(writer);

        fs::write(layer_dir.join(format!("{filename}.prj")), WGS84_PRJ)
            .context("failed to write projection file")?;

        let archive = self.archive_path(filename);
        if let Err(err) = zip_directory(&layer_dir, &archive) {
            let _ = fs::remove_file(&archive);
            return Err(err);
        }

        tracing::info!(
            archive = %archive.display(),
            features = features_written,
            columns = columns.len(),
            "shapefile export written"
        );

        Ok(ExportArtifact {
            work_dir: work.keep(),
            archive,
            features_written,
        })
    }

    /// `{output_dir}/{filename}.zip`, with a short random suffix when an
    /// earlier export still occupies that name.
    fn archive_path(&self, filename: &str) -> PathBuf {
        let candidate = self.output_dir.join(format!("{filename}.zip"));
        if !candidate.exists() {
            return candidate;
        }
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(5).collect();
        self.output_dir.join(format!("{filename}-{suffix}.zip"))
    }
}

fn to_polygon(geometry: &Geometry) -> Polygon {
    let rings = geometry
        .polygons()
        .into_iter()
        .flat_map(|polygon| {
            polygon.into_iter().enumerate().map(|(index, ring)| {
                let points = ring_points(&ring);
                if index == 0 {
                    PolygonRing::Outer(points)
                } else {
                    PolygonRing::Inner(points)
                }
            })
        })
        .collect();
    Polygon::with_rings(rings)
}

fn ring_points(ring: &Ring) -> Vec<Point> {
    ring.iter().map(|[x, y]| Point::new(*x, *y)).collect()
}

fn zip_directory(dir: &Path, archive: &Path) -> anyhow::Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    let file = File::create(archive)
        .with_context(|| format!("failed to create {}", archive.display()))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in entries {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("non-utf8 file name in {}", dir.display()))?
            .to_string();
        zip.start_file(name, options)?;
        let mut source = File::open(&path)?;
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish().context("failed to finish archive")?;
    Ok(())
}

/// Queues removal of an export's files on the runtime.
pub fn schedule_cleanup(policy: CleanupPolicy, artifact: &ExportArtifact) {
    let CleanupPolicy::Deferred { retention } = policy else {
        return;
    };

    let work_dir = artifact.work_dir.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::fs::remove_dir_all(&work_dir).await {
            tracing::warn!(path = %work_dir.display(), error = %err, "export cleanup failed");
        }
    });

    let archive = artifact.archive.clone();
    tokio::spawn(async move {
        tokio::time::sleep(retention).await;
        if let Err(err) = tokio::fs::remove_file(&archive).await {
            tracing::warn!(path = %archive.display(), error = %err, "archive cleanup failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StaffingRecord, Station, StationAddress};

    fn row(id: i64, geometry: Option<Geometry>, staffing: &[(Apparatus, i32)]) -> ExportRow {
        ExportRow {
            station: Station {
                id,
                department_id: Some(11),
                name: format!("Station {id}"),
                station_number: Some(id as i32),
                address: Some(StationAddress {
                    address_line1: Some("1 Main St".to_string()),
                    city: Some("Fairfax".to_string()),
                    state_province: Some("VA".to_string()),
                    postal_code: Some("22030".to_string()),
                    country: Some("US".to_string()),
                    ..StationAddress::default()
                }),
                ..Station::default()
            },
            geometry,
            staffing: staffing
                .iter()
                .enumerate()
                .map(|(n, (apparatus, personnel))| StaffingRecord {
                    id: id * 100 + n as i64,
                    station_id: id,
                    apparatus: *apparatus,
                    personnel: Some(*personnel),
                })
                .collect(),
        }
    }

    fn engine_batch() -> Vec<ExportRow> {
        vec![
            row(
                1,
                Some(Geometry::Point([-77.3, 38.8])),
                &[(Apparatus::Engine, 4), (Apparatus::Engine, 3), (Apparatus::Engine, 5)],
            ),
            row(2, Some(Geometry::Point([-77.2, 38.9])), &[(Apparatus::Engine, 2)]),
        ]
    }

    #[test]
    fn staffing_columns_follow_the_busiest_station() {
        let columns = staffing_columns(&engine_batch());
        let engine: Vec<&str> = columns
            .iter()
            .filter(|c| c.apparatus == Apparatus::Engine)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(engine, vec!["engine", "engine_1", "engine_2"]);

        let ladder: Vec<&str> = columns
            .iter()
            .filter(|c| c.apparatus == Apparatus::Ladder)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(ladder, vec!["truck"]);
        assert!(columns.iter().all(|c| c.name.len() <= 10));
    }

    #[test]
    fn shorter_stations_leave_trailing_columns_unset() {
        let rows = engine_batch();
        let columns = staffing_columns(&rows);

        let a = feature_attributes(&rows[0], &columns);
        assert_eq!(a["engine"], AttributeValue::Integer(Some(4)));
        assert_eq!(a["engine_2"], AttributeValue::Integer(Some(5)));

        let b = feature_attributes(&rows[1], &columns);
        assert_eq!(b["engine"], AttributeValue::Integer(Some(2)));
        assert_eq!(b["engine_1"], AttributeValue::Integer(None));
        assert_eq!(b["engine_2"], AttributeValue::Integer(None));
        assert_eq!(b["address_l2"], AttributeValue::Text(None));
        assert_eq!(b["zipcode"], AttributeValue::Text(Some("22030".to_string())));
    }

    #[test]
    fn geometry_field_names_map_to_layers() {
        assert_eq!(GeometryField::parse("geom"), Some(GeometryField::Stations));
        assert_eq!(GeometryField::parse("district"), Some(GeometryField::Districts));
        assert_eq!(GeometryField::parse("hq"), None);
        assert_eq!(
            export_filename(11, "fairfax-county", GeometryField::Districts),
            "11-fairfax-county-districts"
        );
    }

    #[test]
    fn export_skips_rows_without_geometry_and_zips_the_layer() {
        let output = tempfile::tempdir().expect("output dir");
        let exporter = ShapefileExporter::new(output.path());
        let mut rows = engine_batch();
        rows.push(row(3, None, &[(Apparatus::Boat, 2)]));

        let artifact = exporter
            .export(&rows, GeometryField::Stations, "11-fairfax-stations")
            .expect("export succeeds");
        assert_eq!(artifact.features_written, 2);
        assert_eq!(artifact.archive, output.path().join("11-fairfax-stations.zip"));

        let archive = zip::ZipArchive::new(File::open(&artifact.archive).expect("archive opens"))
            .expect("archive reads");
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "11-fairfax-stations.dbf",
                "11-fairfax-stations.prj",
                "11-fairfax-stations.shp",
                "11-fairfax-stations.shx",
            ]
        );

        let second = exporter
            .export(&rows, GeometryField::Stations, "11-fairfax-stations")
            .expect("second export succeeds");
        assert_ne!(second.archive, artifact.archive);
        let second_name = second
            .archive
            .file_name()
            .and_then(|n| n.to_str())
            .expect("utf8 name");
        assert!(second_name.starts_with("11-fairfax-stations-"));
        assert_eq!(second_name.len(), "11-fairfax-stations-".len() + 5 + ".zip".len());

        fs::remove_dir_all(&artifact.work_dir).ok();
        fs::remove_dir_all(&second.work_dir).ok();
    }

    #[test]
    fn district_exports_write_polygons_only() {
        let output = tempfile::tempdir().expect("output dir");
        let exporter = ShapefileExporter::new(output.path());
        let square = vec![vec![[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]]];
        let rows = vec![
            row(1, Some(Geometry::MultiPolygon(vec![square.clone()])), &[]),
            row(2, Some(Geometry::Point([0.5, 0.5])), &[]),
        ];

        let artifact = exporter
            .export(&rows, GeometryField::Districts, "11-fairfax-districts")
            .expect("export succeeds");
        assert_eq!(artifact.features_written, 1);
        fs::remove_dir_all(&artifact.work_dir).ok();
    }

    #[test]
    fn failed_export_leaves_no_working_directory() {
        let work_root = tempfile::tempdir().expect("work root");
        let scratch = tempfile::tempdir().expect("scratch dir");
        let not_a_dir = scratch.path().join("occupied");
        fs::write(&not_a_dir, b"file").expect("file written");
        let exporter = ShapefileExporter::new(&not_a_dir).with_work_root(work_root.path());

        let result = exporter.export(&engine_batch(), GeometryField::Stations, "11-fairfax-stations");
        assert!(result.is_err());
        let leftovers = fs::read_dir(work_root.path()).expect("work root lists").count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn skip_policy_leaves_files_and_deferred_policy_removes_them() {
        let output = tempfile::tempdir().expect("output dir");
        let exporter = ShapefileExporter::new(output.path());
        let rows = engine_batch();

        let kept = exporter
            .export(&rows, GeometryField::Stations, "kept")
            .expect("export succeeds");
        schedule_cleanup(CleanupPolicy::Skip, &kept);

        let removed = exporter
            .export(&rows, GeometryField::Stations, "removed")
            .expect("export succeeds");
        schedule_cleanup(
            CleanupPolicy::Deferred {
                retention: Duration::from_millis(20),
            },
            &removed,
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(kept.archive.exists());
        assert!(kept.work_dir.exists());
        assert!(!removed.archive.exists());
        assert!(!removed.work_dir.exists());

        fs::remove_dir_all(&kept.work_dir).ok();
    }
}
