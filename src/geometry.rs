use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Tolerance, in degrees, used when looking for boundary records around a
/// department headquarters.
pub const HEADQUARTERS_BUFFER: f64 = 0.01;

/// ESRI projection file contents for EPSG:4326.
pub const WGS84_PRJ: &str = r#"GEOGCS["GCS_WGS_1984",DATUM["D_WGS_1984",SPHEROID["WGS_1984",6378137.0,298.257223563]],PRIMEM["Greenwich",0.0],UNIT["Degree",0.0174532925199433]]"#;

pub type Position = [f64; 2];
pub type Ring = Vec<Position>;

/// GeoJSON geometry in WGS84 longitude/latitude order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Position),
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

impl Geometry {
    pub fn from_geojson(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("invalid GeoJSON geometry")
    }

    pub fn to_geojson(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn is_point(&self) -> bool {
        matches!(self, Geometry::Point(_))
    }

    /// Polygons of this geometry; points have none.
    pub fn polygons(&self) -> Vec<Vec<Ring>> {
        match self {
            Geometry::Point(_) => Vec::new(),
            Geometry::Polygon(rings) => vec![rings.clone()],
            Geometry::MultiPolygon(polygons) => polygons.clone(),
        }
    }

    #[cfg(test)]
    pub fn bbox(&self) -> Option<BoundingBox> {
        let mut positions: Vec<Position> = Vec::new();
        match self {
            Geometry::Point(position) => positions.push(*position),
            Geometry::Polygon(rings) => positions.extend(rings.iter().flatten()),
            Geometry::MultiPolygon(polygons) => {
                positions.extend(polygons.iter().flatten().flatten())
            }
        }
        BoundingBox::around(&positions)
    }

    #[cfg(test)]
    /// Multipolygon covering every polygon of `geometries`.
    ///
    /// Shapes are collected, not dissolved; the database performs the real
    /// union when a department geometry is persisted.
    pub fn union_cover<'a, I>(geometries: I) -> Option<Geometry>
    where
        I: IntoIterator<Item = &'a Geometry>,
    {
        let polygons: Vec<Vec<Ring>> = geometries
            .into_iter()
            .flat_map(Geometry::polygons)
            .collect();
        if polygons.is_empty() {
            None
        } else {
            Some(Geometry::MultiPolygon(polygons))
        }
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

#[cfg(test)]
impl BoundingBox {
    fn around(positions: &[Position]) -> Option<Self> {
        let first = positions.first()?;
        let mut bbox = BoundingBox {
            min_x: first[0],
            min_y: first[1],
            max_x: first[0],
            max_y: first[1],
        };
        for [x, y] in positions.iter().skip(1) {
            bbox.min_x = bbox.min_x.min(*x);
            bbox.min_y = bbox.min_y.min(*y);
            bbox.max_x = bbox.max_x.max(*x);
            bbox.max_y = bbox.max_y.max(*y);
        }
        Some(bbox)
    }

    pub fn buffer(self, distance: f64) -> Self {
        BoundingBox {
            min_x: self.min_x - distance,
            min_y: self.min_y - distance,
            max_x: self.max_x + distance,
            max_y: self.max_y + distance,
        }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, size: f64) -> Vec<Ring> {
        vec![vec![
            [x, y],
            [x + size, y],
            [x + size, y + size],
            [x, y + size],
            [x, y],
        ]]
    }

    #[test]
    fn parses_geojson_point_and_multipolygon() {
        let point = Geometry::from_geojson(r#"{"type":"Point","coordinates":[-77.0,38.9]}"#)
            .expect("point parses");
        assert_eq!(point, Geometry::Point([-77.0, 38.9]));

        let multi = Geometry::from_geojson(
            r#"{"type":"MultiPolygon","coordinates":[[[[0,0],[1,0],[1,1],[0,0]]]]}"#,
        )
        .expect("multipolygon parses");
        assert_eq!(multi.polygons().len(), 1);
        assert!(!multi.is_point());
    }

    #[test]
    fn buffered_point_reaches_nearby_polygon() {
        let hq = Geometry::Point([1.005, 0.5]).bbox().expect("point bbox");
        let county = Geometry::Polygon(square(0.0, 0.0, 1.0))
            .bbox()
            .expect("polygon bbox");

        assert!(!hq.intersects(&county));
        assert!(hq.buffer(HEADQUARTERS_BUFFER).intersects(&county));
    }

    #[test]
    fn union_cover_collects_every_polygon() {
        let a = Geometry::Polygon(square(0.0, 0.0, 1.0));
        let b = Geometry::MultiPolygon(vec![square(2.0, 0.0, 1.0), square(4.0, 0.0, 1.0)]);
        let point = Geometry::Point([9.0, 9.0]);

        let cover = Geometry::union_cover([&a, &b, &point]).expect("cover exists");
        assert_eq!(cover.polygons().len(), 3);
        assert!(Geometry::union_cover([&point]).is_none());
    }
}
