use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::export::GeometryField;
use crate::geometry::{Geometry, HEADQUARTERS_BUFFER};
use crate::govunits::LinkChanges;
use crate::models::{
    Apparatus, Department, DistExtremes, ExportRow, GovernmentUnit, GovernmentUnitKind,
    GovernmentUnitLink, InventoryStats, NewUser, StaffingRecord, Station, StationAddress, User,
};
use crate::search::{DepartmentQuery, FieldFilter};
use crate::session::SessionData;
use crate::store::{DepartmentScope, Store};

const DEPARTMENT_COLUMNS: &str = "id, fdid, name, slug, state, region, population, \
     population_class, featured, dist_model_score, risk_model_deaths, risk_model_injuries, \
     risk_model_fires_size1_percentage, risk_model_fires_size2_percentage, \
     residential_fires_avg_3_years";

const STATION_COLUMNS: &str = "id, department_id, name, station_number, address_line1, \
     address_line2, city, state_province, postal_code, country, fdid, \
     ST_AsGeoJSON(geom) AS geom_json, ST_AsGeoJSON(district) AS district_json";

const USER_COLUMNS: &str =
    "id, username, first_name, last_name, email, is_active, is_staff, is_superuser, last_login";

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

fn department_from_row(row: &PgRow) -> Department {
    Department {
        id: row.get("id"),
        fdid: row.get("fdid"),
        name: row.get("name"),
        slug: row.get("slug"),
        state: row.get("state"),
        region: row.get("region"),
        population: row.get("population"),
        population_class: row.get("population_class"),
        featured: row.get("featured"),
        dist_model_score: row.get("dist_model_score"),
        risk_model_deaths: row.get("risk_model_deaths"),
        risk_model_injuries: row.get("risk_model_injuries"),
        risk_model_fires_size1_percentage: row.get("risk_model_fires_size1_percentage"),
        risk_model_fires_size2_percentage: row.get("risk_model_fires_size2_percentage"),
        residential_fires_avg_3_years: row.get("residential_fires_avg_3_years"),
    }
}

fn optional_geometry(row: &PgRow, column: &str) -> anyhow::Result<Option<Geometry>> {
    let raw: Option<String> = row.get(column);
    raw.as_deref().map(Geometry::from_geojson).transpose()
}

fn station_from_row(row: &PgRow) -> anyhow::Result<Station> {
    Ok(Station {
        id: row.get("id"),
        department_id: row.get("department_id"),
        name: row.get("name"),
        station_number: row.get("station_number"),
        address: Some(StationAddress {
            address_line1: row.get("address_line1"),
            address_line2: row.get("address_line2"),
            city: row.get("city"),
            state_province: row.get("state_province"),
            postal_code: row.get("postal_code"),
            country: row.get("country"),
        }),
        fdid: row.get("fdid"),
        geom: optional_geometry(row, "geom_json")?,
        district: optional_geometry(row, "district_json")?,
    })
}

fn user_from_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        email: row.get("email"),
        is_active: row.get("is_active"),
        is_staff: row.get("is_staff"),
        is_superuser: row.get("is_superuser"),
        last_login: row.get("last_login"),
    }
}

fn session_from_row(row: &PgRow) -> SessionData {
    SessionData {
        oauth_state: row.get("oauth_state"),
        user_id: row.get("user_id"),
        messages: row.get("messages"),
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// `WHERE` clause shared by listing counts and pages.
fn push_listing_filters(
    builder: &mut QueryBuilder<'_, Postgres>,
    scope: DepartmentScope,
    query: &DepartmentQuery,
) {
    builder.push(" FROM firecares.departments WHERE TRUE");

    if let DepartmentScope::SimilarTo {
        department_id,
        population_class,
    } = scope
    {
        builder.push(" AND id <> ").push_bind(department_id);
        match population_class {
            Some(class) => {
                builder.push(" AND population_class = ").push_bind(class);
            }
            None => {
                builder.push(" AND population_class IS NULL");
            }
        }
    }

    if let Some(text) = &query.text {
        builder
            .push(" AND search_vector @@ plainto_tsquery('simple', ")
            .push_bind(text.clone())
            .push(")");
        return;
    }

    for filter in &query.filters {
        match filter {
            FieldFilter::Exact { field, value } => {
                builder
                    .push(format!(" AND {} = ", field.column()))
                    .push_bind(value.clone());
            }
            FieldFilter::Contains { field, value } => {
                builder
                    .push(format!(" AND {} ILIKE ", field.column()))
                    .push_bind(format!("%{}%", escape_like(value)));
            }
            FieldFilter::Range { field, min, max } => {
                let column = field.column();
                if let Some(min) = min {
                    builder
                        .push(format!(" AND {column}::double precision >= "))
                        .push_bind(*min as f64);
                }
                if let Some(max) = max {
                    builder
                        .push(format!(" AND ({column}::double precision <= "))
                        .push_bind(*max as f64)
                        .push(format!(" OR {column} IS NULL)"));
                }
            }
        }
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_usize(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn departments_where(&self, clause: &str) -> anyhow::Result<Vec<Department>> {
        let sql = format!(
            "SELECT {DEPARTMENT_COLUMNS} FROM firecares.departments WHERE {clause} ORDER BY name, id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(department_from_row).collect())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn department(&self, id: i64) -> anyhow::Result<Option<Department>> {
        let sql = format!("SELECT {DEPARTMENT_COLUMNS} FROM firecares.departments WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(department_from_row))
    }

    async fn departments_in_population_class(
        &self,
        population_class: Option<i16>,
    ) -> anyhow::Result<Vec<Department>> {
        let sql = format!(
            "SELECT {DEPARTMENT_COLUMNS} FROM firecares.departments \
             WHERE population_class IS NOT DISTINCT FROM $1 ORDER BY name, id"
        );
        let rows = sqlx::query(&sql)
            .bind(population_class)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(department_from_row).collect())
    }

    async fn scored_departments(&self) -> anyhow::Result<Vec<Department>> {
        self.departments_where("dist_model_score IS NOT NULL").await
    }

    async fn department_extremes(&self) -> anyhow::Result<DistExtremes> {
        let row = sqlx::query(
            r#"
            SELECT MAX(dist_model_score) AS dist_max,
                   MIN(dist_model_score) AS dist_min,
                   COALESCE(MAX(population), 0) AS population_max,
                   COALESCE(MIN(population), 0) AS population_min
            FROM firecares.departments
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DistExtremes {
            dist_max: row.get("dist_max"),
            dist_min: row.get("dist_min"),
            population_max: row.get("population_max"),
            population_min: row.get("population_min"),
        })
    }

    async fn count_departments(
        &self,
        scope: DepartmentScope,
        query: &DepartmentQuery,
    ) -> anyhow::Result<usize> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) AS count");
        push_listing_filters(&mut builder, scope, query);
        let count: i64 = builder.build().fetch_one(&self.pool).await?.get("count");
        Ok(to_usize(count))
    }

    async fn search_departments(
        &self,
        scope: DepartmentScope,
        query: &DepartmentQuery,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Department>> {
        let mut builder = QueryBuilder::new(format!("SELECT {DEPARTMENT_COLUMNS}"));
        push_listing_filters(&mut builder, scope, query);

        let sort = query.sort;
        builder.push(format!(
            " ORDER BY {} {} NULLS {}, id ASC",
            sort.field.column(),
            if sort.descending { "DESC" } else { "ASC" },
            if sort.nulls_last() { "LAST" } else { "FIRST" },
        ));
        builder.push(" LIMIT ").push_bind(to_i64(limit));
        builder.push(" OFFSET ").push_bind(to_i64(offset));

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(department_from_row).collect())
    }

    async fn featured_departments(&self, limit: usize) -> anyhow::Result<Vec<Department>> {
        let sql = format!(
            "SELECT {DEPARTMENT_COLUMNS} FROM firecares.departments \
             WHERE featured ORDER BY random() LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(department_from_row).collect())
    }

    async fn count_stations(&self, department_id: i64) -> anyhow::Result<usize> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM firecares.stations WHERE department_id = $1")
                .bind(department_id)
                .fetch_one(&self.pool)
                .await?
                .get("count");
        Ok(to_usize(count))
    }

    async fn stations(
        &self,
        department_id: i64,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Station>> {
        let sql = format!(
            "SELECT {STATION_COLUMNS} FROM firecares.stations WHERE department_id = $1 \
             ORDER BY station_number ASC NULLS LAST, id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(department_id)
            .bind(to_i64(limit))
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(station_from_row).collect()
    }

    async fn station(&self, id: i64) -> anyhow::Result<Option<Station>> {
        let sql = format!("SELECT {STATION_COLUMNS} FROM firecares.stations WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(station_from_row).transpose()
    }

    async fn export_rows(
        &self,
        department_id: i64,
        field: GeometryField,
    ) -> anyhow::Result<Vec<ExportRow>> {
        let sql = format!(
            "SELECT {STATION_COLUMNS} FROM firecares.stations WHERE department_id = $1 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(department_id)
            .fetch_all(&self.pool)
            .await?;
        let stations = rows
            .iter()
            .map(station_from_row)
            .collect::<anyhow::Result<Vec<Station>>>()?;

        let station_ids: Vec<i64> = stations.iter().map(|station| station.id).collect();
        let staffing_rows = sqlx::query(
            "SELECT id, station_id, apparatus, personnel FROM firecares.staffing \
             WHERE station_id = ANY($1) ORDER BY id",
        )
        .bind(&station_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut staffing: HashMap<i64, Vec<StaffingRecord>> = HashMap::new();
        for row in staffing_rows {
            let apparatus: String = row.get("apparatus");
            let record = StaffingRecord {
                id: row.get("id"),
                station_id: row.get("station_id"),
                apparatus: Apparatus::parse(&apparatus).unwrap_or(Apparatus::Other),
                personnel: row.get("personnel"),
            };
            staffing.entry(record.station_id).or_default().push(record);
        }

        Ok(stations
            .into_iter()
            .map(|station| {
                let geometry = match field {
                    GeometryField::Stations => station.geom.clone(),
                    GeometryField::Districts => station.district.clone(),
                };
                let staffing = staffing.remove(&station.id).unwrap_or_default();
                ExportRow {
                    station,
                    geometry,
                    staffing,
                }
            })
            .collect())
    }

    async fn government_unit_links(
        &self,
        department_id: i64,
    ) -> anyhow::Result<Vec<GovernmentUnitLink>> {
        let rows = sqlx::query(
            "SELECT kind, unit_id FROM firecares.government_unit_links WHERE department_id = $1",
        )
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;

        let mut links = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.get("kind");
            let Some(kind) = GovernmentUnitKind::parse(&kind) else {
                tracing::warn!(department_id, kind = %kind, "skipping link of unknown kind");
                continue;
            };
            links.push(GovernmentUnitLink {
                department_id,
                kind,
                unit_id: row.get("unit_id"),
            });
        }
        links.sort();
        Ok(links)
    }

    async fn government_unit_candidates(
        &self,
        department_id: i64,
    ) -> anyhow::Result<Vec<GovernmentUnit>> {
        let rows = sqlx::query(
            r#"
            SELECT u.kind, u.id, u.name
            FROM firecares.government_units u
            JOIN firecares.departments d ON d.id = $1
            WHERE d.headquarters IS NOT NULL
              AND ST_Intersects(u.geom, ST_Buffer(d.headquarters, $2))
            "#,
        )
        .bind(department_id)
        .bind(HEADQUARTERS_BUFFER)
        .fetch_all(&self.pool)
        .await?;

        let mut units: Vec<GovernmentUnit> = rows
            .iter()
            .filter_map(|row| {
                let kind: String = row.get("kind");
                Some(GovernmentUnit {
                    kind: GovernmentUnitKind::parse(&kind)?,
                    id: row.get("id"),
                    name: row.get("name"),
                    geom: None,
                })
            })
            .collect();
        units.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.name.cmp(&b.name)));
        Ok(units)
    }

    async fn apply_link_changes(&self, changes: &LinkChanges) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for link in &changes.disconnect {
            sqlx::query(
                "DELETE FROM firecares.government_unit_links \
                 WHERE department_id = $1 AND kind = $2 AND unit_id = $3",
            )
            .bind(link.department_id)
            .bind(link.kind.as_str())
            .bind(link.unit_id)
            .execute(&mut *tx)
            .await?;
        }
        for link in &changes.connect {
            sqlx::query(
                "INSERT INTO firecares.government_unit_links (department_id, kind, unit_id) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(link.department_id)
            .bind(link.kind.as_str())
            .bind(link.unit_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn recompute_department_geometry(&self, department_id: i64) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE firecares.departments d
            SET geom = merged.geom
            FROM (
                SELECT ST_Multi(ST_Union(u.geom)) AS geom
                FROM firecares.government_unit_links l
                JOIN firecares.government_units u ON u.kind = l.kind AND u.id = l.unit_id
                WHERE l.department_id = $1
            ) merged
            WHERE d.id = $1 AND merged.geom IS NOT NULL
            "#,
        )
        .bind(department_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::info!(department_id, "no linked geometry; department geometry kept");
        }
        Ok(())
    }

    async fn upsert_sso_user(&self, user: &NewUser) -> anyhow::Result<User> {
        let sql = format!(
            r#"
            INSERT INTO firecares.users
                (username, first_name, last_name, email, is_active, is_staff, is_superuser, last_login)
            VALUES ($1, $2, $3, $4, TRUE, FALSE, FALSE, now())
            ON CONFLICT (username) DO UPDATE
            SET first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                email = EXCLUDED.email,
                is_active = TRUE,
                last_login = EXCLUDED.last_login
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&user.username)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(&user.email)
            .fetch_one(&self.pool)
            .await?;
        Ok(user_from_row(&row))
    }

    async fn user(&self, id: i64) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM firecares.users WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn stats(&self) -> anyhow::Result<InventoryStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM firecares.stations) AS stations,
                (SELECT COUNT(*) FROM firecares.departments) AS departments,
                (SELECT COUNT(*) FROM firecares.stations WHERE fdid IS NOT NULL) AS stations_with_fdid,
                (SELECT COUNT(*) FROM firecares.stations WHERE department_id IS NOT NULL)
                    AS stations_with_departments,
                (SELECT COUNT(*) FROM firecares.departments d
                 WHERE NOT EXISTS (
                     SELECT 1 FROM firecares.government_unit_links l WHERE l.department_id = d.id
                 )) AS departments_without_government_unit
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(InventoryStats {
            stations: row.get("stations"),
            departments: row.get("departments"),
            stations_with_fdid: row.get("stations_with_fdid"),
            stations_with_departments: row.get("stations_with_departments"),
            departments_without_government_unit: row.get("departments_without_government_unit"),
        })
    }

    async fn load_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<SessionData>> {
        let row = sqlx::query(
            r#"
            SELECT oauth_state, user_id, messages
            FROM firecares.sessions
            WHERE id = $1 AND expires_at > $2
            "#,
        )
        .bind(session_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn save_session(
        &self,
        session_id: &str,
        data: &SessionData,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO firecares.sessions (id, oauth_state, user_id, messages, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET oauth_state = EXCLUDED.oauth_state,
                user_id = EXCLUDED.user_id,
                messages = EXCLUDED.messages,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(session_id)
        .bind(&data.oauth_state)
        .bind(data.user_id)
        .bind(&data.messages)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM firecares.sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn take_oauth_state(
        &self,
        session_id: &str,
        state: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<SessionData>> {
        let row = sqlx::query(
            r#"
            UPDATE firecares.sessions
            SET oauth_state = NULL
            WHERE id = $1 AND oauth_state = $2 AND expires_at > $3
            RETURNING oauth_state, user_id, messages
            "#,
        )
        .bind(session_id)
        .bind(state)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM firecares.sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let departments = vec![
        (
            91907_i64,
            "11001",
            "Fairfax County Fire and Rescue Department",
            "VA",
            "South",
            1_081_726_i64,
            9_i16,
            Some(12.4),
            (3.1, 28.0, 10.5, 4.2, 385.0),
        ),
        (
            91934,
            "07029",
            "Arlington County Fire Department",
            "VA",
            "South",
            207_627,
            7,
            Some(8.9),
            (0.8, 6.0, 9.1, 3.3, 92.0),
        ),
        (
            93345,
            "71000",
            "Loudoun County Combined Fire and Rescue System",
            "VA",
            "South",
            312_311,
            7,
            None,
            (1.2, 9.0, 8.4, 2.9, 118.0),
        ),
    ];

    for (id, fdid, name, state, region, population, class, dist, risk) in departments {
        let (deaths, injuries, size1, size2, residential) = risk;
        sqlx::query(
            r#"
            INSERT INTO firecares.departments
            (id, fdid, name, slug, state, region, population, population_class, featured,
             dist_model_score, risk_model_deaths, risk_model_injuries,
             risk_model_fires_size1_percentage, risk_model_fires_size2_percentage,
             residential_fires_avg_3_years)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, population = EXCLUDED.population,
                dist_model_score = EXCLUDED.dist_model_score
            "#,
        )
        .bind(id)
        .bind(fdid)
        .bind(name)
        .bind(slugify(name))
        .bind(state)
        .bind(region)
        .bind(population)
        .bind(class)
        .bind(dist)
        .bind(deaths)
        .bind(injuries)
        .bind(size1)
        .bind(size2)
        .bind(residential)
        .execute(pool)
        .await?;
    }

    let stations = vec![
        (1001_i64, 91907_i64, "Fire Station 401", 401, "10473 Main St", "Fairfax", "22030", -77.3063, 38.8462),
        (1002, 91907, "Fire Station 408", 408, "4650 West Ox Rd", "Fairfax", "22030", -77.3742, 38.8436),
        (1003, 91934, "Arlington Station 101", 101, "500 S Glebe Rd", "Arlington", "22204", -77.0878, 38.8643),
    ];

    for (id, department_id, name, number, street, city, zipcode, lon, lat) in stations {
        let point = Geometry::Point([lon, lat]).to_geojson();
        sqlx::query(
            r#"
            INSERT INTO firecares.stations
            (id, department_id, name, station_number, address_line1, city, state_province,
             postal_code, country, geom)
            VALUES ($1, $2, $3, $4, $5, $6, 'VA', $7, 'US',
                    ST_SetSRID(ST_GeomFromGeoJSON($8), 4326))
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(department_id)
        .bind(name)
        .bind(number)
        .bind(street)
        .bind(city)
        .bind(zipcode)
        .bind(point)
        .execute(pool)
        .await?;
    }

    let staffing = vec![
        (1001_i64, Apparatus::Engine, 4),
        (1001, Apparatus::Engine, 3),
        (1001, Apparatus::Ladder, 4),
        (1002, Apparatus::Engine, 4),
        (1002, Apparatus::AmbulanceAls, 2),
        (1003, Apparatus::Engine, 4),
    ];

    sqlx::query("DELETE FROM firecares.staffing WHERE station_id = ANY($1)")
        .bind(vec![1001_i64, 1002, 1003])
        .execute(pool)
        .await?;
    for (station_id, apparatus, personnel) in staffing {
        sqlx::query(
            "INSERT INTO firecares.staffing (station_id, apparatus, personnel) VALUES ($1, $2, $3)",
        )
        .bind(station_id)
        .bind(apparatus.as_str())
        .bind(personnel)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        id: i64,
        fdid: Option<String>,
        name: String,
        state: Option<String>,
        region: Option<String>,
        population: Option<i64>,
        population_class: Option<i16>,
        featured: Option<bool>,
        dist_model_score: Option<f64>,
        risk_model_deaths: Option<f64>,
        risk_model_injuries: Option<f64>,
        risk_model_fires_size1_percentage: Option<f64>,
        risk_model_fires_size2_percentage: Option<f64>,
        residential_fires_avg_3_years: Option<f64>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut upserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let outcome = sqlx::query(
            r#"
            INSERT INTO firecares.departments
            (id, fdid, name, slug, state, region, population, population_class, featured,
             dist_model_score, risk_model_deaths, risk_model_injuries,
             risk_model_fires_size1_percentage, risk_model_fires_size2_percentage,
             residential_fires_avg_3_years)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO UPDATE
            SET fdid = EXCLUDED.fdid, name = EXCLUDED.name, slug = EXCLUDED.slug,
                state = EXCLUDED.state, region = EXCLUDED.region,
                population = EXCLUDED.population,
                population_class = EXCLUDED.population_class,
                featured = EXCLUDED.featured,
                dist_model_score = EXCLUDED.dist_model_score,
                risk_model_deaths = EXCLUDED.risk_model_deaths,
                risk_model_injuries = EXCLUDED.risk_model_injuries,
                risk_model_fires_size1_percentage = EXCLUDED.risk_model_fires_size1_percentage,
                risk_model_fires_size2_percentage = EXCLUDED.risk_model_fires_size2_percentage,
                residential_fires_avg_3_years = EXCLUDED.residential_fires_avg_3_years
            "#,
        )
        .bind(row.id)
        .bind(&row.fdid)
        .bind(&row.name)
        .bind(slugify(&row.name))
        .bind(&row.state)
        .bind(&row.region)
        .bind(row.population)
        .bind(row.population_class)
        .bind(row.featured.unwrap_or(false))
        .bind(row.dist_model_score)
        .bind(row.risk_model_deaths)
        .bind(row.risk_model_injuries)
        .bind(row.risk_model_fires_size1_percentage)
        .bind(row.risk_model_fires_size2_percentage)
        .bind(row.residential_fires_avg_3_years)
        .execute(pool)
        .await?;

        if outcome.rows_affected() > 0 {
            upserted += 1;
        }
    }

    Ok(upserted)
}
