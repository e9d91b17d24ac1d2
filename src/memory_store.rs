//! In-process `Store` used as the test double for handlers and services.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::export::GeometryField;
use crate::geometry::{Geometry, HEADQUARTERS_BUFFER};
use crate::govunits::{apply_changes, LinkChanges};
use crate::models::{
    Department, DistExtremes, ExportRow, GovernmentUnit, GovernmentUnitLink, InventoryStats,
    NewUser, StaffingRecord, Station, User,
};
use crate::search::DepartmentQuery;
use crate::session::SessionData;
use crate::store::{DepartmentScope, Store};

fn in_scope(scope: DepartmentScope, department: &Department) -> bool {
    match scope {
        DepartmentScope::All => true,
        DepartmentScope::SimilarTo {
            department_id,
            population_class,
        } => department.id != department_id && department.population_class == population_class,
    }
}

#[derive(Debug, Clone, Default)]
struct DepartmentRecord {
    department: Department,
    headquarters: Option<Geometry>,
    geom: Option<Geometry>,
}

#[derive(Debug, Default)]
struct MemoryState {
    departments: Vec<DepartmentRecord>,
    stations: Vec<Station>,
    staffing: Vec<StaffingRecord>,
    units: Vec<GovernmentUnit>,
    links: BTreeSet<GovernmentUnitLink>,
    users: HashMap<i64, User>,
    next_user_id: i64,
    sessions: HashMap<String, (SessionData, DateTime<Utc>)>,
}

impl MemoryState {
    fn departments_by_name(&self) -> Vec<Department> {
        let mut departments: Vec<Department> = self
            .departments
            .iter()
            .map(|record| record.department.clone())
            .collect();
        departments.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        departments
    }

    fn listing(&self, scope: DepartmentScope, query: &DepartmentQuery) -> Vec<Department> {
        let scoped = self
            .departments
            .iter()
            .map(|record| record.department.clone())
            .filter(|department| in_scope(scope, department))
            .collect();
        query.apply(scoped)
    }

    fn department_stations(&self, department_id: i64) -> Vec<Station> {
        let mut stations: Vec<Station> = self
            .stations
            .iter()
            .filter(|station| station.department_id == Some(department_id))
            .cloned()
            .collect();
        stations.sort_by(|a, b| match (a.station_number, b.station_number) {
            (Some(x), Some(y)) => x.cmp(&y).then(a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
        stations
    }
}

/// Store backed by process memory, used by tests and local demos.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_department(&self, department: Department) {
        let mut state = self.state.lock().await;
        state.departments.retain(|record| record.department.id != department.id);
        state.departments.push(DepartmentRecord {
            department,
            ..DepartmentRecord::default()
        });
    }

    pub async fn set_department_geometry(
        &self,
        department_id: i64,
        headquarters: Option<Geometry>,
        geom: Option<Geometry>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(record) = state
            .departments
            .iter_mut()
            .find(|record| record.department.id == department_id)
        {
            record.headquarters = headquarters;
            record.geom = geom;
        }
    }

    pub async fn department_geometry(&self, department_id: i64) -> Option<Geometry> {
        let state = self.state.lock().await;
        state
            .departments
            .iter()
            .find(|record| record.department.id == department_id)
            .and_then(|record| record.geom.clone())
    }

    pub async fn insert_station(&self, station: Station) {
        let mut state = self.state.lock().await;
        state.stations.retain(|existing| existing.id != station.id);
        state.stations.push(station);
    }

    pub async fn insert_staffing(&self, record: StaffingRecord) {
        self.state.lock().await.staffing.push(record);
    }

    pub async fn insert_government_unit(&self, unit: GovernmentUnit) {
        self.state.lock().await.units.push(unit);
    }

    pub async fn link_government_unit(&self, link: GovernmentUnitLink) {
        self.state.lock().await.links.insert(link);
    }

    /// Stored sessions, expired ones included.
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn users(&self) -> Vec<User> {
        let state = self.state.lock().await;
        let mut users: Vec<User> = state.users.values().cloned().collect();
        users.sort_by_key(|user| user.id);
        users
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn department(&self, id: i64) -> anyhow::Result<Option<Department>> {
        let state = self.state.lock().await;
        Ok(state
            .departments
            .iter()
            .find(|record| record.department.id == id)
            .map(|record| record.department.clone()))
    }

    async fn departments_in_population_class(
        &self,
        population_class: Option<i16>,
    ) -> anyhow::Result<Vec<Department>> {
        let state = self.state.lock().await;
        Ok(state
            .departments_by_name()
            .into_iter()
            .filter(|department| department.population_class == population_class)
            .collect())
    }

    async fn scored_departments(&self) -> anyhow::Result<Vec<Department>> {
        let state = self.state.lock().await;
        Ok(state
            .departments_by_name()
            .into_iter()
            .filter(|department| department.dist_model_score.is_some())
            .collect())
    }

    async fn department_extremes(&self) -> anyhow::Result<DistExtremes> {
        let state = self.state.lock().await;
        let scores = state
            .departments
            .iter()
            .filter_map(|record| record.department.dist_model_score);
        let populations: Vec<i64> = state
            .departments
            .iter()
            .filter_map(|record| record.department.population)
            .collect();
        Ok(DistExtremes {
            dist_max: scores.clone().reduce(f64::max),
            dist_min: scores.reduce(f64::min),
            population_max: populations.iter().copied().max().unwrap_or(0),
            population_min: populations.iter().copied().min().unwrap_or(0),
        })
    }

    async fn count_departments(
        &self,
        scope: DepartmentScope,
        query: &DepartmentQuery,
    ) -> anyhow::Result<usize> {
        let state = self.state.lock().await;
        Ok(state.listing(scope, query).len())
    }

    async fn search_departments(
        &self,
        scope: DepartmentScope,
        query: &DepartmentQuery,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Department>> {
        let state = self.state.lock().await;
        Ok(state
            .listing(scope, query)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn featured_departments(&self, limit: usize) -> anyhow::Result<Vec<Department>> {
        let state = self.state.lock().await;
        Ok(state
            .departments_by_name()
            .into_iter()
            .filter(|department| department.featured)
            .take(limit)
            .collect())
    }

    async fn count_stations(&self, department_id: i64) -> anyhow::Result<usize> {
        let state = self.state.lock().await;
        Ok(state.department_stations(department_id).len())
    }

    async fn stations(
        &self,
        department_id: i64,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Station>> {
        let state = self.state.lock().await;
        Ok(state
            .department_stations(department_id)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    async fn station(&self, id: i64) -> anyhow::Result<Option<Station>> {
        let state = self.state.lock().await;
        Ok(state.stations.iter().find(|station| station.id == id).cloned())
    }

    async fn export_rows(
        &self,
        department_id: i64,
        field: GeometryField,
    ) -> anyhow::Result<Vec<ExportRow>> {
        let state = self.state.lock().await;
        let mut stations: Vec<&Station> = state
            .stations
            .iter()
            .filter(|station| station.department_id == Some(department_id))
            .collect();
        stations.sort_by_key(|station| station.id);

        Ok(stations
            .into_iter()
            .map(|station| {
                let geometry = match field {
                    GeometryField::Stations => station.geom.clone(),
                    GeometryField::Districts => station.district.clone(),
                };
                let mut staffing: Vec<StaffingRecord> = state
                    .staffing
                    .iter()
                    .filter(|record| record.station_id == station.id)
                    .cloned()
                    .collect();
                staffing.sort_by_key(|record| record.id);
                ExportRow {
                    station: station.clone(),
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
        let state = self.state.lock().await;
        Ok(state
            .links
            .iter()
            .filter(|link| link.department_id == department_id)
            .copied()
            .collect())
    }

    async fn government_unit_candidates(
        &self,
        department_id: i64,
    ) -> anyhow::Result<Vec<GovernmentUnit>> {
        let state = self.state.lock().await;
        let area = state
            .departments
            .iter()
            .find(|record| record.department.id == department_id)
            .and_then(|record| record.headquarters.as_ref())
            .and_then(Geometry::bbox)
            .map(|bbox| bbox.buffer(HEADQUARTERS_BUFFER));
        let Some(area) = area else {
            return Ok(Vec::new());
        };

        let mut candidates: Vec<GovernmentUnit> = state
            .units
            .iter()
            .filter(|unit| {
                unit.geom
                    .as_ref()
                    .and_then(Geometry::bbox)
                    .is_some_and(|bbox| bbox.intersects(&area))
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.kind.cmp(&b.kind).then(a.name.cmp(&b.name)));
        Ok(candidates)
    }

    async fn apply_link_changes(&self, changes: &LinkChanges) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        apply_changes(&mut state.links, changes);
        Ok(())
    }

    async fn recompute_department_geometry(&self, department_id: i64) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let linked: Vec<Geometry> = state
            .links
            .iter()
            .filter(|link| link.department_id == department_id)
            .filter_map(|link| {
                state
                    .units
                    .iter()
                    .find(|unit| unit.kind == link.kind && unit.id == link.unit_id)
                    .and_then(|unit| unit.geom.clone())
            })
            .collect();
        let Some(geom) = Geometry::union_cover(&linked) else {
            tracing::info!(department_id, "no linked geometry; department geometry kept");
            return Ok(());
        };
        if let Some(record) = state
            .departments
            .iter_mut()
            .find(|record| record.department.id == department_id)
        {
            record.geom = Some(geom);
        }
        Ok(())
    }

    async fn upsert_sso_user(&self, user: &NewUser) -> anyhow::Result<User> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(existing) = state
            .users
            .values_mut()
            .find(|existing| existing.username == user.username)
        {
            existing.first_name = user.first_name.clone();
            existing.last_name = user.last_name.clone();
            existing.email = user.email.clone();
            existing.is_active = true;
            existing.last_login = Some(now);
            return Ok(existing.clone());
        }

        state.next_user_id += 1;
        let created = User {
            id: state.next_user_id,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            email: user.email.clone(),
            is_active: true,
            is_staff: false,
            is_superuser: false,
            last_login: Some(now),
        };
        state.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn user(&self, id: i64) -> anyhow::Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn stats(&self) -> anyhow::Result<InventoryStats> {
        let state = self.state.lock().await;
        let linked: BTreeSet<i64> = state.links.iter().map(|link| link.department_id).collect();
        let count = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
        Ok(InventoryStats {
            stations: count(state.stations.len()),
            departments: count(state.departments.len()),
            stations_with_fdid: count(state.stations.iter().filter(|s| s.fdid.is_some()).count()),
            stations_with_departments: count(
                state
                    .stations
                    .iter()
                    .filter(|s| s.department_id.is_some())
                    .count(),
            ),
            departments_without_government_unit: count(
                state
                    .departments
                    .iter()
                    .filter(|record| !linked.contains(&record.department.id))
                    .count(),
            ),
        })
    }

    async fn load_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<SessionData>> {
        let state = self.state.lock().await;
        Ok(state
            .sessions
            .get(session_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(data, _)| data.clone()))
    }

    async fn save_session(
        &self,
        session_id: &str,
        data: &SessionData,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.state
            .lock()
            .await
            .sessions
            .insert(session_id.to_string(), (data.clone(), expires_at));
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.state.lock().await.sessions.remove(session_id);
        Ok(())
    }

    async fn take_oauth_state(
        &self,
        session_id: &str,
        state: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<SessionData>> {
        let mut guard = self.state.lock().await;
        let Some((data, expires_at)) = guard.sessions.get_mut(session_id) else {
            return Ok(None);
        };
        if *expires_at <= now || data.oauth_state.as_deref() != Some(state) {
            return Ok(None);
        }
        data.oauth_state = None;
        Ok(Some(data.clone()))
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - state.sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Apparatus, GovernmentUnitKind};
    use crate::search::SearchConfig;

    fn department(id: i64, name: &str, class: Option<i16>, population: Option<i64>) -> Department {
        Department {
            id,
            name: name.to_string(),
            slug: name.to_lowercase().replace(' ', "-"),
            population_class: class,
            population,
            ..Department::default()
        }
    }

    fn square(x: f64, y: f64, size: f64) -> Geometry {
        Geometry::Polygon(vec![vec![
            [x, y],
            [x, y + size],
            [x + size, y + size],
            [x + size, y],
            [x, y],
        ]])
    }

    #[tokio::test]
    async fn similar_scope_excludes_subject_and_other_classes() {
        let store = MemoryStore::new();
        store.insert_department(department(1, "Arlington", Some(5), Some(200))).await;
        store.insert_department(department(2, "Bristow", Some(5), Some(100))).await;
        store.insert_department(department(3, "Chantilly", Some(6), Some(300))).await;
        store.insert_department(department(4, "Dale City", Some(5), None)).await;

        let query = DepartmentQuery::from_params(&[], &SearchConfig::default());
        let scope = DepartmentScope::SimilarTo {
            department_id: 1,
            population_class: Some(5),
        };
        let listed = store
            .search_departments(scope, &query, 0, 10)
            .await
            .expect("search");
        let ids: Vec<i64> = listed.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert_eq!(store.count_departments(scope, &query).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn stations_are_paged_by_station_number() {
        let store = MemoryStore::new();
        for (id, number) in [(10, Some(3)), (11, Some(1)), (12, None), (13, Some(2))] {
            store
                .insert_station(Station {
                    id,
                    department_id: Some(1),
                    station_number: number,
                    ..Station::default()
                })
                .await;
        }

        let first = store.stations(1, 0, 2).await.expect("stations");
        assert_eq!(first.iter().map(|s| s.id).collect::<Vec<_>>(), vec![11, 13]);
        let rest = store.stations(1, 2, 2).await.expect("stations");
        assert_eq!(rest.iter().map(|s| s.id).collect::<Vec<_>>(), vec![10, 12]);
        assert_eq!(store.count_stations(1).await.expect("count"), 4);
    }

    #[tokio::test]
    async fn candidates_come_from_around_the_headquarters() {
        let store = MemoryStore::new();
        store.insert_department(department(1, "Fairfax", None, None)).await;
        store
            .set_department_geometry(1, Some(Geometry::Point([-77.3, 38.8])), None)
            .await;
        store
            .insert_government_unit(GovernmentUnit {
                kind: GovernmentUnitKind::County,
                id: 1,
                name: "Fairfax County".to_string(),
                geom: Some(square(-77.5, 38.6, 0.5)),
            })
            .await;
        store
            .insert_government_unit(GovernmentUnit {
                kind: GovernmentUnitKind::County,
                id: 2,
                name: "Far Away County".to_string(),
                geom: Some(square(-100.0, 40.0, 0.5)),
            })
            .await;
        store
            .insert_government_unit(GovernmentUnit {
                kind: GovernmentUnitKind::IncorporatedPlace,
                id: 3,
                name: "Just Outside".to_string(),
                geom: Some(square(-77.295, 38.805, 0.1)),
            })
            .await;

        let candidates = store.government_unit_candidates(1).await.expect("candidates");
        let names: Vec<&str> = candidates.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["Fairfax County", "Just Outside"]);
    }

    #[tokio::test]
    async fn geometry_is_rebuilt_from_linked_units() {
        let store = MemoryStore::new();
        store.insert_department(department(1, "Fairfax", None, None)).await;
        store
            .insert_government_unit(GovernmentUnit {
                kind: GovernmentUnitKind::County,
                id: 1,
                name: "A".to_string(),
                geom: Some(square(0.0, 0.0, 1.0)),
            })
            .await;
        store
            .insert_government_unit(GovernmentUnit {
                kind: GovernmentUnitKind::Reserve,
                id: 1,
                name: "B".to_string(),
                geom: Some(square(2.0, 0.0, 1.0)),
            })
            .await;

        store.recompute_department_geometry(1).await.expect("recompute");
        assert_eq!(store.department_geometry(1).await, None);

        for kind in [GovernmentUnitKind::County, GovernmentUnitKind::Reserve] {
            store
                .link_government_unit(GovernmentUnitLink {
                    department_id: 1,
                    kind,
                    unit_id: 1,
                })
                .await;
        }
        store.recompute_department_geometry(1).await.expect("recompute");
        match store.department_geometry(1).await {
            Some(Geometry::MultiPolygon(polygons)) => assert_eq!(polygons.len(), 2),
            other => panic!("unexpected geometry {other:?}"),
        }
    }

    #[tokio::test]
    async fn sso_users_are_created_once_and_refreshed() {
        let store = MemoryStore::new();
        let mut profile = NewUser {
            username: "iafc-1".to_string(),
            first_name: "Pat".to_string(),
            last_name: "Doe".to_string(),
            email: "pat@example.com".to_string(),
        };
        let created = store.upsert_sso_user(&profile).await.expect("create");
        assert!(created.is_active && !created.is_staff && !created.is_superuser);
        assert!(created.last_login.is_some());

        profile.email = "pat.doe@example.com".to_string();
        let updated = store.upsert_sso_user(&profile).await.expect("update");
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.email, "pat.doe@example.com");
        assert_eq!(store.users().await.len(), 1);
    }

    #[tokio::test]
    async fn export_rows_pick_the_requested_geometry() {
        let store = MemoryStore::new();
        store
            .insert_station(Station {
                id: 1,
                department_id: Some(7),
                geom: Some(Geometry::Point([1.0, 2.0])),
                ..Station::default()
            })
            .await;
        store
            .insert_staffing(StaffingRecord {
                id: 1,
                station_id: 1,
                apparatus: Apparatus::Engine,
                personnel: Some(4),
            })
            .await;

        let stations = store
            .export_rows(7, GeometryField::Stations)
            .await
            .expect("rows");
        assert!(stations[0].geometry.is_some());
        assert_eq!(stations[0].staffing.len(), 1);

        let districts = store
            .export_rows(7, GeometryField::Districts)
            .await
            .expect("rows");
        assert!(districts[0].geometry.is_none());
    }

    #[tokio::test]
    async fn stats_count_unlinked_departments() {
        let store = MemoryStore::new();
        store.insert_department(department(1, "A", None, Some(10))).await;
        store.insert_department(department(2, "B", None, Some(20))).await;
        store
            .link_government_unit(GovernmentUnitLink {
                department_id: 1,
                kind: GovernmentUnitKind::County,
                unit_id: 9,
            })
            .await;
        store
            .insert_station(Station {
                id: 1,
                department_id: Some(1),
                fdid: Some("12345".to_string()),
                ..Station::default()
            })
            .await;
        store
            .insert_station(Station {
                id: 2,
                ..Station::default()
            })
            .await;

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.departments, 2);
        assert_eq!(stats.stations, 2);
        assert_eq!(stats.stations_with_fdid, 1);
        assert_eq!(stats.stations_with_departments, 1);
        assert_eq!(stats.departments_without_government_unit, 1);

        let extremes = store.department_extremes().await.expect("extremes");
        assert_eq!(extremes.population_max, 20);
        assert_eq!(extremes.population_min, 10);
        assert_eq!(extremes.dist_max, None);
    }
}
