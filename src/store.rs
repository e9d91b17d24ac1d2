use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::export::GeometryField;
use crate::govunits::LinkChanges;
use crate::models::{
    Department, DistExtremes, ExportRow, GovernmentUnit, GovernmentUnitLink, InventoryStats,
    NewUser, Station, User,
};
use crate::search::DepartmentQuery;
use crate::session::SessionData;

/// Which departments a listing draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepartmentScope {
    All,
    /// Departments of the same population class, the subject excluded.
    SimilarTo {
        department_id: i64,
        population_class: Option<i16>,
    },
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn department(&self, id: i64) -> anyhow::Result<Option<Department>>;

    /// Members of a population class, ordered by name.
    async fn departments_in_population_class(
        &self,
        population_class: Option<i16>,
    ) -> anyhow::Result<Vec<Department>>;

    /// Departments with a DIST score, ordered by name.
    async fn scored_departments(&self) -> anyhow::Result<Vec<Department>>;

    async fn department_extremes(&self) -> anyhow::Result<DistExtremes>;

    async fn count_departments(
        &self,
        scope: DepartmentScope,
        query: &DepartmentQuery,
    ) -> anyhow::Result<usize>;

    async fn search_departments(
        &self,
        scope: DepartmentScope,
        query: &DepartmentQuery,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Department>>;

    async fn featured_departments(&self, limit: usize) -> anyhow::Result<Vec<Department>>;

    async fn count_stations(&self, department_id: i64) -> anyhow::Result<usize>;

    /// A page of a department's stations ordered by station number.
    async fn stations(
        &self,
        department_id: i64,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Station>>;

    async fn station(&self, id: i64) -> anyhow::Result<Option<Station>>;

    async fn export_rows(
        &self,
        department_id: i64,
        field: GeometryField,
    ) -> anyhow::Result<Vec<ExportRow>>;

    async fn government_unit_links(
        &self,
        department_id: i64,
    ) -> anyhow::Result<Vec<GovernmentUnitLink>>;

    /// Boundary records near the department headquarters.
    async fn government_unit_candidates(
        &self,
        department_id: i64,
    ) -> anyhow::Result<Vec<GovernmentUnit>>;

    async fn apply_link_changes(&self, changes: &LinkChanges) -> anyhow::Result<()>;

    /// Replaces the department geometry with the union of its linked units.
    async fn recompute_department_geometry(&self, department_id: i64) -> anyhow::Result<()>;

    /// Creates or refreshes an SSO user and stamps its last login.
    async fn upsert_sso_user(&self, user: &NewUser) -> anyhow::Result<User>;

    async fn user(&self, id: i64) -> anyhow::Result<Option<User>>;

    async fn stats(&self) -> anyhow::Result<InventoryStats>;

    /// A session that has not expired by `now`.
    async fn load_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<SessionData>>;

    async fn save_session(
        &self,
        session_id: &str,
        data: &SessionData,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()>;

    /// Clears the pending sign-in nonce if it equals `state`, as one atomic
    /// step, and returns the session it was cleared from.
    async fn take_oauth_state(
        &self,
        session_id: &str,
        state: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<SessionData>>;

    /// Deletes sessions that expired by `now`, returning how many went.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;
}
