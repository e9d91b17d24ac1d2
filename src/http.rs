use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};

use crate::config::{AppConfig, StartupError};
use crate::export::{export_filename, schedule_cleanup, GeometryField, ShapefileExporter};
use crate::govunits::{reconcile_all, EditorSubmission, Selection};
use crate::models::{Department, DistExtremes, GovernmentUnit, InventoryStats, Station, User};
use crate::quartile::{build_report_card, ReportCard};
use crate::search::{
    limit_links, page_window, param, resolve_page_size, DepartmentQuery, LimitLink, PageBounds,
    PageWindow, SortOption,
};
use crate::session::{
    expired_session_cookie, new_session_id, session_cookie, session_id_from_headers, SessionData,
    SessionStore,
};
use crate::sso::{
    evaluate_membership, issue_nonce, state_mismatch, verify_state, HelixClient, MembershipDecision,
};
use crate::store::{DepartmentScope, Store};

pub const GOVERNMENT_UNITS_UPDATED: &str = "Government unit associations updated";
pub const NOT_A_MEMBER_KEY: &str = "sso_not_a_member";

#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    store: Arc<dyn Store>,
    sessions: SessionStore,
    helix: HelixClient,
    exporter: ShapefileExporter,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn Store>) -> Result<Self, StartupError> {
        let helix = HelixClient::new(config.require_helix()?).map_err(|err| StartupError {
            code: err.code,
            message: err.message,
        })?;
        let exporter = ShapefileExporter::new(config.export_dir.clone());
        let sessions = SessionStore::new(store.clone(), config.session_ttl);
        Ok(Self {
            config: Arc::new(config),
            store,
            sessions,
            helix,
            exporter,
        })
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn json_error(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
        }),
    )
}

fn store_error(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %err, "store request failed");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "ERR_INTERNAL",
        "internal error",
    )
}

fn not_found(what: &str) -> ApiError {
    json_error(StatusCode::NOT_FOUND, "ERR_NOT_FOUND", format!("{what} not found"))
}

/// 302 to `location`. axum's `Redirect::to` answers 303.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn found_with_cookie(location: &str, cookie: String) -> Response {
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, location.to_string()),
            (header::SET_COOKIE, cookie),
        ],
    )
        .into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/", get(home))
        .route("/message", get(message))
        .route("/stats", get(stats))
        .route("/departments", get(department_list))
        .route("/departments/{id}", get(department_detail))
        .route("/departments/{id}/similar", get(similar_departments))
        .route(
            "/departments/{id}/government-units",
            get(government_units).post(update_government_units),
        )
        .route(
            "/departments/{id}/shapefile/{geometry_field}",
            get(download_shapefile),
        )
        .route("/stations/{id}", get(station_detail))
        .route("/oauth/redirect", get(oauth_redirect))
        .route("/oauth/callback", get(oauth_callback))
        .route("/logout", get(logout))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Session and signed-in user behind a request.
struct Visitor {
    session_id: Option<String>,
    session: Option<SessionData>,
    user: Option<User>,
}

impl Visitor {
    async fn resolve(state: &AppState, headers: &HeaderMap) -> Result<Self, ApiError> {
        let session_id = session_id_from_headers(headers);
        let session = match session_id.as_deref() {
            Some(id) => state.sessions.load(id).await.map_err(store_error)?,
            None => None,
        };
        let user = match session.as_ref().and_then(|session| session.user_id) {
            Some(user_id) => state
                .store
                .user(user_id)
                .await
                .map_err(store_error)?
                .filter(|user| user.is_active),
            None => None,
        };
        Ok(Self {
            session_id,
            session,
            user,
        })
    }

    /// Redirect to sign-in when the page needs a user and there is none.
    fn login_redirect(&self, config: &AppConfig) -> Option<Response> {
        (config.require_login && self.user.is_none()).then(|| found("/oauth/redirect"))
    }
}

async fn load_department(state: &AppState, id: i64) -> Result<Department, ApiError> {
    state
        .store
        .department(id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("department"))
}

#[derive(Debug, Serialize)]
struct HomeResponse {
    featured_departments: Vec<Department>,
    extremes: DistExtremes,
}

async fn home(State(state): State<AppState>) -> Result<Json<HomeResponse>, ApiError> {
    let featured_departments = state
        .store
        .featured_departments(state.config.featured_departments)
        .await
        .map_err(store_error)?;
    let extremes = state.store.department_extremes().await.map_err(store_error)?;
    Ok(Json(HomeResponse {
        featured_departments,
        extremes,
    }))
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    key: String,
    message: String,
}

async fn message(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Json<MessageResponse>, ApiError> {
    let key = param(&params, "key").unwrap_or_default();
    let message = match key {
        NOT_A_MEMBER_KEY => format!(
            "Only active {} members can sign in with this account.",
            state.helix.config().member_organization
        ),
        _ => return Err(not_found("message")),
    };
    Ok(Json(MessageResponse {
        key: key.to_string(),
        message,
    }))
}

async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let visitor = Visitor::resolve(&state, &headers).await?;
    if let Some(redirect) = visitor.login_redirect(&state.config) {
        return Ok(redirect);
    }
    let stats: InventoryStats = state.store.stats().await.map_err(store_error)?;
    Ok(Json(stats).into_response())
}

#[derive(Debug, Serialize)]
struct SortContext {
    current: String,
    options: Vec<SortOption>,
}

#[derive(Debug, Serialize)]
struct DepartmentListResponse {
    departments: Vec<Department>,
    page: PageBounds,
    window: PageWindow,
    sort_by: SortContext,
    limits: Vec<LimitLink>,
    extremes: DistExtremes,
    featured_departments: Vec<Department>,
}

async fn list_departments(
    state: &AppState,
    scope: DepartmentScope,
    path: &str,
    params: &[(String, String)],
) -> Result<DepartmentListResponse, ApiError> {
    let search = &state.config.search;
    let query = DepartmentQuery::from_params(params, search);
    let page_size = resolve_page_size(param(params, "limit"), search);

    let count = state
        .store
        .count_departments(scope, &query)
        .await
        .map_err(store_error)?;
    let page = PageBounds::resolve(param(params, "page"), count, page_size);
    let departments = state
        .store
        .search_departments(scope, &query, page.offset(), page.page_size)
        .await
        .map_err(store_error)?;

    let mut extremes = state.store.department_extremes().await.map_err(store_error)?;
    extremes.dist_min = Some(0.0);
    let featured_departments = state
        .store
        .featured_departments(state.config.featured_departments)
        .await
        .map_err(store_error)?;

    Ok(DepartmentListResponse {
        departments,
        window: page_window(&page),
        page,
        sort_by: SortContext {
            current: query.sort.to_param(),
            options: search.sort_options.clone(),
        },
        limits: limit_links(path, params, search),
        extremes,
        featured_departments,
    })
}

async fn department_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let visitor = Visitor::resolve(&state, &headers).await?;
    if let Some(redirect) = visitor.login_redirect(&state.config) {
        return Ok(redirect);
    }
    let listing = list_departments(&state, DepartmentScope::All, "/departments", &params).await?;
    Ok(Json(listing).into_response())
}

async fn similar_departments(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let visitor = Visitor::resolve(&state, &headers).await?;
    if let Some(redirect) = visitor.login_redirect(&state.config) {
        return Ok(redirect);
    }
    let department = load_department(&state, id).await?;
    let scope = DepartmentScope::SimilarTo {
        department_id: department.id,
        population_class: department.population_class,
    };
    let path = format!("/departments/{id}/similar");
    let listing = list_departments(&state, scope, &path, &params).await?;
    Ok(Json(listing).into_response())
}

#[derive(Debug, Serialize)]
struct DepartmentDetailResponse {
    department: Department,
    stations: Vec<Station>,
    stations_page: PageBounds,
    report_card: ReportCard,
    extremes: DistExtremes,
    messages: Vec<String>,
}

async fn department_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let visitor = Visitor::resolve(&state, &headers).await?;
    if let Some(redirect) = visitor.login_redirect(&state.config) {
        return Ok(redirect);
    }
    let department = load_department(&state, id).await?;

    let station_count = state.store.count_stations(id).await.map_err(store_error)?;
    let stations_page = PageBounds::resolve(
        param(&params, "page"),
        station_count,
        state.config.stations_per_page,
    );
    let stations = state
        .store
        .stations(id, stations_page.offset(), stations_page.page_size)
        .await
        .map_err(store_error)?;

    let peers = state
        .store
        .departments_in_population_class(department.population_class)
        .await
        .map_err(store_error)?;
    let all_scored = state.store.scored_departments().await.map_err(store_error)?;
    let report_card = build_report_card(&department, &peers, &all_scored);
    let extremes = state.store.department_extremes().await.map_err(store_error)?;

    let mut messages = Vec::new();
    if let (Some(session_id), Some(mut session)) = (visitor.session_id, visitor.session) {
        if !session.messages.is_empty() {
            messages = std::mem::take(&mut session.messages);
            state
                .sessions
                .save(&session_id, &session)
                .await
                .map_err(store_error)?;
        }
    }

    Ok(Json(DepartmentDetailResponse {
        department,
        stations,
        stations_page,
        report_card,
        extremes,
        messages,
    })
    .into_response())
}

async fn station_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let visitor = Visitor::resolve(&state, &headers).await?;
    if let Some(redirect) = visitor.login_redirect(&state.config) {
        return Ok(redirect);
    }
    let station = state
        .store
        .station(id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("station"))?;
    Ok(Json(station).into_response())
}

#[derive(Debug, Serialize)]
struct GovernmentUnitEditor {
    department: Department,
    current: Selection,
    candidates: Vec<GovernmentUnit>,
}

async fn government_units(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let visitor = Visitor::resolve(&state, &headers).await?;
    if let Some(redirect) = visitor.login_redirect(&state.config) {
        return Ok(redirect);
    }
    let department = load_department(&state, id).await?;
    let links = state
        .store
        .government_unit_links(id)
        .await
        .map_err(store_error)?;
    let candidates = state
        .store
        .government_unit_candidates(id)
        .await
        .map_err(store_error)?;
    Ok(Json(GovernmentUnitEditor {
        department,
        current: Selection::from_links(&links),
        candidates,
    })
    .into_response())
}

async fn update_government_units(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Form(form): Form<Vec<(String, String)>>,
) -> Result<Response, ApiError> {
    let visitor = Visitor::resolve(&state, &headers).await?;
    if let Some(redirect) = visitor.login_redirect(&state.config) {
        return Ok(redirect);
    }
    let department = load_department(&state, id).await?;
    let submission = EditorSubmission::from_form(&form).map_err(|err| {
        json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_FORM", err.to_string())
    })?;

    let links = state
        .store
        .government_unit_links(id)
        .await
        .map_err(store_error)?;
    let changes = reconcile_all(department.id, &Selection::from_links(&links), &submission.selection);
    if !changes.is_empty() {
        state
            .store
            .apply_link_changes(&changes)
            .await
            .map_err(store_error)?;
    }
    if submission.update_geom {
        state
            .store
            .recompute_department_geometry(department.id)
            .await
            .map_err(store_error)?;
    }
    tracing::info!(
        department_id = department.id,
        connected = changes.connect.len(),
        disconnected = changes.disconnect.len(),
        update_geom = submission.update_geom,
        "government unit associations updated"
    );

    let location = format!("/departments/{}", department.id);
    let mut session = visitor.session.unwrap_or_default();
    session.messages.push(GOVERNMENT_UNITS_UPDATED.to_string());
    match visitor.session_id {
        Some(session_id) => {
            state
                .sessions
                .save(&session_id, &session)
                .await
                .map_err(store_error)?;
            Ok(found(&location))
        }
        None => {
            let session_id = new_session_id();
            state
                .sessions
                .save(&session_id, &session)
                .await
                .map_err(store_error)?;
            Ok(found_with_cookie(&location, session_cookie(&session_id)))
        }
    }
}

async fn download_shapefile(
    State(state): State<AppState>,
    Path((id, geometry_field)): Path<(i64, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let visitor = Visitor::resolve(&state, &headers).await?;
    if let Some(redirect) = visitor.login_redirect(&state.config) {
        return Ok(redirect);
    }
    let department = load_department(&state, id).await?;
    let field = GeometryField::parse(&geometry_field).ok_or_else(|| not_found("geometry field"))?;

    let rows = state
        .store
        .export_rows(department.id, field)
        .await
        .map_err(store_error)?;
    let filename = export_filename(department.id, &department.slug, field);
    let exporter = state.exporter.clone();
    let artifact = tokio::task::spawn_blocking(move || exporter.export(&rows, field, &filename))
        .await
        .map_err(|err| store_error(anyhow::anyhow!("export task failed: {err}")))?
        .map_err(store_error)?;
    schedule_cleanup(state.config.export_cleanup, &artifact);
    tracing::info!(
        department_id = department.id,
        geometry_field = field.tag(),
        features = artifact.features_written,
        archive = %artifact.archive.display(),
        "shapefile exported"
    );

    let body = tokio::fs::read(&artifact.archive)
        .await
        .map_err(|err| store_error(anyhow::anyhow!("failed to read archive: {err}")))?;
    let download_name = artifact
        .archive
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("export.zip")
        .to_string();
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{download_name}\""),
            ),
        ],
        body,
    )
        .into_response())
}

async fn oauth_redirect(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let existing = session_id_from_headers(&headers);
    let mut session = match existing.as_deref() {
        Some(id) => state
            .sessions
            .load(id)
            .await
            .map_err(store_error)?
            .unwrap_or_default(),
        None => SessionData::default(),
    };

    let nonce = issue_nonce();
    let location = state
        .helix
        .authorization_url(&nonce)
        .map_err(|err| json_error(StatusCode::INTERNAL_SERVER_ERROR, err.code, err.message))?;
    session.oauth_state = Some(nonce);

    let session_id = existing.unwrap_or_else(new_session_id);
    state
        .sessions
        .save(&session_id, &session)
        .await
        .map_err(store_error)?;
    Ok(found_with_cookie(&location, session_cookie(&session_id)))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
}

async fn oauth_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Result<Response, ApiError> {
    let rejected = |err: crate::sso::SsoError| {
        tracing::warn!(code = err.code, "sso callback rejected");
        json_error(StatusCode::BAD_REQUEST, err.code, err.message)
    };
    let session_id = session_id_from_headers(&headers).unwrap_or_default();
    // The nonce is checked and cleared in one step.
    let taken = match params.state.as_deref() {
        Some(nonce) if !session_id.is_empty() => state
            .sessions
            .take_state(&session_id, nonce)
            .await
            .map_err(store_error)?,
        _ => None,
    };
    let Some(mut session) = taken else {
        let pending = if session_id.is_empty() {
            None
        } else {
            state.sessions.load(&session_id).await.map_err(store_error)?
        };
        let err = verify_state(pending.as_ref(), params.state.as_deref())
            .err()
            .unwrap_or_else(state_mismatch);
        return Err(rejected(err));
    };

    let code = params
        .code
        .filter(|code| !code.trim().is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_SSO_NO_CODE",
                "callback is missing the authorization code",
            )
        })?;

    let sso_failure = |err: crate::sso::SsoError| json_error(StatusCode::BAD_GATEWAY, err.code, err.message);
    let token = state.helix.exchange_code(&code).await.map_err(sso_failure)?;
    let profile = state.helix.whoami(&token).await.map_err(sso_failure)?;

    let organization = &state.helix.config().member_organization;
    match evaluate_membership(&token, &profile, organization) {
        MembershipDecision::NotAMember => {
            tracing::info!(organization = %organization, "sso sign-in refused for non-member");
            state
                .sessions
                .remove(&session_id)
                .await
                .map_err(store_error)?;
            Ok(found_with_cookie(
                &format!("/message?key={NOT_A_MEMBER_KEY}"),
                expired_session_cookie(),
            ))
        }
        MembershipDecision::Member(new_user) => {
            let user = state
                .store
                .upsert_sso_user(&new_user)
                .await
                .map_err(store_error)?;
            session.user_id = Some(user.id);
            let rotated = state
                .sessions
                .cycle(Some(session_id.as_str()), &session)
                .await
                .map_err(store_error)?;
            tracing::info!(user_id = user.id, username = %user.username, "sso sign-in");
            Ok(found_with_cookie("/", session_cookie(&rotated)))
        }
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(session_id) = session_id_from_headers(&headers) {
        if let Err(err) = state.sessions.remove(&session_id).await {
            tracing::warn!(error = %err, "failed to remove session at logout");
        }
    }
    found_with_cookie(state.helix.logout_url(), expired_session_cookie())
}
