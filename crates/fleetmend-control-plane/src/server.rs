use crate::shared::error::ControlPlaneError;
use crate::shared::types::{
    ApiVersion, CreateSecurityGroupRuleBody, CreateServerGroupBody, RequestContext,
    SecurityGroupBody, ServerActionBody, ServerGroupListQuery,
};
use crate::ControlPlane;
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use fleetmend_core::ErrorResponse;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub const PROJECT_HEADER: &str = "x-project-id";
pub const USER_HEADER: &str = "x-user-id";
pub const ROLES_HEADER: &str = "x-roles";
pub const API_VERSION_HEADER: &str = "x-compute-api-version";

#[derive(Clone)]
pub struct AppState {
    pub control_plane: Arc<ControlPlane>,
}

/// Error body sent back over HTTP
pub struct ApiError(pub ErrorResponse);

impl From<ErrorResponse> for ApiError {
    fn from(response: ErrorResponse) -> Self {
        Self(response)
    }
}

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.0 }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn router(control_plane: Arc<ControlPlane>) -> Router {
    let state = AppState { control_plane };

    Router::new()
        .route("/servers/:id/action", post(server_action))
        .route(
            "/servers/:id/os-security-groups",
            get(list_instance_security_groups),
        )
        .route(
            "/os-server-groups",
            get(list_server_groups).post(create_server_group),
        )
        .route(
            "/os-server-groups/:id",
            get(show_server_group).delete(delete_server_group),
        )
        .route(
            "/os-security-groups",
            get(list_security_groups).post(create_security_group),
        )
        .route(
            "/os-security-groups/:id",
            get(show_security_group)
                .put(update_security_group)
                .delete(delete_security_group),
        )
        .route("/os-security-group-rules", post(create_security_group_rule))
        .route(
            "/os-security-group-rules/:id",
            delete(delete_security_group_rule),
        )
        .route("/os-certificates", post(certificates_gone))
        .route("/os-certificates/:id", get(certificates_gone))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_metrics))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Build the caller context from identity and version headers.
pub fn request_context(headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let project_id = header_str(headers, PROJECT_HEADER).ok_or_else(|| {
        ControlPlaneError::BadRequest("X-Project-Id header is required".to_string())
    })?;
    let user_id = header_str(headers, USER_HEADER).unwrap_or("anonymous");
    let api_version =
        ApiVersion::negotiate(header_str(headers, API_VERSION_HEADER)).map_err(ControlPlaneError::from)?;

    let mut ctx = RequestContext::new(project_id, user_id).with_version(api_version);
    let is_admin = header_str(headers, ROLES_HEADER)
        .map(|roles| roles.split(',').any(|role| role.trim() == "admin"))
        .unwrap_or(false);
    if is_admin {
        ctx = ctx.admin();
    }
    Ok(ctx)
}

async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let started = Instant::now();

    let response = next.run(request).await;

    state.control_plane.observability.record_api_request(
        &endpoint,
        response.status().as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn server_action(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ServerActionBody>,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers)?;
    let response = state
        .control_plane
        .server_actions
        .dispatch(&ctx, &instance_id, body)
        .await?;

    Ok(match response {
        Some(body) => (StatusCode::ACCEPTED, Json(body)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    })
}

async fn list_server_groups(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ServerGroupListQuery>,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers)?;
    let list = state.control_plane.server_groups.list(&ctx, query).await?;
    Ok(Json(list).into_response())
}

async fn show_server_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers)?;
    let group = state
        .control_plane
        .server_groups
        .show(&ctx, &group_id)
        .await?;
    Ok(Json(json!({ "server_group": group })).into_response())
}

async fn create_server_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateServerGroupBody>,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers)?;
    let group = state.control_plane.server_groups.create(&ctx, body).await?;
    Ok(Json(json!({ "server_group": group })).into_response())
}

async fn delete_server_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    request_context(&headers)?;
    state.control_plane.server_groups.delete(&group_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_security_groups(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers)?;
    let list = state
        .control_plane
        .security_groups
        .list(&ctx, page.limit, page.offset)
        .await?;
    Ok(Json(list).into_response())
}

async fn show_security_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    request_context(&headers)?;
    let group = state.control_plane.security_groups.show(&group_id).await?;
    Ok(Json(json!({ "security_group": group })).into_response())
}

async fn create_security_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SecurityGroupBody>,
) -> Result<Response, ApiError> {
    let ctx = request_context(&headers)?;
    let created = state.control_plane.security_groups.create(&ctx, body).await?;
    Ok(Json(created).into_response())
}

async fn update_security_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SecurityGroupBody>,
) -> Result<Response, ApiError> {
    request_context(&headers)?;
    let updated = state
        .control_plane
        .security_groups
        .update(&group_id, body)
        .await?;
    Ok(Json(updated).into_response())
}

async fn delete_security_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    request_context(&headers)?;
    state.control_plane.security_groups.delete(&group_id).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn create_security_group_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSecurityGroupRuleBody>,
) -> Result<Response, ApiError> {
    request_context(&headers)?;
    let created = state
        .control_plane
        .security_groups
        .create_rule(body)
        .await?;
    Ok(Json(created).into_response())
}

async fn delete_security_group_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    request_context(&headers)?;
    state
        .control_plane
        .security_groups
        .delete_rule(&rule_id)
        .await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn list_instance_security_groups(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    request_context(&headers)?;
    let list = state
        .control_plane
        .security_groups
        .list_for_instance(&instance_id)
        .await?;
    Ok(Json(list).into_response())
}

/// Certificate management was removed; every call answers 410.
async fn certificates_gone() -> ApiError {
    ControlPlaneError::Gone("The certificates API has been removed.".to_string()).into()
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.control_plane.observability.render_metrics() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(error) => ApiError(ErrorResponse::new(
            "INTERNAL_ERROR",
            error,
            StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        ))
        .into_response(),
    }
}
