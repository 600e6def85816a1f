use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use rdkafka::producer::{FutureProducer, Producer};
use serde::{Deserialize, Serialize};
use shared::{OrderId, PieceId};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::auth::{AuthError, Claims, PublicKeyCache};
use crate::error::WarehouseError;
use crate::models::{Piece, PieceStatus};
use crate::store::PieceStore;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

/// Healthy when the brokers answer a metadata request.
pub struct KafkaHealth {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaHealth {
    pub fn new(producer: FutureProducer, timeout: Duration) -> Self {
        Self { producer, timeout }
    }
}

#[async_trait]
impl HealthProbe for KafkaHealth {
    async fn check(&self) -> Result<(), String> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(drop)
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

/// Fixed answer, for tests and for running without a broker.
pub struct StaticHealth(pub Result<(), String>);

#[async_trait]
impl HealthProbe for StaticHealth {
    async fn check(&self) -> Result<(), String> {
        self.0.clone()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pieces: Arc<dyn PieceStore>,
    pub keys: Arc<PublicKeyCache>,
    pub health: Arc<dyn HealthProbe>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::KeyUnavailable | AuthError::InvalidKey(_) => {
                warn!("Token check impossible: {}", err);
                ApiError::Unavailable(err.to_string())
            }
            AuthError::InvalidToken(_) => ApiError::Unauthorized(err.to_string()),
        }
    }
}

impl From<WarehouseError> for ApiError {
    fn from(err: WarehouseError) -> Self {
        error!("Store query failed: {}", err);
        ApiError::Internal(err.to_string())
    }
}

/// Caller holding any valid token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Claims);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing authorization header".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("expected 'Bearer <token>'".to_string()))?;

        Ok(Self(state.keys.verify(token)?))
    }
}

/// Caller holding a valid token with the admin role.
#[derive(Debug, Clone)]
pub struct RequireAdmin(pub Claims);

#[async_trait]
impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let AuthenticatedUser(claims) = AuthenticatedUser::from_request_parts(parts, state).await?;
        if !claims.is_admin() {
            return Err(ApiError::Unauthorized("admin role required".to_string()));
        }
        Ok(Self(claims))
    }
}

pub fn create_router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/health", get(health_check))
        .route("/health/auth", get(auth_health_check))
        .route("/pieces", get(list_pieces))
        .route("/pieces/order/:order_id", get(pieces_by_order))
        .route("/pieces/:piece_id", get(get_piece));

    Router::new()
        .nest("/warehouse", routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    match state.health.check().await {
        Ok(()) => Ok(Json(HealthResponse { status: "OK" })),
        Err(reason) => {
            warn!("Health check failed: {}", reason);
            Err(ApiError::Unavailable(reason))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthHealthResponse {
    pub status: &'static str,
    pub sub: String,
    pub role: Option<String>,
}

pub async fn auth_health_check(AuthenticatedUser(claims): AuthenticatedUser) -> Json<AuthHealthResponse> {
    Json(AuthHealthResponse {
        status: "OK",
        sub: claims.sub,
        role: claims.role,
    })
}

#[derive(Debug, Deserialize)]
pub struct PieceFilter {
    pub status: Option<PieceStatus>,
}

pub async fn list_pieces(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Query(filter): Query<PieceFilter>,
) -> Result<Json<Vec<Piece>>, ApiError> {
    let pieces = match filter.status {
        Some(status) => state.pieces.pieces_by_status(status).await?,
        None => state.pieces.list_pieces().await?,
    };
    Ok(Json(pieces))
}

pub async fn pieces_by_order(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<Vec<Piece>>, ApiError> {
    Ok(Json(state.pieces.pieces_by_order(order_id).await?))
}

pub async fn get_piece(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(piece_id): Path<PieceId>,
) -> Result<Json<Piece>, ApiError> {
    state
        .pieces
        .get_piece(piece_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("piece {} not found", piece_id)))
}
