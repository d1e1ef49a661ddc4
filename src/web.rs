//! HTTP surface for the mobile security core.
//!
//! Login and refresh sit behind a thin API-key + rate-limit gate; everything
//! else under /mobile passes the full security gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::cache::TtlCache;
use crate::security::devices::DeviceRegistry;
use crate::security::events::{EventContext, SecurityEventKind, SecurityEventLogger};
use crate::security::gateway::{self, AuthPrincipal, GatewayError, SecurityGateway};
use crate::security::rate_limit::RateLimiter;
use crate::security::routes::RouteRules;
use crate::security::signing::SignatureValidator;
use crate::security::tokens::{TokenError, TokenLifecycle};
use crate::settings::Settings;
use crate::storage;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub registry: Arc<DeviceRegistry>,
    pub tokens: Arc<TokenLifecycle>,
    pub gateway: Arc<SecurityGateway>,
    pub events: Arc<SecurityEventLogger>,
}

impl AppState {
    /// Wires the component graph once; every tunable comes from `settings`.
    pub fn new(settings: Settings, db: DatabaseConnection) -> Self {
        let settings = Arc::new(settings);
        let cache = Arc::new(TtlCache::new());

        let registry = Arc::new(DeviceRegistry::new(
            db.clone(),
            cache.clone(),
            settings.device_binding.clone(),
        ));
        let tokens = Arc::new(TokenLifecycle::new(
            db.clone(),
            cache.clone(),
            settings.mobile_tokens.clone(),
            settings.token_rotation.clone(),
        ));
        let events = Arc::new(SecurityEventLogger::new(db.clone(), settings.events.clone()));

        let validator = SignatureValidator::new(
            registry.clone(),
            cache.clone(),
            settings.request_signing.clone(),
        );
        let limiter = RateLimiter::new(settings.rate_limits.clone());
        let gateway = Arc::new(SecurityGateway::new(
            settings.clone(),
            registry.clone(),
            validator,
            limiter,
            RouteRules::default_rules(),
            events.clone(),
        ));

        Self {
            settings,
            db,
            registry,
            tokens,
            gateway,
            events,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let pre_auth = Router::new()
        .route("/mobile/auth/login", post(login))
        .route("/mobile/auth/refresh", post(refresh))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gateway::pre_auth_middleware,
        ));

    let protected = Router::new()
        .route("/mobile/auth/logout", post(logout))
        .route("/mobile/devices", get(list_devices))
        .route("/mobile/devices/trust", post(trust_device))
        .route("/mobile/devices/{device_id}", delete(remove_device))
        .route("/mobile/devices/{device_id}/trust", delete(revoke_trust))
        .route("/mobile/tokens/info", get(token_info))
        .route("/mobile/profile", get(profile))
        .route("/mobile/users", post(create_user))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gateway::middleware,
        ));

    Router::new()
        .route("/healthz", get(health))
        .merge(pre_auth)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    use miette::IntoDiagnostic;

    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    tracing::info!(%addr, "tether listening");
    axum::serve(listener, app).await.into_diagnostic()?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn json_with_headers(status: StatusCode, body: Value, headers: &[(&str, String)]) -> Response {
    let mut response = (status, Json(body)).into_response();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            axum::http::HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// Registration view with the secret stripped; the plaintext secret only
/// ever appears in the one response that created it.
fn device_view(registration: &storage::DeviceRegistration) -> Value {
    json!({
        "device_id": registration.device_id,
        "device_info": registration.device_info,
        "is_trusted": registration.is_trusted == 1,
        "trusted_at": registration.trusted_at,
        "trusted_until": registration.trusted_until,
        "registered_at": registration.registered_at,
        "last_used_at": registration.last_used_at,
    })
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
    device_id: String,
    device_info: Option<Value>,
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    let subject = match storage::verify_user_password(&state.db, &req.email, &req.password).await {
        Ok(Some(subject)) => subject,
        Ok(None) => {
            state
                .events
                .log(
                    SecurityEventKind::AuthFailure,
                    EventContext {
                        device_id: Some(req.device_id.clone()),
                        extra: Some(json!({"email": req.email})),
                        ..Default::default()
                    },
                )
                .await;
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid_credentials", "message": "Email or password is incorrect"})),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "login failed");
            return GatewayError::Internal.into_response();
        }
    };

    let registration = match state
        .registry
        .register(&subject, &req.device_id, req.device_info.as_ref())
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "device registration failed");
            return GatewayError::Internal.into_response();
        }
    };

    // First registration gets a signing secret, delivered exactly once.
    let device_secret = if registration.device_secret.is_none() {
        match state.registry.generate_secret(&subject, &req.device_id).await {
            Ok(secret) => {
                state
                    .events
                    .log(
                        SecurityEventKind::DeviceRegistered,
                        EventContext {
                            subject: Some(subject.clone()),
                            device_id: Some(req.device_id.clone()),
                            ..Default::default()
                        },
                    )
                    .await;
                secret
            }
            Err(e) => {
                tracing::error!(error = %e, "secret generation failed");
                return GatewayError::Internal.into_response();
            }
        }
    } else {
        None
    };

    let pair = match state.tokens.generate_token_pair(&subject, &req.device_id).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "token issuance failed");
            return GatewayError::Internal.into_response();
        }
    };

    state
        .events
        .log(
            SecurityEventKind::AuthSuccess,
            EventContext {
                subject: Some(subject.clone()),
                device_id: Some(req.device_id.clone()),
                ..Default::default()
            },
        )
        .await;

    let mut device = device_view(&registration);
    if let Some(secret) = device_secret {
        device["device_secret"] = json!(secret);
    }

    json_with_headers(
        StatusCode::OK,
        json!({"tokens": pair, "device": device}),
        &[
            ("cache-control", "no-store".to_string()),
            ("pragma", "no-cache".to_string()),
        ],
    )
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh(State(state): State<AppState>, Json(req): Json<RefreshRequest>) -> Response {
    match state.tokens.rotate_tokens(&req.refresh_token).await {
        Ok(pair) => {
            state
                .events
                .log(SecurityEventKind::TokenRotation, EventContext::default())
                .await;
            json_with_headers(
                StatusCode::OK,
                json!({"tokens": pair}),
                &[
                    ("cache-control", "no-store".to_string()),
                    ("pragma", "no-cache".to_string()),
                ],
            )
        }
        Err(TokenError::Invalid(detail)) => {
            GatewayError::TokenInvalid(detail.to_string()).into_response()
        }
        Err(TokenError::Expired) => GatewayError::TokenExpired.into_response(),
        Err(TokenError::Infra(e)) => {
            tracing::error!(error = %e, "token rotation failed");
            GatewayError::Internal.into_response()
        }
    }
}

async fn logout(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Response {
    let result = match principal.device_id.as_deref() {
        Some(device_id) => {
            state
                .tokens
                .revoke_device_tokens(&principal.subject, device_id)
                .await
        }
        None => state.tokens.revoke_all_user_tokens(&principal.subject).await,
    };

    match result {
        Ok(revoked) => {
            state
                .events
                .log(
                    SecurityEventKind::TokenRevoked,
                    EventContext {
                        subject: Some(principal.subject.clone()),
                        device_id: principal.device_id.clone(),
                        ..Default::default()
                    },
                )
                .await;
            (StatusCode::OK, Json(json!({"revoked": revoked}))).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "logout failed");
            GatewayError::Internal.into_response()
        }
    }
}

async fn list_devices(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Response {
    match state.registry.list_devices(&principal.subject).await {
        Ok(devices) => {
            let views: Vec<Value> = devices.iter().map(device_view).collect();
            (StatusCode::OK, Json(json!({"devices": views}))).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "device listing failed");
            GatewayError::Internal.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrustRequest {
    device_id: String,
}

async fn trust_device(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
    Json(req): Json<TrustRequest>,
) -> Response {
    match state.registry.trust(&principal.subject, &req.device_id).await {
        Ok(true) => {
            state
                .events
                .log(
                    SecurityEventKind::DeviceTrusted,
                    EventContext {
                        subject: Some(principal.subject.clone()),
                        device_id: Some(req.device_id.clone()),
                        ..Default::default()
                    },
                )
                .await;
            (StatusCode::OK, Json(json!({"trusted": true}))).into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown_device", "message": "No such device registration"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "trust grant failed");
            GatewayError::Internal.into_response()
        }
    }
}

async fn revoke_trust(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
    Path(device_id): Path<String>,
) -> Response {
    match state.registry.revoke_trust(&principal.subject, &device_id).await {
        Ok(true) => {
            state
                .events
                .log(
                    SecurityEventKind::DeviceTrustRevoked,
                    EventContext {
                        subject: Some(principal.subject.clone()),
                        device_id: Some(device_id.clone()),
                        ..Default::default()
                    },
                )
                .await;
            (StatusCode::OK, Json(json!({"trusted": false}))).into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown_device", "message": "No such device registration"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "trust revocation failed");
            GatewayError::Internal.into_response()
        }
    }
}

async fn remove_device(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
    Path(device_id): Path<String>,
) -> Response {
    let removed = match state.registry.remove(&principal.subject, &device_id).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "device removal failed");
            return GatewayError::Internal.into_response();
        }
    };
    if !removed {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown_device", "message": "No such device registration"})),
        )
            .into_response();
    }

    // A removed device loses its token pairings with it.
    match state
        .tokens
        .revoke_device_tokens(&principal.subject, &device_id)
        .await
    {
        Ok(revoked) => {
            state
                .events
                .log(
                    SecurityEventKind::TokenRevoked,
                    EventContext {
                        subject: Some(principal.subject.clone()),
                        device_id: Some(device_id.clone()),
                        ..Default::default()
                    },
                )
                .await;
            (
                StatusCode::OK,
                Json(json!({"removed": true, "tokens_revoked": revoked})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "token revocation after device removal failed");
            GatewayError::Internal.into_response()
        }
    }
}

async fn token_info(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Response {
    let Some(device_id) = principal.device_id.as_deref() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing_device_id", "message": "Device id header required"})),
        )
            .into_response();
    };

    match state.tokens.get_token_info(&principal.subject, device_id).await {
        Ok(Some(info)) => (StatusCode::OK, Json(json!(info))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no_tokens", "message": "No token pairing for this device"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "token info lookup failed");
            GatewayError::Internal.into_response()
        }
    }
}

async fn profile(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Response {
    match storage::get_user(&state.db, &principal.subject).await {
        Ok(Some(user)) => (
            StatusCode::OK,
            Json(json!({
                "subject": user.subject,
                "email": user.email,
                "tenant_id": user.tenant_id,
                "role": user.role,
                "created_at": user.created_at,
            })),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown_user", "message": "User not found"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "profile lookup failed");
            GatewayError::Internal.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    email: String,
    password: String,
    tenant_id: Option<String>,
    role: Option<String>,
}

async fn create_user(
    State(state): State<AppState>,
    Extension(principal): Extension<AuthPrincipal>,
    Json(req): Json<CreateUserRequest>,
) -> Response {
    if principal.role != "admin" {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "forbidden", "message": "Admin role required"})),
        )
            .into_response();
    }

    if storage::get_user_by_email(&state.db, &req.email)
        .await
        .ok()
        .flatten()
        .is_some()
    {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "email_taken", "message": "A user with this email exists"})),
        )
            .into_response();
    }

    match storage::create_user(
        &state.db,
        &req.email,
        &req.password,
        req.tenant_id.clone(),
        req.role.as_deref().unwrap_or("member"),
    )
    .await
    {
        Ok(user) => (
            StatusCode::CREATED,
            Json(json!({
                "subject": user.subject,
                "email": user.email,
                "tenant_id": user.tenant_id,
                "role": user.role,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "user creation failed");
            GatewayError::Internal.into_response()
        }
    }
}
