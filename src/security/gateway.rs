//! The security gateway: the single choke point every protected mobile
//! request passes through.
//!
//! Order is fixed: API key → bearer principal → device binding → request
//! signature (sensitive operations only) → rate limit. Later steps never run
//! once an earlier step rejects, every rejection emits a security event
//! before the response leaves, and nothing but a generic failure ever
//! escapes to the client on an infrastructure error.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::errors::TetherError;
use crate::settings::Settings;
use crate::storage;
use crate::web::AppState;

use super::devices::DeviceRegistry;
use super::events::{EventContext, SecurityEventKind, SecurityEventLogger};
use super::rate_limit::RateLimiter;
use super::routes::RouteRules;
use super::signing::{SignatureValidator, SignedRequest};

/// Everything the gateway needs to know about a request, extracted up front.
/// No ambient request/auth globals anywhere below this point.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    /// Full URL as the client signed it.
    pub url: String,
    pub path: String,
    pub body: String,
    pub api_key: Option<String>,
    pub device_id: Option<String>,
    pub timestamp: Option<String>,
    pub nonce: Option<String>,
    pub signature: Option<String>,
    /// Resolved bearer principal, if any.
    pub subject: Option<String>,
    pub tenant_id: Option<String>,
    pub role: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Authenticated principal injected into request extensions for handlers.
#[derive(Debug, Clone)]
pub struct AuthPrincipal {
    pub subject: String,
    pub tenant_id: Option<String>,
    pub role: String,
    pub device_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("authentication required")]
    Unauthenticated,
    #[error("device not registered")]
    InvalidDevice,
    #[error("request signature validation failed")]
    InvalidSignature,
    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after: u64 },
    #[error("invalid token: {0}")]
    TokenInvalid(String),
    #[error("token expired")]
    TokenExpired,
    #[error("internal error")]
    Internal,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error, message) = match &self {
            GatewayError::InvalidApiKey => (
                StatusCode::UNAUTHORIZED,
                "invalid_api_key",
                "A valid API key is required".to_string(),
            ),
            GatewayError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "Authentication required".to_string(),
            ),
            GatewayError::InvalidDevice => (
                StatusCode::FORBIDDEN,
                "invalid_device",
                "Device is not registered for this account".to_string(),
            ),
            GatewayError::InvalidSignature => (
                StatusCode::FORBIDDEN,
                "invalid_signature",
                "Request signature validation failed".to_string(),
            ),
            GatewayError::RateLimitExceeded { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                format!("Rate limit exceeded, retry after {}s", retry_after),
            ),
            GatewayError::TokenInvalid(detail) => (
                StatusCode::BAD_REQUEST,
                "invalid_token",
                detail.clone(),
            ),
            GatewayError::TokenExpired => (
                StatusCode::BAD_REQUEST,
                "token_expired",
                "Refresh token has expired".to_string(),
            ),
            GatewayError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "An internal error occurred".to_string(),
            ),
        };

        let mut response =
            (status, Json(json!({"error": error, "message": message}))).into_response();
        if let GatewayError::RateLimitExceeded { retry_after } = &self {
            if let Ok(val) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("retry-after", val);
            }
        }
        response
    }
}

fn infra(e: TetherError) -> GatewayError {
    tracing::error!(error = %e, "gateway infrastructure failure");
    GatewayError::Internal
}

pub struct SecurityGateway {
    settings: Arc<Settings>,
    registry: Arc<DeviceRegistry>,
    validator: SignatureValidator,
    limiter: RateLimiter,
    rules: RouteRules,
    events: Arc<SecurityEventLogger>,
}

impl SecurityGateway {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<DeviceRegistry>,
        validator: SignatureValidator,
        limiter: RateLimiter,
        rules: RouteRules,
        events: Arc<SecurityEventLogger>,
    ) -> Self {
        Self {
            settings,
            registry,
            validator,
            limiter,
            rules,
            events,
        }
    }

    pub fn rules(&self) -> &RouteRules {
        &self.rules
    }

    /// Shared-secret check with constant-time comparison. An empty
    /// configured key rejects everything rather than matching everything.
    async fn check_api_key(&self, ctx: &RequestContext) -> Result<(), GatewayError> {
        if !self.settings.api_key.required {
            return Ok(());
        }
        let presented = ctx.api_key.as_deref().unwrap_or("");
        let expected = self.settings.api_key.key.as_str();
        let matches =
            !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()));
        if !matches {
            self.events
                .log(SecurityEventKind::ApiKeyValidationFailed, self.event_ctx(ctx, None))
                .await;
            return Err(GatewayError::InvalidApiKey);
        }
        Ok(())
    }

    /// Runs the full pipeline against an explicit request context. Handlers
    /// only execute when this returns Ok.
    pub async fn authorize(&self, ctx: &RequestContext) -> Result<(), GatewayError> {
        // 1. Shared-secret API key.
        self.check_api_key(ctx).await?;

        // 2. Bearer principal.
        let Some(subject) = ctx.subject.as_deref() else {
            self.events
                .log(SecurityEventKind::AuthFailure, self.event_ctx(ctx, None))
                .await;
            return Err(GatewayError::Unauthenticated);
        };

        // 3. Device binding. A registered-but-untrusted device passes with a
        // soft warning so clients can build trust progressively; an unknown
        // device is a hard stop.
        if self.settings.device_binding.enabled {
            let Some(device_id) = ctx.device_id.as_deref() else {
                self.events
                    .log(
                        SecurityEventKind::DeviceValidationFailed,
                        self.event_ctx(ctx, Some(json!({"reason": "missing_device_id"}))),
                    )
                    .await;
                return Err(GatewayError::InvalidDevice);
            };

            let trusted = self
                .registry
                .is_trusted(subject, device_id)
                .await
                .map_err(infra)?;
            if !trusted {
                let registered = self
                    .registry
                    .is_registered(subject, device_id)
                    .await
                    .map_err(infra)?;
                if !registered {
                    self.events
                        .log(
                            SecurityEventKind::DeviceValidationFailed,
                            self.event_ctx(ctx, Some(json!({"reason": "unregistered_device"}))),
                        )
                        .await;
                    return Err(GatewayError::InvalidDevice);
                }
                self.events
                    .log(SecurityEventKind::UntrustedDeviceAccess, self.event_ctx(ctx, None))
                    .await;
            }
        }

        // 4. Request signature, sensitive operations only.
        if self.settings.request_signing.enabled
            && self.rules.is_sensitive(&ctx.method, &ctx.path)
        {
            let signed = SignedRequest {
                method: &ctx.method,
                url: &ctx.url,
                body: &ctx.body,
                device_id: ctx.device_id.as_deref(),
                timestamp: ctx.timestamp.as_deref(),
                nonce: ctx.nonce.as_deref(),
                signature: ctx.signature.as_deref(),
            };
            match self.validator.validate(&signed).await.map_err(infra)? {
                Ok(()) => {}
                Err(cause) => {
                    self.events
                        .log(
                            SecurityEventKind::SignatureValidationFailed,
                            self.event_ctx(ctx, Some(json!({"reason": cause.reason()}))),
                        )
                        .await;
                    return Err(GatewayError::InvalidSignature);
                }
            }
        }

        // 5. Rate limit, keyed by principal (fallback: source address).
        let class = self.rules.classify(&ctx.method, &ctx.path);
        let key = ctx
            .subject
            .as_deref()
            .or(ctx.ip.as_deref())
            .unwrap_or("anonymous");
        if let Err(retry_after) = self.limiter.check(class, key) {
            self.events
                .log(
                    SecurityEventKind::RateLimitExceeded,
                    self.event_ctx(ctx, Some(json!({"class": class.as_str()}))),
                )
                .await;
            return Err(GatewayError::RateLimitExceeded { retry_after });
        }

        self.events
            .log(SecurityEventKind::SecurityValidationSuccess, self.event_ctx(ctx, None))
            .await;
        Ok(())
    }

    /// Thin pre-auth pipeline for the login/refresh endpoints, which cannot
    /// carry a bearer token yet: API key plus the auth-class rate budget.
    pub async fn authorize_pre_auth(&self, ctx: &RequestContext) -> Result<(), GatewayError> {
        self.check_api_key(ctx).await?;

        let class = self.rules.classify(&ctx.method, &ctx.path);
        let key = ctx.ip.as_deref().unwrap_or("anonymous");
        if let Err(retry_after) = self.limiter.check(class, key) {
            self.events
                .log(
                    SecurityEventKind::RateLimitExceeded,
                    self.event_ctx(ctx, Some(json!({"class": class.as_str()}))),
                )
                .await;
            return Err(GatewayError::RateLimitExceeded { retry_after });
        }

        Ok(())
    }

    fn event_ctx(&self, ctx: &RequestContext, extra: Option<serde_json::Value>) -> EventContext {
        EventContext {
            subject: ctx.subject.clone(),
            tenant_id: ctx.tenant_id.clone(),
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            device_id: ctx.device_id.clone(),
            session_id: None,
            extra,
            ..Default::default()
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Reconstructs the URL the client signed. Proxies are expected to forward
/// the original scheme; without one we assume plain http.
fn full_url(headers: &HeaderMap, uri: &axum::http::Uri) -> String {
    let scheme = header_str(headers, "x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    let host = header_str(headers, "host").unwrap_or_default();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    format!("{}://{}{}", scheme, host, path_and_query)
}

const MAX_SIGNED_BODY_BYTES: usize = 1024 * 1024;

/// Builds the request context from raw request parts. The body is only
/// buffered when the operation is sensitive enough to need signature
/// verification.
pub async fn context_from_request(
    state: &AppState,
    req: Request,
) -> Result<(RequestContext, Request), GatewayError> {
    let (parts, body) = req.into_parts();
    let headers = &parts.headers;
    let signing = &state.settings.request_signing;

    let mut ctx = RequestContext {
        method: parts.method.to_string(),
        url: full_url(headers, &parts.uri),
        path: parts.uri.path().to_string(),
        body: String::new(),
        api_key: header_str(headers, &state.settings.api_key.header_name),
        device_id: header_str(headers, &signing.device_id_header),
        timestamp: header_str(headers, &signing.timestamp_header),
        nonce: header_str(headers, &signing.nonce_header),
        signature: header_str(headers, &signing.signature_header),
        subject: None,
        tenant_id: None,
        role: None,
        ip: header_str(headers, "x-forwarded-for")
            .map(|v| v.split(',').next().unwrap_or("").trim().to_string()),
        user_agent: header_str(headers, "user-agent"),
    };

    // Resolve the bearer principal. Refresh tokens carry only the `refresh`
    // ability and do not authenticate as a principal.
    if let Some(token) = header_str(headers, "authorization")
        .as_deref()
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        match storage::get_live_bearer_token(&state.db, token).await {
            Ok(Some(t)) if t.has_ability("mobile-access") => {
                match storage::get_user(&state.db, &t.subject).await {
                    Ok(user) => {
                        if let Some(user) = user {
                            ctx.tenant_id = user.tenant_id;
                            ctx.role = Some(user.role);
                        }
                        ctx.subject = Some(t.subject);
                    }
                    Err(e) => return Err(infra(e)),
                }
            }
            Ok(_) => {}
            Err(e) => return Err(infra(e)),
        }
    }

    // Sensitive operations are verified against the raw body, so buffer it
    // and hand the handler an identical copy.
    let body = if state.settings.request_signing.enabled
        && state.gateway.rules().is_sensitive(&ctx.method, &ctx.path)
    {
        let bytes = axum::body::to_bytes(body, MAX_SIGNED_BODY_BYTES)
            .await
            .map_err(|_| GatewayError::InvalidSignature)?;
        ctx.body = String::from_utf8_lossy(&bytes).into_owned();
        Body::from(bytes)
    } else {
        body
    };

    Ok((ctx, Request::from_parts(parts, body)))
}

/// Axum middleware wrapping the protected mobile routes.
pub async fn middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (ctx, mut req) = match context_from_request(&state, req).await {
        Ok(pair) => pair,
        Err(e) => return e.into_response(),
    };

    match state.gateway.authorize(&ctx).await {
        Ok(()) => {
            if let Some(subject) = ctx.subject.clone() {
                req.extensions_mut().insert(AuthPrincipal {
                    subject,
                    tenant_id: ctx.tenant_id.clone(),
                    role: ctx.role.clone().unwrap_or_else(|| "member".to_string()),
                    device_id: ctx.device_id.clone(),
                });
            }
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

/// Axum middleware for the pre-auth endpoints (login, refresh).
pub async fn pre_auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let (ctx, req) = match context_from_request(&state, req).await {
        Ok(pair) => pair,
        Err(e) => return e.into_response(),
    };

    match state.gateway.authorize_pre_auth(&ctx).await {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}
