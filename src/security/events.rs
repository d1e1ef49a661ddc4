//! Security event capture with risk scoring and tiered sinks.
//!
//! Every event goes to the structured log channel. At or above the persistence
//! threshold it is also written to the database; above the SIEM threshold it
//! is forwarded on the siem channel; above the alert threshold it fires the
//! real-time alert channel. Each tier is independently best-effort: a sink
//! failure is logged and swallowed, never surfaced to the request being
//! observed.

use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde_json::Value;

use crate::settings::Events;
use crate::storage;
use crate::storage::NewSecurityEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEventKind {
    AuthSuccess,
    AuthFailure,
    ApiKeyValidationFailed,
    SignatureValidationFailed,
    DeviceValidationFailed,
    UntrustedDeviceAccess,
    RateLimitExceeded,
    TokenRotation,
    TokenRevoked,
    DeviceRegistered,
    DeviceTrusted,
    DeviceTrustRevoked,
    SecurityValidationSuccess,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::AuthSuccess => "auth_success",
            SecurityEventKind::AuthFailure => "auth_failure",
            SecurityEventKind::ApiKeyValidationFailed => "api_key_validation_failed",
            SecurityEventKind::SignatureValidationFailed => "signature_validation_failed",
            SecurityEventKind::DeviceValidationFailed => "device_validation_failed",
            SecurityEventKind::UntrustedDeviceAccess => "untrusted_device_access",
            SecurityEventKind::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventKind::TokenRotation => "token_rotation",
            SecurityEventKind::TokenRevoked => "token_revoked",
            SecurityEventKind::DeviceRegistered => "device_registered",
            SecurityEventKind::DeviceTrusted => "device_trusted",
            SecurityEventKind::DeviceTrustRevoked => "device_trust_revoked",
            SecurityEventKind::SecurityValidationSuccess => "security_validation_success",
        }
    }
}

/// Base risk per known event type. Unknown types score 0.5.
pub fn base_risk(event_type: &str) -> Option<f64> {
    let score = match event_type {
        "auth_success" => 0.1,
        "auth_failure" => 0.6,
        "api_key_validation_failed" => 0.9,
        "signature_validation_failed" => 0.8,
        "device_validation_failed" => 0.7,
        "untrusted_device_access" => 0.5,
        "rate_limit_exceeded" => 0.4,
        "token_rotation" => 0.2,
        "token_revoked" => 0.3,
        "device_registered" => 0.2,
        "device_trusted" => 0.3,
        "device_trust_revoked" => 0.4,
        "security_validation_success" => 0.0,
        _ => return None,
    };
    Some(score)
}

/// Everything an event carries besides its type. Modifier inputs come from
/// whatever the caller knows at the call site; absent inputs contribute
/// nothing.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub subject: Option<String>,
    pub tenant_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
    pub session_id: Option<String>,
    pub failed_attempts: Option<u32>,
    pub geo_distance_km: Option<f64>,
    pub suspicious_user_agent: bool,
    pub concurrent_sessions: Option<u32>,
    pub extra: Option<Value>,
}

const FAILED_ATTEMPT_INCREMENT: f64 = 0.05;
const FAILED_ATTEMPT_CAP: f64 = 0.2;
const GEO_DISTANCE_THRESHOLD_KM: f64 = 1000.0;
const GEO_DISTANCE_INCREMENT: f64 = 0.15;
const SUSPICIOUS_AGENT_INCREMENT: f64 = 0.1;
const CONCURRENT_SESSION_THRESHOLD: u32 = 5;
const CONCURRENT_SESSION_INCREMENT: f64 = 0.1;

/// Pure risk computation: base score per event type plus bounded additive
/// modifiers, clamped to [0, 1].
pub fn risk_score(event_type: &str, ctx: &EventContext) -> f64 {
    let mut score = base_risk(event_type).unwrap_or(0.5);

    if let Some(attempts) = ctx.failed_attempts {
        score += (attempts as f64 * FAILED_ATTEMPT_INCREMENT).min(FAILED_ATTEMPT_CAP);
    }
    if let Some(distance) = ctx.geo_distance_km {
        if distance > GEO_DISTANCE_THRESHOLD_KM {
            score += GEO_DISTANCE_INCREMENT;
        }
    }
    if ctx.suspicious_user_agent {
        score += SUSPICIOUS_AGENT_INCREMENT;
    }
    if let Some(sessions) = ctx.concurrent_sessions {
        if sessions > CONCURRENT_SESSION_THRESHOLD {
            score += CONCURRENT_SESSION_INCREMENT;
        }
    }

    score.clamp(0.0, 1.0)
}

pub struct SecurityEventLogger {
    db: DatabaseConnection,
    cfg: Events,
}

impl SecurityEventLogger {
    pub fn new(db: DatabaseConnection, cfg: Events) -> Self {
        Self { db, cfg }
    }

    pub async fn log(&self, kind: SecurityEventKind, ctx: EventContext) {
        self.log_event_type(kind.as_str(), ctx).await;
    }

    /// String-typed entry point; unrecognized event types score 0.5 and are
    /// themselves worth noticing.
    pub async fn log_event_type(&self, event_type: &str, ctx: EventContext) {
        if base_risk(event_type).is_none() {
            tracing::warn!(target: "security", event_type, "unrecognized security event type");
        }

        let score = risk_score(event_type, &ctx);

        tracing::info!(
            target: "security",
            event_type,
            risk_score = score,
            subject = ctx.subject.as_deref(),
            tenant_id = ctx.tenant_id.as_deref(),
            ip = ctx.ip.as_deref(),
            device_id = ctx.device_id.as_deref(),
            "security event"
        );

        if score >= self.cfg.persist_threshold {
            let record = NewSecurityEvent {
                event_type: event_type.to_string(),
                occurred_at: Utc::now().timestamp(),
                subject: ctx.subject.clone(),
                tenant_id: ctx.tenant_id.clone(),
                ip_address: ctx.ip.clone(),
                user_agent: ctx.user_agent.clone(),
                device_id: ctx.device_id.clone(),
                session_id: ctx.session_id.clone(),
                context: ctx.extra.clone(),
                risk_score: score,
            };
            if let Err(e) = storage::insert_security_event(&self.db, &record).await {
                tracing::error!(target: "security", error = %e, "failed to persist security event");
            }
        }

        if score >= self.cfg.siem_threshold {
            tracing::warn!(
                target: "siem",
                event_type,
                risk_score = score,
                subject = ctx.subject.as_deref(),
                ip = ctx.ip.as_deref(),
                device_id = ctx.device_id.as_deref(),
                "high-risk security event"
            );
        }

        if score >= self.cfg.alert_threshold {
            tracing::error!(
                target: "alert",
                event_type,
                risk_score = score,
                subject = ctx.subject.as_deref(),
                ip = ctx.ip.as_deref(),
                "critical security event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_failure_scores_point_nine() {
        let score = risk_score("api_key_validation_failed", &EventContext::default());
        assert!((score - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn auth_success_scores_point_one() {
        let score = risk_score("auth_success", &EventContext::default());
        assert!((score - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_type_scores_default() {
        let score = risk_score("totally_new_event", &EventContext::default());
        assert!((score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn failed_attempts_contribution_is_capped() {
        let ctx = EventContext {
            failed_attempts: Some(100),
            ..Default::default()
        };
        let score = risk_score("auth_failure", &ctx);
        assert!((score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn modifiers_are_additive() {
        let ctx = EventContext {
            failed_attempts: Some(2),
            geo_distance_km: Some(5000.0),
            suspicious_user_agent: true,
            concurrent_sessions: Some(10),
            ..Default::default()
        };
        // 0.1 + 0.1 + 0.15 + 0.1 + 0.1
        let score = risk_score("auth_success", &ctx);
        assert!((score - 0.55).abs() < 1e-9);
    }

    #[test]
    fn score_is_clamped_to_one() {
        let ctx = EventContext {
            failed_attempts: Some(10),
            geo_distance_km: Some(9000.0),
            suspicious_user_agent: true,
            concurrent_sessions: Some(50),
            ..Default::default()
        };
        assert_eq!(risk_score("api_key_validation_failed", &ctx), 1.0);
    }

    #[test]
    fn nearby_geo_distance_adds_nothing() {
        let ctx = EventContext {
            geo_distance_km: Some(10.0),
            ..Default::default()
        };
        let score = risk_score("auth_success", &ctx);
        assert!((score - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn kind_strings_are_known() {
        for kind in [
            SecurityEventKind::AuthSuccess,
            SecurityEventKind::AuthFailure,
            SecurityEventKind::ApiKeyValidationFailed,
            SecurityEventKind::SignatureValidationFailed,
            SecurityEventKind::DeviceValidationFailed,
            SecurityEventKind::UntrustedDeviceAccess,
            SecurityEventKind::RateLimitExceeded,
            SecurityEventKind::TokenRotation,
            SecurityEventKind::TokenRevoked,
            SecurityEventKind::DeviceRegistered,
            SecurityEventKind::DeviceTrusted,
            SecurityEventKind::DeviceTrustRevoked,
            SecurityEventKind::SecurityValidationSuccess,
        ] {
            assert!(base_risk(kind.as_str()).is_some(), "{}", kind.as_str());
        }
    }
}
