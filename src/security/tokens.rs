//! Paired access/refresh token lifecycle.
//!
//! Access and refresh tokens are the same bearer primitive differentiated by
//! abilities and lifetime: access tokens are short-lived and broad, refresh
//! tokens long-lived and only able to rotate. A pairing row ties the two to
//! the (subject, device) they were minted for; rotation deletes the old
//! pairing before issuing its replacement so the lifecycle's own queries
//! never discover two current pairings.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::TtlCache;
use crate::errors::TetherError;
use crate::settings::{MobileTokens, TokenRotation};
use crate::storage;
use crate::storage::TokenPairing;

#[derive(Debug, Error)]
pub enum TokenError {
    /// Unresolvable, revoked, orphaned, or lacking the rotate ability.
    #[error("invalid refresh token: {0}")]
    Invalid(&'static str),

    #[error("refresh token expired")]
    Expired,

    #[error(transparent)]
    Infra(#[from] TetherError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_expires_in: i64,
    pub expires_at: i64,
    pub refresh_expires_at: i64,
}

/// Caller-facing summary of the current pairing. Carries no raw token
/// identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub device_id: String,
    pub access_expires_at: i64,
    pub refresh_expires_at: i64,
    pub access_valid: bool,
    pub should_rotate: bool,
}

/// Proactive-rotation predicate: true once the elapsed fraction of the
/// token's lifetime reaches the threshold. Tokens without an expiry never
/// rotate.
pub fn should_rotate(created_at: i64, expires_at: Option<i64>, now: i64, threshold: f64) -> bool {
    let Some(expires_at) = expires_at else {
        return false;
    };
    let lifetime = expires_at - created_at;
    if lifetime <= 0 {
        return true;
    }
    let elapsed = (now - created_at).max(0);
    (elapsed as f64) / (lifetime as f64) >= threshold
}

fn token_info_key(subject: &str, device_id: &str) -> String {
    format!("token_info:{}:{}", subject, device_id)
}

pub struct TokenLifecycle {
    db: DatabaseConnection,
    cache: Arc<TtlCache>,
    tokens: MobileTokens,
    rotation: TokenRotation,
}

const TOKEN_INFO_CACHE_TTL: Duration = Duration::from_secs(300);

impl TokenLifecycle {
    pub fn new(
        db: DatabaseConnection,
        cache: Arc<TtlCache>,
        tokens: MobileTokens,
        rotation: TokenRotation,
    ) -> Self {
        Self {
            db,
            cache,
            tokens,
            rotation,
        }
    }

    /// Issues a fresh access/refresh pair for (subject, device). The
    /// plaintext tokens exist only in the returned value.
    pub async fn generate_token_pair(
        &self,
        subject: &str,
        device_id: &str,
    ) -> Result<TokenPair, TetherError> {
        let now = Utc::now().timestamp();

        let access_label = format!("mobile_access_{}_{}", device_id, now);
        let access = storage::issue_bearer_token(
            &self.db,
            subject,
            &access_label,
            &self.tokens.access.abilities,
            self.tokens.access.lifetime,
        )
        .await?;

        let refresh_label = format!("mobile_refresh_{}_{}", device_id, now);
        let refresh = storage::issue_bearer_token(
            &self.db,
            subject,
            &refresh_label,
            &self.tokens.refresh.abilities,
            self.tokens.refresh.lifetime,
        )
        .await?;

        // The pairing's effective lifetime mirrors the refresh expiry.
        storage::insert_token_pairing(
            &self.db,
            subject,
            device_id,
            access.id,
            refresh.id,
            refresh.expires_at,
        )
        .await?;

        self.cache.forget(&token_info_key(subject, device_id));

        Ok(TokenPair {
            access_token: access.token,
            refresh_token: refresh.token,
            token_type: "Bearer".to_string(),
            expires_in: self.tokens.access.lifetime,
            refresh_expires_in: self.tokens.refresh.lifetime,
            expires_at: access.expires_at,
            refresh_expires_at: refresh.expires_at,
        })
    }

    /// Client-driven rotation: the caller presents its refresh token, the
    /// old pairing is revoked, and a new pair is issued for the same
    /// (subject, device). The device id comes from the pairing row, never
    /// from parsing token labels.
    pub async fn rotate_tokens(&self, refresh_plaintext: &str) -> Result<TokenPair, TokenError> {
        let Some(refresh) = storage::find_bearer_token(&self.db, refresh_plaintext).await? else {
            return Err(TokenError::Invalid("unknown token"));
        };
        if refresh.revoked != 0 {
            return Err(TokenError::Invalid("token revoked"));
        }
        // The rotate gate requires the literal ability; a wildcard access
        // token must not mint new pairs.
        if !refresh.abilities.iter().any(|a| a == "refresh") {
            return Err(TokenError::Invalid("token lacks refresh ability"));
        }
        if refresh.is_expired(Utc::now().timestamp()) {
            return Err(TokenError::Expired);
        }

        let Some(pairing) = storage::get_pairing_by_refresh_token(&self.db, refresh.id).await?
        else {
            return Err(TokenError::Invalid("orphaned token"));
        };

        let subject = pairing.subject.clone();
        let device_id = pairing.device_id.clone();

        self.revoke_pairing(&pairing).await?;

        let pair = self.generate_token_pair(&subject, &device_id).await?;
        Ok(pair)
    }

    /// Whether the access token is close enough to expiry that the client
    /// should rotate now.
    pub fn access_should_rotate(&self, created_at: i64, expires_at: i64, now: i64) -> bool {
        should_rotate(created_at, Some(expires_at), now, self.rotation.threshold)
    }

    pub async fn revoke_device_tokens(
        &self,
        subject: &str,
        device_id: &str,
    ) -> Result<u64, TetherError> {
        let pairings = storage::pairings_for_device(&self.db, subject, device_id).await?;
        let mut revoked = 0u64;
        for pairing in pairings {
            self.revoke_pairing(&pairing).await?;
            revoked += 1;
        }
        Ok(revoked)
    }

    pub async fn revoke_all_user_tokens(&self, subject: &str) -> Result<u64, TetherError> {
        let pairings = storage::pairings_for_user(&self.db, subject).await?;
        let mut revoked = 0u64;
        for pairing in pairings {
            self.revoke_pairing(&pairing).await?;
            revoked += 1;
        }
        Ok(revoked)
    }

    pub async fn get_token_info(
        &self,
        subject: &str,
        device_id: &str,
    ) -> Result<Option<TokenInfo>, TetherError> {
        let key = token_info_key(subject, device_id);
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(info) = serde_json::from_str(&cached) {
                return Ok(Some(info));
            }
        }

        let Some(pairing) = storage::latest_pairing_for_device(&self.db, subject, device_id).await?
        else {
            return Ok(None);
        };

        let now = Utc::now().timestamp();
        let access = storage::get_bearer_token_by_id(&self.db, pairing.access_token_id).await?;
        let info = match access {
            Some(access) => TokenInfo {
                device_id: pairing.device_id.clone(),
                access_expires_at: access.expires_at,
                refresh_expires_at: pairing.expires_at,
                access_valid: access.revoked == 0 && !access.is_expired(now),
                should_rotate: self.access_should_rotate(access.created_at, access.expires_at, now),
            },
            None => TokenInfo {
                device_id: pairing.device_id.clone(),
                access_expires_at: 0,
                refresh_expires_at: pairing.expires_at,
                access_valid: false,
                should_rotate: true,
            },
        };

        if let Ok(json) = serde_json::to_string(&info) {
            self.cache.put(&key, &json, TOKEN_INFO_CACHE_TTL);
        }
        Ok(Some(info))
    }

    /// Reclaims pairings whose refresh window lapsed and whose access token
    /// is also expired or already gone. Run hourly.
    pub async fn cleanup_expired_tokens(&self) -> Result<u64, TetherError> {
        let now = Utc::now().timestamp();
        let expired = storage::expired_pairings(&self.db, now).await?;

        let mut reclaimed = 0u64;
        for pairing in expired {
            let access = storage::get_bearer_token_by_id(&self.db, pairing.access_token_id).await?;
            let access_dead = match access {
                Some(a) => a.revoked != 0 || a.is_expired(now),
                None => true,
            };
            if access_dead {
                self.revoke_pairing(&pairing).await?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Deletes both underlying tokens, the pairing row, and the cached
    /// per-device token info.
    async fn revoke_pairing(&self, pairing: &TokenPairing) -> Result<(), TetherError> {
        storage::delete_bearer_token(&self.db, pairing.access_token_id).await?;
        storage::delete_bearer_token(&self.db, pairing.refresh_token_id).await?;
        storage::delete_token_pairing(&self.db, pairing.id).await?;
        self.cache
            .forget(&token_info_key(&pairing.subject, &pairing.device_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_rotate_false_at_issuance() {
        assert!(!should_rotate(1000, Some(1900), 1000, 0.8));
    }

    #[test]
    fn should_rotate_true_at_threshold() {
        // 900s lifetime, 720s elapsed = exactly 80%
        assert!(should_rotate(1000, Some(1900), 1720, 0.8));
    }

    #[test]
    fn should_rotate_false_just_below_threshold() {
        assert!(!should_rotate(1000, Some(1900), 1719, 0.8));
    }

    #[test]
    fn should_rotate_true_past_expiry() {
        assert!(should_rotate(1000, Some(1900), 2000, 0.8));
    }

    #[test]
    fn should_rotate_false_without_expiry() {
        assert!(!should_rotate(1000, None, 999_999, 0.8));
    }
}
