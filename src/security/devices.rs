//! Device registry: source of truth for device identity, trust state and the
//! per-device signing secret.
//!
//! Lookups are cached with explicit invalidation on every mutation, so a
//! reader never sees a cache hit older than the last successful write for
//! that key. Not-found is reported as `false`/`None`; only storage failures
//! propagate as errors.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde_json::Value;

use crate::cache::TtlCache;
use crate::errors::TetherError;
use crate::settings::DeviceBinding;
use crate::storage;
use crate::storage::DeviceRegistration;

pub struct DeviceRegistry {
    db: DatabaseConnection,
    cache: Arc<TtlCache>,
    cfg: DeviceBinding,
}

fn registered_key(subject: &str, device_id: &str) -> String {
    format!("device_registered:{}:{}", subject, device_id)
}

fn trusted_key(subject: &str, device_id: &str) -> String {
    format!("device_trusted:{}:{}", subject, device_id)
}

fn secret_key(device_id: &str) -> String {
    format!("device_secret:{}", device_id)
}

impl DeviceRegistry {
    pub fn new(db: DatabaseConnection, cache: Arc<TtlCache>, cfg: DeviceBinding) -> Self {
        Self { db, cache, cfg }
    }

    pub async fn is_registered(&self, subject: &str, device_id: &str) -> Result<bool, TetherError> {
        let key = registered_key(subject, device_id);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached == "1");
        }

        let registered = storage::get_device_registration(&self.db, subject, device_id)
            .await?
            .is_some();
        self.cache.put(
            &key,
            if registered { "1" } else { "0" },
            Duration::from_secs(self.cfg.registered_cache_ttl),
        );
        Ok(registered)
    }

    /// Trust holds only while `trusted_until` is in the future. The cache
    /// stores the expiry timestamp rather than a boolean so a grant lapsing
    /// mid-TTL is still seen as expired.
    pub async fn is_trusted(&self, subject: &str, device_id: &str) -> Result<bool, TetherError> {
        let now = Utc::now().timestamp();
        let key = trusted_key(subject, device_id);

        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.parse::<i64>().map(|until| until > now).unwrap_or(false));
        }

        let registration = storage::get_device_registration(&self.db, subject, device_id).await?;
        let trusted_until = match registration {
            Some(r) if r.is_trusted == 1 => r.trusted_until.unwrap_or(0),
            _ => 0,
        };
        self.cache.put(
            &key,
            &trusted_until.to_string(),
            Duration::from_secs(self.cfg.trusted_cache_ttl),
        );
        Ok(trusted_until > now)
    }

    /// Idempotent registration. An existing (subject, device) row is
    /// refreshed in place and keeps its trust state; a new device may first
    /// evict the least-recently-used registration when the user is at the
    /// per-user limit.
    pub async fn register(
        &self,
        subject: &str,
        device_id: &str,
        device_info: Option<&Value>,
    ) -> Result<DeviceRegistration, TetherError> {
        if let Some(updated) =
            storage::touch_device_registration(&self.db, subject, device_id, device_info).await?
        {
            self.cache.put(
                &registered_key(subject, device_id),
                "1",
                Duration::from_secs(self.cfg.registered_cache_ttl),
            );
            return Ok(updated);
        }

        let count = storage::count_device_registrations(&self.db, subject).await?;
        if count >= self.cfg.max_devices_per_user {
            if let Some(oldest) = storage::oldest_device_registration(&self.db, subject).await? {
                storage::delete_device_registration(&self.db, subject, &oldest.device_id).await?;
                self.forget_device(subject, &oldest.device_id);
            }
        }

        let registration =
            storage::insert_device_registration(&self.db, subject, device_id, device_info).await?;
        self.cache.put(
            &registered_key(subject, device_id),
            "1",
            Duration::from_secs(self.cfg.registered_cache_ttl),
        );
        Ok(registration)
    }

    /// Grants trust for the configured duration. Returns false when no
    /// matching registration exists.
    pub async fn trust(&self, subject: &str, device_id: &str) -> Result<bool, TetherError> {
        let trusted_until = Utc::now().timestamp() + self.cfg.device_trust_duration;
        let updated =
            storage::set_device_trust(&self.db, subject, device_id, trusted_until).await?;
        if updated {
            self.cache.forget(&trusted_key(subject, device_id));
        }
        Ok(updated)
    }

    pub async fn revoke_trust(&self, subject: &str, device_id: &str) -> Result<bool, TetherError> {
        let updated = storage::clear_device_trust(&self.db, subject, device_id).await?;
        if updated {
            self.cache.forget(&trusted_key(subject, device_id));
        }
        Ok(updated)
    }

    /// Generates and stores a fresh signing secret, returning the plaintext.
    /// This is the only point where the plaintext leaves the registry; the
    /// caller delivers it to the device once, in the registration response.
    pub async fn generate_secret(
        &self,
        subject: &str,
        device_id: &str,
    ) -> Result<Option<String>, TetherError> {
        let secret = storage::random_device_secret();
        let stored = storage::set_device_secret(&self.db, subject, device_id, &secret).await?;
        if !stored {
            return Ok(None);
        }
        self.cache.forget(&secret_key(device_id));
        Ok(Some(secret))
    }

    pub async fn get_secret(&self, device_id: &str) -> Result<Option<String>, TetherError> {
        let key = secret_key(device_id);
        if let Some(cached) = self.cache.get(&key) {
            return Ok(Some(cached));
        }

        let secret = storage::get_device_secret(&self.db, device_id).await?;
        if let Some(ref s) = secret {
            self.cache
                .put(&key, s, Duration::from_secs(self.cfg.secret_cache_ttl));
        }
        Ok(secret)
    }

    /// Explicit deregistration (user or admin initiated).
    pub async fn remove(&self, subject: &str, device_id: &str) -> Result<bool, TetherError> {
        let deleted = storage::delete_device_registration(&self.db, subject, device_id).await?;
        if deleted {
            self.forget_device(subject, device_id);
        }
        Ok(deleted)
    }

    pub async fn list_devices(
        &self,
        subject: &str,
    ) -> Result<Vec<DeviceRegistration>, TetherError> {
        storage::list_device_registrations(&self.db, subject).await
    }

    /// Clears trust flags on registrations whose window lapsed. Run hourly;
    /// `is_trusted` already treats lapsed grants as untrusted, this keeps the
    /// table honest.
    pub async fn cleanup_expired_trust(&self) -> Result<u64, TetherError> {
        let now = Utc::now().timestamp();
        let expired = storage::find_expired_trust(&self.db, now).await?;

        let mut processed = 0u64;
        for registration in expired {
            if storage::clear_device_trust(&self.db, &registration.subject, &registration.device_id)
                .await?
            {
                self.cache
                    .forget(&trusted_key(&registration.subject, &registration.device_id));
                processed += 1;
            }
        }
        Ok(processed)
    }

    fn forget_device(&self, subject: &str, device_id: &str) {
        self.cache.forget(&registered_key(subject, device_id));
        self.cache.forget(&trusted_key(subject, device_id));
        self.cache.forget(&secret_key(device_id));
    }
}
