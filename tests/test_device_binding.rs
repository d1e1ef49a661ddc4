// Integration tests for device registration, trust lifecycle and the
// per-device signing secret.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::json;

use helpers::db::seed_user;
use helpers::TestDb;
use tether::cache::TtlCache;
use tether::entities;
use tether::security::devices::DeviceRegistry;
use tether::settings::DeviceBinding;
use tether::storage;

fn registry_with(db: sea_orm::DatabaseConnection, cfg: DeviceBinding) -> DeviceRegistry {
    DeviceRegistry::new(db, Arc::new(TtlCache::new()), cfg)
}

fn default_registry(db: sea_orm::DatabaseConnection) -> DeviceRegistry {
    registry_with(db, DeviceBinding::default())
}

/// Backdate a registration's last_used_at so LRU ordering is deterministic.
async fn set_last_used(db: &sea_orm::DatabaseConnection, subject: &str, device_id: &str, ts: i64) {
    let model = entities::DeviceRegistration::find()
        .filter(entities::device_registration::Column::Subject.eq(subject))
        .filter(entities::device_registration::Column::DeviceId.eq(device_id))
        .one(db)
        .await
        .expect("query failed")
        .expect("registration not found");
    let mut active: entities::device_registration::ActiveModel = model.into();
    active.last_used_at = Set(ts);
    active.update(db).await.expect("update failed");
}

#[tokio::test]
async fn test_registration_is_idempotent_and_keeps_trust() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "alice@example.com", "password123").await;
    let registry = default_registry(db.clone());

    let first = registry
        .register(&user.subject, "phone-1", Some(&json!({"model": "Pixel 9"})))
        .await
        .expect("register failed");
    assert_eq!(first.is_trusted, 0);

    assert!(registry.trust(&user.subject, "phone-1").await.expect("trust failed"));

    // Re-registration updates device_info but must not clear trust.
    let again = registry
        .register(&user.subject, "phone-1", Some(&json!({"model": "Pixel 9 Pro"})))
        .await
        .expect("re-register failed");
    assert_eq!(again.id, first.id);
    assert_eq!(again.is_trusted, 1);
    assert_eq!(
        again.device_info.as_ref().and_then(|v| v["model"].as_str()),
        Some("Pixel 9 Pro")
    );

    let count = storage::count_device_registrations(&db, &user.subject)
        .await
        .expect("count failed");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_sixth_device_evicts_least_recently_used() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "bob@example.com", "password123").await;
    let registry = default_registry(db.clone());

    for i in 1..=5 {
        registry
            .register(&user.subject, &format!("device-{}", i), None)
            .await
            .expect("register failed");
    }
    // device-3 is the stalest; the others were used more recently.
    for (device, ts) in [
        ("device-1", 5000),
        ("device-2", 4000),
        ("device-3", 1000),
        ("device-4", 3000),
        ("device-5", 2000),
    ] {
        set_last_used(&db, &user.subject, device, ts).await;
    }

    // Warm the cache for the device about to be evicted, so the test also
    // proves eviction clears cached flags rather than letting them linger.
    assert!(registry
        .is_registered(&user.subject, "device-3")
        .await
        .expect("is_registered failed"));

    registry
        .register(&user.subject, "device-6", None)
        .await
        .expect("register failed");

    let count = storage::count_device_registrations(&db, &user.subject)
        .await
        .expect("count failed");
    assert_eq!(count, 5);

    assert!(!registry
        .is_registered(&user.subject, "device-3")
        .await
        .expect("is_registered failed"));
    assert!(registry
        .is_registered(&user.subject, "device-6")
        .await
        .expect("is_registered failed"));
    // The more recently used devices survive.
    for device in ["device-1", "device-2", "device-4", "device-5"] {
        assert!(
            registry
                .is_registered(&user.subject, device)
                .await
                .expect("is_registered failed"),
            "{} should survive eviction",
            device
        );
    }
}

#[tokio::test]
async fn test_trust_then_is_trusted() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "carol@example.com", "password123").await;
    let registry = default_registry(db.clone());

    registry
        .register(&user.subject, "phone-1", None)
        .await
        .expect("register failed");

    assert!(!registry
        .is_trusted(&user.subject, "phone-1")
        .await
        .expect("is_trusted failed"));

    assert!(registry.trust(&user.subject, "phone-1").await.expect("trust failed"));
    assert!(registry
        .is_trusted(&user.subject, "phone-1")
        .await
        .expect("is_trusted failed"));
}

#[tokio::test]
async fn test_trust_lapses_without_explicit_revoke() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "dave@example.com", "password123").await;
    // One-second trust window so the grant expires inside the test.
    let cfg = DeviceBinding {
        device_trust_duration: 1,
        ..Default::default()
    };
    let registry = registry_with(db.clone(), cfg);

    registry
        .register(&user.subject, "phone-1", None)
        .await
        .expect("register failed");
    assert!(registry.trust(&user.subject, "phone-1").await.expect("trust failed"));

    // Warm the trust cache; expiry must be honored through the cached value.
    assert!(registry
        .is_trusted(&user.subject, "phone-1")
        .await
        .expect("is_trusted failed"));

    tokio::time::sleep(Duration::from_millis(2100)).await;

    assert!(!registry
        .is_trusted(&user.subject, "phone-1")
        .await
        .expect("is_trusted failed"));
}

#[tokio::test]
async fn test_trust_on_unknown_device_is_a_noop() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "erin@example.com", "password123").await;
    let registry = default_registry(db.clone());

    assert!(!registry
        .trust(&user.subject, "never-registered")
        .await
        .expect("trust failed"));
    assert!(!registry
        .revoke_trust(&user.subject, "never-registered")
        .await
        .expect("revoke failed"));
}

#[tokio::test]
async fn test_revoke_trust_clears_flags() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "frank@example.com", "password123").await;
    let registry = default_registry(db.clone());

    registry
        .register(&user.subject, "phone-1", None)
        .await
        .expect("register failed");
    registry.trust(&user.subject, "phone-1").await.expect("trust failed");
    assert!(registry
        .is_trusted(&user.subject, "phone-1")
        .await
        .expect("is_trusted failed"));

    assert!(registry
        .revoke_trust(&user.subject, "phone-1")
        .await
        .expect("revoke failed"));
    assert!(!registry
        .is_trusted(&user.subject, "phone-1")
        .await
        .expect("is_trusted failed"));

    let registration = storage::get_device_registration(&db, &user.subject, "phone-1")
        .await
        .expect("lookup failed")
        .expect("registration missing");
    assert_eq!(registration.is_trusted, 0);
    assert!(registration.trusted_at.is_none());
    assert!(registration.trusted_until.is_none());
}

#[tokio::test]
async fn test_secret_generation_and_lookup() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "grace@example.com", "password123").await;
    let registry = default_registry(db.clone());

    // No registration yet: nothing to attach a secret to.
    assert!(registry
        .generate_secret(&user.subject, "phone-1")
        .await
        .expect("generate failed")
        .is_none());

    registry
        .register(&user.subject, "phone-1", None)
        .await
        .expect("register failed");

    let secret = registry
        .generate_secret(&user.subject, "phone-1")
        .await
        .expect("generate failed")
        .expect("secret expected");
    assert_eq!(secret.len(), 64);

    assert_eq!(
        registry.get_secret("phone-1").await.expect("get failed"),
        Some(secret.clone())
    );

    // Regeneration replaces the stored secret and invalidates the cache.
    let rotated = registry
        .generate_secret(&user.subject, "phone-1")
        .await
        .expect("generate failed")
        .expect("secret expected");
    assert_ne!(rotated, secret);
    assert_eq!(
        registry.get_secret("phone-1").await.expect("get failed"),
        Some(rotated)
    );
}

#[tokio::test]
async fn test_cleanup_expired_trust() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "heidi@example.com", "password123").await;
    let registry = default_registry(db.clone());

    registry
        .register(&user.subject, "stale", None)
        .await
        .expect("register failed");
    registry
        .register(&user.subject, "fresh", None)
        .await
        .expect("register failed");
    registry.trust(&user.subject, "stale").await.expect("trust failed");
    registry.trust(&user.subject, "fresh").await.expect("trust failed");

    // Backdate one grant so only it is swept.
    let model = entities::DeviceRegistration::find()
        .filter(entities::device_registration::Column::Subject.eq(user.subject.as_str()))
        .filter(entities::device_registration::Column::DeviceId.eq("stale"))
        .one(&db)
        .await
        .expect("query failed")
        .expect("registration not found");
    let mut active: entities::device_registration::ActiveModel = model.into();
    active.trusted_until = Set(Some(100));
    active.update(&db).await.expect("update failed");

    let processed = registry.cleanup_expired_trust().await.expect("cleanup failed");
    assert_eq!(processed, 1);

    let stale = storage::get_device_registration(&db, &user.subject, "stale")
        .await
        .expect("lookup failed")
        .expect("registration missing");
    assert_eq!(stale.is_trusted, 0);
    assert!(stale.trusted_until.is_none());

    assert!(registry
        .is_trusted(&user.subject, "fresh")
        .await
        .expect("is_trusted failed"));
}

#[tokio::test]
async fn test_remove_device() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "ivan@example.com", "password123").await;
    let registry = default_registry(db.clone());

    registry
        .register(&user.subject, "phone-1", None)
        .await
        .expect("register failed");
    assert!(registry
        .is_registered(&user.subject, "phone-1")
        .await
        .expect("is_registered failed"));

    assert!(registry.remove(&user.subject, "phone-1").await.expect("remove failed"));
    assert!(!registry
        .is_registered(&user.subject, "phone-1")
        .await
        .expect("is_registered failed"));
    assert!(!registry.remove(&user.subject, "phone-1").await.expect("remove failed"));
}
