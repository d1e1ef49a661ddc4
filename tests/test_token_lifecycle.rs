// Integration tests for paired access/refresh token issuance, rotation and
// revocation bookkeeping.

mod helpers;

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};

use helpers::db::seed_user;
use helpers::TestDb;
use tether::cache::TtlCache;
use tether::entities;
use tether::security::tokens::{TokenError, TokenLifecycle};
use tether::settings::{MobileTokens, TokenRotation};
use tether::storage;

fn lifecycle(db: sea_orm::DatabaseConnection) -> TokenLifecycle {
    TokenLifecycle::new(
        db,
        Arc::new(TtlCache::new()),
        MobileTokens::default(),
        TokenRotation::default(),
    )
}

/// Force a bearer token's expiry into the past.
async fn expire_token(db: &sea_orm::DatabaseConnection, plaintext: &str) {
    let model = entities::BearerToken::find()
        .filter(entities::bearer_token::Column::Token.eq(plaintext))
        .one(db)
        .await
        .expect("query failed")
        .expect("token not found");
    let mut active: entities::bearer_token::ActiveModel = model.into();
    active.expires_at = Set(100);
    active.update(db).await.expect("update failed");
}

#[tokio::test]
async fn test_generate_token_pair() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "alice@example.com", "password123").await;
    let tokens = lifecycle(db.clone());

    let pair = tokens
        .generate_token_pair(&user.subject, "phone-1")
        .await
        .expect("issuance failed");

    assert_ne!(pair.access_token, pair.refresh_token);
    assert_eq!(pair.token_type, "Bearer");
    assert_eq!(pair.expires_in, 900);
    assert_eq!(pair.refresh_expires_in, 86400);
    assert!(pair.refresh_expires_at > pair.expires_at);

    // Access token carries the broad ability set, refresh only `refresh`.
    let access = storage::find_bearer_token(&db, &pair.access_token)
        .await
        .expect("lookup failed")
        .expect("access token missing");
    assert_eq!(access.abilities, vec!["*"]);
    assert!(access.label.starts_with("mobile_access_phone-1_"));

    let refresh = storage::find_bearer_token(&db, &pair.refresh_token)
        .await
        .expect("lookup failed")
        .expect("refresh token missing");
    assert_eq!(refresh.abilities, vec!["refresh"]);
    assert!(refresh.label.starts_with("mobile_refresh_phone-1_"));

    // The pairing records the device id directly.
    let pairing = storage::get_pairing_by_refresh_token(&db, refresh.id)
        .await
        .expect("lookup failed")
        .expect("pairing missing");
    assert_eq!(pairing.subject, user.subject);
    assert_eq!(pairing.device_id, "phone-1");
    assert_eq!(pairing.expires_at, refresh.expires_at);
}

#[tokio::test]
async fn test_rotation_replaces_pair_and_kills_old_refresh() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "bob@example.com", "password123").await;
    let tokens = lifecycle(db.clone());

    let original = tokens
        .generate_token_pair(&user.subject, "phone-1")
        .await
        .expect("issuance failed");

    let rotated = tokens
        .rotate_tokens(&original.refresh_token)
        .await
        .expect("rotation failed");

    assert_ne!(rotated.access_token, original.access_token);
    assert_ne!(rotated.refresh_token, original.refresh_token);

    // The old pair is gone entirely, not just flagged.
    assert!(storage::find_bearer_token(&db, &original.access_token)
        .await
        .expect("lookup failed")
        .is_none());
    assert!(storage::find_bearer_token(&db, &original.refresh_token)
        .await
        .expect("lookup failed")
        .is_none());

    // A second rotation with the dead refresh token is rejected outright.
    match tokens.rotate_tokens(&original.refresh_token).await {
        Err(TokenError::Invalid(_)) => {}
        other => panic!("expected TokenInvalid, got {:?}", other.map(|p| p.access_token)),
    }

    // Exactly one live pairing remains for the device.
    let pairings = storage::pairings_for_device(&db, &user.subject, "phone-1")
        .await
        .expect("lookup failed");
    assert_eq!(pairings.len(), 1);
}

#[tokio::test]
async fn test_access_token_cannot_rotate() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "carol@example.com", "password123").await;
    let tokens = lifecycle(db.clone());

    let pair = tokens
        .generate_token_pair(&user.subject, "phone-1")
        .await
        .expect("issuance failed");

    // The wildcard ability must not satisfy the rotate gate.
    match tokens.rotate_tokens(&pair.access_token).await {
        Err(TokenError::Invalid(_)) => {}
        other => panic!("expected TokenInvalid, got {:?}", other.map(|p| p.access_token)),
    }

    // Nothing was issued or destroyed.
    let pairings = storage::pairings_for_device(&db, &user.subject, "phone-1")
        .await
        .expect("lookup failed");
    assert_eq!(pairings.len(), 1);
    assert!(storage::find_bearer_token(&db, &pair.refresh_token)
        .await
        .expect("lookup failed")
        .is_some());
}

#[tokio::test]
async fn test_expired_refresh_token_is_distinct_error() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "dave@example.com", "password123").await;
    let tokens = lifecycle(db.clone());

    let pair = tokens
        .generate_token_pair(&user.subject, "phone-1")
        .await
        .expect("issuance failed");

    expire_token(&db, &pair.refresh_token).await;

    match tokens.rotate_tokens(&pair.refresh_token).await {
        Err(TokenError::Expired) => {}
        other => panic!("expected TokenExpired, got {:?}", other.map(|p| p.access_token)),
    }
}

#[tokio::test]
async fn test_unknown_refresh_token_is_invalid() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let tokens = lifecycle(db.clone());

    match tokens.rotate_tokens("not-a-real-token").await {
        Err(TokenError::Invalid(_)) => {}
        other => panic!("expected TokenInvalid, got {:?}", other.map(|p| p.access_token)),
    }
}

#[tokio::test]
async fn test_token_info_summarizes_without_leaking() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "erin@example.com", "password123").await;
    let tokens = lifecycle(db.clone());

    assert!(tokens
        .get_token_info(&user.subject, "phone-1")
        .await
        .expect("info failed")
        .is_none());

    let pair = tokens
        .generate_token_pair(&user.subject, "phone-1")
        .await
        .expect("issuance failed");

    let info = tokens
        .get_token_info(&user.subject, "phone-1")
        .await
        .expect("info failed")
        .expect("info expected");

    assert_eq!(info.device_id, "phone-1");
    assert_eq!(info.access_expires_at, pair.expires_at);
    assert_eq!(info.refresh_expires_at, pair.refresh_expires_at);
    assert!(info.access_valid);
    // Freshly issued: nowhere near the rotation threshold.
    assert!(!info.should_rotate);

    // The serialized summary must not contain the raw token values.
    let serialized = serde_json::to_string(&info).expect("serialize failed");
    assert!(!serialized.contains(&pair.access_token));
    assert!(!serialized.contains(&pair.refresh_token));
}

#[tokio::test]
async fn test_revoke_device_tokens() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "frank@example.com", "password123").await;
    let tokens = lifecycle(db.clone());

    tokens
        .generate_token_pair(&user.subject, "phone-1")
        .await
        .expect("issuance failed");
    tokens
        .generate_token_pair(&user.subject, "tablet-1")
        .await
        .expect("issuance failed");

    let revoked = tokens
        .revoke_device_tokens(&user.subject, "phone-1")
        .await
        .expect("revoke failed");
    assert_eq!(revoked, 1);

    assert!(storage::latest_pairing_for_device(&db, &user.subject, "phone-1")
        .await
        .expect("lookup failed")
        .is_none());
    // The other device is untouched.
    assert!(storage::latest_pairing_for_device(&db, &user.subject, "tablet-1")
        .await
        .expect("lookup failed")
        .is_some());
}

#[tokio::test]
async fn test_revoke_all_user_tokens() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "grace@example.com", "password123").await;
    let other = seed_user(&db, "other@example.com", "password123").await;
    let tokens = lifecycle(db.clone());

    tokens
        .generate_token_pair(&user.subject, "phone-1")
        .await
        .expect("issuance failed");
    tokens
        .generate_token_pair(&user.subject, "tablet-1")
        .await
        .expect("issuance failed");
    tokens
        .generate_token_pair(&other.subject, "phone-9")
        .await
        .expect("issuance failed");

    let revoked = tokens
        .revoke_all_user_tokens(&user.subject)
        .await
        .expect("revoke failed");
    assert_eq!(revoked, 2);

    assert!(storage::pairings_for_user(&db, &user.subject)
        .await
        .expect("lookup failed")
        .is_empty());
    assert_eq!(
        storage::pairings_for_user(&db, &other.subject)
            .await
            .expect("lookup failed")
            .len(),
        1
    );
}

#[tokio::test]
async fn test_cleanup_reclaims_fully_expired_pairings() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let user = seed_user(&db, "heidi@example.com", "password123").await;
    let tokens = lifecycle(db.clone());

    let dead = tokens
        .generate_token_pair(&user.subject, "old-phone")
        .await
        .expect("issuance failed");
    tokens
        .generate_token_pair(&user.subject, "new-phone")
        .await
        .expect("issuance failed");

    // Expire both halves of the old pairing, including the pairing row.
    expire_token(&db, &dead.access_token).await;
    expire_token(&db, &dead.refresh_token).await;
    let pairing = storage::latest_pairing_for_device(&db, &user.subject, "old-phone")
        .await
        .expect("lookup failed")
        .expect("pairing missing");
    let model = entities::TokenPairing::find()
        .filter(entities::token_pairing::Column::Id.eq(pairing.id))
        .one(&db)
        .await
        .expect("query failed")
        .expect("pairing row missing");
    let mut active: entities::token_pairing::ActiveModel = model.into();
    active.expires_at = Set(100);
    active.update(&db).await.expect("update failed");

    let reclaimed = tokens.cleanup_expired_tokens().await.expect("cleanup failed");
    assert_eq!(reclaimed, 1);

    assert!(storage::latest_pairing_for_device(&db, &user.subject, "old-phone")
        .await
        .expect("lookup failed")
        .is_none());
    assert!(storage::latest_pairing_for_device(&db, &user.subject, "new-phone")
        .await
        .expect("lookup failed")
        .is_some());
}

#[tokio::test]
async fn test_should_rotate_tracks_elapsed_lifetime() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let tokens = lifecycle(db.clone());

    let now = Utc::now().timestamp();
    // Fresh token: 0% elapsed.
    assert!(!tokens.access_should_rotate(now, now + 900, now));
    // 80% of a 900s lifetime.
    assert!(tokens.access_should_rotate(now - 720, now + 180, now));
    // Just under the threshold.
    assert!(!tokens.access_should_rotate(now - 719, now + 181, now));
}
