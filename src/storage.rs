use crate::entities;
use crate::errors::TetherError;
use crate::settings::Database as DbCfg;
use base64ct::Encoding;
use chrono::Utc;
use rand::RngCore;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub subject: String,
    pub email: String,
    pub tenant_id: Option<String>,
    pub role: String,
    pub password_hash: String,
    pub enabled: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub id: i64,
    pub subject: String,
    pub device_id: String,
    pub device_info: Option<Value>,
    pub is_trusted: i64,
    pub trusted_at: Option<i64>,
    pub trusted_until: Option<i64>,
    pub device_secret: Option<String>,
    pub registered_at: i64,
    pub last_used_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerToken {
    pub id: i64,
    pub token: String,
    pub subject: String,
    pub label: String,
    pub abilities: Vec<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked: i64,
}

impl BearerToken {
    pub fn has_ability(&self, ability: &str) -> bool {
        self.abilities.iter().any(|a| a == "*" || a == ability)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPairing {
    pub id: i64,
    pub subject: String,
    pub device_id: String,
    pub access_token_id: i64,
    pub refresh_token_id: i64,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSecurityEvent {
    pub event_type: String,
    pub occurred_at: i64,
    pub subject: Option<String>,
    pub tenant_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_id: Option<String>,
    pub session_id: Option<String>,
    pub context: Option<Value>,
    pub risk_score: f64,
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, TetherError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

fn model_to_registration(
    model: entities::device_registration::Model,
) -> Result<DeviceRegistration, TetherError> {
    let device_info = match model.device_info {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    Ok(DeviceRegistration {
        id: model.id,
        subject: model.subject,
        device_id: model.device_id,
        device_info,
        is_trusted: model.is_trusted,
        trusted_at: model.trusted_at,
        trusted_until: model.trusted_until,
        device_secret: model.device_secret,
        registered_at: model.registered_at,
        last_used_at: model.last_used_at,
    })
}

fn model_to_token(model: entities::bearer_token::Model) -> Result<BearerToken, TetherError> {
    let abilities: Vec<String> = serde_json::from_str(&model.abilities)?;
    Ok(BearerToken {
        id: model.id,
        token: model.token,
        subject: model.subject,
        label: model.label,
        abilities,
        created_at: model.created_at,
        expires_at: model.expires_at,
        revoked: model.revoked,
    })
}

fn model_to_pairing(model: entities::token_pairing::Model) -> TokenPairing {
    TokenPairing {
        id: model.id,
        subject: model.subject,
        device_id: model.device_id,
        access_token_id: model.access_token_id,
        refresh_token_id: model.refresh_token_id,
        created_at: model.created_at,
        expires_at: model.expires_at,
    }
}

// User directory functions

pub async fn create_user(
    db: &DatabaseConnection,
    email: &str,
    password: &str,
    tenant_id: Option<String>,
    role: &str,
) -> Result<User, TetherError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let subject = random_id();
    let created_at = Utc::now().timestamp();

    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| TetherError::Other(format!("Password hashing failed: {}", e)))?
        .to_string();

    let user = entities::user::ActiveModel {
        subject: Set(subject.clone()),
        email: Set(email.to_string()),
        tenant_id: Set(tenant_id.clone()),
        role: Set(role.to_string()),
        password_hash: Set(password_hash.clone()),
        enabled: Set(1),
        created_at: Set(created_at),
    };

    user.insert(db).await?;

    Ok(User {
        subject,
        email: email.to_string(),
        tenant_id,
        role: role.to_string(),
        password_hash,
        enabled: 1,
        created_at,
    })
}

pub async fn get_user(db: &DatabaseConnection, subject: &str) -> Result<Option<User>, TetherError> {
    use entities::user::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::Subject.eq(subject))
        .one(db)
        .await?
    {
        Ok(Some(User {
            subject: model.subject,
            email: model.email,
            tenant_id: model.tenant_id,
            role: model.role,
            password_hash: model.password_hash,
            enabled: model.enabled,
            created_at: model.created_at,
        }))
    } else {
        Ok(None)
    }
}

pub async fn get_user_by_email(
    db: &DatabaseConnection,
    email: &str,
) -> Result<Option<User>, TetherError> {
    use entities::user::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::Email.eq(email))
        .one(db)
        .await?
    {
        Ok(Some(User {
            subject: model.subject,
            email: model.email,
            tenant_id: model.tenant_id,
            role: model.role,
            password_hash: model.password_hash,
            enabled: model.enabled,
            created_at: model.created_at,
        }))
    } else {
        Ok(None)
    }
}

/// Returns the subject on success, None on bad credentials or disabled user.
pub async fn verify_user_password(
    db: &DatabaseConnection,
    email: &str,
    password: &str,
) -> Result<Option<String>, TetherError> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let user = match get_user_by_email(db, email).await? {
        Some(u) if u.enabled == 1 => u,
        _ => return Ok(None),
    };

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| TetherError::Other(format!("Invalid password hash: {}", e)))?;

    if Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
    {
        Ok(Some(user.subject))
    } else {
        Ok(None)
    }
}

// Device registration functions

pub async fn get_device_registration(
    db: &DatabaseConnection,
    subject: &str,
    device_id: &str,
) -> Result<Option<DeviceRegistration>, TetherError> {
    use entities::device_registration::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::Subject.eq(subject))
        .filter(Column::DeviceId.eq(device_id))
        .one(db)
        .await?
    {
        Ok(Some(model_to_registration(model)?))
    } else {
        Ok(None)
    }
}

pub async fn list_device_registrations(
    db: &DatabaseConnection,
    subject: &str,
) -> Result<Vec<DeviceRegistration>, TetherError> {
    use entities::device_registration::{Column, Entity};

    let models = Entity::find()
        .filter(Column::Subject.eq(subject))
        .order_by_desc(Column::LastUsedAt)
        .all(db)
        .await?;

    models.into_iter().map(model_to_registration).collect()
}

pub async fn count_device_registrations(
    db: &DatabaseConnection,
    subject: &str,
) -> Result<u64, TetherError> {
    use entities::device_registration::{Column, Entity};

    let count = Entity::find()
        .filter(Column::Subject.eq(subject))
        .count(db)
        .await?;
    Ok(count)
}

/// The least-recently-used registration for a user, if any.
pub async fn oldest_device_registration(
    db: &DatabaseConnection,
    subject: &str,
) -> Result<Option<DeviceRegistration>, TetherError> {
    use entities::device_registration::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::Subject.eq(subject))
        .order_by_asc(Column::LastUsedAt)
        .one(db)
        .await?
    {
        Ok(Some(model_to_registration(model)?))
    } else {
        Ok(None)
    }
}

pub async fn insert_device_registration(
    db: &DatabaseConnection,
    subject: &str,
    device_id: &str,
    device_info: Option<&Value>,
) -> Result<DeviceRegistration, TetherError> {
    let now = Utc::now().timestamp();
    let info_json = match device_info {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    };

    let registration = entities::device_registration::ActiveModel {
        subject: Set(subject.to_string()),
        device_id: Set(device_id.to_string()),
        device_info: Set(info_json),
        is_trusted: Set(0),
        trusted_at: Set(None),
        trusted_until: Set(None),
        device_secret: Set(None),
        registered_at: Set(now),
        last_used_at: Set(now),
        ..Default::default()
    };

    let model = registration.insert(db).await?;
    model_to_registration(model)
}

/// Re-registration path: refresh device_info and last_used_at, keep trust.
pub async fn touch_device_registration(
    db: &DatabaseConnection,
    subject: &str,
    device_id: &str,
    device_info: Option<&Value>,
) -> Result<Option<DeviceRegistration>, TetherError> {
    use entities::device_registration::{Column, Entity};

    let Some(model) = Entity::find()
        .filter(Column::Subject.eq(subject))
        .filter(Column::DeviceId.eq(device_id))
        .one(db)
        .await?
    else {
        return Ok(None);
    };

    let mut active: entities::device_registration::ActiveModel = model.into();
    if let Some(info) = device_info {
        active.device_info = Set(Some(serde_json::to_string(info)?));
    }
    active.last_used_at = Set(Utc::now().timestamp());
    let updated = active.update(db).await?;

    Ok(Some(model_to_registration(updated)?))
}

pub async fn set_device_trust(
    db: &DatabaseConnection,
    subject: &str,
    device_id: &str,
    trusted_until: i64,
) -> Result<bool, TetherError> {
    use entities::device_registration::{Column, Entity};

    let Some(model) = Entity::find()
        .filter(Column::Subject.eq(subject))
        .filter(Column::DeviceId.eq(device_id))
        .one(db)
        .await?
    else {
        return Ok(false);
    };

    let now = Utc::now().timestamp();
    let mut active: entities::device_registration::ActiveModel = model.into();
    active.is_trusted = Set(1);
    active.trusted_at = Set(Some(now));
    active.trusted_until = Set(Some(trusted_until));
    active.update(db).await?;

    Ok(true)
}

pub async fn clear_device_trust(
    db: &DatabaseConnection,
    subject: &str,
    device_id: &str,
) -> Result<bool, TetherError> {
    use entities::device_registration::{Column, Entity};

    let Some(model) = Entity::find()
        .filter(Column::Subject.eq(subject))
        .filter(Column::DeviceId.eq(device_id))
        .one(db)
        .await?
    else {
        return Ok(false);
    };

    if model.is_trusted == 0 && model.trusted_until.is_none() {
        return Ok(false);
    }

    let mut active: entities::device_registration::ActiveModel = model.into();
    active.is_trusted = Set(0);
    active.trusted_at = Set(None);
    active.trusted_until = Set(None);
    active.update(db).await?;

    Ok(true)
}

pub async fn set_device_secret(
    db: &DatabaseConnection,
    subject: &str,
    device_id: &str,
    secret: &str,
) -> Result<bool, TetherError> {
    use entities::device_registration::{Column, Entity};

    let Some(model) = Entity::find()
        .filter(Column::Subject.eq(subject))
        .filter(Column::DeviceId.eq(device_id))
        .one(db)
        .await?
    else {
        return Ok(false);
    };

    let mut active: entities::device_registration::ActiveModel = model.into();
    active.device_secret = Set(Some(secret.to_string()));
    active.update(db).await?;

    Ok(true)
}

/// Signature validation looks the secret up by device id alone; device ids
/// are client-generated and scoped per user, so the newest registration wins
/// if two users ever pick the same id.
pub async fn get_device_secret(
    db: &DatabaseConnection,
    device_id: &str,
) -> Result<Option<String>, TetherError> {
    use entities::device_registration::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::DeviceId.eq(device_id))
        .order_by_desc(Column::RegisteredAt)
        .one(db)
        .await?
    {
        Ok(model.device_secret)
    } else {
        Ok(None)
    }
}

pub async fn delete_device_registration(
    db: &DatabaseConnection,
    subject: &str,
    device_id: &str,
) -> Result<bool, TetherError> {
    use entities::device_registration::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::Subject.eq(subject))
        .filter(Column::DeviceId.eq(device_id))
        .exec(db)
        .await?;

    Ok(result.rows_affected > 0)
}

/// Registrations whose trust window has lapsed but still carry the flag.
pub async fn find_expired_trust(
    db: &DatabaseConnection,
    now: i64,
) -> Result<Vec<DeviceRegistration>, TetherError> {
    use entities::device_registration::{Column, Entity};

    let models = Entity::find()
        .filter(Column::IsTrusted.eq(1))
        .filter(Column::TrustedUntil.lt(now))
        .all(db)
        .await?;

    models.into_iter().map(model_to_registration).collect()
}

// Bearer token functions

pub async fn issue_bearer_token(
    db: &DatabaseConnection,
    subject: &str,
    label: &str,
    abilities: &[String],
    ttl_secs: i64,
) -> Result<BearerToken, TetherError> {
    let token = random_token();
    let now = Utc::now().timestamp();
    let expires_at = now + ttl_secs;
    let abilities_json = serde_json::to_string(abilities)?;

    let active = entities::bearer_token::ActiveModel {
        token: Set(token.clone()),
        subject: Set(subject.to_string()),
        label: Set(label.to_string()),
        abilities: Set(abilities_json),
        created_at: Set(now),
        expires_at: Set(expires_at),
        revoked: Set(0),
        ..Default::default()
    };

    let model = active.insert(db).await?;
    model_to_token(model)
}

/// Raw lookup: returns the row even when expired or revoked so callers can
/// distinguish "invalid" from "expired".
pub async fn find_bearer_token(
    db: &DatabaseConnection,
    token: &str,
) -> Result<Option<BearerToken>, TetherError> {
    use entities::bearer_token::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::Token.eq(token))
        .one(db)
        .await?
    {
        Ok(Some(model_to_token(model)?))
    } else {
        Ok(None)
    }
}

/// Live-token lookup used by bearer authentication: revoked or expired rows
/// resolve to None.
pub async fn get_live_bearer_token(
    db: &DatabaseConnection,
    token: &str,
) -> Result<Option<BearerToken>, TetherError> {
    match find_bearer_token(db, token).await? {
        Some(t) if t.revoked == 0 && !t.is_expired(Utc::now().timestamp()) => Ok(Some(t)),
        _ => Ok(None),
    }
}

pub async fn get_bearer_token_by_id(
    db: &DatabaseConnection,
    id: i64,
) -> Result<Option<BearerToken>, TetherError> {
    use entities::bearer_token::{Column, Entity};

    if let Some(model) = Entity::find().filter(Column::Id.eq(id)).one(db).await? {
        Ok(Some(model_to_token(model)?))
    } else {
        Ok(None)
    }
}

pub async fn delete_bearer_token(db: &DatabaseConnection, id: i64) -> Result<bool, TetherError> {
    use entities::bearer_token::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::Id.eq(id))
        .exec(db)
        .await?;

    Ok(result.rows_affected > 0)
}

// Token pairing functions

pub async fn insert_token_pairing(
    db: &DatabaseConnection,
    subject: &str,
    device_id: &str,
    access_token_id: i64,
    refresh_token_id: i64,
    expires_at: i64,
) -> Result<TokenPairing, TetherError> {
    let now = Utc::now().timestamp();

    let active = entities::token_pairing::ActiveModel {
        subject: Set(subject.to_string()),
        device_id: Set(device_id.to_string()),
        access_token_id: Set(access_token_id),
        refresh_token_id: Set(refresh_token_id),
        created_at: Set(now),
        expires_at: Set(expires_at),
        ..Default::default()
    };

    let model = active.insert(db).await?;
    Ok(model_to_pairing(model))
}

pub async fn get_pairing_by_refresh_token(
    db: &DatabaseConnection,
    refresh_token_id: i64,
) -> Result<Option<TokenPairing>, TetherError> {
    use entities::token_pairing::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::RefreshTokenId.eq(refresh_token_id))
        .one(db)
        .await?
    {
        Ok(Some(model_to_pairing(model)))
    } else {
        Ok(None)
    }
}

/// Newest pairing for a (subject, device); normally the only one.
pub async fn latest_pairing_for_device(
    db: &DatabaseConnection,
    subject: &str,
    device_id: &str,
) -> Result<Option<TokenPairing>, TetherError> {
    use entities::token_pairing::{Column, Entity};

    if let Some(model) = Entity::find()
        .filter(Column::Subject.eq(subject))
        .filter(Column::DeviceId.eq(device_id))
        .order_by_desc(Column::CreatedAt)
        .one(db)
        .await?
    {
        Ok(Some(model_to_pairing(model)))
    } else {
        Ok(None)
    }
}

pub async fn pairings_for_device(
    db: &DatabaseConnection,
    subject: &str,
    device_id: &str,
) -> Result<Vec<TokenPairing>, TetherError> {
    use entities::token_pairing::{Column, Entity};

    let models = Entity::find()
        .filter(Column::Subject.eq(subject))
        .filter(Column::DeviceId.eq(device_id))
        .all(db)
        .await?;

    Ok(models.into_iter().map(model_to_pairing).collect())
}

pub async fn pairings_for_user(
    db: &DatabaseConnection,
    subject: &str,
) -> Result<Vec<TokenPairing>, TetherError> {
    use entities::token_pairing::{Column, Entity};

    let models = Entity::find()
        .filter(Column::Subject.eq(subject))
        .all(db)
        .await?;

    Ok(models.into_iter().map(model_to_pairing).collect())
}

pub async fn expired_pairings(
    db: &DatabaseConnection,
    now: i64,
) -> Result<Vec<TokenPairing>, TetherError> {
    use entities::token_pairing::{Column, Entity};

    let models = Entity::find()
        .filter(Column::ExpiresAt.lt(now))
        .all(db)
        .await?;

    Ok(models.into_iter().map(model_to_pairing).collect())
}

pub async fn delete_token_pairing(db: &DatabaseConnection, id: i64) -> Result<bool, TetherError> {
    use entities::token_pairing::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::Id.eq(id))
        .exec(db)
        .await?;

    Ok(result.rows_affected > 0)
}

// Security event functions

pub async fn insert_security_event(
    db: &DatabaseConnection,
    event: &NewSecurityEvent,
) -> Result<(), TetherError> {
    let context_json = match &event.context {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    };

    let active = entities::security_event::ActiveModel {
        event_type: Set(event.event_type.clone()),
        occurred_at: Set(event.occurred_at),
        subject: Set(event.subject.clone()),
        tenant_id: Set(event.tenant_id.clone()),
        ip_address: Set(event.ip_address.clone()),
        user_agent: Set(event.user_agent.clone()),
        device_id: Set(event.device_id.clone()),
        session_id: Set(event.session_id.clone()),
        context: Set(context_json),
        risk_score: Set(event.risk_score),
        ..Default::default()
    };

    active.insert(db).await?;
    Ok(())
}

pub async fn recent_security_events(
    db: &DatabaseConnection,
    limit: u64,
) -> Result<Vec<entities::security_event::Model>, TetherError> {
    use entities::security_event::{Column, Entity};

    let models = Entity::find()
        .order_by_desc(Column::OccurredAt)
        .paginate(db, limit)
        .fetch_page(0)
        .await?;

    Ok(models)
}

pub async fn count_security_events_since(
    db: &DatabaseConnection,
    since: i64,
) -> Result<u64, TetherError> {
    use entities::security_event::{Column, Entity};

    let count = Entity::find()
        .filter(Column::OccurredAt.gte(since))
        .count(db)
        .await?;
    Ok(count)
}

pub async fn cleanup_old_security_events(
    db: &DatabaseConnection,
    cutoff: i64,
) -> Result<u64, TetherError> {
    use entities::security_event::{Column, Entity};

    let result = Entity::delete_many()
        .filter(Column::OccurredAt.lt(cutoff))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

pub fn random_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64ct::Base64UrlUnpadded::encode_string(&bytes)
}

/// 32 random bytes, lowercase hex. This is the per-device HMAC key material.
pub fn random_device_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
