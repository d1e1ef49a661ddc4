use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Links an access/refresh token pair to the (subject, device) it was
/// issued for. The device id lives here as a real column so rotation never
/// has to recover it from token labels.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "token_pairings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub subject: String,
    pub device_id: String,
    pub access_token_id: i64,
    pub refresh_token_id: i64,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
