//! Session entity: one row per agent known to the server

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub agent_id: String,

    /// Resumption token presented by the agent
    pub session_id: String,

    #[sea_orm(indexed)]
    pub auth_id: String,

    pub name: Option<String>,
    pub version: Option<String>,

    /// Remote address of the last connection
    pub address: Option<String>,

    /// JSON array of the session's tunnels
    #[sea_orm(column_type = "Text")]
    pub tunnels: String,

    /// JSON array of user groups allowed to manage this agent
    #[sea_orm(column_type = "Text")]
    pub allowed_user_groups: String,

    pub connected_at: ChronoDateTimeUtc,

    /// Set while the agent is offline
    pub disconnected_at: Option<ChronoDateTimeUtc>,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
