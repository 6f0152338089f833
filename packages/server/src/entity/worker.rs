use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Durable record of a judge worker (§3 "Worker"). The live connection state
/// (current session, in-flight submission) lives only in the in-memory
/// registry; this row tracks what survives a disconnect.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "worker")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(unique)]
    pub name: String,
    pub auth_key: String,

    #[sea_orm(default_value = false)]
    pub disabled: bool,
    #[sea_orm(default_value = false)]
    pub blocked: bool,
    #[sea_orm(default_value = 0)]
    pub tier: i32,

    pub last_latency_ms: Option<f64>,
    pub last_load: Option<f64>,
    pub last_ip: Option<String>,

    #[sea_orm(default_value = false)]
    pub online: bool,

    #[sea_orm(has_many)]
    pub runtimes: HasMany<super::worker_runtime::Entity>,

    pub created_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
