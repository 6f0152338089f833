use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One runtime version a worker reported for one language. Replaced in bulk
/// whenever the worker sends a fresh `executors` packet or re-handshakes.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "worker_runtime")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub worker_id: i32,
    pub language_id: String,
    pub runtime_name: String,
    /// Dotted version string, e.g. "3.11.5".
    pub version: String,
    /// Worker-reported preference order within a language, lowest first.
    pub rank: i32,

    #[sea_orm(belongs_to, from = "worker_id", to = "id")]
    pub worker: HasOne<super::worker::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
