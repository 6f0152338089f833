use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;
use crate::events::Publisher;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::store::ProjectionStore;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: AppConfig,
    pub registry: Arc<Registry>,
    pub store: Arc<dyn ProjectionStore>,
    pub publisher: Arc<Publisher>,
    pub scheduler: Arc<Scheduler>,
}
