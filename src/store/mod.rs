pub mod pool;
pub mod sessions;
pub mod valkey;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::dispatch::CommandStore;
use crate::hub::AgentHub;

/// Shared state for the control-plane process. Constructed once at startup
/// and passed explicitly to everything that needs it.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub valkey: fred::clients::Pool,
    pub hub: Arc<AgentHub>,
    pub commands: CommandStore,
    pub config: Arc<Config>,
}
