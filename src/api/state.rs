use std::sync::Arc;

use crate::broker::Broker;
use crate::config::ApiConfig;
use crate::persistence::SqlStore;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<SqlStore>,
    pub config: ApiConfig,
}
