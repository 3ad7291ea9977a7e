use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{ClientRegistry, DdosDetector, Store};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ClientRegistry>,
    pub store: Arc<Store>,
    pub detector: Arc<Mutex<DdosDetector>>,
    pub shutdown: CancellationToken,
}
