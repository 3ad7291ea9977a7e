mod detector;
mod dispatch;
mod distributor;
mod intake;
mod registry;
mod server;
mod store;

pub use detector::DdosDetector;
pub use distributor::run_rule_distributor;
pub use intake::run_csv_store_loop;
pub use registry::{ClientRegistry, HEARTBEAT_TIMEOUT};
pub use server::run_server;
pub use store::Store;
