pub mod config;
pub mod logging;
pub mod state;

pub use config::{AppConfig, LoggingConfig, QuotaConfig, ResilienceConfig};
pub use logging::init_logging;
pub use state::AppState;
