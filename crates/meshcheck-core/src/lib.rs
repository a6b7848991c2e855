pub mod config;
pub mod ids;
pub mod logging;

pub use config::{ConfigError, HarnessConfig};
