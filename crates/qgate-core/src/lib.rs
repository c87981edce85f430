pub mod config;
pub mod types;

pub use config::{ConfigError, GatewayConfig};
pub use types::*;
