//! Shared plumbing for the beacon crates: error taxonomy, configuration
//! and logging setup.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;

pub use bootstrap::load_config;
pub use config::{
    BrokerBackend, BrokerConfig, ClientConfig, Config, LoggingConfig, RegistryConfig, ServerConfig,
};
pub use error::{Error, Result};
