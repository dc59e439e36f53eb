//! Configuration Management Module
//!
//! Gateway-wide settings (timeouts, keepalive, coalescing interval, display
//! handshake defaults) and their on-disk JSON storage.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use types::{GatewayConfig, CONFIG_VERSION};
