//! Gateway configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Process-wide gateway settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Config format version
    pub version: u32,

    /// Deadline for each hop's dial + SSH handshake, in seconds
    pub hop_timeout_secs: u64,

    /// SSH keepalive interval, in seconds
    pub keepalive_interval_secs: u64,

    /// Missed keepalives before russh drops the connection
    pub keepalive_max: usize,

    /// Terminal output coalescing interval, in milliseconds
    pub flush_interval_ms: u64,

    /// Deadline for the display daemon TCP dial, in seconds
    pub display_dial_timeout_secs: u64,

    /// Default display daemon address
    pub display_address: String,

    /// Terminal geometry used when the caller gives none
    pub default_cols: u16,
    pub default_rows: u16,

    /// Display geometry announced during the display handshake
    pub display_width: u32,
    pub display_height: u32,
    pub display_dpi: u32,

    /// Timezone announced during the display handshake
    pub display_timezone: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            hop_timeout_secs: 30,
            keepalive_interval_secs: 30,
            keepalive_max: 3,
            flush_interval_ms: 60,
            display_dial_timeout_secs: 5,
            display_address: "127.0.0.1:4822".to_string(),
            default_cols: 80,
            default_rows: 24,
            display_width: 1024,
            display_height: 768,
            display_dpi: 96,
            display_timezone: "UTC".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn hop_timeout(&self) -> Duration {
        Duration::from_secs(self.hop_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        // A zero period would make tokio's interval panic.
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn display_dial_timeout(&self) -> Duration {
        Duration::from_secs(self.display_dial_timeout_secs)
    }
}
