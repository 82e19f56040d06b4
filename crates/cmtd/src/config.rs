//! Daemon configuration

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Default GPIO switch class root on platforms that expose one
pub const GPIO_SWITCH_ROOT: &str = "/sys/devices/platform/gpio-switch";

/// Fallback per-line value root
pub const DEV_CMT_ROOT: &str = "/dev/cmt";

/// Daemon configuration, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DaemonConfig {
    /// HTTP bind address
    pub bind: String,

    /// Phonet network interface carrying the modem link
    pub interface: String,

    /// Root of the gpio-switch pseudo-filesystem layout
    pub gpio_switch_root: String,

    /// Root of the /dev/cmt fallback layout
    pub dev_cmt_root: String,

    /// Per-request MTC transport timeout in milliseconds
    pub mtc_timeout_ms: u64,
}

impl DaemonConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            bind: std::env::var("CMTD_BIND").unwrap_or_else(|_| "127.0.0.1:8871".to_string()),
            interface: std::env::var("CMTD_INTERFACE").unwrap_or_else(|_| "phonet0".to_string()),
            gpio_switch_root: std::env::var("CMTD_GPIO_SWITCH")
                .unwrap_or_else(|_| GPIO_SWITCH_ROOT.to_string()),
            dev_cmt_root: std::env::var("CMTD_DEV_CMT")
                .unwrap_or_else(|_| DEV_CMT_ROOT.to_string()),
            mtc_timeout_ms: std::env::var("CMTD_MTC_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8871".to_string(),
            interface: "phonet0".to_string(),
            gpio_switch_root: GPIO_SWITCH_ROOT.to_string(),
            dev_cmt_root: DEV_CMT_ROOT.to_string(),
            mtc_timeout_ms: 5000,
        }
    }
}
