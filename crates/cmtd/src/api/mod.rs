//! REST + WebSocket control surface for the daemon

pub mod handlers;
pub mod routes;
pub mod ws;

pub use routes::create_router;

use crate::config::DaemonConfig;
use crate::power::ModemPower;

/// Shared state handed to every handler
pub struct ApiState {
    pub power: ModemPower,
    pub config: DaemonConfig,
}
