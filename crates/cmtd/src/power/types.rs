//! Power lifecycle states, events and budgets

use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;

/// Bound on consecutive power-on attempts before giving up
pub const POWER_ON_RETRIES: u32 = 10;

/// Bound on consecutive reset cycles before falling back to a power cycle
pub const RESET_RETRIES: u32 = 5;

/// Maximum time a modem power-on attempt may take
pub const POWER_ON_TIMEOUT: Duration = Duration::from_millis(5000);

/// Time allowed for the modem to restart after a crash
pub const REBOOT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Maximum time a modem power-off may take
pub const POWER_OFF_TIMEOUT: Duration = Duration::from_millis(6150);

/// Cooling time after power off
pub const OFF_SETTLE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Observable modem power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Nothing known yet; waiting for the first link report
    None,
    /// Power-on sequence running, waiting for the link to come up
    OnStarted,
    /// Modem is up
    On,
    /// Link lost while wanted up; waiting for the modem to come back
    OnReset,
    /// Retry budgets exhausted; recoverable only by an explicit enable
    OnFailed,
    /// Graceful power-off handshake running
    OffStarted,
    /// Lines dropped, waiting for the modem to settle
    OffWaiting,
    /// Modem is off
    Off,
}

impl PowerState {
    /// Stable ASCII identifier for logs
    pub fn name(self) -> &'static str {
        match self {
            PowerState::None => "POWER_NONE_STATE",
            PowerState::OnStarted => "POWER_ON_STARTED_STATE",
            PowerState::On => "POWER_ON_STATE",
            PowerState::OnReset => "POWER_ON_RESET_STATE",
            PowerState::OnFailed => "POWER_ON_FAILED_STATE",
            PowerState::OffStarted => "POWER_OFF_STARTED_STATE",
            PowerState::OffWaiting => "POWER_OFF_WAITING_STATE",
            PowerState::Off => "POWER_OFF_STATE",
        }
    }
}

/// Observed Phonet link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    None,
    Down,
    Up,
}

/// Desired Phonet link state, set by enable/disable requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    None,
    Down,
    Up,
}

/// Event alphabet consumed by the power state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    LinkUp,
    LinkDown,
    PowerOn,
    PowerOnTimeout,
    RebootTimeout,
    PowerOff,
    PowerOffImmediately,
    PowerOffTimeout,
    PowerOffComplete,
}

impl PowerEvent {
    /// Stable ASCII identifier for logs
    pub fn name(self) -> &'static str {
        match self {
            PowerEvent::LinkUp => "PHONET_LINK_UP_EVENT",
            PowerEvent::LinkDown => "PHONET_LINK_DOWN_EVENT",
            PowerEvent::PowerOn => "POWER_ON_EVENT",
            PowerEvent::PowerOnTimeout => "POWER_ON_TIMEOUT_EVENT",
            PowerEvent::RebootTimeout => "POWER_REBOOT_TIMEOUT_EVENT",
            PowerEvent::PowerOff => "POWER_OFF_EVENT",
            PowerEvent::PowerOffImmediately => "POWER_OFF_IMMEDIATELY_EVENT",
            PowerEvent::PowerOffTimeout => "POWER_OFF_TIMEOUT_EVENT",
            PowerEvent::PowerOffComplete => "POWER_OFF_COMPLETE_EVENT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_are_stable() {
        assert_eq!(PowerState::None.name(), "POWER_NONE_STATE");
        assert_eq!(PowerState::OnStarted.name(), "POWER_ON_STARTED_STATE");
        assert_eq!(PowerState::OnFailed.name(), "POWER_ON_FAILED_STATE");
        assert_eq!(PowerState::Off.name(), "POWER_OFF_STATE");
    }

    #[test]
    fn test_event_names_are_stable() {
        assert_eq!(PowerEvent::LinkUp.name(), "PHONET_LINK_UP_EVENT");
        assert_eq!(
            PowerEvent::PowerOffImmediately.name(),
            "POWER_OFF_IMMEDIATELY_EVENT"
        );
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&PowerState::OnStarted).unwrap(),
            "\"on_started\""
        );
    }
}
