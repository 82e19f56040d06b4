//! Error taxonomy for the modem power controller

use crate::mtc::protocol::IsiCause;

/// Errors surfaced while probing and wiring up a controller instance.
///
/// No controller state is retained when probe fails; the instance registry
/// entry is released before the error propagates.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// A live controller already exists for this interface
    #[error("modem power controller already in use")]
    Busy,

    /// The mandatory `cmt_en` line is missing in both GPIO layouts
    #[error("modem control GPIO lines are not available")]
    NoDevice,

    /// The Phonet interface does not exist
    #[error("network interface {0} not found")]
    NoInterface(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by power and online requests after probe
#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    /// The controller has been removed (or its task is gone)
    #[error("modem power controller has been removed")]
    Removed,

    /// Online transitions require the modem to be in the powered-on state
    #[error("modem is not powered on")]
    NotPowered,

    /// The modem reported a selftest failure; online transitions are refused
    #[error("modem selftest failed")]
    SelftestFailed,

    /// An online transition is already pending
    #[error("an online transition is already in progress")]
    OnlineBusy,

    /// The modem rejected the state request
    #[error("online transition rejected: {0}")]
    Rejected(IsiCause),

    /// The modem settled in a state other than the requested one
    #[error("online transition did not reach the requested state")]
    OnlineFailed,

    /// The MTC transport failed or timed out
    #[error("mtc transport error: {0}")]
    Transport(String),
}

/// Outcome of an enable/disable request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The modem is already in the requested power state
    AlreadyDone,

    /// The transition has been started; progress is reported through the
    /// power-state stream
    InProgress,
}
