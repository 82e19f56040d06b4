//! MTC wire protocol
//!
//! Requests are 3-byte frames `[id, a, b]`; each response carries the
//! request id offset by `0x64` in its first byte. State indications arrive
//! unsolicited as `[STATE_INFO_IND, state, subkind]`.

use std::fmt;

/// Phonet resource carrying the MTC service
pub const PN_MTC: u8 = 0x15;

pub const MTC_STATE_REQ: u8 = 0x00;
pub const MTC_STATE_QUERY_REQ: u8 = 0x01;
pub const MTC_POWER_OFF_REQ: u8 = 0x02;
pub const MTC_STARTUP_SYNQ_REQ: u8 = 0x04;
pub const MTC_SHUTDOWN_SYNC_REQ: u8 = 0x05;

pub const MTC_STATE_RESP: u8 = 0x64;
pub const MTC_STATE_QUERY_RESP: u8 = 0x65;
pub const MTC_POWER_OFF_RESP: u8 = 0x66;
pub const MTC_STARTUP_SYNQ_RESP: u8 = 0x68;
pub const MTC_SHUTDOWN_SYNC_RESP: u8 = 0x69;

pub const MTC_STATE_INFO_IND: u8 = 0xC0;

/// Offset between a request id and its response id
const RESP_OFFSET: u8 = 0x64;

/// Modem state as reported over MTC.
///
/// Only the states the power logic distinguishes get their own variant;
/// everything else is carried raw and classified as powered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemState {
    /// No state known (nothing reported yet, or the modem is unreachable)
    None,
    PowerOff,
    Normal,
    Charging,
    SelftestFail,
    RfInactive,
    Other(u8),
}

impl ModemState {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0x00 => ModemState::PowerOff,
            0x01 => ModemState::Normal,
            0x02 => ModemState::Charging,
            0x08 => ModemState::SelftestFail,
            0x0A => ModemState::RfInactive,
            other => ModemState::Other(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            ModemState::None => 0xFF,
            ModemState::PowerOff => 0x00,
            ModemState::Normal => 0x01,
            ModemState::Charging => 0x02,
            ModemState::SelftestFail => 0x08,
            ModemState::RfInactive => 0x0A,
            ModemState::Other(value) => value,
        }
    }

    /// Powered classification: anything live except off, charging and a
    /// failed selftest counts as powered.
    pub fn is_powered(self) -> bool {
        !matches!(
            self,
            ModemState::None
                | ModemState::PowerOff
                | ModemState::Charging
                | ModemState::SelftestFail
        )
    }

    /// Stable ASCII identifier for logs
    pub fn name(self) -> &'static str {
        match self {
            ModemState::None => "MTC_STATE_NONE",
            ModemState::PowerOff => "MTC_POWER_OFF",
            ModemState::Normal => "MTC_NORMAL",
            ModemState::Charging => "MTC_CHARGING",
            ModemState::SelftestFail => "MTC_SELFTEST_FAIL",
            ModemState::RfInactive => "MTC_RF_INACTIVE",
            ModemState::Other(_) => "<UNKNOWN>",
        }
    }
}

/// Cause byte of an MTC state response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsiCause {
    Ok,
    Fail,
    NotAllowed,
    AlreadyActive,
    Other(u8),
}

impl IsiCause {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0x00 => IsiCause::Ok,
            0x01 => IsiCause::Fail,
            0x02 => IsiCause::NotAllowed,
            0x06 => IsiCause::AlreadyActive,
            other => IsiCause::Other(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IsiCause::Ok => "MTC_OK",
            IsiCause::Fail => "MTC_FAIL",
            IsiCause::NotAllowed => "MTC_NOT_ALLOWED",
            IsiCause::AlreadyActive => "MTC_ALREADY_ACTIVE",
            IsiCause::Other(_) => "<UNKNOWN>",
        }
    }
}

impl fmt::Display for IsiCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sub-kind of a state indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKind {
    /// A transition toward the carried state has started
    Start,
    /// The carried state has been reached
    Ready,
    Other(u8),
}

impl InfoKind {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0x03 => InfoKind::Start,
            0x04 => InfoKind::Ready,
            other => InfoKind::Other(other),
        }
    }
}

/// Parsed `MTC_STATE_INFO_IND`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInfo {
    pub state: ModemState,
    pub kind: InfoKind,
}

/// Build a plain 3-byte request with filler bytes
pub fn request(id: u8) -> [u8; 3] {
    [id, 0x00, 0x00]
}

/// Build a `MTC_STATE_REQ` asking for the given modem state
pub fn state_request(state: ModemState) -> [u8; 3] {
    [MTC_STATE_REQ, state.to_wire(), 0x00]
}

/// Response id expected for a request frame
pub fn expected_response(request_id: u8) -> u8 {
    request_id.wrapping_add(RESP_OFFSET)
}

/// Parse a state indication; anything else returns `None`
pub fn parse_state_info(frame: &[u8]) -> Option<StateInfo> {
    if frame.len() < 3 || frame[0] != MTC_STATE_INFO_IND {
        return None;
    }
    Some(StateInfo {
        state: ModemState::from_wire(frame[1]),
        kind: InfoKind::from_wire(frame[2]),
    })
}
