//! Modem Telephony Control - wire protocol, transport client and the
//! graceful-shutdown / online supervisor

pub mod client;
pub mod phonet;
pub mod protocol;
pub mod supervisor;

pub use client::{MtcClient, MtcEndpoint};
pub use protocol::{InfoKind, IsiCause, ModemState, StateInfo};
pub use supervisor::{MtcStatus, MtcSupervisor, SetOnlineRequest};
