//! Modem power lifecycle - state machine, publication bus and controller

pub mod bus;
pub mod controller;
pub mod fsm;
pub mod types;

pub use bus::{ControllerEvent, PowerBus, PowerObserver};
pub use controller::{ModemPower, StatusSnapshot};
pub use fsm::PowerFsm;
pub use types::{LinkState, LinkTarget, PowerEvent, PowerState};
