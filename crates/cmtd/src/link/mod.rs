//! Phonet link monitoring
//!
//! The watcher thread owns a rtnetlink socket and forwards raw link reports
//! for the configured interface into the controller, which normalizes them
//! into edges.

pub mod netlink;

pub use netlink::LinkWatcher;

/// Raw link report as received from the OS, before edge normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkReport {
    Up,
    Down,
    Removed,
}
