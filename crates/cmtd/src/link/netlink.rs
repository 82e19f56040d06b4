//! rtnetlink link watcher
//!
//! A dedicated thread owns the netlink socket and feeds reports into an
//! mpsc channel; the controller task consumes the async side. The socket
//! carries a receive timeout so the thread notices the stop flag promptly.

use super::LinkReport;
use crate::error::ProbeError;
use nix::sys::socket::{
    bind, recv, setsockopt, socket, sockopt, AddressFamily, MsgFlags, NetlinkAddr, SockFlag,
    SockProtocol, SockType,
};
use nix::sys::time::TimeVal;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// rtnetlink multicast group carrying link state changes
const RTMGRP_LINK: u32 = 1;

const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;

const NLMSG_HDRLEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;
const RTA_HDRLEN: usize = 4;

/// Interface attribute carrying the interface name
const IFLA_IFNAME: u16 = 3;

const IFF_UP: u32 = 0x1;
const IFF_RUNNING: u32 = 0x40;

const RECV_BUF_SIZE: usize = 8192;

/// Handle to the watcher thread
pub struct LinkWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LinkWatcher {
    /// Open the rtnetlink socket, subscribe to link changes and spawn the
    /// watcher thread. Reports for `interface` are sent to `report_tx`.
    pub fn spawn(
        interface: &str,
        report_tx: mpsc::UnboundedSender<LinkReport>,
    ) -> Result<Self, ProbeError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::empty(),
            SockProtocol::NetlinkRoute,
        )
        .map_err(|e| ProbeError::Io(e.into()))?;

        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, RTMGRP_LINK))
            .map_err(|e| ProbeError::Io(e.into()))?;

        // Bounded receive timeout so the stop flag is honored
        setsockopt(&fd, sockopt::ReceiveTimeout, &TimeVal::new(0, 500_000))
            .map_err(|e| ProbeError::Io(e.into()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let ifname = interface.to_string();

        let handle = std::thread::Builder::new()
            .name(format!("link-{ifname}"))
            .spawn(move || {
                let mut buf = [0u8; RECV_BUF_SIZE];
                while !thread_stop.load(Ordering::SeqCst) {
                    match recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                        Ok(0) => break,
                        Ok(n) => {
                            for report in parse_link_messages(&buf[..n], &ifname) {
                                debug!("link {} reported {:?}", ifname, report);
                                if report_tx.send(report).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {}
                        Err(e) => {
                            warn!("netlink recv: {}", e);
                            break;
                        }
                    }
                }
            })
            .map_err(ProbeError::Io)?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the thread to stop and wait for it to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LinkWatcher {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Parse a datagram of rtnetlink messages, returning the reports that
/// concern `ifname`. Malformed trailers are ignored.
pub fn parse_link_messages(buf: &[u8], ifname: &str) -> Vec<LinkReport> {
    let mut reports = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let msg_len = read_u32(buf, offset) as usize;
        let msg_type = read_u16(buf, offset + 4);
        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }

        if msg_type == RTM_NEWLINK || msg_type == RTM_DELLINK {
            let payload = &buf[offset + NLMSG_HDRLEN..offset + msg_len];
            if let Some(report) = parse_ifinfo(payload, msg_type, ifname) {
                reports.push(report);
            }
        }

        offset += align4(msg_len);
    }

    reports
}

fn parse_ifinfo(payload: &[u8], msg_type: u16, ifname: &str) -> Option<LinkReport> {
    if payload.len() < IFINFOMSG_LEN {
        return None;
    }
    let flags = read_u32(payload, 8);

    // Walk the attributes looking for the interface name
    let mut at = IFINFOMSG_LEN;
    let mut name = None;
    while at + RTA_HDRLEN <= payload.len() {
        let rta_len = read_u16(payload, at) as usize;
        let rta_type = read_u16(payload, at + 2);
        if rta_len < RTA_HDRLEN || at + rta_len > payload.len() {
            break;
        }
        if rta_type == IFLA_IFNAME {
            let value = &payload[at + RTA_HDRLEN..at + rta_len];
            let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
            name = std::str::from_utf8(&value[..end]).ok();
            break;
        }
        at += align4(rta_len);
    }

    if name != Some(ifname) {
        return None;
    }

    if msg_type == RTM_DELLINK {
        return Some(LinkReport::Removed);
    }
    if flags & IFF_UP != 0 && flags & IFF_RUNNING != 0 {
        Some(LinkReport::Up)
    } else {
        Some(LinkReport::Down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one rtnetlink link message for tests
    fn link_message(msg_type: u16, ifname: &str, flags: u32) -> Vec<u8> {
        let name_attr_len = RTA_HDRLEN + ifname.len() + 1;
        let msg_len = NLMSG_HDRLEN + IFINFOMSG_LEN + align4(name_attr_len);

        let mut buf = vec![0u8; align4(msg_len)];
        buf[0..4].copy_from_slice(&(msg_len as u32).to_ne_bytes());
        buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());

        // ifinfomsg: family, pad, type, index, flags, change
        let ifi = NLMSG_HDRLEN;
        buf[ifi + 8..ifi + 12].copy_from_slice(&flags.to_ne_bytes());

        let rta = ifi + IFINFOMSG_LEN;
        buf[rta..rta + 2].copy_from_slice(&(name_attr_len as u16).to_ne_bytes());
        buf[rta + 2..rta + 4].copy_from_slice(&IFLA_IFNAME.to_ne_bytes());
        buf[rta + 4..rta + 4 + ifname.len()].copy_from_slice(ifname.as_bytes());

        buf
    }

    #[test]
    fn test_newlink_up_requires_running() {
        let up = link_message(RTM_NEWLINK, "phonet0", IFF_UP | IFF_RUNNING);
        assert_eq!(parse_link_messages(&up, "phonet0"), vec![LinkReport::Up]);

        let admin_only = link_message(RTM_NEWLINK, "phonet0", IFF_UP);
        assert_eq!(
            parse_link_messages(&admin_only, "phonet0"),
            vec![LinkReport::Down]
        );
    }

    #[test]
    fn test_dellink_reports_removed() {
        let gone = link_message(RTM_DELLINK, "phonet0", 0);
        assert_eq!(
            parse_link_messages(&gone, "phonet0"),
            vec![LinkReport::Removed]
        );
    }

    #[test]
    fn test_other_interfaces_are_ignored() {
        let other = link_message(RTM_NEWLINK, "eth0", IFF_UP | IFF_RUNNING);
        assert!(parse_link_messages(&other, "phonet0").is_empty());
    }

    #[test]
    fn test_batched_messages_parse_in_order() {
        let mut buf = link_message(RTM_NEWLINK, "phonet0", IFF_UP | IFF_RUNNING);
        buf.extend(link_message(RTM_NEWLINK, "phonet0", 0));
        assert_eq!(
            parse_link_messages(&buf, "phonet0"),
            vec![LinkReport::Up, LinkReport::Down]
        );
    }

    #[test]
    fn test_truncated_message_is_dropped() {
        let mut buf = link_message(RTM_NEWLINK, "phonet0", IFF_UP | IFF_RUNNING);
        buf.truncate(buf.len() - 4);
        assert!(parse_link_messages(&buf, "phonet0").is_empty());
    }
}
