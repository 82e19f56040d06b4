//! AF_PHONET datagram endpoint
//!
//! Bridges a nonblocking Phonet socket to the channel pair the MTC client
//! consumes. The socket is bound to the MTC resource and datagrams are sent
//! to the modem host device. Unsafe is confined to the raw socket calls.

use super::client::{MtcEndpoint, ENDPOINT_QUEUE};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Phonet device address of the modem host
const PN_DEV_HOST: u8 = 0x00;

/// Largest MTC frame we expect on the wire
const RECV_BUF_SIZE: usize = 256;

/// Phonet socket address, mirroring the kernel's `sockaddr_pn`
#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrPn {
    spn_family: libc::sa_family_t,
    spn_obj: u8,
    spn_dev: u8,
    spn_resource: u8,
    spn_zero: [u8; 11],
}

impl SockaddrPn {
    fn new(dev: u8, resource: u8) -> Self {
        Self {
            spn_family: libc::AF_PHONET as libc::sa_family_t,
            spn_obj: 0,
            spn_dev: dev,
            spn_resource: resource,
            spn_zero: [0; 11],
        }
    }
}

/// Open the Phonet socket for `resource` and spawn the bridge task.
///
/// Must be called from within the tokio runtime; the fd registers with the
/// runtime reactor.
pub fn connect(resource: u8) -> io::Result<MtcEndpoint> {
    let socket = PhonetSocket::open(resource)?;

    let (to_tx, mut to_rx) = mpsc::channel::<Vec<u8>>(ENDPOINT_QUEUE);
    let (from_tx, from_rx) = mpsc::channel::<Vec<u8>>(ENDPOINT_QUEUE);

    tokio::spawn(async move {
        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            tokio::select! {
                maybe_frame = to_rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    if let Err(e) = socket.send(&frame).await {
                        warn!("phonet send: {}", e);
                        break;
                    }
                }
                ready = socket.fd.readable() => {
                    let mut guard = match ready {
                        Ok(guard) => guard,
                        Err(e) => {
                            warn!("phonet poll: {}", e);
                            break;
                        }
                    };
                    match guard.try_io(|fd| recv_raw(fd.get_ref(), &mut buf)) {
                        Ok(Ok(n)) => {
                            if from_tx.send(buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("phonet recv: {}", e);
                            break;
                        }
                        Err(_would_block) => {}
                    }
                }
            }
        }
        debug!("phonet bridge exiting");
    });

    Ok(MtcEndpoint {
        to_modem: to_tx,
        from_modem: from_rx,
    })
}

struct PhonetSocket {
    fd: AsyncFd<OwnedFd>,
    peer: SockaddrPn,
}

impl PhonetSocket {
    fn open(resource: u8) -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_PHONET,
                libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a fresh, valid descriptor we own
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };

        let local = SockaddrPn::new(0, resource);
        let rc = unsafe {
            libc::bind(
                owned.as_raw_fd(),
                &local as *const SockaddrPn as *const libc::sockaddr,
                std::mem::size_of::<SockaddrPn>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: AsyncFd::new(owned)?,
            peer: SockaddrPn::new(PN_DEV_HOST, resource),
        })
    }

    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|fd| send_raw(fd.get_ref(), frame, &self.peer)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }
}

fn send_raw(fd: &OwnedFd, frame: &[u8], peer: &SockaddrPn) -> io::Result<usize> {
    let n = unsafe {
        libc::sendto(
            fd.as_raw_fd(),
            frame.as_ptr() as *const libc::c_void,
            frame.len(),
            0,
            peer as *const SockaddrPn as *const libc::sockaddr,
            std::mem::size_of::<SockaddrPn>() as libc::socklen_t,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn recv_raw(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::recv(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_layout_matches_kernel() {
        // family(2) + obj + dev + resource + zero[11] == sizeof(sockaddr)
        assert_eq!(
            std::mem::size_of::<SockaddrPn>(),
            std::mem::size_of::<libc::sockaddr>()
        );
    }
}
