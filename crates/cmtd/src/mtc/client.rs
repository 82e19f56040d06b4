//! MTC transport client
//!
//! A cloneable handle over an I/O task that owns the endpoint. Requests are
//! serialized through an mpsc queue and answered via oneshot channels; each
//! carries the expected response id and the transport timeout. Unsolicited
//! state indications are fanned out on a broadcast channel at any time,
//! including while a request is in flight.

use super::protocol::{self, StateInfo};
use crate::error::PowerError;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

/// Frame queue depth between the client task and the endpoint bridge
pub const ENDPOINT_QUEUE: usize = 32;

/// Broadcast depth for unsolicited indications
const INDICATION_BUFFER: usize = 64;

/// One side of a datagram-frame transport.
///
/// The production side bridges an AF_PHONET socket; tests hold the peer and
/// play the modem.
pub struct MtcEndpoint {
    pub to_modem: mpsc::Sender<Vec<u8>>,
    pub from_modem: mpsc::Receiver<Vec<u8>>,
}

impl MtcEndpoint {
    /// Create a connected endpoint pair. The second endpoint acts as the
    /// remote side.
    pub fn pair() -> (MtcEndpoint, MtcEndpoint) {
        let (a_tx, a_rx) = mpsc::channel(ENDPOINT_QUEUE);
        let (b_tx, b_rx) = mpsc::channel(ENDPOINT_QUEUE);
        (
            MtcEndpoint {
                to_modem: a_tx,
                from_modem: b_rx,
            },
            MtcEndpoint {
                to_modem: b_tx,
                from_modem: a_rx,
            },
        )
    }
}

struct Request {
    frame: [u8; 3],
    /// `None` for fire-and-forget sends
    reply: Option<oneshot::Sender<Result<Vec<u8>, PowerError>>>,
}

/// Cloneable MTC client handle
#[derive(Clone)]
pub struct MtcClient {
    request_tx: mpsc::UnboundedSender<Request>,
    ind_tx: broadcast::Sender<StateInfo>,
}

impl MtcClient {
    /// Spawn the I/O task over the endpoint. `timeout` bounds every
    /// request/response exchange.
    pub fn new(endpoint: MtcEndpoint, timeout: Duration) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (ind_tx, _) = broadcast::channel(INDICATION_BUFFER);

        let task = ClientTask {
            endpoint,
            request_rx,
            ind_tx: ind_tx.clone(),
            timeout,
        };
        tokio::spawn(task.run());

        Self { request_tx, ind_tx }
    }

    /// Subscribe to unsolicited state indications
    pub fn subscribe(&self) -> broadcast::Receiver<StateInfo> {
        self.ind_tx.subscribe()
    }

    /// The I/O task is still running and can reach the endpoint
    pub fn is_alive(&self) -> bool {
        !self.request_tx.is_closed()
    }

    /// Issue a request and wait for its matching response
    pub async fn request(&self, frame: [u8; 3]) -> Result<Vec<u8>, PowerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(Request {
                frame,
                reply: Some(reply_tx),
            })
            .map_err(|_| PowerError::Removed)?;
        reply_rx.await.map_err(|_| PowerError::Removed)?
    }

    /// Fire-and-forget send, used for the shutdown-sync poll
    pub fn send(&self, frame: [u8; 3]) {
        let _ = self.request_tx.send(Request { frame, reply: None });
    }
}

enum Step {
    Request(Option<Request>),
    Inbound(Option<Vec<u8>>),
}

struct ClientTask {
    endpoint: MtcEndpoint,
    request_rx: mpsc::UnboundedReceiver<Request>,
    ind_tx: broadcast::Sender<StateInfo>,
    timeout: Duration,
}

impl ClientTask {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                request = self.request_rx.recv() => Step::Request(request),
                frame = self.endpoint.from_modem.recv() => Step::Inbound(frame),
            };

            match step {
                Step::Request(None) => break,
                Step::Request(Some(request)) => self.handle_request(request).await,
                Step::Inbound(None) => {
                    warn!("mtc endpoint closed");
                    break;
                }
                Step::Inbound(Some(frame)) => dispatch_unsolicited(&frame, &self.ind_tx),
            }
        }
        debug!("mtc client task exiting");
    }

    async fn handle_request(&mut self, request: Request) {
        if self
            .endpoint
            .to_modem
            .send(request.frame.to_vec())
            .await
            .is_err()
        {
            if let Some(reply) = request.reply {
                let _ = reply.send(Err(PowerError::Transport("endpoint closed".into())));
            }
            return;
        }

        let Some(reply) = request.reply else {
            return;
        };

        let expect = protocol::expected_response(request.frame[0]);
        let from_modem = &mut self.endpoint.from_modem;
        let ind_tx = &self.ind_tx;

        // Wait for the matching response, fanning out anything unsolicited
        // that arrives in between.
        let result = tokio::time::timeout(self.timeout, async {
            loop {
                match from_modem.recv().await {
                    Some(frame) if frame.first() == Some(&expect) => return Ok(frame),
                    Some(frame) => dispatch_unsolicited(&frame, ind_tx),
                    None => return Err(PowerError::Transport("endpoint closed".into())),
                }
            }
        })
        .await;

        let response = match result {
            Ok(inner) => inner,
            Err(_) => Err(PowerError::Transport(format!(
                "request 0x{:02X} timed out",
                request.frame[0]
            ))),
        };
        let _ = reply.send(response);
    }
}

fn dispatch_unsolicited(frame: &[u8], ind_tx: &broadcast::Sender<StateInfo>) {
    if let Some(info) = protocol::parse_state_info(frame) {
        let _ = ind_tx.send(info);
    } else {
        debug!("unexpected mtc frame: {:02X?}", frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtc::protocol::{
        MTC_POWER_OFF_REQ, MTC_POWER_OFF_RESP, MTC_SHUTDOWN_SYNC_REQ, MTC_STATE_INFO_IND,
    };
    use crate::mtc::{InfoKind, ModemState};

    #[tokio::test]
    async fn test_request_matches_response_id() {
        let (endpoint, mut modem) = MtcEndpoint::pair();
        let client = MtcClient::new(endpoint, Duration::from_secs(1));

        let request = tokio::spawn({
            let client = client.clone();
            async move { client.request(protocol::request(MTC_POWER_OFF_REQ)).await }
        });

        let frame = modem.from_modem.recv().await.unwrap();
        assert_eq!(frame[0], MTC_POWER_OFF_REQ);
        modem
            .to_modem
            .send(vec![MTC_POWER_OFF_RESP, 0x00, 0x00])
            .await
            .unwrap();

        let response = request.await.unwrap().unwrap();
        assert_eq!(response[0], MTC_POWER_OFF_RESP);
    }

    #[tokio::test]
    async fn test_indications_flow_during_pending_request() {
        let (endpoint, mut modem) = MtcEndpoint::pair();
        let client = MtcClient::new(endpoint, Duration::from_secs(1));
        let mut indications = client.subscribe();

        let request = tokio::spawn({
            let client = client.clone();
            async move { client.request(protocol::request(MTC_POWER_OFF_REQ)).await }
        });

        let _ = modem.from_modem.recv().await.unwrap();
        // Indication first, then the response
        modem
            .to_modem
            .send(vec![MTC_STATE_INFO_IND, 0x00, 0x03])
            .await
            .unwrap();
        modem
            .to_modem
            .send(vec![MTC_POWER_OFF_RESP, 0x00, 0x00])
            .await
            .unwrap();

        assert!(request.await.unwrap().is_ok());
        let info = indications.recv().await.unwrap();
        assert_eq!(info.state, ModemState::PowerOff);
        assert_eq!(info.kind, InfoKind::Start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_without_response() {
        let (endpoint, mut modem) = MtcEndpoint::pair();
        let client = MtcClient::new(endpoint, Duration::from_millis(100));

        let result = client.request(protocol::request(MTC_POWER_OFF_REQ)).await;
        assert!(matches!(result, Err(PowerError::Transport(_))));

        // The request frame still went out
        assert_eq!(modem.from_modem.recv().await.unwrap()[0], MTC_POWER_OFF_REQ);
    }

    #[tokio::test]
    async fn test_fire_and_forget_send() {
        let (endpoint, mut modem) = MtcEndpoint::pair();
        let client = MtcClient::new(endpoint, Duration::from_secs(1));

        client.send(protocol::request(MTC_SHUTDOWN_SYNC_REQ));
        let frame = modem.from_modem.recv().await.unwrap();
        assert_eq!(frame[0], MTC_SHUTDOWN_SYNC_REQ);
        assert!(client.is_alive());
    }
}
