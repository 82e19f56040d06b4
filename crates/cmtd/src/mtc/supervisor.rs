//! MTC supervisor
//!
//! Observes the power-state stream and drives the modem-side protocol: the
//! graceful power-off request with its 200 ms shutdown-sync poll, the state
//! query on power-on, the powered classification forwarded upstream, and
//! the single pending online-transition callback.

use super::client::MtcClient;
use super::protocol::{
    self, InfoKind, IsiCause, ModemState, StateInfo, MTC_POWER_OFF_REQ, MTC_SHUTDOWN_SYNC_REQ,
    MTC_STARTUP_SYNQ_REQ, MTC_STATE_QUERY_REQ,
};
use crate::error::PowerError;
use crate::power::bus::{ControllerEvent, PowerObserver};
use crate::power::types::PowerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Interval of the shutdown-sync poll while a power-off is in flight
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Online-transition request routed from the public handle
pub struct SetOnlineRequest {
    pub online: bool,
    pub reply: oneshot::Sender<Result<(), PowerError>>,
}

/// Modem-side status shared with the public handle
#[derive(Debug, Clone)]
pub struct MtcStatus {
    /// Debounced powered classification
    pub powered: bool,
    /// The modem is in the RF-active state
    pub online: bool,
    pub mtc_state: ModemState,
}

impl Default for MtcStatus {
    fn default() -> Self {
        Self {
            powered: false,
            online: false,
            mtc_state: ModemState::None,
        }
    }
}

struct PendingOnline {
    desired: bool,
    reply: oneshot::Sender<Result<(), PowerError>>,
}

enum Step {
    Power(Option<PowerState>),
    Online(Option<SetOnlineRequest>),
    Indication(Result<StateInfo, RecvError>),
    Poll,
}

pub struct MtcSupervisor {
    client: MtcClient,
    observer: Arc<dyn PowerObserver>,
    power_rx: mpsc::UnboundedReceiver<PowerState>,
    online_rx: mpsc::UnboundedReceiver<SetOnlineRequest>,
    ind_rx: broadcast::Receiver<StateInfo>,
    /// FSM truth, read by the power-off retry task
    state_rx: watch::Receiver<PowerState>,
    status: Arc<RwLock<MtcStatus>>,
    event_tx: broadcast::Sender<ControllerEvent>,

    /// Last power state seen here; also forced to `OffStarted` by a
    /// modem-initiated shutdown indication
    shadow: PowerState,
    mtc_state: ModemState,
    reported: bool,
    pending_online: Option<PendingOnline>,
    polling: bool,
    poll: tokio::time::Interval,
    online_closed: bool,
    ind_closed: bool,
}

impl MtcSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        client: MtcClient,
        observer: Arc<dyn PowerObserver>,
        power_rx: mpsc::UnboundedReceiver<PowerState>,
        online_rx: mpsc::UnboundedReceiver<SetOnlineRequest>,
        state_rx: watch::Receiver<PowerState>,
        status: Arc<RwLock<MtcStatus>>,
        event_tx: broadcast::Sender<ControllerEvent>,
    ) -> JoinHandle<()> {
        let ind_rx = client.subscribe();
        let mut poll = tokio::time::interval(SHUTDOWN_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let supervisor = Self {
            client,
            observer,
            power_rx,
            online_rx,
            ind_rx,
            state_rx,
            status,
            event_tx,
            shadow: PowerState::None,
            mtc_state: ModemState::None,
            reported: false,
            pending_online: None,
            polling: false,
            poll,
            online_closed: false,
            ind_closed: false,
        };
        tokio::spawn(supervisor.run())
    }

    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                state = self.power_rx.recv() => Step::Power(state),
                request = self.online_rx.recv(), if !self.online_closed => Step::Online(request),
                info = self.ind_rx.recv(), if !self.ind_closed => Step::Indication(info),
                _ = self.poll.tick(), if self.polling => Step::Poll,
            };

            match step {
                Step::Power(None) => break,
                Step::Power(Some(state)) => self.on_power_state(state).await,
                Step::Online(None) => self.online_closed = true,
                Step::Online(Some(request)) => self.set_online(request).await,
                Step::Indication(Err(RecvError::Closed)) => {
                    warn!("mtc indication stream closed");
                    self.ind_closed = true;
                }
                Step::Indication(Err(RecvError::Lagged(n))) => {
                    warn!("dropped {} mtc indications", n);
                }
                Step::Indication(Ok(info)) => self.on_indication(info).await,
                Step::Poll => self.poll_shutdown().await,
            }
        }
        debug!("mtc supervisor exiting");
    }

    async fn on_power_state(&mut self, state: PowerState) {
        debug!("power state {}", state.name());
        self.shadow = state;

        if state == PowerState::OffStarted {
            self.start_power_off();
            self.polling = true;
            self.poll.reset_immediately();
        } else {
            // Any other transition cancels the shutdown poll
            self.polling = false;
        }

        if state == PowerState::On {
            if !self.client.is_alive() {
                warn!("mtc client is unreachable");
                return;
            }
            self.query_state().await;
        } else {
            self.set_power_by_mtc_state(ModemState::None).await;
        }
    }

    /// Ask the modem for its current state, then issue the startup sync.
    async fn query_state(&mut self) {
        match self
            .client
            .request(protocol::request(MTC_STATE_QUERY_REQ))
            .await
        {
            Ok(resp) if resp.len() >= 3 => {
                let current = ModemState::from_wire(resp[1]);
                let target = ModemState::from_wire(resp[2]);
                debug!("current modem state: {} (0x{:02X})", current.name(), resp[1]);
                debug!("target modem state: {} (0x{:02X})", target.name(), resp[2]);

                self.set_power_by_mtc_state(current).await;

                if let Err(e) = self
                    .client
                    .request(protocol::request(MTC_STARTUP_SYNQ_REQ))
                    .await
                {
                    debug!("MTC_STARTUP_SYNQ: {}", e);
                }
            }
            Ok(resp) => warn!("short state query response: {:02X?}", resp),
            Err(e) => warn!("MTC_STATE_QUERY: {}", e),
        }
    }

    /// Issue the power-off request, re-issuing on transport errors for as
    /// long as the state machine still reports `OffStarted`. The power-off
    /// timer bounds the loop.
    fn start_power_off(&self) {
        let client = self.client.clone();
        let state_rx = self.state_rx.clone();
        tokio::spawn(async move {
            loop {
                if *state_rx.borrow() != PowerState::OffStarted {
                    break;
                }
                match client.request(protocol::request(MTC_POWER_OFF_REQ)).await {
                    Ok(_) => break,
                    Err(e) => debug!("MTC_POWER_OFF: {}; reissuing", e),
                }
            }
        });
    }

    async fn poll_shutdown(&mut self) {
        if matches!(
            self.shadow,
            PowerState::OnStarted | PowerState::Off | PowerState::OffWaiting
        ) {
            self.polling = false;
            return;
        }
        self.client.send(protocol::request(MTC_SHUTDOWN_SYNC_REQ));
    }

    async fn on_indication(&mut self, info: StateInfo) {
        match info.kind {
            InfoKind::Start => {
                debug!("target modem state: {}", info.state.name());
                if info.state == ModemState::PowerOff {
                    // Modem-initiated shutdown
                    self.shadow = PowerState::OffStarted;
                    self.polling = true;
                    self.poll.reset_immediately();
                }
            }
            InfoKind::Ready => {
                debug!("current modem state: {}", info.state.name());
                self.set_power_by_mtc_state(info.state).await;
            }
            InfoKind::Other(kind) => debug!("unhandled state indication 0x{:02X}", kind),
        }
    }

    async fn set_online(&mut self, request: SetOnlineRequest) {
        if self.shadow != PowerState::On {
            let _ = request.reply.send(Err(PowerError::NotPowered));
            return;
        }
        if self.mtc_state == ModemState::SelftestFail {
            let _ = request.reply.send(Err(PowerError::SelftestFailed));
            return;
        }
        if self.pending_online.is_some() {
            let _ = request.reply.send(Err(PowerError::OnlineBusy));
            return;
        }

        let wanted = if request.online {
            ModemState::Normal
        } else {
            ModemState::RfInactive
        };

        match self.client.request(protocol::state_request(wanted)).await {
            Ok(resp) if resp.len() >= 2 => {
                let cause = IsiCause::from_wire(resp[1]);
                debug!("cause: {} (0x{:02X})", cause.name(), resp[1]);
                match cause {
                    // Armed: completed by the next READY indication
                    IsiCause::Ok => {
                        self.pending_online = Some(PendingOnline {
                            desired: request.online,
                            reply: request.reply,
                        });
                    }
                    IsiCause::AlreadyActive => {
                        let _ = request.reply.send(Ok(()));
                    }
                    other => {
                        let _ = request.reply.send(Err(PowerError::Rejected(other)));
                    }
                }
            }
            Ok(resp) => {
                let _ = request.reply.send(Err(PowerError::Transport(format!(
                    "short state response: {:02X?}",
                    resp
                ))));
            }
            Err(e) => {
                let _ = request.reply.send(Err(e));
            }
        }
    }

    async fn set_power_by_mtc_state(&mut self, state: ModemState) {
        self.mtc_state = state;

        if let Some(pending) = self.pending_online.take() {
            let reached = (state == ModemState::Normal) == pending.desired;
            let result = if reached {
                Ok(())
            } else {
                Err(PowerError::OnlineFailed)
            };
            let _ = pending.reply.send(result);
        }

        let powered = state.is_powered();
        let online = state == ModemState::Normal;
        {
            let mut status = self.status.write().await;
            status.mtc_state = state;
            status.online = online;
            status.powered = powered;
        }

        if powered != self.reported {
            self.reported = powered;
            self.observer.on_powered(powered);
            let _ = self.event_tx.send(ControllerEvent::PoweredChanged {
                powered,
                timestamp: chrono::Utc::now(),
            });
        }
    }
}
