//! Modem power controller
//!
//! `ModemPower` is the public handle; behind it one controller task owns
//! the state machine and serializes commands, link reports and the pending
//! timeout. A process-wide registry enforces a single live controller per
//! interface.

use super::bus::{ControllerEvent, PowerBus, PowerObserver, MAX_EVENT_SUBSCRIBERS};
use super::fsm::PowerFsm;
use super::types::{LinkState, PowerEvent, PowerState};
use crate::config::DaemonConfig;
use crate::error::{PowerError, ProbeError, RequestOutcome};
use crate::gpio::{GpioEffector, HardwareVariant};
use crate::link::{LinkReport, LinkWatcher};
use crate::mtc::client::{MtcClient, MtcEndpoint};
use crate::mtc::phonet;
use crate::mtc::protocol::PN_MTC;
use crate::mtc::supervisor::{MtcStatus, MtcSupervisor, SetOnlineRequest};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Live controllers by interface name. A second probe for the same
/// interface fails until the first controller is removed.
static REGISTRY: Lazy<Mutex<HashMap<String, Uuid>>> = Lazy::new(Mutex::default);

fn registry_claim(interface: &str) -> Result<Uuid, ProbeError> {
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if registry.contains_key(interface) {
        return Err(ProbeError::Busy);
    }
    let token = Uuid::new_v4();
    registry.insert(interface.to_string(), token);
    Ok(token)
}

fn registry_release(interface: &str, token: Uuid) {
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    if registry.get(interface) == Some(&token) {
        registry.remove(interface);
    }
}

enum Command {
    Enable(oneshot::Sender<RequestOutcome>),
    Disable(oneshot::Sender<RequestOutcome>),
    PowerOffImmediately,
    Remove(oneshot::Sender<()>),
}

/// Point-in-time controller status
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusSnapshot {
    pub state: PowerState,
    pub state_name: String,
    pub link: LinkState,
    pub powered: bool,
    pub online: bool,
    pub mtc_state: String,
    pub variant: HardwareVariant,
    pub interface: String,
    pub uptime_secs: u64,
}

/// Handle to a live modem power controller
#[derive(Clone)]
pub struct ModemPower {
    cmd_tx: mpsc::UnboundedSender<Command>,
    online_tx: mpsc::UnboundedSender<SetOnlineRequest>,
    state_rx: watch::Receiver<PowerState>,
    link_rx: watch::Receiver<LinkState>,
    event_tx: broadcast::Sender<ControllerEvent>,
    status: Arc<RwLock<MtcStatus>>,
    interface: String,
    variant: HardwareVariant,
    started_at: Instant,
}

impl ModemPower {
    /// Probe the hardware and bring up the controller: instance registry,
    /// interface check, GPIO probe, link watcher, Phonet MTC transport.
    ///
    /// Must be called from within the tokio runtime.
    pub fn probe(
        config: &DaemonConfig,
        observer: Arc<dyn PowerObserver>,
    ) -> Result<Self, ProbeError> {
        let token = registry_claim(&config.interface)?;

        let result = (|| {
            nix::net::if_::if_nametoindex(config.interface.as_str())
                .map_err(|_| ProbeError::NoInterface(config.interface.clone()))?;

            let (link_tx, link_rx) = mpsc::unbounded_channel();
            let watcher = LinkWatcher::spawn(&config.interface, link_tx)?;
            let endpoint = phonet::connect(PN_MTC).map_err(ProbeError::Io)?;
            Self::build(config, observer, token, Some(watcher), link_rx, endpoint)
        })();

        result.map_err(|e| {
            registry_release(&config.interface, token);
            e
        })
    }

    /// Bring up a controller over externally supplied link and MTC
    /// transports. Probes GPIO like [`probe`](Self::probe) and enforces the
    /// same instance registry.
    pub fn probe_with(
        config: &DaemonConfig,
        observer: Arc<dyn PowerObserver>,
        link_rx: mpsc::UnboundedReceiver<LinkReport>,
        endpoint: MtcEndpoint,
    ) -> Result<Self, ProbeError> {
        let token = registry_claim(&config.interface)?;
        Self::build(config, observer, token, None, link_rx, endpoint).map_err(|e| {
            registry_release(&config.interface, token);
            e
        })
    }

    fn build(
        config: &DaemonConfig,
        observer: Arc<dyn PowerObserver>,
        token: Uuid,
        watcher: Option<LinkWatcher>,
        link_rx: mpsc::UnboundedReceiver<LinkReport>,
        endpoint: MtcEndpoint,
    ) -> Result<Self, ProbeError> {
        let effector = GpioEffector::probe(config)?;
        let variant = effector.variant();

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (online_tx, online_rx) = mpsc::unbounded_channel();
        let (supervisor_tx, supervisor_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PowerState::None);
        let (link_state_tx, link_state_rx) = watch::channel(LinkState::None);
        let (event_tx, _) = broadcast::channel(MAX_EVENT_SUBSCRIBERS);
        let status = Arc::new(RwLock::new(MtcStatus::default()));

        let bus = PowerBus::new(
            observer.clone(),
            supervisor_tx,
            state_tx,
            link_state_tx,
            event_tx.clone(),
        );
        let fsm = PowerFsm::new(effector, bus);

        let client = MtcClient::new(endpoint, Duration::from_millis(config.mtc_timeout_ms));
        MtcSupervisor::spawn(
            client,
            observer,
            supervisor_rx,
            online_rx,
            state_rx.clone(),
            status.clone(),
            event_tx.clone(),
        );

        let controller = Controller {
            fsm,
            cmd_rx,
            link_rx,
            link_closed: false,
            interface: config.interface.clone(),
            token,
            remove_ack: None,
        };
        tokio::spawn(controller.run(watcher));

        info!(
            "modem power controller ready on {} (variant {:?})",
            config.interface, variant
        );

        Ok(Self {
            cmd_tx,
            online_tx,
            state_rx,
            link_rx: link_state_rx,
            event_tx,
            status,
            interface: config.interface.clone(),
            variant,
            started_at: Instant::now(),
        })
    }

    /// Request power-on. Returns [`RequestOutcome::AlreadyDone`] when the
    /// modem is already on, otherwise the transition proceeds in the
    /// background.
    pub async fn enable(&self) -> Result<RequestOutcome, PowerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Enable(reply_tx))
            .map_err(|_| PowerError::Removed)?;
        reply_rx.await.map_err(|_| PowerError::Removed)
    }

    /// Request graceful power-off. Already-off (or failed) modems report
    /// [`RequestOutcome::AlreadyDone`].
    pub async fn disable(&self) -> Result<RequestOutcome, PowerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Disable(reply_tx))
            .map_err(|_| PowerError::Removed)?;
        reply_rx.await.map_err(|_| PowerError::Removed)
    }

    /// Cut power without the graceful MTC handshake.
    pub fn power_off_immediately(&self) -> Result<(), PowerError> {
        self.cmd_tx
            .send(Command::PowerOffImmediately)
            .map_err(|_| PowerError::Removed)
    }

    /// Request the RF-active (online) or RF-inactive state. Completes when
    /// the modem confirms the transition.
    pub async fn set_online(&self, online: bool) -> Result<(), PowerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.online_tx
            .send(SetOnlineRequest {
                online,
                reply: reply_tx,
            })
            .map_err(|_| PowerError::Removed)?;
        reply_rx.await.map_err(|_| PowerError::Removed)?
    }

    /// Tear the controller down: stop the link watcher, cancel the pending
    /// timeout and release the instance registry entry.
    pub async fn remove(self) -> Result<(), PowerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Remove(reply_tx))
            .map_err(|_| PowerError::Removed)?;
        reply_rx.await.map_err(|_| PowerError::Removed)
    }

    pub fn state(&self) -> PowerState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    pub fn variant(&self) -> HardwareVariant {
        self.variant
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub async fn status(&self) -> StatusSnapshot {
        let mtc = self.status.read().await.clone();
        let state = *self.state_rx.borrow();
        StatusSnapshot {
            state,
            state_name: state.name().to_string(),
            link: *self.link_rx.borrow(),
            powered: mtc.powered,
            online: mtc.online,
            mtc_state: mtc.mtc_state.name().to_string(),
            variant: self.variant,
            interface: self.interface.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

enum Step {
    Cmd(Option<Command>),
    Link(Option<LinkReport>),
    Timeout,
}

struct Controller {
    fsm: PowerFsm,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    link_rx: mpsc::UnboundedReceiver<LinkReport>,
    link_closed: bool,
    interface: String,
    token: Uuid,
    remove_ack: Option<oneshot::Sender<()>>,
}

impl Controller {
    async fn run(mut self, watcher: Option<LinkWatcher>) {
        loop {
            let deadline = self.fsm.timer_deadline();
            let timer_at = deadline.unwrap_or_else(Instant::now);

            let step = tokio::select! {
                command = self.cmd_rx.recv() => Step::Cmd(command),
                report = self.link_rx.recv(), if !self.link_closed => Step::Link(report),
                _ = tokio::time::sleep_until(timer_at), if deadline.is_some() => Step::Timeout,
            };

            match step {
                Step::Cmd(None) => break,
                Step::Cmd(Some(command)) => {
                    if self.handle_command(command) {
                        break;
                    }
                }
                Step::Link(None) => {
                    warn!("link report stream ended");
                    self.link_closed = true;
                }
                Step::Link(Some(report)) => self.fsm.handle_link_report(report),
                Step::Timeout => self.fsm.fire_timer(),
            }
        }

        self.fsm.cancel_timer();
        if let Some(watcher) = watcher {
            tokio::task::spawn_blocking(move || watcher.stop());
        }
        registry_release(&self.interface, self.token);
        if let Some(ack) = self.remove_ack.take() {
            let _ = ack.send(());
        }
        debug!("power controller for {} exiting", self.interface);
    }

    /// Returns true when the controller should shut down.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Enable(reply) => {
                let outcome = if self.fsm.state() == PowerState::On {
                    RequestOutcome::AlreadyDone
                } else {
                    self.fsm.handle_event(PowerEvent::PowerOn);
                    RequestOutcome::InProgress
                };
                let _ = reply.send(outcome);
                false
            }
            Command::Disable(reply) => {
                let outcome = if matches!(
                    self.fsm.state(),
                    PowerState::Off | PowerState::OnFailed
                ) {
                    RequestOutcome::AlreadyDone
                } else {
                    self.fsm.handle_event(PowerEvent::PowerOff);
                    RequestOutcome::InProgress
                };
                let _ = reply.send(outcome);
                false
            }
            Command::PowerOffImmediately => {
                self.fsm.handle_event(PowerEvent::PowerOffImmediately);
                false
            }
            Command::Remove(reply) => {
                self.remove_ack = Some(reply);
                true
            }
        }
    }
}
