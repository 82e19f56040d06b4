//! The modem power state machine
//!
//! Consumes the power event alphabet, drives the GPIO sequences, arms at
//! most one timeout at a time and publishes every state assignment on the
//! bus. All dispatch happens on the controller task; a transition (exit
//! action, timer cancel, entry action, timer arm, publish) runs without
//! awaiting and is therefore non-interruptible.

use super::bus::PowerBus;
use super::types::{
    LinkState, LinkTarget, PowerEvent, PowerState, OFF_SETTLE_TIMEOUT, POWER_OFF_TIMEOUT,
    POWER_ON_RETRIES, POWER_ON_TIMEOUT, REBOOT_TIMEOUT, RESET_RETRIES,
};
use crate::gpio::{GpioEffector, GpioLine};
use crate::link::LinkReport;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The single pending timeout. Entering a state overwrites it; expiry
/// re-injects the stored event.
#[derive(Debug, Clone, Copy)]
pub struct ArmedTimer {
    pub event: PowerEvent,
    pub deadline: Instant,
}

pub struct PowerFsm {
    state: PowerState,
    link: LinkState,
    target: LinkTarget,
    on_attempts: u32,
    reset_attempts: u32,
    timer: Option<ArmedTimer>,
    effector: GpioEffector,
    bus: PowerBus,
}

impl PowerFsm {
    pub fn new(effector: GpioEffector, bus: PowerBus) -> Self {
        Self {
            state: PowerState::None,
            link: LinkState::None,
            target: LinkTarget::None,
            on_attempts: 0,
            reset_attempts: 0,
            timer: None,
            effector,
            bus,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn timer_deadline(&self) -> Option<Instant> {
        self.timer.map(|t| t.deadline)
    }

    #[cfg(test)]
    pub fn armed_event(&self) -> Option<PowerEvent> {
        self.timer.map(|t| t.event)
    }

    /// Cancel any pending timeout. Used when the controller shuts down.
    pub fn cancel_timer(&mut self) {
        self.timer = None;
    }

    /// Normalize a raw link report into an edge and dispatch it. Duplicate
    /// reports are ignored. The first up edge releases the reset request
    /// line: the modem has signaled readiness.
    pub fn handle_link_report(&mut self, report: LinkReport) {
        match report {
            LinkReport::Up => {
                if self.link == LinkState::Up {
                    return;
                }
                self.link = LinkState::Up;
                self.bus.publish_link(self.link);

                self.effector.write(GpioLine::RstRq, false);

                self.handle_event(PowerEvent::LinkUp);
            }
            LinkReport::Down | LinkReport::Removed => {
                if self.link == LinkState::Down {
                    return;
                }
                self.link = LinkState::Down;
                self.bus.publish_link(self.link);

                self.handle_event(PowerEvent::LinkDown);
            }
        }
    }

    /// Re-inject the stored event after its deadline elapsed.
    pub fn fire_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.handle_event(timer.event);
        }
    }

    pub fn handle_event(&mut self, event: PowerEvent) {
        debug!("({}) @ state {}", event.name(), self.state.name());

        match event {
            PowerEvent::PowerOn => {
                self.target = LinkTarget::Up;

                // Wait for the first link report before acting
                if self.link == LinkState::None {
                    return;
                }

                match self.state {
                    PowerState::OnStarted
                    | PowerState::OnReset
                    | PowerState::On
                    | PowerState::OffStarted => {}
                    PowerState::None
                    | PowerState::OffWaiting
                    | PowerState::Off
                    | PowerState::OnFailed => self.set_state(PowerState::OnStarted),
                }
            }

            PowerEvent::LinkDown => {
                if self.target != LinkTarget::Up {
                    let new_state = if matches!(self.state, PowerState::Off | PowerState::None) {
                        PowerState::Off
                    } else {
                        PowerState::OffWaiting
                    };
                    self.set_state(new_state);
                    return;
                }

                match self.state {
                    // First link report: start the modem
                    PowerState::None => self.set_state(PowerState::OnStarted),
                    PowerState::OnStarted | PowerState::OnReset => {}
                    _ => {
                        self.reset_attempts = 0;
                        self.set_state(PowerState::OnReset);
                    }
                }
            }

            PowerEvent::PowerOnTimeout => {
                let new_state = if self.target == LinkTarget::Down {
                    PowerState::OffStarted
                } else if self.on_attempts <= POWER_ON_RETRIES {
                    PowerState::OnStarted
                } else {
                    PowerState::OnFailed
                };
                self.set_state(new_state);
            }

            PowerEvent::RebootTimeout => {
                // The modem is not rebooting itself - try to power cycle it
                let new_state = if self.target == LinkTarget::Down {
                    PowerState::OffStarted
                } else if self.reset_attempts <= RESET_RETRIES {
                    PowerState::OnReset
                } else {
                    PowerState::OnStarted
                };
                self.set_state(new_state);
            }

            PowerEvent::LinkUp => {
                match self.state {
                    PowerState::None | PowerState::On => return,
                    PowerState::OnStarted | PowerState::OnReset => {}
                    PowerState::OffStarted
                    | PowerState::OffWaiting
                    | PowerState::Off
                    | PowerState::OnFailed => {
                        warn!("link up while the modem should be powered off");
                    }
                }
                if self.target == LinkTarget::Down {
                    self.set_state(PowerState::OffStarted);
                } else {
                    self.set_state(PowerState::On);
                }
            }

            PowerEvent::PowerOff => {
                self.target = LinkTarget::Down;

                match self.state {
                    // Keep the start-up sequence running until its timer expires
                    PowerState::OnStarted | PowerState::OnReset => {}
                    PowerState::On => self.set_state(PowerState::OffStarted),
                    PowerState::OffStarted | PowerState::OffWaiting | PowerState::Off => {}
                    PowerState::None | PowerState::OnFailed => self.set_state(PowerState::Off),
                }
            }

            PowerEvent::PowerOffImmediately => self.set_state(PowerState::Off),

            PowerEvent::PowerOffTimeout => {
                warn!("modem power off timed out");
                self.set_state(PowerState::Off);
            }

            PowerEvent::PowerOffComplete => {
                if self.state == PowerState::OffWaiting {
                    debug!("modem shutdown complete");
                    self.set_state(PowerState::Off);
                }
            }
        }
    }

    fn arm(&mut self, after: Duration, event: PowerEvent) {
        self.timer = Some(ArmedTimer {
            event,
            deadline: Instant::now() + after,
        });
    }

    fn set_state(&mut self, new_state: PowerState) {
        let old_state = self.state;

        debug!(
            "({}) at ({}){}",
            new_state.name(),
            old_state.name(),
            if new_state == old_state { " - already" } else { "" }
        );

        match old_state {
            PowerState::OnStarted => self.effector.finish_power_on(),
            PowerState::OnReset => self.effector.finish_reset(),
            _ => {}
        }

        self.timer = None;

        // Only the two sequence-restarting states may self-re-enter
        if old_state == new_state
            && new_state != PowerState::OnStarted
            && new_state != PowerState::OnReset
        {
            return;
        }

        self.state = new_state;

        match new_state {
            PowerState::None => {}

            PowerState::OnStarted => {
                self.on_attempts += 1;
                self.arm(POWER_ON_TIMEOUT, PowerEvent::PowerOnTimeout);
                self.effector.start_power_on();
            }

            PowerState::OnReset => {
                debug!("starting modem restart timeout");
                self.arm(REBOOT_TIMEOUT, PowerEvent::RebootTimeout);
                // The first entry gives the modem a window to reboot itself
                self.reset_attempts += 1;
                if self.reset_attempts > 1 {
                    self.effector.start_reset();
                }
            }

            PowerState::On => {
                debug!("power on");
                self.on_attempts = 0;
                self.reset_attempts = 0;
            }

            PowerState::OffStarted => {
                debug!("starting power off");
                self.arm(POWER_OFF_TIMEOUT, PowerEvent::PowerOffTimeout);
            }

            PowerState::OffWaiting => {
                self.effector.finish_power_off();
                debug!("waiting for the modem to settle down");
                self.arm(OFF_SETTLE_TIMEOUT, PowerEvent::PowerOffComplete);
            }

            PowerState::Off => {
                if old_state != PowerState::OffWaiting && old_state != PowerState::OnFailed {
                    self.effector.finish_power_off();
                }
            }

            PowerState::OnFailed => {
                warn!("link to the modem cannot be established, giving up");
                self.effector.finish_power_off();
            }
        }

        self.bus.publish(new_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::power::bus::{PowerObserver, MAX_EVENT_SUBSCRIBERS};
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::sync::{broadcast, mpsc, watch};

    struct Capture(Mutex<Vec<PowerState>>);

    impl PowerObserver for Capture {
        fn on_power_state(&self, state: PowerState) {
            self.0.lock().unwrap().push(state);
        }

        fn on_powered(&self, _powered: bool) {}
    }

    struct Fixture {
        fsm: PowerFsm,
        trace: Arc<Capture>,
        config: DaemonConfig,
        _dir: TempDir,
    }

    impl Fixture {
        fn states(&self) -> Vec<PowerState> {
            self.trace.0.lock().unwrap().clone()
        }
    }

    /// Variant-A fixture (all lines present); no in-sequence sleep.
    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let switch_root = dir.path().join("gpio-switch");
        for line in ["cmt_en", "cmt_rst_rq", "cmt_rst", "cmt_bsi", "cmt_apeslpx"] {
            let line_dir = switch_root.join(line);
            fs::create_dir_all(&line_dir).unwrap();
            fs::write(line_dir.join("state"), "inactive").unwrap();
        }
        let config = DaemonConfig {
            gpio_switch_root: switch_root.to_string_lossy().into_owned(),
            dev_cmt_root: dir.path().join("cmt").to_string_lossy().into_owned(),
            ..DaemonConfig::default()
        };

        let effector = GpioEffector::probe(&config).unwrap();
        let trace = Arc::new(Capture(Mutex::new(Vec::new())));
        let (sup_tx, _sup_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(PowerState::None);
        let (link_tx, _link_rx) = watch::channel(LinkState::None);
        let (event_tx, _event_rx) = broadcast::channel(MAX_EVENT_SUBSCRIBERS);
        let bus = PowerBus::new(trace.clone(), sup_tx, state_tx, link_tx, event_tx);

        Fixture {
            fsm: PowerFsm::new(effector, bus),
            trace,
            config,
            _dir: dir,
        }
    }

    fn read_line(config: &DaemonConfig, line: &str) -> String {
        fs::read_to_string(
            std::path::Path::new(&config.gpio_switch_root)
                .join(line)
                .join("state"),
        )
        .unwrap()
    }

    fn bring_on(f: &mut Fixture) {
        f.fsm.handle_link_report(LinkReport::Down);
        f.fsm.handle_event(PowerEvent::PowerOn);
        f.fsm.handle_link_report(LinkReport::Up);
        assert_eq!(f.fsm.state(), PowerState::On);
    }

    #[test]
    fn test_cold_boot_link_comes_up() {
        let mut f = fixture();

        // No target yet: the first down report parks the modem off.
        f.fsm.handle_link_report(LinkReport::Down);
        assert_eq!(f.fsm.state(), PowerState::Off);

        f.fsm.handle_event(PowerEvent::PowerOn);
        assert_eq!(f.fsm.state(), PowerState::OnStarted);
        f.fsm.handle_link_report(LinkReport::Up);

        assert_eq!(
            f.states(),
            vec![PowerState::Off, PowerState::OnStarted, PowerState::On]
        );
    }

    #[test]
    fn test_power_on_before_first_link_report_waits() {
        let mut f = fixture();

        f.fsm.handle_event(PowerEvent::PowerOn);
        assert_eq!(f.fsm.state(), PowerState::None);
        assert!(f.states().is_empty());

        // The first down report now starts the modem.
        f.fsm.handle_link_report(LinkReport::Down);
        assert_eq!(f.fsm.state(), PowerState::OnStarted);
    }

    #[test]
    fn test_power_on_retry_budget_exhausts_to_failed() {
        let mut f = fixture();

        f.fsm.handle_event(PowerEvent::PowerOn);
        f.fsm.handle_link_report(LinkReport::Down);

        // No link up ever arrives; every timeout re-enters the start state
        // until the budget is gone: initial entry + 10 retries.
        while f.fsm.state() == PowerState::OnStarted {
            f.fsm.fire_timer();
        }

        assert_eq!(f.fsm.state(), PowerState::OnFailed);
        let trace = f.states();
        let entries = trace
            .iter()
            .filter(|&&s| s == PowerState::OnStarted)
            .count();
        assert_eq!(entries, 11);
        assert_eq!(*trace.last().unwrap(), PowerState::OnFailed);
        assert!(f.fsm.timer_deadline().is_none());
    }

    #[test]
    fn test_graceful_off_from_on() {
        let mut f = fixture();
        bring_on(&mut f);

        f.fsm.handle_event(PowerEvent::PowerOff);
        assert_eq!(f.fsm.state(), PowerState::OffStarted);
        assert_eq!(f.fsm.armed_event(), Some(PowerEvent::PowerOffTimeout));

        // Modem drops the link once its shutdown completes.
        f.fsm.handle_link_report(LinkReport::Down);
        assert_eq!(f.fsm.state(), PowerState::OffWaiting);
        f.fsm.fire_timer();
        assert_eq!(f.fsm.state(), PowerState::Off);
    }

    #[test]
    fn test_link_crash_resets_after_self_reboot_window() {
        let mut f = fixture();
        bring_on(&mut f);

        // Crash: link drops while wanted up. First reset entry only waits.
        fs::write(
            std::path::Path::new(&f.config.gpio_switch_root)
                .join("cmt_rst_rq")
                .join("state"),
            "sentinel",
        )
        .unwrap();
        f.fsm.handle_link_report(LinkReport::Down);
        assert_eq!(f.fsm.state(), PowerState::OnReset);
        assert_eq!(read_line(&f.config, "cmt_rst_rq"), "sentinel");

        // Self-reboot window elapses: now the reset line is pulsed.
        f.fsm.fire_timer();
        assert_eq!(f.fsm.state(), PowerState::OnReset);
        assert_eq!(read_line(&f.config, "cmt_rst_rq"), "active");

        f.fsm.handle_link_report(LinkReport::Up);
        assert_eq!(f.fsm.state(), PowerState::On);
    }

    #[test]
    fn test_reset_budget_falls_back_to_power_cycle() {
        let mut f = fixture();
        bring_on(&mut f);

        f.fsm.handle_link_report(LinkReport::Down);
        assert_eq!(f.fsm.state(), PowerState::OnReset);

        // Reset cycles until the budget is gone, then a full power-on.
        while f.fsm.state() == PowerState::OnReset {
            f.fsm.fire_timer();
        }
        assert_eq!(f.fsm.state(), PowerState::OnStarted);

        let entries = f
            .states()
            .iter()
            .filter(|&&s| s == PowerState::OnReset)
            .count();
        assert_eq!(entries, 6); // initial + 5 reset retries
    }

    #[test]
    fn test_power_off_during_startup_waits_for_timer() {
        let mut f = fixture();
        f.fsm.handle_event(PowerEvent::PowerOn);
        f.fsm.handle_link_report(LinkReport::Down);
        assert_eq!(f.fsm.state(), PowerState::OnStarted);

        f.fsm.handle_event(PowerEvent::PowerOff);
        assert_eq!(f.fsm.state(), PowerState::OnStarted);

        f.fsm.fire_timer();
        assert_eq!(f.fsm.state(), PowerState::OffStarted);
    }

    #[test]
    fn test_power_off_timeout_forces_off() {
        let mut f = fixture();
        bring_on(&mut f);
        f.fsm.handle_event(PowerEvent::PowerOff);
        assert_eq!(f.fsm.state(), PowerState::OffStarted);

        f.fsm.fire_timer();
        assert_eq!(f.fsm.state(), PowerState::Off);
        assert!(f.fsm.timer_deadline().is_none());
    }

    #[test]
    fn test_power_off_from_none_and_failed_goes_directly_off() {
        let mut f = fixture();
        f.fsm.handle_event(PowerEvent::PowerOff);
        assert_eq!(f.fsm.state(), PowerState::Off);

        let mut f = fixture();
        f.fsm.handle_event(PowerEvent::PowerOn);
        f.fsm.handle_link_report(LinkReport::Down);
        while f.fsm.state() == PowerState::OnStarted {
            f.fsm.fire_timer();
        }
        assert_eq!(f.fsm.state(), PowerState::OnFailed);
        f.fsm.handle_event(PowerEvent::PowerOff);
        assert_eq!(f.fsm.state(), PowerState::Off);
    }

    #[test]
    fn test_self_reentry_republishes_and_rearms() {
        let mut f = fixture();
        f.fsm.handle_event(PowerEvent::PowerOn);
        f.fsm.handle_link_report(LinkReport::Down);
        assert_eq!(f.fsm.state(), PowerState::OnStarted);
        let published = f.states().len();

        f.fsm.handle_event(PowerEvent::PowerOnTimeout);
        assert_eq!(f.fsm.state(), PowerState::OnStarted);
        assert_eq!(f.states().len(), published + 1);
        assert_eq!(f.fsm.armed_event(), Some(PowerEvent::PowerOnTimeout));
    }

    #[test]
    fn test_plain_self_transition_is_silent() {
        let mut f = fixture();
        f.fsm.handle_event(PowerEvent::PowerOff);
        assert_eq!(f.fsm.state(), PowerState::Off);
        let published = f.states().len();

        // Already off: a repeated disable publishes nothing.
        f.fsm.handle_event(PowerEvent::PowerOff);
        assert_eq!(f.states().len(), published);
    }

    #[test]
    fn test_duplicate_link_reports_are_ignored() {
        let mut f = fixture();
        f.fsm.handle_link_report(LinkReport::Down);
        let published = f.states().len();

        f.fsm.handle_link_report(LinkReport::Down);
        f.fsm.handle_link_report(LinkReport::Removed);
        assert_eq!(f.states().len(), published);
    }

    #[test]
    fn test_link_up_clears_reset_request_line() {
        let mut f = fixture();
        f.fsm.handle_event(PowerEvent::PowerOn);
        f.fsm.handle_link_report(LinkReport::Down);
        assert_eq!(read_line(&f.config, "cmt_rst_rq"), "active");

        f.fsm.handle_link_report(LinkReport::Up);
        assert_eq!(read_line(&f.config, "cmt_rst_rq"), "inactive");
    }

    #[test]
    fn test_anomalous_link_up_while_off_is_coerced() {
        let mut f = fixture();
        f.fsm.handle_link_report(LinkReport::Down);
        assert_eq!(f.fsm.state(), PowerState::Off);

        // Target is still unset; an unexpected up edge reads as power-on.
        f.fsm.handle_link_report(LinkReport::Up);
        assert_eq!(f.fsm.state(), PowerState::On);
    }

    #[test]
    fn test_power_off_immediately_from_every_state() {
        // PowerOffImmediately must land in Off in a single transition.
        let states: &[fn(&mut Fixture)] = &[
            |_| {},
            |f| {
                f.fsm.handle_event(PowerEvent::PowerOn);
                f.fsm.handle_link_report(LinkReport::Down);
            },
            |f| bring_on(f),
            |f| {
                bring_on(f);
                f.fsm.handle_link_report(LinkReport::Down);
            },
            |f| {
                bring_on(f);
                f.fsm.handle_event(PowerEvent::PowerOff);
            },
        ];

        for prepare in states {
            let mut f = fixture();
            prepare(&mut f);
            let before = f.states().len();
            f.fsm.handle_event(PowerEvent::PowerOffImmediately);
            assert_eq!(f.fsm.state(), PowerState::Off);
            assert!(f.states().len() <= before + 1);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone, Copy)]
        enum Action {
            ReportUp,
            ReportDown,
            ReportRemoved,
            PowerOn,
            PowerOff,
            PowerOffImmediately,
            FireTimer,
        }

        fn action_strategy() -> impl Strategy<Value = Action> {
            prop_oneof![
                Just(Action::ReportUp),
                Just(Action::ReportDown),
                Just(Action::ReportRemoved),
                Just(Action::PowerOn),
                Just(Action::PowerOff),
                Just(Action::PowerOffImmediately),
                Just(Action::FireTimer),
            ]
        }

        fn apply(f: &mut Fixture, action: Action) {
            match action {
                Action::ReportUp => f.fsm.handle_link_report(LinkReport::Up),
                Action::ReportDown => f.fsm.handle_link_report(LinkReport::Down),
                Action::ReportRemoved => f.fsm.handle_link_report(LinkReport::Removed),
                Action::PowerOn => f.fsm.handle_event(PowerEvent::PowerOn),
                Action::PowerOff => f.fsm.handle_event(PowerEvent::PowerOff),
                Action::PowerOffImmediately => {
                    f.fsm.handle_event(PowerEvent::PowerOffImmediately)
                }
                Action::FireTimer => f.fsm.fire_timer(),
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Timers only exist in the states that arm one, and always
            /// carry that state's timeout event.
            #[test]
            fn prop_timer_matches_state(actions in proptest::collection::vec(action_strategy(), 1..40)) {
                let mut f = fixture();
                for action in actions {
                    apply(&mut f, action);

                    match f.fsm.armed_event() {
                        None => prop_assert!(!matches!(
                            f.fsm.state(),
                            PowerState::OnStarted | PowerState::OnReset
                        )),
                        Some(event) => {
                            let expected = match f.fsm.state() {
                                PowerState::OnStarted => Some(PowerEvent::PowerOnTimeout),
                                PowerState::OnReset => Some(PowerEvent::RebootTimeout),
                                PowerState::OffStarted => Some(PowerEvent::PowerOffTimeout),
                                PowerState::OffWaiting => Some(PowerEvent::PowerOffComplete),
                                _ => None,
                            };
                            prop_assert_eq!(Some(event), expected);
                        }
                    }
                }
            }

            /// An immediate power-off always lands in Off, whatever came
            /// before.
            #[test]
            fn prop_immediate_off_always_reaches_off(actions in proptest::collection::vec(action_strategy(), 0..30)) {
                let mut f = fixture();
                for action in actions {
                    apply(&mut f, action);
                }
                f.fsm.handle_event(PowerEvent::PowerOffImmediately);
                prop_assert_eq!(f.fsm.state(), PowerState::Off);
                prop_assert!(f.fsm.timer_deadline().is_none());
            }
        }
    }
}
