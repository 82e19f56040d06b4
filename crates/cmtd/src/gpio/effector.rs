//! GPIO effector - line writes and the modem power sequences
//!
//! Two pseudo-filesystem layouts are supported. The gpio-switch layout maps
//! each line to `<root>/<line>/state` with textual `active`/`inactive`; the
//! fallback layout maps each line to `<root>/<line>/value` with `1`/`0`.
//! The layout is picked once at probe by checking whether the switch root
//! exists.

use super::lines::{GpioLine, HardwareVariant, LineAvailability};
use crate::config::DaemonConfig;
use crate::error::ProbeError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Settling window required by the variant-B ASIC between dropping and
/// raising the enable line during power-on. Hardware-mandated; this is the
/// only in-sequence sleep.
const ENABLE_CYCLE_SETTLE: Duration = Duration::from_millis(20);

/// Backing layout for line files
#[derive(Debug, Clone)]
enum GpioLayout {
    /// `<root>/<line>/state`, values `active`/`inactive`
    Switch(PathBuf),
    /// `<root>/<line>/value`, values `1`/`0`
    Dev(PathBuf),
}

impl GpioLayout {
    fn line_path(&self, line: GpioLine) -> PathBuf {
        match self {
            GpioLayout::Switch(root) => root.join(line.name()).join("state"),
            GpioLayout::Dev(root) => root.join(line.name()).join("value"),
        }
    }

    fn encode(&self, value: bool) -> &'static str {
        match (self, value) {
            (GpioLayout::Switch(_), true) => "active",
            (GpioLayout::Switch(_), false) => "inactive",
            (GpioLayout::Dev(_), true) => "1",
            (GpioLayout::Dev(_), false) => "0",
        }
    }
}

/// Writes the named modem control lines and runs the compound power
/// sequences.
///
/// Layout, line availability and hardware variant are fixed at probe time.
/// Line write failures are logged and swallowed; there is no retry at this
/// layer.
#[derive(Debug)]
pub struct GpioEffector {
    layout: GpioLayout,
    lines: LineAvailability,
    variant: HardwareVariant,
    startup_in_progress: bool,
    reset_in_progress: bool,
}

impl GpioEffector {
    /// Probe the GPIO layout and line availability.
    ///
    /// Fails with [`ProbeError::NoDevice`] when the mandatory `cmt_en` line
    /// is missing.
    pub fn probe(config: &DaemonConfig) -> Result<Self, ProbeError> {
        let layout = if Path::new(&config.gpio_switch_root).is_dir() {
            debug!("using gpio-switch layout at {}", config.gpio_switch_root);
            GpioLayout::Switch(PathBuf::from(&config.gpio_switch_root))
        } else {
            debug!("using {} layout", config.dev_cmt_root);
            GpioLayout::Dev(PathBuf::from(&config.dev_cmt_root))
        };

        let probe_line = |line: GpioLine| {
            let found = layout.line_path(line).exists();
            debug!("{}: {}", line.name(), if found { "found" } else { "not found" });
            found
        };

        // Line availability depends on hardware and software versions
        let lines = LineAvailability {
            en: probe_line(GpioLine::En),
            rst_rq: probe_line(GpioLine::RstRq),
            rst: probe_line(GpioLine::Rst),
            bsi: probe_line(GpioLine::Bsi),
            apeslpx: probe_line(GpioLine::Apeslpx),
        };

        if !lines.en {
            warn!("modem control GPIO lines are not available");
            return Err(ProbeError::NoDevice);
        }

        let variant = if lines.bsi {
            HardwareVariant::A
        } else {
            HardwareVariant::B
        };
        debug!("hardware variant {:?}", variant);

        Ok(Self {
            layout,
            lines,
            variant,
            startup_in_progress: false,
            reset_in_progress: false,
        })
    }

    pub fn variant(&self) -> HardwareVariant {
        self.variant
    }

    pub fn lines(&self) -> LineAvailability {
        self.lines
    }

    /// Write one line. Missing lines are skipped, write errors are logged
    /// and swallowed.
    pub fn write(&self, line: GpioLine, value: bool) {
        if !self.lines.has(line) {
            return;
        }

        let path = self.layout.line_path(line);
        let text = self.layout.encode(value);
        debug!("(\"{}\", \"{}\")", line.name(), text);

        if let Err(e) = std::fs::write(&path, text) {
            warn!("{}: {}", path.display(), e);
        }
    }

    /// Modem start-up sequence.
    ///
    /// Sets all lines down and leaves the "power key" pressed; the key must
    /// be released with [`finish_power_on`](Self::finish_power_on) after the
    /// link responds or the attempt times out. Idempotent until finished.
    pub fn start_power_on(&mut self) {
        if self.startup_in_progress {
            return;
        }
        self.startup_in_progress = true;

        self.write(GpioLine::Apeslpx, false); // skip flash mode
        self.write(GpioLine::RstRq, false); // prevent current drain

        match self.variant {
            HardwareVariant::B => {
                self.write(GpioLine::En, false);
                std::thread::sleep(ENABLE_CYCLE_SETTLE);
                self.write(GpioLine::En, true);
            }
            HardwareVariant::A => {
                // toggle BSI visible to the modem
                self.write(GpioLine::Bsi, false);
                self.write(GpioLine::Rst, false); // assert PURX
                self.write(GpioLine::En, true); // press "power key"
                self.write(GpioLine::Rst, true); // release to boot
            }
        }

        self.write(GpioLine::RstRq, true);
    }

    /// Release the "power key" held by [`start_power_on`](Self::start_power_on).
    pub fn finish_power_on(&mut self) {
        if !self.startup_in_progress {
            return;
        }
        self.startup_in_progress = false;

        match self.variant {
            HardwareVariant::B => {}
            HardwareVariant::A => {
                self.write(GpioLine::En, false); // release "power key"
            }
        }
    }

    /// Pulse the reset-request line, or fall back to a full power-on when
    /// the line is missing. Idempotent until finished.
    pub fn start_reset(&mut self) {
        if self.reset_in_progress {
            return;
        }
        self.reset_in_progress = true;

        if self.lines.rst_rq {
            self.write(GpioLine::RstRq, false); // just in case
            self.write(GpioLine::RstRq, true);
        } else {
            self.start_power_on();
        }
    }

    pub fn finish_reset(&mut self) {
        if !self.reset_in_progress {
            return;
        }
        self.reset_in_progress = false;
        self.finish_power_on();
    }

    /// Put the modem into its powered-off line configuration, releasing any
    /// in-progress startup or reset sequence first.
    pub fn finish_power_off(&mut self) {
        if self.reset_in_progress {
            self.finish_reset();
        }
        if self.startup_in_progress {
            self.finish_power_on();
        }

        self.write(GpioLine::Apeslpx, false); // skip flash mode
        self.write(GpioLine::RstRq, false); // prevent current drain

        match self.variant {
            HardwareVariant::B => {
                self.write(GpioLine::En, false); // power off
            }
            HardwareVariant::A => {
                self.write(GpioLine::Rst, false); // force modem to reset state
                self.write(GpioLine::En, false); // release "power key"
                self.write(GpioLine::Rst, true); // powered off by bootloader
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn switch_fixture(lines: &[&str]) -> (TempDir, DaemonConfig) {
        let dir = TempDir::new().unwrap();
        let switch_root = dir.path().join("gpio-switch");
        for line in lines {
            let line_dir = switch_root.join(line);
            fs::create_dir_all(&line_dir).unwrap();
            fs::write(line_dir.join("state"), "inactive").unwrap();
        }
        let config = DaemonConfig {
            gpio_switch_root: switch_root.to_string_lossy().into_owned(),
            dev_cmt_root: dir.path().join("cmt").to_string_lossy().into_owned(),
            ..DaemonConfig::default()
        };
        (dir, config)
    }

    fn dev_fixture(lines: &[&str]) -> (TempDir, DaemonConfig) {
        let dir = TempDir::new().unwrap();
        let dev_root = dir.path().join("cmt");
        for line in lines {
            let line_dir = dev_root.join(line);
            fs::create_dir_all(&line_dir).unwrap();
            fs::write(line_dir.join("value"), "0").unwrap();
        }
        let config = DaemonConfig {
            gpio_switch_root: dir.path().join("missing").to_string_lossy().into_owned(),
            dev_cmt_root: dev_root.to_string_lossy().into_owned(),
            ..DaemonConfig::default()
        };
        (dir, config)
    }

    fn read_line(config: &DaemonConfig, line: &str) -> String {
        let switch = Path::new(&config.gpio_switch_root);
        if switch.is_dir() {
            fs::read_to_string(switch.join(line).join("state")).unwrap()
        } else {
            fs::read_to_string(Path::new(&config.dev_cmt_root).join(line).join("value")).unwrap()
        }
    }

    #[test]
    fn test_probe_selects_switch_layout_and_variant_a() {
        let (_dir, config) =
            switch_fixture(&["cmt_en", "cmt_rst_rq", "cmt_rst", "cmt_bsi", "cmt_apeslpx"]);
        let effector = GpioEffector::probe(&config).unwrap();
        assert_eq!(effector.variant(), HardwareVariant::A);
        assert!(effector.lines().bsi);
    }

    #[test]
    fn test_probe_without_bsi_is_variant_b() {
        let (_dir, config) = dev_fixture(&["cmt_en", "cmt_rst_rq", "cmt_apeslpx"]);
        let effector = GpioEffector::probe(&config).unwrap();
        assert_eq!(effector.variant(), HardwareVariant::B);
        assert!(!effector.lines().rst);
    }

    #[test]
    fn test_probe_without_en_fails_no_device() {
        let (_dir, config) = switch_fixture(&["cmt_rst_rq", "cmt_rst"]);
        assert!(matches!(
            GpioEffector::probe(&config),
            Err(ProbeError::NoDevice)
        ));
    }

    #[test]
    fn test_write_encodings_per_layout() {
        let (_dir, config) = switch_fixture(&["cmt_en"]);
        let effector = GpioEffector::probe(&config).unwrap();
        effector.write(GpioLine::En, true);
        assert_eq!(read_line(&config, "cmt_en"), "active");
        effector.write(GpioLine::En, false);
        assert_eq!(read_line(&config, "cmt_en"), "inactive");

        let (_dir, config) = dev_fixture(&["cmt_en"]);
        let effector = GpioEffector::probe(&config).unwrap();
        effector.write(GpioLine::En, true);
        assert_eq!(read_line(&config, "cmt_en"), "1");
    }

    #[test]
    fn test_write_missing_line_is_skipped() {
        let (_dir, config) = dev_fixture(&["cmt_en"]);
        let effector = GpioEffector::probe(&config).unwrap();
        // No line directory exists for rst_rq; the write must be a no-op.
        effector.write(GpioLine::RstRq, true);
        assert!(!Path::new(&config.dev_cmt_root).join("cmt_rst_rq").exists());
    }

    #[test]
    fn test_variant_a_power_on_sequence_end_state() {
        let (_dir, config) =
            switch_fixture(&["cmt_en", "cmt_rst_rq", "cmt_rst", "cmt_bsi", "cmt_apeslpx"]);
        let mut effector = GpioEffector::probe(&config).unwrap();

        effector.start_power_on();
        assert_eq!(read_line(&config, "cmt_apeslpx"), "inactive");
        assert_eq!(read_line(&config, "cmt_bsi"), "inactive");
        assert_eq!(read_line(&config, "cmt_en"), "active"); // key held
        assert_eq!(read_line(&config, "cmt_rst"), "active");
        assert_eq!(read_line(&config, "cmt_rst_rq"), "active");

        effector.finish_power_on();
        assert_eq!(read_line(&config, "cmt_en"), "inactive"); // key released
    }

    #[test]
    fn test_variant_b_power_on_cycles_enable() {
        let (_dir, config) = dev_fixture(&["cmt_en", "cmt_rst_rq", "cmt_apeslpx"]);
        let mut effector = GpioEffector::probe(&config).unwrap();

        effector.start_power_on();
        assert_eq!(read_line(&config, "cmt_en"), "1");
        assert_eq!(read_line(&config, "cmt_rst_rq"), "1");

        // Variant B keeps enable high after finish.
        effector.finish_power_on();
        assert_eq!(read_line(&config, "cmt_en"), "1");
    }

    #[test]
    fn test_start_power_on_is_idempotent_until_finished() {
        let (_dir, config) = dev_fixture(&["cmt_en", "cmt_rst_rq"]);
        let mut effector = GpioEffector::probe(&config).unwrap();

        effector.start_power_on();
        // Overwrite a line behind the effector's back; a second start must
        // not touch it while the sequence is still in progress.
        fs::write(
            Path::new(&config.dev_cmt_root).join("cmt_en").join("value"),
            "sentinel",
        )
        .unwrap();
        effector.start_power_on();
        assert_eq!(read_line(&config, "cmt_en"), "sentinel");

        effector.finish_power_on();
        effector.start_power_on();
        assert_eq!(read_line(&config, "cmt_en"), "1");
    }

    #[test]
    fn test_reset_pulses_rst_rq_when_available() {
        let (_dir, config) = dev_fixture(&["cmt_en", "cmt_rst_rq"]);
        let mut effector = GpioEffector::probe(&config).unwrap();

        effector.start_reset();
        assert_eq!(read_line(&config, "cmt_rst_rq"), "1");

        // Falls back to the full power-on sequence without the line.
        let (_dir2, config2) = dev_fixture(&["cmt_en"]);
        let mut effector2 = GpioEffector::probe(&config2).unwrap();
        effector2.start_reset();
        assert_eq!(read_line(&config2, "cmt_en"), "1");
    }

    #[test]
    fn test_finish_power_off_releases_sequences_and_lines() {
        let (_dir, config) =
            switch_fixture(&["cmt_en", "cmt_rst_rq", "cmt_rst", "cmt_bsi", "cmt_apeslpx"]);
        let mut effector = GpioEffector::probe(&config).unwrap();

        effector.start_power_on();
        effector.start_reset();
        effector.finish_power_off();

        assert_eq!(read_line(&config, "cmt_apeslpx"), "inactive");
        assert_eq!(read_line(&config, "cmt_rst_rq"), "inactive");
        assert_eq!(read_line(&config, "cmt_en"), "inactive");
        // Variant A leaves rst released for the bootloader power-down.
        assert_eq!(read_line(&config, "cmt_rst"), "active");

        // Both sequence flags were cleared.
        effector.start_power_on();
        assert_eq!(read_line(&config, "cmt_en"), "active");
    }
}
