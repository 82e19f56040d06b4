//! GPIO line names, availability record and hardware variant

use serde::Serialize;
use utoipa::ToSchema;

/// Named modem control lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioLine {
    /// Power enable ("power key")
    En,
    /// Reset request
    RstRq,
    /// Reset (PURX)
    Rst,
    /// Battery size indicator, present only on variant A
    Bsi,
    /// Sleep-mode / flash-mode select
    Apeslpx,
}

impl GpioLine {
    /// Line directory name under either GPIO layout
    pub fn name(self) -> &'static str {
        match self {
            GpioLine::En => "cmt_en",
            GpioLine::RstRq => "cmt_rst_rq",
            GpioLine::Rst => "cmt_rst",
            GpioLine::Bsi => "cmt_bsi",
            GpioLine::Apeslpx => "cmt_apeslpx",
        }
    }
}

/// Baseband hardware revision, selected at probe time.
///
/// Variant `A` carries the BSI line and is sequenced by toggling reset and
/// enable; variant `B` has no BSI and is sequenced by cycling enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub enum HardwareVariant {
    A,
    B,
}

/// Which control lines exist on this device.
///
/// Determined once at probe, immutable afterwards. Writes to missing lines
/// are skipped and treated as success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineAvailability {
    pub en: bool,
    pub rst_rq: bool,
    pub rst: bool,
    pub bsi: bool,
    pub apeslpx: bool,
}

impl LineAvailability {
    pub fn has(&self, line: GpioLine) -> bool {
        match line {
            GpioLine::En => self.en,
            GpioLine::RstRq => self.rst_rq,
            GpioLine::Rst => self.rst,
            GpioLine::Bsi => self.bsi,
            GpioLine::Apeslpx => self.apeslpx,
        }
    }
}
