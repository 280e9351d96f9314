//! ARM ADIv5 Debug Access Port support.
//!
//! The DAP is driven through a journal of posted register transactions: every
//! DP/AP access is shifted out eagerly, but acknowledgements and posted read
//! values are only interpreted at a batch boundary, where the sticky overrun
//! and error flags in CTRL/STAT decide whether the batch is accepted, replayed
//! or failed. See [`JtagDp`] for the engine and [`JtagIo`] for the scan chain
//! service it runs on.

pub mod dp;
mod interface;
mod jtag_dp;

use std::fmt::Debug;

pub use interface::AccessPort;
pub use jtag_dp::{DapSettings, DapStatistics, JtagDp, JtagIo};

/// A single DP or AP register, with its address within the port.
///
/// Only address bits [3:2] are shifted on the wire; for AP registers the
/// remaining high bits select the register bank via the DP SELECT register.
pub trait Register: Clone + From<u32> + Into<u32> + Sized + Debug {
    const ADDRESS: u8;
    const NAME: &'static str;
}

/// The address space a transaction targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    DebugPort,
    AccessPort,
}

/// Failure of the underlying scan chain transport.
///
/// The scan chain itself (TAP state machine, adapter plumbing) is an external
/// service; anything it reports is fatal for the current operation and is
/// never retried by the DAP engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    #[error("scan chain transport failed: {0}")]
    Transport(String),
    #[error("scan chain is disconnected")]
    Disconnected,
}

/// Errors surfaced by the DAP transaction engine.
#[derive(Debug, thiserror::Error)]
pub enum DapError {
    /// The scan chain hardware itself failed.
    #[error("scan chain access failed")]
    Scan(#[from] ScanError),

    /// The target answered with an acknowledge pattern that is neither
    /// OK/FAULT nor WAIT. This is a protocol-level interface error.
    #[error("target did not send a valid acknowledge (ack = {ack:#05b})")]
    NoAcknowledge { ack: u8 },

    /// CTRL/STAT reported a sticky error. The batch that triggered it has an
    /// unknown outcome and is not replayed; the sticky bit has already been
    /// cleared when this is returned.
    #[error("sticky error set in CTRL/STAT ({ctrl_stat:#010x})")]
    StickyFault { ctrl_stat: u32 },

    /// The debug power domain bits in CTRL/STAT are no longer all set,
    /// usually because the target reset unexpectedly.
    #[error("debug power domain lost (CTRL/STAT = {ctrl_stat:#010x})")]
    DebugPowerLoss { ctrl_stat: u32 },

    /// A bounded WAIT-retry loop or the power-up handshake ran out of budget.
    #[error("timeout while waiting for the debug port")]
    Timeout,
}
