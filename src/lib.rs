//! # dapstack
//!
//! An ARM ADIv5 Debug Access Port transaction engine over JTAG, plus a
//! generic flash bank lifecycle.
//!
//! The [`dap`] module drives DP and AP registers through a journal of posted
//! transactions: accesses are shifted eagerly for throughput, acknowledges
//! are interpreted at batch boundaries, and a sticky overrun is recovered by
//! replaying the whole batch. The scan chain itself is supplied by the caller
//! through the [`dap::JtagIo`] trait.
//!
//! The [`flash`] module wraps chip-specific [`flash::FlashDriver`]
//! implementations in the probe/erase/write/protect lifecycle they all
//! share, with per-sector tri-state erased bookkeeping.
//!
//! The two subsystems are independent; a memory-mapped flash controller
//! driver would typically implement its register accesses on top of the DAP
//! engine's AP reads and writes.

pub mod dap;
pub mod flash;

pub use dap::{AccessPort, DapError, DapSettings, JtagDp, JtagIo};
pub use flash::{FlashBank, FlashDriver, FlashError, TargetState};
