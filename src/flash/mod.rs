//! Generic flash bank lifecycle.
//!
//! A [`FlashBank`] wraps one chip-specific [`FlashDriver`] and enforces the
//! contract every driver shares: probe before mutation, target halted for
//! anything destructive, tri-state erased bookkeeping per sector, and the
//! mass-erase fast path with sector-by-sector fallback.

mod bank;
mod driver;

use std::time::Duration;

pub use bank::{ErasedState, FlashBank, Sector};
pub use driver::{poll_until, FlashDriver, FlashGeometry, ProtectState};

/// Execution state of the core that owns a flash bank, as reported by the
/// debug stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Halted,
    Running,
}

/// Describes any error that happened during a flash bank operation.
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    /// Mutating operations require a halted core; this is a precondition
    /// violation, never retried internally.
    #[error("the target must be halted for flash operations")]
    TargetNotHalted,

    /// The device identification read at probe time matched no known part.
    /// The bank stays unusable until a later probe succeeds.
    #[error("flash device was not recognized (id = {id:#010x})")]
    DeviceUnrecognized { id: u32 },

    #[error("sector range {first}..={last} is invalid for a bank with {num_sectors} sectors")]
    InvalidSectorRange {
        first: usize,
        last: usize,
        num_sectors: usize,
    },

    #[error("sector {index} at offset {offset:#010x} is protected")]
    ProtectedSector { index: usize, offset: u32 },

    #[error("offset {offset:#010x} lies outside the bank (size {size:#010x})")]
    OffsetOutOfBounds { offset: u32, size: u32 },

    /// The driver does not implement the requested routine.
    #[error("the '{0}' routine is not supported by this flash driver")]
    RoutineNotSupported(&'static str),

    #[error("erasing sector {index} failed with controller status {status:#x}")]
    EraseFailed { index: usize, status: u32 },

    #[error("programming the page at {address:#010x} failed with controller status {status:#x}")]
    PageWrite { address: u32, status: u32 },

    /// A busy-bit poll loop exceeded its deadline. Progress committed before
    /// the timeout (sectors already erased, pages already written) remains.
    #[error("timed out after {0:?} waiting for the flash controller")]
    Timeout(Duration),

    /// On-target scratch memory could not be allocated at the needed size.
    /// Drivers may degrade to a slower path instead of surfacing this.
    #[error("could not allocate {requested} bytes of working memory")]
    ResourceUnavailable { requested: usize },
}
