//! The contract a chip-specific flash controller driver implements.

use std::thread;
use std::time::{Duration, Instant};

use super::FlashError;

/// Hardware protection state of one sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectState {
    /// Not read back from hardware yet.
    Unknown,
    Protected,
    Unprotected,
}

/// Geometry reported by a successful device-identification lookup.
///
/// `num_sectors * sector_size` must equal `size` exactly; the bank asserts
/// this at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    pub base: u32,
    pub size: u32,
    pub sector_size: u32,
    pub num_sectors: usize,
}

/// One chip family's flash controller protocol.
///
/// Drivers own the register sequences and the busy-bit polling (through
/// [`poll_until`]); the surrounding [`FlashBank`](super::FlashBank) owns the
/// lifecycle, preconditions and sector bookkeeping. Offsets are relative to
/// the bank base throughout.
pub trait FlashDriver {
    /// Identify the device and report its geometry. Called by the bank's
    /// probe; a failed lookup returns [`FlashError::DeviceUnrecognized`].
    fn probe(&mut self) -> Result<FlashGeometry, FlashError>;

    /// Erase one sector and wait for the controller to finish.
    fn erase_sector(&mut self, index: usize) -> Result<(), FlashError>;

    /// Whether the controller has a distinct whole-bank erase command.
    fn supports_mass_erase(&self) -> bool {
        false
    }

    /// Erase the whole bank in one command. Only called when
    /// [`Self::supports_mass_erase`] returns true.
    fn mass_erase(&mut self) -> Result<(), FlashError> {
        Err(FlashError::RoutineNotSupported("mass_erase"))
    }

    /// Programming granularity. The bank chunks write data to page
    /// boundaries before handing it down.
    fn page_size(&self) -> u32;

    /// Program one page-aligned chunk. `data` never crosses a page boundary.
    fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Read back flash contents.
    fn read(&mut self, offset: u32, data: &mut [u8]) -> Result<(), FlashError>;

    /// Change the hardware protection of a sector range. On some controllers
    /// this is itself an erase-and-rewrite of a lock-bits page.
    fn protect_sectors(&mut self, set: bool, first: usize, last: usize)
        -> Result<(), FlashError>;

    /// Read the hardware protection state of every sector.
    fn protect_check(&mut self) -> Result<Vec<ProtectState>, FlashError>;
}

/// Poll `condition` until it reports ready or `timeout` expires.
///
/// The cooperative sleep between polls keeps a long erase from busy-spinning;
/// expiry surfaces as [`FlashError::Timeout`] and never loops forever.
pub fn poll_until<F>(timeout: Duration, mut condition: F) -> Result<(), FlashError>
where
    F: FnMut() -> Result<bool, FlashError>,
{
    let start = Instant::now();
    loop {
        if condition()? {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            tracing::error!("flash controller stayed busy for {:?}", timeout);
            return Err(FlashError::Timeout(timeout));
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::poll_until;
    use crate::flash::FlashError;

    #[test]
    fn poll_until_returns_once_ready() {
        let mut polls = 0;
        poll_until(Duration::from_secs(1), || {
            polls += 1;
            Ok(polls == 3)
        })
        .unwrap();
        assert_eq!(polls, 3);
    }

    #[test]
    fn poll_until_times_out() {
        let result = poll_until(Duration::ZERO, || Ok(false));
        assert!(matches!(result, Err(FlashError::Timeout(_))));
    }

    #[test]
    fn poll_until_propagates_condition_errors() {
        let result: Result<(), FlashError> = poll_until(Duration::from_secs(1), || {
            Err(FlashError::EraseFailed {
                index: 0,
                status: 0xA5,
            })
        });
        assert!(matches!(result, Err(FlashError::EraseFailed { .. })));
    }
}
