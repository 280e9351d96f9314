//! The per-bank lifecycle state machine.

use super::driver::{FlashDriver, ProtectState};
use super::{FlashError, TargetState};

/// Tri-state erased bookkeeping for one sector.
///
/// `Unknown` means nothing is known about the contents (fresh probe, or the
/// sector was never touched); only an erase or an erase-check moves a sector
/// to `Erased`, and any write moves it to `NotErased`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErasedState {
    Unknown,
    Erased,
    NotErased,
}

/// One erase-granularity unit within a bank.
#[derive(Debug, Clone)]
pub struct Sector {
    pub offset: u32,
    pub size: u32,
    pub erased: ErasedState,
    pub protected: ProtectState,
}

impl Sector {
    fn overlaps(&self, offset: u32, length: u32) -> bool {
        self.offset < offset + length && offset < self.offset + self.size
    }
}

/// One erasable/programmable memory region on a target, wrapping a
/// chip-specific [`FlashDriver`].
///
/// A bank starts unprobed; [`FlashBank::auto_probe`] gates every mutating
/// operation, so geometry is always established before anything destructive
/// happens. The target-halted precondition is checked before the probe gate,
/// so a mutating call on a running core performs no hardware access at all.
#[derive(Debug)]
pub struct FlashBank<D: FlashDriver> {
    driver: D,
    base: u32,
    size: u32,
    sectors: Vec<Sector>,
    probed: bool,
}

impl<D: FlashDriver> FlashBank<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            base: 0,
            size: 0,
            sectors: Vec::new(),
            probed: false,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    pub fn is_probed(&self) -> bool {
        self.probed
    }

    /// Release the wrapped driver.
    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Query the hardware for device identity and geometry, rebuilding the
    /// sector table. A failed lookup leaves the bank unprobed.
    pub fn probe(&mut self) -> Result<(), FlashError> {
        self.probed = false;

        let geometry = self.driver.probe()?;
        assert_eq!(
            geometry.sector_size as u64 * geometry.num_sectors as u64,
            geometry.size as u64,
            "driver reported inconsistent flash geometry"
        );

        self.base = geometry.base;
        self.size = geometry.size;
        self.sectors = (0..geometry.num_sectors)
            .map(|i| Sector {
                offset: i as u32 * geometry.sector_size,
                size: geometry.sector_size,
                erased: ErasedState::Unknown,
                protected: ProtectState::Unknown,
            })
            .collect();
        self.probed = true;

        tracing::debug!(
            "probed flash bank at {:#010x}: {} sectors of {:#x} bytes",
            self.base,
            self.sectors.len(),
            geometry.sector_size
        );
        Ok(())
    }

    /// No-op when already probed, otherwise delegates to [`Self::probe`].
    pub fn auto_probe(&mut self) -> Result<(), FlashError> {
        if self.probed {
            return Ok(());
        }
        self.probe()
    }

    fn check_halted(target: TargetState) -> Result<(), FlashError> {
        if target != TargetState::Halted {
            return Err(FlashError::TargetNotHalted);
        }
        Ok(())
    }

    fn check_sector_range(&self, first: usize, last: usize) -> Result<(), FlashError> {
        if first > last || last >= self.sectors.len() {
            return Err(FlashError::InvalidSectorRange {
                first,
                last,
                num_sectors: self.sectors.len(),
            });
        }
        Ok(())
    }

    fn check_unprotected(&self, indices: impl Iterator<Item = usize>) -> Result<(), FlashError> {
        for index in indices {
            let sector = &self.sectors[index];
            if sector.protected == ProtectState::Protected {
                return Err(FlashError::ProtectedSector {
                    index,
                    offset: sector.offset,
                });
            }
        }
        Ok(())
    }

    /// Indices of the sectors overlapping `offset..offset + length`.
    fn touched_sectors(&self, offset: u32, length: u32) -> Vec<usize> {
        self.sectors
            .iter()
            .enumerate()
            .filter(|(_, s)| s.overlaps(offset, length))
            .map(|(i, _)| i)
            .collect()
    }

    /// Erase the inclusive sector range `first..=last`.
    ///
    /// A full-bank range tries the controller's mass-erase command first when
    /// one exists, falling back to sector-by-sector erase on any failure.
    /// A mid-range failure returns immediately; sectors erased before it
    /// stay marked erased.
    pub fn erase(
        &mut self,
        target: TargetState,
        first: usize,
        last: usize,
    ) -> Result<(), FlashError> {
        Self::check_halted(target)?;
        self.auto_probe()?;
        self.check_sector_range(first, last)?;
        self.check_unprotected(first..=last)?;

        if first == 0 && last == self.sectors.len() - 1 && self.driver.supports_mass_erase() {
            match self.driver.mass_erase() {
                Ok(()) => {
                    for sector in &mut self.sectors {
                        sector.erased = ErasedState::Erased;
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("mass erase failed ({e}), erasing sector by sector");
                }
            }
        }

        for index in first..=last {
            self.driver.erase_sector(index)?;
            self.sectors[index].erased = ErasedState::Erased;
        }
        Ok(())
    }

    /// Program `data` starting at `offset`.
    ///
    /// Data reaching past the end of the bank is truncated with a warning
    /// rather than rejected. Every touched sector loses its erased mark, even
    /// when a page was skipped for holding only the erased pattern.
    pub fn write(
        &mut self,
        target: TargetState,
        data: &[u8],
        offset: u32,
    ) -> Result<(), FlashError> {
        Self::check_halted(target)?;
        self.auto_probe()?;

        if offset > self.size {
            return Err(FlashError::OffsetOutOfBounds {
                offset,
                size: self.size,
            });
        }
        let available = (self.size - offset) as usize;
        let data = if data.len() > available {
            tracing::warn!(
                "write of {} bytes at {:#010x} reaches past the bank end, truncating to {} bytes",
                data.len(),
                offset,
                available
            );
            &data[..available]
        } else {
            data
        };
        if data.is_empty() {
            return Ok(());
        }

        let touched = self.touched_sectors(offset, data.len() as u32);
        self.check_unprotected(touched.iter().copied())?;

        let page_size = self.driver.page_size();
        let mut pos = offset;
        let mut remaining = data;
        while !remaining.is_empty() {
            let chunk_len = (page_size - pos % page_size).min(remaining.len() as u32) as usize;
            let (chunk, rest) = remaining.split_at(chunk_len);
            if chunk.iter().all(|&b| b == 0xFF) {
                // Already the erased pattern; programming it would be a
                // no-op on NOR flash.
                tracing::trace!("skipping erased-pattern page at {:#010x}", pos);
            } else {
                self.driver.program_page(pos, chunk)?;
            }
            pos += chunk_len as u32;
            remaining = rest;
        }

        for index in touched {
            self.sectors[index].erased = ErasedState::NotErased;
        }
        Ok(())
    }

    /// Read back flash contents.
    pub fn read(&mut self, offset: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        self.auto_probe()?;
        if offset as u64 + buffer.len() as u64 > self.size as u64 {
            return Err(FlashError::OffsetOutOfBounds {
                offset,
                size: self.size,
            });
        }
        self.driver.read(offset, buffer)
    }

    /// Change the protection of the inclusive sector range `first..=last`.
    pub fn protect(
        &mut self,
        target: TargetState,
        set: bool,
        first: usize,
        last: usize,
    ) -> Result<(), FlashError> {
        Self::check_halted(target)?;
        self.auto_probe()?;
        self.check_sector_range(first, last)?;

        self.driver.protect_sectors(set, first, last)?;
        let state = if set {
            ProtectState::Protected
        } else {
            ProtectState::Unprotected
        };
        for sector in &mut self.sectors[first..=last] {
            sector.protected = state;
        }
        Ok(())
    }

    /// Re-read hardware protection state into the sector table. Safe to call
    /// at any time, used to resynchronize after an external reset.
    pub fn protect_check(&mut self) -> Result<(), FlashError> {
        self.auto_probe()?;
        let states = self.driver.protect_check()?;
        for (sector, state) in self.sectors.iter_mut().zip(states) {
            sector.protected = state;
        }
        Ok(())
    }

    /// Read back every sector and refresh the tri-state erased flags from
    /// actual contents.
    pub fn erase_check(&mut self) -> Result<(), FlashError> {
        self.auto_probe()?;
        for index in 0..self.sectors.len() {
            let (offset, size) = {
                let sector = &self.sectors[index];
                (sector.offset, sector.size)
            };
            let mut contents = vec![0; size as usize];
            self.driver.read(offset, &mut contents)?;
            self.sectors[index].erased = if contents.iter().all(|&b| b == 0xFF) {
                ErasedState::Erased
            } else {
                ErasedState::NotErased
            };
        }
        Ok(())
    }

    /// Human-readable geometry and state summary.
    pub fn info(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        if !self.probed {
            out.push_str("flash bank (not probed)");
            return out;
        }

        let _ = writeln!(
            out,
            "flash bank at {:#010x}, size {:#x}, {} sectors",
            self.base,
            self.size,
            self.sectors.len()
        );
        for (i, sector) in self.sectors.iter().enumerate() {
            let erased = match sector.erased {
                ErasedState::Unknown => "unknown",
                ErasedState::Erased => "erased",
                ErasedState::NotErased => "not erased",
            };
            let protected = match sector.protected {
                ProtectState::Unknown => "unknown",
                ProtectState::Protected => "protected",
                ProtectState::Unprotected => "unprotected",
            };
            let _ = writeln!(
                out,
                "  sector {i}: offset {:#010x}, size {:#x}, {erased}, {protected}",
                sector.offset, sector.size
            );
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::{ErasedState, FlashBank};
    use crate::flash::driver::{FlashDriver, FlashGeometry, ProtectState};
    use crate::flash::{FlashError, TargetState};

    struct MockFlashDriver {
        geometry: FlashGeometry,
        memory: Vec<u8>,
        protect: Vec<ProtectState>,
        probe_calls: usize,
        erased_sectors: Vec<usize>,
        programmed_pages: Vec<(u32, usize)>,
        mass_erases: usize,
        mass_erase_supported: bool,
        fail_mass_erase: bool,
        fail_erase_at: Option<usize>,
        unrecognized: bool,
    }

    impl MockFlashDriver {
        /// The 4 x 0x1000 bank used throughout.
        fn new() -> Self {
            let geometry = FlashGeometry {
                base: 0,
                size: 0x4000,
                sector_size: 0x1000,
                num_sectors: 4,
            };
            Self {
                geometry,
                memory: vec![0xFF; 0x4000],
                protect: vec![ProtectState::Unprotected; 4],
                probe_calls: 0,
                erased_sectors: Vec::new(),
                programmed_pages: Vec::new(),
                mass_erases: 0,
                mass_erase_supported: false,
                fail_mass_erase: false,
                fail_erase_at: None,
                unrecognized: false,
            }
        }
    }

    impl FlashDriver for MockFlashDriver {
        fn probe(&mut self) -> Result<FlashGeometry, FlashError> {
            self.probe_calls += 1;
            if self.unrecognized {
                return Err(FlashError::DeviceUnrecognized { id: 0xDEAD_BEEF });
            }
            Ok(self.geometry)
        }

        fn erase_sector(&mut self, index: usize) -> Result<(), FlashError> {
            if self.fail_erase_at == Some(index) {
                return Err(FlashError::EraseFailed { index, status: 0xA5 });
            }
            self.erased_sectors.push(index);
            let start = index * self.geometry.sector_size as usize;
            let end = start + self.geometry.sector_size as usize;
            self.memory[start..end].fill(0xFF);
            Ok(())
        }

        fn supports_mass_erase(&self) -> bool {
            self.mass_erase_supported
        }

        fn mass_erase(&mut self) -> Result<(), FlashError> {
            self.mass_erases += 1;
            if self.fail_mass_erase {
                return Err(FlashError::EraseFailed {
                    index: 0,
                    status: 0xEE,
                });
            }
            self.memory.fill(0xFF);
            Ok(())
        }

        fn page_size(&self) -> u32 {
            0x400
        }

        fn program_page(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
            self.programmed_pages.push((offset, data.len()));
            let start = offset as usize;
            self.memory[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn read(&mut self, offset: u32, data: &mut [u8]) -> Result<(), FlashError> {
            let start = offset as usize;
            data.copy_from_slice(&self.memory[start..start + data.len()]);
            Ok(())
        }

        fn protect_sectors(
            &mut self,
            set: bool,
            first: usize,
            last: usize,
        ) -> Result<(), FlashError> {
            let state = if set {
                ProtectState::Protected
            } else {
                ProtectState::Unprotected
            };
            for slot in &mut self.protect[first..=last] {
                *slot = state;
            }
            Ok(())
        }

        fn protect_check(&mut self) -> Result<Vec<ProtectState>, FlashError> {
            Ok(self.protect.clone())
        }
    }

    fn erased_states<D: FlashDriver>(bank: &FlashBank<D>) -> Vec<ErasedState> {
        bank.sectors().iter().map(|s| s.erased).collect()
    }

    #[test]
    fn probe_builds_the_sector_table() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();

        assert!(bank.is_probed());
        assert_eq!(bank.size(), 0x4000);
        assert_eq!(bank.sectors().len(), 4);
        for (i, sector) in bank.sectors().iter().enumerate() {
            assert_eq!(sector.offset, i as u32 * 0x1000);
            assert_eq!(sector.size, 0x1000);
            assert_eq!(sector.erased, ErasedState::Unknown);
        }
    }

    #[test]
    fn auto_probe_after_probe_touches_no_hardware() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();
        bank.auto_probe().unwrap();

        assert_eq!(bank.into_driver().probe_calls, 1);
    }

    #[test]
    fn failed_probe_leaves_the_bank_unprobed() {
        let mut driver = MockFlashDriver::new();
        driver.unrecognized = true;

        let mut bank = FlashBank::new(driver);
        let err = bank.probe().unwrap_err();
        assert!(matches!(err, FlashError::DeviceUnrecognized { .. }));
        assert!(!bank.is_probed());
    }

    #[test]
    fn erase_then_write_tracks_sector_state() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();

        bank.erase(TargetState::Halted, 1, 2).unwrap();
        assert_eq!(
            erased_states(&bank),
            [
                ErasedState::Unknown,
                ErasedState::Erased,
                ErasedState::Erased,
                ErasedState::Unknown,
            ]
        );

        // Writing into sector 1 only clears its erased mark and nothing else.
        let data = vec![0xAB; 0x800];
        bank.write(TargetState::Halted, &data, 0x1000).unwrap();
        assert_eq!(
            erased_states(&bank),
            [
                ErasedState::Unknown,
                ErasedState::NotErased,
                ErasedState::Erased,
                ErasedState::Unknown,
            ]
        );
    }

    #[test]
    fn mutating_operations_require_a_halted_target() {
        let mut bank = FlashBank::new(MockFlashDriver::new());

        let err = bank.erase(TargetState::Running, 0, 3).unwrap_err();
        assert!(matches!(err, FlashError::TargetNotHalted));
        let err = bank.write(TargetState::Running, &[0u8; 4], 0).unwrap_err();
        assert!(matches!(err, FlashError::TargetNotHalted));
        let err = bank.protect(TargetState::Running, true, 0, 0).unwrap_err();
        assert!(matches!(err, FlashError::TargetNotHalted));

        // The precondition is checked before the probe gate: no hardware
        // access happened at all.
        let driver = bank.into_driver();
        assert_eq!(driver.probe_calls, 0);
        assert!(driver.erased_sectors.is_empty());
        assert!(driver.programmed_pages.is_empty());
    }

    #[test]
    fn erase_rejects_protected_sectors_before_touching_hardware() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();
        bank.protect(TargetState::Halted, true, 2, 2).unwrap();

        let err = bank.erase(TargetState::Halted, 1, 3).unwrap_err();
        assert!(matches!(err, FlashError::ProtectedSector { index: 2, .. }));
        assert!(bank.into_driver().erased_sectors.is_empty());
    }

    #[test]
    fn erase_rejects_bad_ranges() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();

        let err = bank.erase(TargetState::Halted, 0, 4).unwrap_err();
        assert!(matches!(err, FlashError::InvalidSectorRange { .. }));
        let err = bank.erase(TargetState::Halted, 3, 1).unwrap_err();
        assert!(matches!(err, FlashError::InvalidSectorRange { .. }));
    }

    #[test]
    fn erase_failure_keeps_partial_progress() {
        let mut driver = MockFlashDriver::new();
        driver.fail_erase_at = Some(2);

        let mut bank = FlashBank::new(driver);
        bank.probe().unwrap();
        let err = bank.erase(TargetState::Halted, 0, 3).unwrap_err();
        assert!(matches!(err, FlashError::EraseFailed { index: 2, .. }));

        // Sectors erased before the failure stay committed.
        assert_eq!(
            erased_states(&bank),
            [
                ErasedState::Erased,
                ErasedState::Erased,
                ErasedState::Unknown,
                ErasedState::Unknown,
            ]
        );
    }

    #[test]
    fn full_range_erase_takes_the_mass_erase_shortcut() {
        let mut driver = MockFlashDriver::new();
        driver.mass_erase_supported = true;

        let mut bank = FlashBank::new(driver);
        bank.probe().unwrap();
        bank.erase(TargetState::Halted, 0, 3).unwrap();

        assert_eq!(erased_states(&bank), [ErasedState::Erased; 4]);
        let driver = bank.into_driver();
        assert_eq!(driver.mass_erases, 1);
        assert!(driver.erased_sectors.is_empty());
    }

    #[test]
    fn partial_range_erase_never_uses_mass_erase() {
        let mut driver = MockFlashDriver::new();
        driver.mass_erase_supported = true;

        let mut bank = FlashBank::new(driver);
        bank.probe().unwrap();
        bank.erase(TargetState::Halted, 0, 2).unwrap();

        let driver = bank.into_driver();
        assert_eq!(driver.mass_erases, 0);
        assert_eq!(driver.erased_sectors, [0, 1, 2]);
    }

    #[test]
    fn mass_erase_failure_falls_back_to_sectors() {
        let mut driver = MockFlashDriver::new();
        driver.mass_erase_supported = true;
        driver.fail_mass_erase = true;

        let mut bank = FlashBank::new(driver);
        bank.probe().unwrap();
        bank.erase(TargetState::Halted, 0, 3).unwrap();

        assert_eq!(erased_states(&bank), [ErasedState::Erased; 4]);
        assert_eq!(bank.into_driver().erased_sectors, [0, 1, 2, 3]);
    }

    #[test]
    fn write_chunks_to_page_boundaries() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();

        // 0x800 bytes starting at 0x100: a partial page up to the 0x400
        // boundary, one full page, and a trailing partial page.
        let data = vec![0x5A; 0x800];
        bank.write(TargetState::Halted, &data, 0x100).unwrap();

        assert_eq!(
            bank.into_driver().programmed_pages,
            [(0x100, 0x300), (0x400, 0x400), (0x800, 0x100)]
        );
    }

    #[test]
    fn write_truncates_past_the_bank_end() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();

        let data = vec![0x11; 0x1000];
        bank.write(TargetState::Halted, &data, 0x3800).unwrap();

        assert_eq!(bank.sectors()[3].erased, ErasedState::NotErased);
        let written: usize = bank
            .into_driver()
            .programmed_pages
            .iter()
            .map(|(_, len)| len)
            .sum();
        assert_eq!(written, 0x800);
    }

    #[test]
    fn write_rejects_out_of_bank_offsets() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();

        let err = bank
            .write(TargetState::Halted, &[0u8; 4], 0x5000)
            .unwrap_err();
        assert!(matches!(err, FlashError::OffsetOutOfBounds { .. }));
    }

    #[test]
    fn write_rejects_protected_sectors() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();
        bank.protect(TargetState::Halted, true, 1, 1).unwrap();

        let err = bank
            .write(TargetState::Halted, &[0u8; 0x100], 0x1080)
            .unwrap_err();
        assert!(matches!(err, FlashError::ProtectedSector { index: 1, .. }));
        assert!(bank.into_driver().programmed_pages.is_empty());
    }

    #[test]
    fn erased_pattern_pages_are_skipped_but_still_clear_the_mark() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();
        bank.erase(TargetState::Halted, 0, 0).unwrap();

        let data = vec![0xFF; 0x400];
        bank.write(TargetState::Halted, &data, 0).unwrap();

        // No page was programmed, but the sector is no longer provably
        // erased.
        assert_eq!(bank.sectors()[0].erased, ErasedState::NotErased);
        assert!(bank.into_driver().programmed_pages.is_empty());
    }

    #[test]
    fn protect_check_resynchronizes_from_hardware() {
        let mut driver = MockFlashDriver::new();
        driver.protect[0] = ProtectState::Protected;
        driver.protect[3] = ProtectState::Protected;

        let mut bank = FlashBank::new(driver);
        bank.probe().unwrap();
        bank.protect_check().unwrap();

        let states: Vec<_> = bank.sectors().iter().map(|s| s.protected).collect();
        assert_eq!(
            states,
            [
                ProtectState::Protected,
                ProtectState::Unprotected,
                ProtectState::Unprotected,
                ProtectState::Protected,
            ]
        );
    }

    #[test]
    fn erase_check_refreshes_from_contents() {
        let mut driver = MockFlashDriver::new();
        driver.memory[0x2004] = 0x00;

        let mut bank = FlashBank::new(driver);
        bank.probe().unwrap();
        bank.erase_check().unwrap();

        assert_eq!(
            erased_states(&bank),
            [
                ErasedState::Erased,
                ErasedState::Erased,
                ErasedState::NotErased,
                ErasedState::Erased,
            ]
        );
    }

    #[test]
    fn read_round_trips_written_data() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        bank.probe().unwrap();

        let data: Vec<u8> = (0..0x100).map(|i| i as u8).collect();
        bank.write(TargetState::Halted, &data, 0x2000).unwrap();

        let mut readback = vec![0; 0x100];
        bank.read(0x2000, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn info_summarizes_geometry() {
        let mut bank = FlashBank::new(MockFlashDriver::new());
        assert!(bank.info().contains("not probed"));

        bank.probe().unwrap();
        let info = bank.info();
        assert!(info.contains("4 sectors"));
        assert!(info.contains("sector 3"));
    }
}
