//! Symbolic AP/DP register access on top of the transaction engine.
//!
//! This layer hides the posted-read plumbing and the SELECT bookkeeping:
//! callers name a register, the façade decides whether a SELECT write has to
//! be interleaved and when the batch has to be forced out.

use std::time::Instant;

use crate::dap::dp::{Abort, Ctrl, Select, DPIDR};
use crate::dap::jtag_dp::{payload_write, JtagIo, TransferDirection, JTAG_ABORT_IR};
use crate::dap::{DapError, JtagDp, PortType, Register};

/// One numbered address-space window within a DAP.
///
/// The AP number and register bank end up in the DP SELECT register; the
/// `memaccess_tck` idle cycles give the memory bus time to settle after
/// memory-class accesses and are a fixed per-AP configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessPort {
    port: u8,
    memaccess_tck: u32,
}

impl AccessPort {
    pub fn new(port: u8) -> Self {
        Self {
            port,
            memaccess_tck: 0,
        }
    }

    pub fn with_memaccess_tck(port: u8, memaccess_tck: u32) -> Self {
        Self {
            port,
            memaccess_tck,
        }
    }

    pub fn port_number(&self) -> u8 {
        self.port
    }
}

/// DRW and the banked data registers drive the memory bus and get the AP's
/// extra idle cycles appended.
fn is_memory_access(address: u8) -> bool {
    matches!(address, 0x0C | 0x10 | 0x14 | 0x18 | 0x1C)
}

impl<P: JtagIo> JtagDp<P> {
    /// Read a DP register. Forces the pending batch out: the read is posted,
    /// so an RDBUFF drain and the CTRL/STAT endcheck happen before the value
    /// is returned.
    pub fn dp_read(&mut self, address: u8) -> Result<u32, DapError> {
        self.queue_dp_read(address)?;
        let batch = self.run_batch()?;
        Ok(batch[batch.len() - 1].value)
    }

    /// Write a DP register. Writes pipeline; the batch keeps accumulating.
    pub fn dp_write(&mut self, address: u8, value: u32) -> Result<(), DapError> {
        self.queue_dp_write(address, value)
    }

    /// Typed variant of [`Self::dp_read`].
    pub fn dp_read_register<R: Register>(&mut self) -> Result<R, DapError> {
        tracing::trace!("reading DP register {}", R::NAME);
        Ok(R::from(self.dp_read(R::ADDRESS)?))
    }

    /// Typed variant of [`Self::dp_write`].
    pub fn dp_write_register<R: Register>(&mut self, register: R) -> Result<(), DapError> {
        tracing::trace!("writing DP register {}", R::NAME);
        self.dp_write(R::ADDRESS, register.into())
    }

    /// Make sure SELECT addresses `ap` and the bank of `address`, enqueueing
    /// a SELECT write only when the cached value differs.
    ///
    /// The cache is also a correctness requirement: every AP access must be
    /// preceded by a matching SELECT state, and the cache is dropped on every
    /// path that may have changed SELECT behind our back.
    fn select_ap_bank(&mut self, ap: &AccessPort, address: u8) -> Result<(), DapError> {
        let mut select = Select(0);
        select.set_ap_sel(ap.port);
        select.set_ap_bank_sel(address >> 4);
        let value = u32::from(select);

        if self.select != Some(value) {
            tracing::debug!(
                "changing SELECT to AP {}, bank {}",
                ap.port,
                address >> 4
            );
            self.queue_dp_write(Select::ADDRESS, value)?;
        }

        Ok(())
    }

    /// Read an AP register. Forces the batch out, like [`Self::dp_read`].
    pub fn ap_read(&mut self, ap: &AccessPort, address: u8) -> Result<u32, DapError> {
        self.select_ap_bank(ap, address)?;
        let idle = if is_memory_access(address) {
            ap.memaccess_tck
        } else {
            0
        };
        self.queue_ap_read(address & 0x0F, idle)?;
        let batch = self.run_batch()?;
        Ok(batch[batch.len() - 1].value)
    }

    /// Write an AP register. Pipelines.
    pub fn ap_write(&mut self, ap: &AccessPort, address: u8, value: u32) -> Result<(), DapError> {
        self.select_ap_bank(ap, address)?;
        let idle = if is_memory_access(address) {
            ap.memaccess_tck
        } else {
            0
        };
        self.queue_ap_write(address & 0x0F, value, idle)
    }

    /// Pipelined block read from one AP register (typically DRW with an
    /// auto-incrementing TAR): all reads are shifted back to back and each
    /// scan captures the previous posted value.
    pub fn ap_read_block(
        &mut self,
        ap: &AccessPort,
        address: u8,
        values: &mut [u32],
    ) -> Result<(), DapError> {
        if values.is_empty() {
            return Ok(());
        }

        self.select_ap_bank(ap, address)?;
        let idle = if is_memory_access(address) {
            ap.memaccess_tck
        } else {
            0
        };
        for _ in 0..values.len() {
            self.queue_ap_read(address & 0x0F, idle)?;
        }

        let batch = self.run_batch()?;
        let reads = &batch[batch.len() - values.len()..];
        for (slot, cmd) in values.iter_mut().zip(reads) {
            *slot = cmd.value;
        }
        Ok(())
    }

    /// Pipelined block write to one AP register.
    pub fn ap_write_block(
        &mut self,
        ap: &AccessPort,
        address: u8,
        values: &[u32],
    ) -> Result<(), DapError> {
        self.select_ap_bank(ap, address)?;
        let idle = if is_memory_access(address) {
            ap.memaccess_tck
        } else {
            0
        };
        for value in values {
            self.queue_ap_write(address & 0x0F, *value, idle)?;
        }
        Ok(())
    }

    /// Write the ABORT register, abandoning the current AP transaction and
    /// any queued batch.
    ///
    /// This is the only way the ABORT register is written: a DP write with
    /// register address 0 and value 1 (DAPABORT) under the dedicated
    /// instruction. It produces no acknowledge, and it is for higher layers'
    /// unrecoverable-error paths, not part of the overrun recovery.
    pub fn abort(&mut self) -> Result<(), DapError> {
        tracing::debug!("writing ABORT, dropping {} queued commands", self.journal.len());
        self.poison();
        let mut abort = Abort(0);
        abort.set_dapabort(true);
        self.scan(JTAG_ABORT_IR, payload_write(Abort::ADDRESS, abort.into()), 0)?;
        Ok(())
    }

    /// Attach-time handshake: identify the DP, request debug power, arm
    /// overrun detection and clear stale sticky flags.
    ///
    /// Runs on raw confirmed transactions rather than the journal, because
    /// the endcheck's power-domain test cannot pass until the handshake has
    /// completed. Expects no batch to be pending.
    pub fn connect(&mut self) -> Result<DPIDR, DapError> {
        let dpidr = DPIDR(self.execute_single(
            PortType::DebugPort,
            TransferDirection::Read,
            DPIDR::ADDRESS,
            0,
            0,
        )?);
        tracing::debug!(
            "DPIDR {:#010x}: DPv{}, designer {:#05x}, part {:#04x}",
            u32::from(dpidr.clone()),
            dpidr.version(),
            dpidr.designer(),
            dpidr.part_no(),
        );

        // Request debug power. ORUNDETECT is set here as well; without it the
        // sticky overrun machinery never triggers and pipelining would be
        // unsafe.
        let mut ctrl = Ctrl(0);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_orun_detect(true);
        self.execute_single(
            PortType::DebugPort,
            TransferDirection::Write,
            Ctrl::ADDRESS,
            ctrl.into(),
            0,
        )?;

        let start = Instant::now();
        loop {
            let ctrl = Ctrl(self.execute_single(
                PortType::DebugPort,
                TransferDirection::Read,
                Ctrl::ADDRESS,
                0,
                0,
            )?);
            if ctrl.csyspwrupack() && ctrl.cdbgpwrupack() {
                break;
            }
            if start.elapsed() >= self.settings.power_up_timeout {
                tracing::error!("debug power-up request was not acknowledged");
                return Err(DapError::Timeout);
            }
        }

        // Clear sticky conditions left over from before the handshake.
        let ctrl_stat = self.execute_single(
            PortType::DebugPort,
            TransferDirection::Read,
            Ctrl::ADDRESS,
            0,
            0,
        )?;
        let ctrl = Ctrl(ctrl_stat);
        if ctrl.sticky_err() || ctrl.sticky_orun() || ctrl.sticky_cmp() {
            tracing::debug!("clearing stale sticky flags ({:#010x})", ctrl_stat);
            self.execute_single(
                PortType::DebugPort,
                TransferDirection::Write,
                Ctrl::ADDRESS,
                ctrl_stat,
                0,
            )?;
        }

        self.select = None;
        Ok(dpidr)
    }
}
