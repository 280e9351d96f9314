//! The JTAG-DP transaction engine.
//!
//! ADIv5 JTAG-DP transactions are posted: shifting a request captures the
//! *previous* request's result and acknowledge, not its own. The engine
//! exploits this for pipelining by shifting every queued access eagerly and
//! interpreting acknowledges only at the batch boundary, where CTRL/STAT is
//! inspected. A sticky overrun there is recovered by replaying the whole
//! journal in order; a sticky error fails the batch.

use std::mem;
use std::time::Duration;

use crate::dap::dp::{Ctrl, RdBuff, Select};
use crate::dap::{DapError, PortType, Register, ScanError};

// IR values for the three DAP-related JTAG instructions.
pub(super) const JTAG_DPACC_IR: u32 = 0xA;
pub(super) const JTAG_APACC_IR: u32 = 0xB;
pub(super) const JTAG_ABORT_IR: u32 = 0x8;

// DR scans are always 35 bits: 32 data bits, 2 address bits, RnW.
pub(super) const JTAG_DR_BIT_LENGTH: u32 = 35;

/// WAIT acknowledge; the request was not accepted and must be retried.
pub(super) const JTAG_ACK_WAIT: u8 = 0b001;
/// OK/FAULT acknowledge. Whether it meant OK is decided by CTRL/STAT.
pub(super) const JTAG_ACK_OK_FAULT: u8 = 0b010;

/// Access to the scan chain service this engine runs on.
///
/// The TAP state machine, adapter and transport behind it are out of scope
/// here; all the engine needs is to shift a DR under a given IR and to clock
/// idle cycles.
pub trait JtagIo {
    /// Select `ir`, shift `bit_len` bits of `payload` through the data
    /// register and return the captured bits.
    fn scan_dr(&mut self, ir: u32, payload: u64, bit_len: u32) -> Result<u64, ScanError>;

    /// Stay in Run-Test/Idle for `cycles` clock cycles.
    fn run_idle(&mut self, cycles: u32) -> Result<(), ScanError>;
}

/// Tunables for the transaction engine.
#[derive(Debug, Clone)]
pub struct DapSettings {
    /// How often a transaction is retried when a WAIT acknowledge is
    /// received during replay or synchronous execution.
    pub num_retries_after_wait: usize,

    /// Budget for the power-up handshake in [`JtagDp::connect`].
    pub power_up_timeout: Duration,
}

impl Default for DapSettings {
    fn default() -> Self {
        Self {
            num_retries_after_wait: 1000,
            power_up_timeout: Duration::from_secs(1),
        }
    }
}

/// Counters kept by the engine. Purely diagnostic.
#[derive(Debug, Default, Clone, Copy)]
pub struct DapStatistics {
    /// Number of DR scans performed, including endcheck and replay scans.
    pub num_scans: usize,
    /// Number of finalized batches.
    pub num_batches: usize,
    /// Number of WAIT acknowledges observed.
    pub num_wait_acks: usize,
    /// Number of batch replays triggered by a sticky overrun.
    pub num_replays: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TransferDirection {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Ack {
    /// The scan that will carry this command's acknowledge has not happened.
    Pending,
    OkFault,
    Wait,
    Invalid(u8),
}

impl Ack {
    fn from_wire(bits: u8) -> Self {
        match bits {
            JTAG_ACK_OK_FAULT => Ack::OkFault,
            JTAG_ACK_WAIT => Ack::Wait,
            other => Ack::Invalid(other),
        }
    }
}

/// One journaled DP or AP register transaction.
///
/// The acknowledge is only meaningful once the next scan (or the trailing
/// RDBUFF read) has been shifted; a command whose acknowledge is WAIT has not
/// executed and must be replayed, never treated as complete.
#[derive(Debug, Clone)]
pub(super) struct DapCmd {
    pub(super) port: PortType,
    pub(super) direction: TransferDirection,
    /// Register address. Only bits [3:2] travel on the wire; for AP accesses
    /// the bank nibble has been folded into SELECT beforehand.
    pub(super) address: u8,
    pub(super) out_value: u32,
    /// Posted read result, filled in one scan later.
    pub(super) value: u32,
    pub(super) ack: Ack,
    /// Extra idle cycles after the data phase, for memory-class AP accesses.
    pub(super) idle_cycles_after: u32,
    /// SELECT value active when this command was issued. Replay restores it
    /// before re-executing, so a bank change mid-batch replays correctly.
    pub(super) select: u32,
}

impl DapCmd {
    fn read(port: PortType, address: u8) -> Self {
        Self {
            port,
            direction: TransferDirection::Read,
            address,
            out_value: 0,
            value: 0,
            ack: Ack::Pending,
            idle_cycles_after: 0,
            select: 0,
        }
    }

    fn write(port: PortType, address: u8, value: u32) -> Self {
        Self {
            port,
            direction: TransferDirection::Write,
            address,
            out_value: value,
            value: 0,
            ack: Ack::Pending,
            idle_cycles_after: 0,
            select: 0,
        }
    }
}

/// Build the 35-bit DR payload for a transaction.
///
/// Bits [34:3] carry the data word, bits [2:1] the register address bits
/// [3:2], bit [0] is RnW (read = 1). The data word is shifted for reads too;
/// the scan is symmetric and the outbound bits are don't-care.
pub(super) fn build_payload(direction: TransferDirection, address: u8, value: u32) -> u64 {
    let mut payload = (value as u64) << 3;
    payload |= ((address as u64) & 0b1100) >> 1;
    payload |= u64::from(direction == TransferDirection::Read);
    payload
}

pub(super) fn payload_read(address: u8) -> u64 {
    build_payload(TransferDirection::Read, address, 0)
}

pub(super) fn payload_write(address: u8, value: u32) -> u64 {
    build_payload(TransferDirection::Write, address, value)
}

fn ir_for_port(port: PortType) -> u32 {
    match port {
        PortType::DebugPort => JTAG_DPACC_IR,
        PortType::AccessPort => JTAG_APACC_IR,
    }
}

/// The ADIv5 JTAG-DP engine: pending-transaction journal, cached SELECT and
/// the overrun recovery protocol, layered over a [`JtagIo`] scan chain.
///
/// One value of this type owns all mutable DAP state for one physical target;
/// every access funnels through `&mut self`, which serializes the SELECT
/// cache and the journal by construction.
#[derive(Debug)]
pub struct JtagDp<P: JtagIo> {
    pub(super) probe: P,
    pub(super) journal: Vec<DapCmd>,
    /// Cached SELECT value, `None` when it must be re-established.
    pub(super) select: Option<u32>,
    pub(super) settings: DapSettings,
    pub(super) statistics: DapStatistics,
}

impl<P: JtagIo> JtagDp<P> {
    pub fn new(probe: P) -> Self {
        Self::with_settings(probe, DapSettings::default())
    }

    pub fn with_settings(probe: P, settings: DapSettings) -> Self {
        Self {
            probe,
            journal: Vec::new(),
            select: None,
            settings,
            statistics: DapStatistics::default(),
        }
    }

    pub fn statistics(&self) -> DapStatistics {
        self.statistics
    }

    /// Release the underlying scan chain access.
    pub fn into_probe(self) -> P {
        self.probe
    }

    /// Shift one 35-bit DR scan and split the capture into (value, ack).
    pub(super) fn scan(
        &mut self,
        ir: u32,
        payload: u64,
        idle_cycles: u32,
    ) -> Result<(u32, u8), DapError> {
        let received = self.probe.scan_dr(ir, payload, JTAG_DR_BIT_LENGTH)?;
        if idle_cycles > 0 {
            self.probe.run_idle(idle_cycles)?;
        }
        self.statistics.num_scans += 1;
        Ok(((received >> 3) as u32, (received & 0b111) as u8))
    }

    /// Append a command to the journal and shift it out immediately.
    ///
    /// The capture of this scan is routed to the previous journal entry:
    /// its acknowledge, and its posted value if it was a read.
    fn push(&mut self, mut cmd: DapCmd) -> Result<(), DapError> {
        cmd.select = self.select.unwrap_or(0);

        let payload = build_payload(cmd.direction, cmd.address, cmd.out_value);
        let scanned = self.scan(ir_for_port(cmd.port), payload, cmd.idle_cycles_after);
        let (value, ack) = match scanned {
            Ok(pair) => pair,
            Err(e) => {
                self.poison();
                return Err(e);
            }
        };

        if let Some(prev) = self.journal.last_mut() {
            prev.ack = Ack::from_wire(ack);
            if prev.ack == Ack::Wait {
                self.statistics.num_wait_acks += 1;
            }
            if prev.direction == TransferDirection::Read && prev.ack == Ack::OkFault {
                prev.value = value;
            }
        }

        self.journal.push(cmd);
        Ok(())
    }

    /// Enqueue a DP register read. The value lands at the batch boundary.
    pub(super) fn queue_dp_read(&mut self, address: u8) -> Result<(), DapError> {
        self.push(DapCmd::read(PortType::DebugPort, address))
    }

    /// Enqueue a DP register write. Writes pipeline; no flush is forced.
    pub(super) fn queue_dp_write(&mut self, address: u8, value: u32) -> Result<(), DapError> {
        self.push(DapCmd::write(PortType::DebugPort, address, value))?;
        if address == Select::ADDRESS {
            self.select = Some(value);
        }
        Ok(())
    }

    pub(super) fn queue_ap_read(&mut self, address: u8, idle_cycles: u32) -> Result<(), DapError> {
        let mut cmd = DapCmd::read(PortType::AccessPort, address);
        cmd.idle_cycles_after = idle_cycles;
        self.push(cmd)
    }

    pub(super) fn queue_ap_write(
        &mut self,
        address: u8,
        value: u32,
        idle_cycles: u32,
    ) -> Result<(), DapError> {
        let mut cmd = DapCmd::write(PortType::AccessPort, address, value);
        cmd.idle_cycles_after = idle_cycles;
        self.push(cmd)
    }

    /// Finalize the current batch: drain the pipeline, check CTRL/STAT, and
    /// replay on overrun. On success the completed journal is returned with
    /// every read's posted value filled in.
    pub(super) fn run_batch(&mut self) -> Result<Vec<DapCmd>, DapError> {
        if self.journal.is_empty() {
            return Ok(Vec::new());
        }
        self.statistics.num_batches += 1;

        match self.finalize() {
            Ok(()) => Ok(mem::take(&mut self.journal)),
            Err(e) => {
                self.poison();
                Err(e)
            }
        }
    }

    /// Finalize the current batch, discarding read results.
    pub fn flush(&mut self) -> Result<(), DapError> {
        self.run_batch().map(|_| ())
    }

    fn finalize(&mut self) -> Result<(), DapError> {
        // The last command's acknowledge and posted value are still in
        // flight; an RDBUFF read drains them without starting a new access.
        let (value, ack) = self.scan(JTAG_DPACC_IR, payload_read(RdBuff::ADDRESS), 0)?;
        if let Some(last) = self.journal.last_mut() {
            last.ack = Ack::from_wire(ack);
            if last.ack == Ack::Wait {
                self.statistics.num_wait_acks += 1;
            }
            if last.direction == TransferDirection::Read && last.ack == Ack::OkFault {
                last.value = value;
            }
        }

        for cmd in &self.journal {
            if let Ack::Invalid(ack) = cmd.ack {
                tracing::error!("unexpected DAP acknowledge: {:#05b}", ack);
                return Err(DapError::NoAcknowledge { ack });
            }
        }

        self.transaction_endcheck()
    }

    /// Inspect CTRL/STAT after a batch and decide: accept, replay or fail.
    fn transaction_endcheck(&mut self) -> Result<(), DapError> {
        let ctrl_stat = self.read_ctrl_posted()?;
        let ctrl = Ctrl(ctrl_stat);
        tracing::trace!("CTRL/STAT at batch end: {:#010x}", ctrl_stat);

        if !ctrl.debug_domain_powered() {
            tracing::error!(
                "debug power domain is down (CTRL/STAT = {:#010x}), target reset?",
                ctrl_stat
            );
            return Err(DapError::DebugPowerLoss { ctrl_stat });
        }

        if ctrl.sticky_err() {
            tracing::debug!("sticky error set after batch of {}", self.journal.len());
            self.clear_sticky(ctrl_stat)?;
            // The triggering command's outcome is unknown; do not replay.
            return Err(DapError::StickyFault { ctrl_stat });
        }

        if ctrl.sticky_orun() {
            tracing::debug!(
                "sticky overrun set, replaying batch of {}",
                self.journal.len()
            );
            self.clear_sticky(ctrl_stat)?;
            self.replay()?;
        } else if self.journal.iter().any(|cmd| cmd.ack == Ack::Wait) {
            // A WAIT-acked command never executed. With ORUNDETECT armed the
            // sticky overrun catches this; the journal is checked regardless.
            tracing::debug!("WAIT acknowledge without sticky overrun, replaying batch");
            self.replay()?;
        }

        Ok(())
    }

    /// Clear whatever sticky flags are set in `ctrl_stat` by writing the
    /// value back (write-one-to-clear), then re-read to confirm.
    fn clear_sticky(&mut self, ctrl_stat: u32) -> Result<(), DapError> {
        self.scan(JTAG_DPACC_IR, payload_write(Ctrl::ADDRESS, ctrl_stat), 0)?;
        let confirmed = Ctrl(self.read_ctrl_posted()?);
        if confirmed.sticky_err() || confirmed.sticky_orun() {
            tracing::warn!(
                "sticky flags still set after clear (CTRL/STAT = {:#010x})",
                u32::from(confirmed)
            );
        }
        Ok(())
    }

    /// Posted CTRL/STAT read: issue the read, then fetch the result through
    /// RDBUFF. Spins on WAIT within the retry budget.
    fn read_ctrl_posted(&mut self) -> Result<u32, DapError> {
        for _ in 0..=self.settings.num_retries_after_wait {
            self.scan(JTAG_DPACC_IR, payload_read(Ctrl::ADDRESS), 0)?;
            let (value, ack) = self.scan(JTAG_DPACC_IR, payload_read(RdBuff::ADDRESS), 0)?;
            match Ack::from_wire(ack) {
                Ack::OkFault => return Ok(value),
                Ack::Wait => {
                    self.statistics.num_wait_acks += 1;
                    continue;
                }
                _ => return Err(DapError::NoAcknowledge { ack }),
            }
        }
        tracing::error!("CTRL/STAT read kept answering WAIT");
        Err(DapError::Timeout)
    }

    /// Re-execute the whole journal in original order after an overrun.
    ///
    /// Each command is executed synchronously (scan plus RDBUFF drain) and
    /// retried while it acknowledges WAIT. A command's recorded SELECT
    /// context is restored first whenever it differs from the one active in
    /// the replay pass.
    fn replay(&mut self) -> Result<(), DapError> {
        self.statistics.num_replays += 1;

        // The overrun may have struck mid-batch; nothing about the live
        // SELECT state can be assumed.
        let mut active_select: Option<u32> = None;

        for i in 0..self.journal.len() {
            let cmd = self.journal[i].clone();

            if cmd.port == PortType::AccessPort && active_select != Some(cmd.select) {
                self.execute_single(
                    PortType::DebugPort,
                    TransferDirection::Write,
                    Select::ADDRESS,
                    cmd.select,
                    0,
                )?;
                active_select = Some(cmd.select);
            }

            let value = self.execute_single(
                cmd.port,
                cmd.direction,
                cmd.address,
                cmd.out_value,
                cmd.idle_cycles_after,
            )?;

            if cmd.port == PortType::DebugPort
                && cmd.direction == TransferDirection::Write
                && cmd.address == Select::ADDRESS
            {
                active_select = Some(cmd.out_value);
            }

            let slot = &mut self.journal[i];
            slot.ack = Ack::OkFault;
            if slot.direction == TransferDirection::Read {
                slot.value = value;
            }
        }

        Ok(())
    }

    /// One synchronous, confirmed transaction: shift the request, drain the
    /// posted result through RDBUFF, spin on WAIT within the retry budget.
    pub(super) fn execute_single(
        &mut self,
        port: PortType,
        direction: TransferDirection,
        address: u8,
        out_value: u32,
        idle_cycles: u32,
    ) -> Result<u32, DapError> {
        let payload = build_payload(direction, address, out_value);

        for _ in 0..=self.settings.num_retries_after_wait {
            self.scan(ir_for_port(port), payload, idle_cycles)?;
            let (value, ack) = self.scan(JTAG_DPACC_IR, payload_read(RdBuff::ADDRESS), 0)?;
            match Ack::from_wire(ack) {
                Ack::OkFault => return Ok(value),
                Ack::Wait => {
                    self.statistics.num_wait_acks += 1;
                    continue;
                }
                _ => return Err(DapError::NoAcknowledge { ack }),
            }
        }

        tracing::error!("transaction kept answering WAIT, giving up");
        Err(DapError::Timeout)
    }

    /// Drop all pending state after a fatal error. Whatever SELECT value the
    /// hardware holds can no longer be trusted.
    pub(super) fn poison(&mut self) {
        self.journal.clear();
        self.select = None;
    }
}
