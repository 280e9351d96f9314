//! Debug Port register definitions.

use bitfield::bitfield;

use super::Register;

bitfield! {
    /// The ABORT register. Write-only, used to force the current AP
    /// transaction to be abandoned.
    #[derive(Clone)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 5;
    pub _, set_wderrclr: 4;
    pub _, set_stkerrclr: 3;
    pub _, set_stkcmpclr: 2;
    pub _, set_dapabort: 0;
}

impl From<u32> for Abort {
    fn from(raw: u32) -> Self {
        Abort(raw)
    }
}

impl From<Abort> for u32 {
    fn from(raw: Abort) -> Self {
        raw.0
    }
}

impl Register for Abort {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "ABORT";
}

bitfield! {
    /// The CTRL/STAT register: power domain handshake bits and the sticky
    /// flags the batch endcheck is built around.
    ///
    /// STICKYORUN and STICKYERR have write-one-to-clear semantics on a
    /// JTAG-DP; writing back the value that was read clears whatever was set.
    #[derive(Clone, Default)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub cdbgrstreq, set_cdbgrstreq: 26;
    pub u16, trn_cnt, set_trn_cnt: 23, 12;
    pub u8, mask_lane, set_mask_lane: 11, 8;
    pub wdataerr, _: 7;
    pub readok, _: 6;
    pub sticky_err, set_sticky_err: 5;
    pub sticky_cmp, _: 4;
    pub u8, trn_mode, _: 3, 2;
    pub sticky_orun, set_sticky_orun: 1;
    pub orun_detect, set_orun_detect: 0;
}

impl Ctrl {
    /// Mask of the four power domain bits [31:28].
    pub const POWER_MASK: u32 = 0xF000_0000;

    /// All four power request/acknowledge bits are set. Anything else means
    /// the debug domain is (partially) unpowered.
    pub fn debug_domain_powered(&self) -> bool {
        self.0 & Self::POWER_MASK == Self::POWER_MASK
    }
}

impl From<u32> for Ctrl {
    fn from(raw: u32) -> Self {
        Ctrl(raw)
    }
}

impl From<Ctrl> for u32 {
    fn from(raw: Ctrl) -> Self {
        raw.0
    }
}

impl Register for Ctrl {
    const ADDRESS: u8 = 0x4;
    const NAME: &'static str = "CTRL/STAT";
}

bitfield! {
    /// The SELECT register. Chooses the addressed AP and its register bank;
    /// the engine keeps a cached copy so redundant writes can be elided.
    #[derive(Clone, PartialEq)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

impl From<u32> for Select {
    fn from(raw: u32) -> Self {
        Select(raw)
    }
}

impl From<Select> for u32 {
    fn from(raw: Select) -> Self {
        raw.0
    }
}

impl Register for Select {
    const ADDRESS: u8 = 0x8;
    const NAME: &'static str = "SELECT";
}

/// The RDBUFF register. Reading it returns the posted result of the previous
/// transaction without starting a new one, which is what batch finalization
/// uses to drain the pipeline.
#[derive(Debug, Clone)]
pub struct RdBuff(pub u32);

impl From<u32> for RdBuff {
    fn from(raw: u32) -> Self {
        RdBuff(raw)
    }
}

impl From<RdBuff> for u32 {
    fn from(raw: RdBuff) -> Self {
        raw.0
    }
}

impl Register for RdBuff {
    const ADDRESS: u8 = 0xC;
    const NAME: &'static str = "RDBUFF";
}

bitfield! {
    /// The DP identification register.
    #[derive(Clone)]
    pub struct DPIDR(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, part_no, _: 27, 20;
    pub min, _: 16;
    pub u8, version, _: 15, 12;
    pub u16, designer, _: 11, 1;
}

impl From<u32> for DPIDR {
    fn from(raw: u32) -> Self {
        DPIDR(raw)
    }
}

impl From<DPIDR> for u32 {
    fn from(raw: DPIDR) -> Self {
        raw.0
    }
}

impl Register for DPIDR {
    const ADDRESS: u8 = 0x0;
    const NAME: &'static str = "DPIDR";
}
