//! Access to the memory's IEEE-1500 style wrapper instruction and data
//! registers (WIR/WDR).

use std::fmt::{Display, Formatter};
use std::time::Duration;

use phf::phf_map;
use serde::Serialize;

use crate::base::lock::AccessGuard;
use crate::error::{RepairError, RepairResult};
use crate::hbm::types::{Channel, Site};

pub mod jtag;
pub mod shadow;

pub use jtag::JtagBitBangEngine;
pub use shadow::ShadowRegisterEngine;

/// Wrapper instruction opcodes.
#[derive(Debug, Clone)]
pub struct Opcode;
impl Opcode {
    pub const BYPASS: u8 = 0x00;
    pub const HBM_RESET: u8 = 0x05;
    pub const MBIST: u8 = 0x06;
    pub const SOFT_REPAIR: u8 = 0x07;
    pub const HARD_REPAIR: u8 = 0x08;
    pub const DEVICE_ID: u8 = 0x0E;
    pub const MODE_REGISTER_DUMP_SET: u8 = 0x10;
    pub const SOFT_LANE_REPAIR: u8 = 0x12;
    pub const HARD_LANE_REPAIR: u8 = 0x13;
    pub const TMRS: u8 = 0x1C;
    pub const SPARE_ROW_QUERY: u8 = 0x1D;
    pub const MBIST_STATUS: u8 = 0x1E;
}

static OPCODE_NAMES: phf::Map<u8, &'static str> = phf_map! {
    0x00u8 => "BYPASS",
    0x05u8 => "HBM_RESET",
    0x06u8 => "MBIST",
    0x07u8 => "SOFT_REPAIR",
    0x08u8 => "HARD_REPAIR",
    0x0Eu8 => "DEVICE_ID",
    0x10u8 => "MODE_REGISTER_DUMP_SET",
    0x12u8 => "SOFT_LANE_REPAIR",
    0x13u8 => "HARD_LANE_REPAIR",
    0x1Cu8 => "TMRS",
    0x1Du8 => "SPARE_ROW_QUERY",
    0x1Eu8 => "MBIST_STATUS",
};

pub fn opcode_name(opcode: u8) -> &'static str {
    OPCODE_NAMES.get(&opcode).copied().unwrap_or("UNKNOWN")
}

/// Channel-select and opcode, packed as `(channel << 8) | opcode` into the
/// 12-bit wrapper instruction register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WrapperInstruction {
    pub channel: u8,
    pub opcode: u8,
}

impl WrapperInstruction {
    pub const BITS: u32 = 12;
    /// Channel select value addressing every channel of the site.
    pub const ALL_CHANNELS: u8 = 0xF;

    pub fn new(channel: Channel, opcode: u8) -> Self {
        Self { channel: (channel & 0xF) as u8, opcode }
    }

    pub fn broadcast(opcode: u8) -> Self {
        Self { channel: Self::ALL_CHANNELS, opcode }
    }

    pub fn packed(&self) -> u32 {
        ((self.channel as u32 & 0xF) << 8) | self.opcode as u32
    }

    pub fn unpack(raw: u32) -> Self {
        Self {
            channel: ((raw >> 8) & 0xF) as u8,
            opcode: (raw & 0xFF) as u8,
        }
    }
}

impl Display for WrapperInstruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[ch {}] ({:#05x})", opcode_name(self.opcode), self.channel, self.packed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportKind {
    JtagBitBang,
    ShadowRegister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportOp {
    ReadWrapperData,
    WriteWrapperData,
    WriteBypass,
    SelectChannel,
    AssertMask,
    ResetSite,
    ToggleClock,
    PollWrapperIdle,
}

/// Capability interface over the two wrapper transports.
///
/// Each transport implements a subset; callers check [`RegisterTransport::supports`]
/// instead of assuming an operation exists.
pub trait RegisterTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn supports(&self, op: TransportOp) -> bool;

    /// Exclusive access to the wrapper register bank for the guard's lifetime.
    fn acquire(&self) -> RepairResult<AccessGuard<'_>>;

    fn read_wrapper_data(&self, site: Site, instr: WrapperInstruction, length_bits: u32) -> RepairResult<Vec<u32>>;

    fn write_wrapper_data(&self, site: Site, instr: WrapperInstruction, data: &[u32], length_bits: u32) -> RepairResult<()>;

    fn write_bypass(&self, site: Site, channel: Channel) -> RepairResult<()>;

    fn select_channel(&self, site: Site, channel: Channel) -> RepairResult<()>;

    fn assert_mask(&self, site: Site) -> RepairResult<()> {
        let _ = site;
        Err(RepairError::unsupported(TransportOp::AssertMask, self.kind()))
    }

    fn reset_site(&self, site: Site) -> RepairResult<()>;

    fn toggle_clock(&self, site: Site, cycles: u32) -> RepairResult<()> {
        let _ = (site, cycles);
        Err(RepairError::unsupported(TransportOp::ToggleClock, self.kind()))
    }

    fn poll_wrapper_idle(&self, site: Site, blocking: bool, timeout: Duration) -> RepairResult<()> {
        let _ = (site, blocking, timeout);
        Err(RepairError::unsupported(TransportOp::PollWrapperIdle, self.kind()))
    }
}

/// Check that a data vector can hold `length_bits`.
pub(crate) fn check_length(data: &[u32], length_bits: u32) -> RepairResult<()> {
    if length_bits == 0 {
        return Err(RepairError::invalid("zero-length wrapper data access"));
    }
    if data.len() < crate::utils::words_for(length_bits) {
        return Err(RepairError::invalid(format!(
            "{} words cannot hold {} bits",
            data.len(),
            length_bits
        )));
    }
    Ok(())
}
