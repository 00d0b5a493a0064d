use std::fmt::{Display, Formatter};
use std::str::FromStr;

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

pub type Site = u32;
pub type Channel = u32;

pub const MAX_SITES: u32 = 4;
pub const MAX_CHANNELS: u32 = 8;
pub const NUM_BANKS: u32 = 16;
pub const ROW_BITS: u32 = 14;
pub const DWORDS_PER_CHANNEL: u32 = 4;
pub const BYTES_PER_DWORD: u32 = 4;
pub const DATA_LANES_PER_CHANNEL: u32 = DWORDS_PER_CHANNEL * BYTES_PER_DWORD * 8;
pub const BYTE_LANES_PER_CHANNEL: u32 = DWORDS_PER_CHANNEL * BYTES_PER_DWORD;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    /// Wrapper reached through the host-to-JTAG bridge.
    #[default]
    Hbm2e,
    /// Wrapper reached through memory-mapped shadow registers.
    Hbm3,
}

impl FromStr for Generation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "hbm2e" => Ok(Self::Hbm2e),
            "hbm3" => Ok(Self::Hbm3),
            _ => Err(format!("unsupported generation '{}', expected one of: hbm2e, hbm3", value)),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    #[default]
    Samsung,
    Skhynix,
}

impl FromStr for Vendor {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "samsung" => Ok(Self::Samsung),
            "skhynix" => Ok(Self::Skhynix),
            _ => Err(format!("unsupported vendor '{}', expected one of: samsung, skhynix", value)),
        }
    }
}

/// Electrical category of a bit-line.
#[derive(Debug, FromPrimitive, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LaneType {
    Data = 0,
    Dbi = 1,
    Dm = 2,
    Addr = 3,
    Unknown = 4,
}

impl Display for LaneType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LaneType::Data => "DATA",
            LaneType::Dbi => "DBI",
            LaneType::Dm => "DM",
            LaneType::Addr => "ADDR",
            LaneType::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RepairType {
    /// Volatile remap, lost on reset.
    Soft,
    /// Fuse burn; takes effect after a site reset.
    Hard,
}

impl RepairType {
    pub fn is_soft(self) -> bool {
        self == RepairType::Soft
    }
}

/// One failing bit-line as seen from the GPU side.
///
/// `lane_bit` is channel-relative: DATA lanes are `0..128`
/// (`dword * 32 + byte * 8 + bit`), DBI and DM lanes are `0..16`
/// (`dword * 4 + byte`).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaneError {
    pub bus_id: u32,
    pub lane_bit: u32,
    pub lane_type: LaneType,
}

impl Display for LaneError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "bus {} {} lane {}", self.bus_id, self.lane_type, self.lane_bit)
    }
}

/// One failing row as seen from the GPU side.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RowError {
    pub bus_id: u32,
    pub subpartition: u32,
    pub rank: u32,
    pub bank: u32,
    pub row: u32,
    pub name: String,
    pub origin_test_id: Option<u32>,
}

impl Display for RowError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [bus {} subp {} rank {} bank {} row {:#x}]",
            self.name, self.bus_id, self.subpartition, self.rank, self.bank, self.row
        )
    }
}

/// Memory-side coordinates of one lane inside a channel.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct DwordByte {
    pub dword: u32,
    pub byte: u32,
}
