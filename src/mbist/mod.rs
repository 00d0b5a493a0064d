//! Vendor MBIST sequencing and row repair.

use std::fmt::{Display, Formatter};

use log::info;
use serde::Serialize;

use crate::error::{RepairError, RepairResult};
use crate::hbm::types::{Channel, RepairType, Site, Vendor, MAX_CHANNELS, NUM_BANKS, ROW_BITS};
use crate::sim::config::TimingConfig;
use crate::wir::RegisterTransport;

pub mod sequencer;
pub mod spare_rows;
pub mod vendor;

pub use sequencer::HbmSequencer;
pub use vendor::{Samsung, SkHynix, VendorProtocol};

/// Bits of the lane repair wrapper data register: four 16-bit remap values.
pub const LANE_REPAIR_BITS: u32 = 64;
pub const ROW_REPAIR_BITS: u32 = 21;
pub const HARD_ROW_REPAIR_BITS: u32 = 22;
pub const MBIST_STATUS_BITS: u32 = 32;
/// Largest rank index the row repair payload can carry.
pub const MAX_PAYLOAD_RANKS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MbistPattern {
    MarchC,
    Checkerboard,
    RowStripe,
    Retention,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MbistState {
    Idle,
    Running,
    Complete { repairable: bool, bad_rows: u32 },
    /// Completion flag not set yet; poll again.
    Incomplete,
    /// Pattern not implemented by this vendor sequence. Terminal.
    Unsupported,
}

impl MbistState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MbistState::Complete { .. } | MbistState::Unsupported)
    }
}

/// One row within a site, memory-side coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RowAddress {
    pub site: Site,
    pub rank: u32,
    pub channel: Channel,
    pub bank: u32,
    pub row: u32,
}

impl Display for RowAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "site {} ch {} rank {} bank {} row {:#x}",
            self.site, self.channel, self.rank, self.bank, self.row
        )
    }
}

impl RowAddress {
    pub fn validate(&self) -> RepairResult<()> {
        if self.channel >= MAX_CHANNELS {
            return Err(RepairError::invalid(format!("channel {} out of range", self.channel)));
        }
        if self.rank >= MAX_PAYLOAD_RANKS {
            return Err(RepairError::invalid(format!("rank {} out of range", self.rank)));
        }
        if self.bank >= NUM_BANKS {
            return Err(RepairError::invalid(format!("bank {} out of range", self.bank)));
        }
        if self.row >= 1 << ROW_BITS {
            return Err(RepairError::invalid(format!("row {:#x} out of range", self.row)));
        }
        Ok(())
    }

    /// Row repair payload: `enable[20] rank[19:18] bank[17:14] row[13:0]`.
    pub fn payload(&self) -> u32 {
        1 << 20 | (self.rank & 0x3) << 18 | (self.bank & 0xF) << 14 | (self.row & ((1 << ROW_BITS) - 1))
    }

    /// Hard repair payload for one dword of the row.
    pub fn hard_payload(&self, dword: u32) -> u32 {
        self.payload() | (dword & 1) << 21
    }
}

/// Run/poll/decode of vendor MBIST and row/lane programming.
///
/// Vendors differ only in payloads and status layouts; the generation's
/// differences live behind the [`RegisterTransport`] handed to each call.
pub trait MbistSequencer: Send {
    fn vendor(&self) -> Vendor;

    fn state(&self, site: Site) -> MbistState;

    fn start(&mut self, t: &dyn RegisterTransport, site: Site, pattern: MbistPattern) -> RepairResult<MbistState>;

    fn poll_completion(&mut self, t: &dyn RegisterTransport, site: Site, pattern: MbistPattern) -> RepairResult<MbistState>;

    /// Spare rows (0..=2) still unfused for one bank.
    fn spare_rows_available(&self, t: &dyn RegisterTransport, site: Site, rank: u32, channel: Channel, bank: u32) -> RepairResult<u32>;

    fn soft_row_repair(&mut self, t: &dyn RegisterTransport, addr: RowAddress) -> RepairResult<()>;

    /// All-or-nothing: once a fuse write is issued the site reset always runs.
    fn hard_row_repair(&mut self, t: &dyn RegisterTransport, pseudo: bool, addr: RowAddress) -> RepairResult<()>;

    fn lane_repair(&mut self, t: &dyn RegisterTransport, repair: RepairType, pseudo: bool, site: Site, channel: Channel, data: &[u32]) -> RepairResult<()>;

    fn was_reset_since_last_soft_repair(&self, t: &dyn RegisterTransport, site: Site) -> RepairResult<bool>;

    fn row_repair(&mut self, t: &dyn RegisterTransport, repair: RepairType, pseudo: bool, addr: RowAddress) -> RepairResult<()> {
        match repair {
            RepairType::Soft if pseudo => {
                info!("{}: pseudo soft repair payload {:#08x} (not written)", addr, addr.payload());
                Ok(())
            }
            RepairType::Soft => self.soft_row_repair(t, addr),
            RepairType::Hard => self.hard_row_repair(t, pseudo, addr),
        }
    }
}

pub fn sequencer_for(vendor: Vendor, timing: TimingConfig) -> Box<dyn MbistSequencer> {
    match vendor {
        Vendor::Samsung => Box::new(HbmSequencer::<Samsung>::new(timing)),
        Vendor::Skhynix => Box::new(HbmSequencer::<SkHynix>::new(timing)),
    }
}
