use crate::hbm::types::Vendor;
use crate::mbist::{MbistPattern, MbistState};
use crate::utils::BitSlice;

/// Position of the not-repairable flag and failing-row indicator field in the
/// MBIST status word. Bit 0 is always the completion flag.
#[derive(Debug, Clone, Copy)]
pub struct StatusLayout {
    pub not_repairable_bit: u32,
    pub rows_hi: u32,
    pub rows_lo: u32,
}

impl StatusLayout {
    pub fn decode(&self, word: u32) -> MbistState {
        if !word.bit(0) {
            return MbistState::Incomplete;
        }
        let field = word.sel(self.rows_hi, self.rows_lo);
        // indicator bit i stands for 2^i failing rows
        let bad_rows = (0..=(self.rows_hi - self.rows_lo))
            .filter(|i| field.bit(*i))
            .fold(0u32, |acc, i| acc + (1 << i));
        MbistState::Complete {
            repairable: !word.bit(self.not_repairable_bit),
            bad_rows,
        }
    }
}

/// Vendor-defined constants of the wrapper MBIST and repair protocol.
pub trait VendorProtocol: Send + Sync + 'static {
    const VENDOR: Vendor;
    const STATUS: StatusLayout;
    const MBIST_PAYLOAD_BITS: u32;
    /// Test-mode register values written, in order, before the first soft repair.
    const WAKE_TMRS: [u32; 3];
    const WAKE_MRDS: u32;
    const TMRS_BITS: u32;
    const MRDS_BITS: u32;
    /// Wrapper clocks between a spare-row probe write and its read-back.
    const SPARE_ROW_SETTLE_CYCLES: u32;
    const FUSE_BURN_CYCLES: u32;

    /// Wrapper data written with the MBIST instruction, `None` if the
    /// pattern is not implemented.
    fn mbist_payload(pattern: MbistPattern) -> Option<[u32; 2]>;
}

#[derive(Debug, Default)]
pub struct Samsung;

impl VendorProtocol for Samsung {
    const VENDOR: Vendor = Vendor::Samsung;
    const STATUS: StatusLayout = StatusLayout {
        not_repairable_bit: 1,
        rows_hi: 9,
        rows_lo: 2,
    };
    const MBIST_PAYLOAD_BITS: u32 = 40;
    const WAKE_TMRS: [u32; 3] = [0x0A3C_1F00, 0x0A3C_1F81, 0x0A3C_2F06];
    const WAKE_MRDS: u32 = 0x0000_0C05;
    const TMRS_BITS: u32 = 32;
    const MRDS_BITS: u32 = 16;
    const SPARE_ROW_SETTLE_CYCLES: u32 = 600;
    const FUSE_BURN_CYCLES: u32 = 2_000;

    fn mbist_payload(pattern: MbistPattern) -> Option<[u32; 2]> {
        match pattern {
            MbistPattern::MarchC => Some([0x0000_0101, 0x00]),
            MbistPattern::Checkerboard => Some([0x0000_0501, 0x5A]),
            MbistPattern::RowStripe => Some([0x0000_0901, 0xF0]),
            MbistPattern::Retention => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SkHynix;

impl VendorProtocol for SkHynix {
    const VENDOR: Vendor = Vendor::Skhynix;
    const STATUS: StatusLayout = StatusLayout {
        not_repairable_bit: 15,
        rows_hi: 14,
        rows_lo: 8,
    };
    const MBIST_PAYLOAD_BITS: u32 = 36;
    const WAKE_TMRS: [u32; 3] = [0x0013_B000, 0x0013_B0A5, 0x0013_C0E1];
    const WAKE_MRDS: u32 = 0x0000_0A11;
    const TMRS_BITS: u32 = 24;
    const MRDS_BITS: u32 = 16;
    const SPARE_ROW_SETTLE_CYCLES: u32 = 640;
    const FUSE_BURN_CYCLES: u32 = 2_400;

    fn mbist_payload(pattern: MbistPattern) -> Option<[u32; 2]> {
        match pattern {
            MbistPattern::MarchC => Some([0x8000_0003, 0x1]),
            MbistPattern::Checkerboard => Some([0x8000_0013, 0x1]),
            MbistPattern::RowStripe => Some([0x8000_0023, 0x3]),
            MbistPattern::Retention => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_without_completion_flag_is_incomplete() {
        assert_eq!(Samsung::STATUS.decode(0x0000_03FE), MbistState::Incomplete);
    }

    #[test]
    fn failing_rows_are_power_of_two_weighted() {
        // field bits 0 and 2 set -> 1 + 4 rows
        let word = 1 | (0b101 << 2);
        assert_eq!(
            Samsung::STATUS.decode(word),
            MbistState::Complete { repairable: true, bad_rows: 5 }
        );
        let word = 1 | (1 << 15) | (0b100_0000 << 8);
        assert_eq!(
            SkHynix::STATUS.decode(word),
            MbistState::Complete { repairable: false, bad_rows: 64 }
        );
    }
}
