//! Lane remap values held in the wrapper data registers.
//!
//! A 16-bit remap value covers one dword and is made of two independent
//! byte-pair fields (bits 7:0 and 15:8), each covering two bytes of the dword.
//! A field is either the generation's "no repair" byte, or a repair-type code
//! in one nibble and a position nibble in the other:
//!
//! - lower byte of the pair: `(fill << 4) | code`
//! - upper byte of the pair: `(code << 4) | OTHER_BYTE`
//!
//! A lower-byte field whose fill nibble differs from the generation's fill is
//! rejected, so every decodable value has exactly one encoding.
//!
//! Type codes: `0` DM, `1..=8` DATA lane `code - 1`, `9` DBI.

use smallvec::SmallVec;

use crate::error::{DecodeError, RepairError, RepairResult};
use crate::hbm::types::{Generation, LaneType, BYTES_PER_DWORD};
use crate::utils::BitSlice;

pub type RemapValue = u16;

const TYPE_DM: u8 = 0;
const TYPE_DATA_FIRST: u8 = 1;
const TYPE_DATA_LAST: u8 = 8;
const TYPE_DBI: u8 = 9;

/// Bits per byte in a repaired-lane bitmap: DATA 0..7, DM 8, DBI 9.
pub const LANE_SLOTS_PER_BYTE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapEncoding {
    pub pair_no_repair: u8,
    pub other_byte: u8,
    pub lower_fill: u8,
}

impl RemapEncoding {
    pub const HBM2E: RemapEncoding = RemapEncoding {
        pair_no_repair: 0x00,
        other_byte: 0xE,
        lower_fill: 0xF,
    };

    pub const HBM3: RemapEncoding = RemapEncoding {
        pair_no_repair: 0xFF,
        other_byte: 0xE,
        lower_fill: 0x0,
    };

    pub fn for_generation(generation: Generation) -> Self {
        match generation {
            Generation::Hbm2e => Self::HBM2E,
            Generation::Hbm3 => Self::HBM3,
        }
    }

    pub fn no_repair(&self) -> RemapValue {
        (self.pair_no_repair as u16) << 8 | self.pair_no_repair as u16
    }
}

/// One decoded repair: dword-relative lane offset and lane category.
///
/// DM and DBI report the offset of their byte, which is the same offset as
/// DATA lane 0 of that byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapEntry {
    pub offset: u8,
    pub lane_type: LaneType,
}

impl RemapEntry {
    pub fn byte(&self) -> u32 {
        self.offset as u32 / 8
    }

    pub fn bit_in_byte(&self) -> u32 {
        self.offset as u32 % 8
    }
}

pub type RemapEntries = SmallVec<[RemapEntry; 2]>;

/// Remap value and masks for a single lane repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneRemap {
    /// Full 16-bit value with the untouched pair left at "no repair".
    pub value: RemapValue,
    /// Bits of the remap value owned by this repair.
    pub field_mask: RemapValue,
    /// Bit of this lane in a repaired-lane bitmap.
    pub lane_mask: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RemapCodec {
    enc: RemapEncoding,
}

impl RemapCodec {
    pub fn new(generation: Generation) -> Self {
        Self { enc: RemapEncoding::for_generation(generation) }
    }

    pub fn with_encoding(enc: RemapEncoding) -> Self {
        Self { enc }
    }

    pub fn encoding(&self) -> RemapEncoding {
        self.enc
    }

    pub fn no_repair(&self) -> RemapValue {
        self.enc.no_repair()
    }

    pub fn decode(&self, value: RemapValue) -> Result<RemapEntries, DecodeError> {
        let mut entries = RemapEntries::new();
        for pair in 0..2u8 {
            let field = value.sel(8 * pair as u32 + 7, 8 * pair as u32) as u8;
            if field == self.enc.pair_no_repair {
                continue;
            }
            let (code, mut offset) = if field & 0xF == self.enc.other_byte {
                (field >> 4, 8u8)
            } else if field >> 4 == self.enc.lower_fill {
                (field & 0xF, 0u8)
            } else {
                return Err(DecodeError::UnexpectedFill {
                    value,
                    byte_pair: pair,
                    fill: field >> 4,
                });
            };
            offset += 16 * pair;
            let entry = match code {
                TYPE_DM => RemapEntry { offset, lane_type: LaneType::Dm },
                TYPE_DATA_FIRST..=TYPE_DATA_LAST => RemapEntry {
                    offset: offset + code - TYPE_DATA_FIRST,
                    lane_type: LaneType::Data,
                },
                TYPE_DBI => RemapEntry { offset, lane_type: LaneType::Dbi },
                _ => {
                    return Err(DecodeError::UnsupportedEncoding {
                        value,
                        byte_pair: pair,
                        type_code: code,
                    })
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Field for one repair within its byte pair, plus the pair index.
    fn encode_field(&self, entry: RemapEntry) -> RepairResult<(u8, u8)> {
        let offset = entry.offset as u32;
        if offset >= BYTES_PER_DWORD * 8 {
            return Err(RepairError::invalid(format!("lane offset {} outside the dword", offset)));
        }
        let code = match entry.lane_type {
            LaneType::Data => TYPE_DATA_FIRST + entry.bit_in_byte() as u8,
            LaneType::Dm | LaneType::Dbi if entry.bit_in_byte() != 0 => {
                return Err(RepairError::invalid(format!(
                    "{} repair must sit on a byte boundary, got offset {}",
                    entry.lane_type, offset
                )))
            }
            LaneType::Dm => TYPE_DM,
            LaneType::Dbi => TYPE_DBI,
            other => {
                return Err(RepairError::invalid(format!("{} lanes have no remap encoding", other)))
            }
        };
        let pair = (offset / 16) as u8;
        let upper = offset % 16 >= 8;
        let field = if upper {
            code << 4 | self.enc.other_byte
        } else {
            self.enc.lower_fill << 4 | code
        };
        Ok((pair, field))
    }

    /// Inverse of [`RemapCodec::decode`]. At most one entry per byte pair.
    pub fn encode(&self, entries: &[RemapEntry]) -> RepairResult<RemapValue> {
        let mut value = self.no_repair();
        let mut used = [false; 2];
        for entry in entries {
            let (pair, field) = self.encode_field(*entry)?;
            if used[pair as usize] {
                return Err(DecodeError::PairConflict { byte_pair: pair }.into());
            }
            used[pair as usize] = true;
            let shift = 8 * pair as u32;
            value = (value & !(0xFF << shift)) | (field as u16) << shift;
        }
        Ok(value)
    }

    /// Remap value and masks for repairing `bit` of `byte` (dword-relative).
    /// `bit` is ignored for DM and DBI lanes.
    pub fn lane_remap(&self, byte: u32, bit: u32, lane_type: LaneType) -> RepairResult<LaneRemap> {
        if byte >= BYTES_PER_DWORD || bit >= 8 {
            return Err(RepairError::invalid(format!("byte {} bit {} outside the dword", byte, bit)));
        }
        let bit = if lane_type == LaneType::Data { bit } else { 0 };
        let entry = RemapEntry { offset: (byte * 8 + bit) as u8, lane_type };
        let (pair, field) = self.encode_field(entry)?;
        let shift = 8 * pair as u32;
        let field_mask = 0xFFu16 << shift;
        let value = (self.no_repair() & !field_mask) | (field as u16) << shift;
        Ok(LaneRemap {
            value,
            field_mask,
            lane_mask: Self::lane_slot(entry),
        })
    }

    /// Merge a new repair into `existing`, replacing only the masked field.
    pub fn encode_into(&self, existing: &mut RemapValue, byte: u32, bit: u32, lane_type: LaneType) -> RepairResult<LaneRemap> {
        let remap = self.lane_remap(byte, bit, lane_type)?;
        merge(existing, remap.value, remap.field_mask);
        Ok(remap)
    }

    /// Bitmap of lanes already repaired by `value`.
    pub fn repaired_lanes(&self, value: RemapValue) -> Result<u64, DecodeError> {
        Ok(self
            .decode(value)?
            .iter()
            .fold(0u64, |acc, entry| acc | Self::lane_slot(*entry)))
    }

    /// True when the byte pair selected by `field_mask` already holds a repair.
    pub fn pair_in_use(&self, value: RemapValue, field_mask: RemapValue) -> bool {
        value & field_mask != self.no_repair() & field_mask
    }

    fn lane_slot(entry: RemapEntry) -> u64 {
        let slot = match entry.lane_type {
            LaneType::Dm => 8,
            LaneType::Dbi => 9,
            _ => entry.bit_in_byte(),
        };
        1u64 << (entry.byte() * LANE_SLOTS_PER_BYTE + slot)
    }
}

pub fn merge(existing: &mut RemapValue, value: RemapValue, mask: RemapValue) {
    *existing = (*existing & !mask) | (value & mask);
}
