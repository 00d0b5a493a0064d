use log::{debug, warn};

use crate::base::bus::RegisterBus;
use crate::error::{RepairError, RepairResult};
use crate::hbm::remap::{RemapCodec, RemapValue};
use crate::hbm::types::*;
use crate::utils::BitSlice;

pub const LINK_REPAIR_REG: &str = "FBPA_LINK_REPAIR";
const LINK_REPAIR_BYPASS_BIT: u32 = 31;
pub const CHANNELS_PER_BUS: u32 = 2;
pub const BUSES_PER_SITE: u32 = MAX_CHANNELS / CHANNELS_PER_BUS;

/// Instance index of the link repair register for one (bus, subpartition, dword).
pub fn link_repair_instance(bus_id: u32, subpartition: u32, dword: u32) -> u32 {
    (bus_id * CHANNELS_PER_BUS + subpartition) * DWORDS_PER_CHANNEL + dword
}

/// Bit position of a lane inside its byte; DM and DBI lanes are byte-wide.
pub fn lane_bit_in_byte(lane_bit: u32, lane_type: LaneType) -> u32 {
    match lane_type {
        LaneType::Data => lane_bit % 8,
        _ => 0,
    }
}

/// Translation between GPU lane numbering, memory-side dword/byte and
/// bus addressing.
///
/// The provided methods hold the generic calculation; a generation only
/// overrides [`Topology::swizzle_dword`] when its wiring reorders dwords.
pub trait Topology: Send + Sync {
    fn generation(&self) -> Generation;

    /// Final per-site dword correction. Must be its own inverse.
    fn swizzle_dword(&self, _site: Site, dword: u32) -> u32 {
        dword
    }

    fn codec(&self) -> RemapCodec {
        RemapCodec::new(self.generation())
    }

    fn gpu_lane_to_memory_dword_byte(&self, site: Site, lane_bit: u32, lane_type: LaneType) -> RepairResult<DwordByte> {
        check_site(site)?;
        let (dword, byte) = match lane_type {
            LaneType::Data if lane_bit < DATA_LANES_PER_CHANNEL => {
                (lane_bit / (BYTES_PER_DWORD * 8), (lane_bit / 8) % BYTES_PER_DWORD)
            }
            LaneType::Dm | LaneType::Dbi if lane_bit < BYTE_LANES_PER_CHANNEL => {
                (lane_bit / BYTES_PER_DWORD, lane_bit % BYTES_PER_DWORD)
            }
            _ => {
                return Err(RepairError::invalid(format!(
                    "{} lane {} cannot be mapped to a dword",
                    lane_type, lane_bit
                )))
            }
        };
        Ok(DwordByte {
            dword: self.swizzle_dword(site, dword),
            byte,
        })
    }

    fn memory_to_gpu_lane(&self, site: Site, pos: DwordByte, bit: u32, lane_type: LaneType) -> RepairResult<u32> {
        check_site(site)?;
        if pos.dword >= DWORDS_PER_CHANNEL || pos.byte >= BYTES_PER_DWORD || bit >= 8 {
            return Err(RepairError::invalid(format!(
                "dword {} byte {} bit {} out of range",
                pos.dword, pos.byte, bit
            )));
        }
        let dword = self.swizzle_dword(site, pos.dword);
        match lane_type {
            LaneType::Data => Ok(dword * BYTES_PER_DWORD * 8 + pos.byte * 8 + bit),
            LaneType::Dm | LaneType::Dbi => Ok(dword * BYTES_PER_DWORD + pos.byte),
            other => Err(RepairError::invalid(format!("{} lanes have no memory-side position", other))),
        }
    }

    fn site_channel_to_bus(&self, site: Site, channel: Channel) -> RepairResult<(u32, u32)> {
        check_site(site)?;
        check_channel(channel)?;
        Ok((site * BUSES_PER_SITE + channel / CHANNELS_PER_BUS, channel % CHANNELS_PER_BUS))
    }

    fn bus_to_site_channel(&self, bus_id: u32, subpartition: u32) -> RepairResult<(Site, Channel)> {
        if bus_id >= MAX_SITES * BUSES_PER_SITE || subpartition >= CHANNELS_PER_BUS {
            return Err(RepairError::invalid(format!(
                "bus {} subpartition {} out of range",
                bus_id, subpartition
            )));
        }
        Ok((
            bus_id / BUSES_PER_SITE,
            (bus_id % BUSES_PER_SITE) * CHANNELS_PER_BUS + subpartition,
        ))
    }

    /// GPU-side lanes covered by the repairs encoded in `remap` for one dword.
    fn gpu_lane_to_fuse_repairs(&self, site: Site, channel: Channel, dword: u32, remap: RemapValue) -> RepairResult<Vec<LaneError>> {
        let (bus_id, _) = self.site_channel_to_bus(site, channel)?;
        let entries = self.codec().decode(remap)?;
        entries
            .iter()
            .map(|entry| {
                let pos = DwordByte { dword, byte: entry.byte() };
                let lane_bit = self.memory_to_gpu_lane(site, pos, entry.bit_in_byte(), entry.lane_type)?;
                Ok(LaneError { bus_id, lane_bit, lane_type: entry.lane_type })
            })
            .collect()
    }

    /// Lanes currently remapped according to the GPU-side link repair register.
    fn read_link_repairs(&self, bus: &dyn RegisterBus, bus_id: u32, subpartition: u32, dword: u32) -> RepairResult<Vec<LaneError>> {
        if dword >= DWORDS_PER_CHANNEL {
            return Err(RepairError::invalid(format!("dword {} out of range", dword)));
        }
        let (site, channel) = self.bus_to_site_channel(bus_id, subpartition)?;
        let raw = bus.read32(LINK_REPAIR_REG, link_repair_instance(bus_id, subpartition, dword))?;
        let remap = raw.sel(15, 0) as RemapValue;
        let no_repair = self.codec().no_repair();
        if remap != no_repair && !raw.bit(LINK_REPAIR_BYPASS_BIT) {
            warn!(
                "bus {} subp {} dword {}: remap value {:#06x} present but bypass enable is clear",
                bus_id, subpartition, dword, remap
            );
        }
        let lanes = self.gpu_lane_to_fuse_repairs(site, channel, dword, remap)?;
        debug!("bus {} subp {} dword {}: {} remapped lanes", bus_id, subpartition, dword, lanes.len());
        Ok(lanes)
    }
}

fn check_site(site: Site) -> RepairResult<()> {
    if site >= MAX_SITES {
        return Err(RepairError::invalid(format!("site {} out of range", site)));
    }
    Ok(())
}

fn check_channel(channel: Channel) -> RepairResult<()> {
    if channel >= MAX_CHANNELS {
        return Err(RepairError::invalid(format!("channel {} out of range", channel)));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct Hbm2eTopology;

impl Topology for Hbm2eTopology {
    fn generation(&self) -> Generation {
        Generation::Hbm2e
    }
}

/// HBM3 sites 1 and 3 are wired with the dword order reversed.
#[derive(Debug, Default)]
pub struct Hbm3Topology;

impl Hbm3Topology {
    const SWIZZLED_SITES: [Site; 2] = [1, 3];
}

impl Topology for Hbm3Topology {
    fn generation(&self) -> Generation {
        Generation::Hbm3
    }

    fn swizzle_dword(&self, site: Site, dword: u32) -> u32 {
        if Self::SWIZZLED_SITES.contains(&site) {
            DWORDS_PER_CHANNEL - 1 - dword
        } else {
            dword
        }
    }
}

pub fn topology_for(generation: Generation) -> Box<dyn Topology> {
    match generation {
        Generation::Hbm2e => Box::new(Hbm2eTopology),
        Generation::Hbm3 => Box::new(Hbm3Topology),
    }
}
