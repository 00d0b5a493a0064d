use std::sync::Arc;

use crate::error::RepairError;
use crate::hbm::topology::{link_repair_instance, lane_bit_in_byte, topology_for, Hbm2eTopology, Hbm3Topology, Topology, LINK_REPAIR_REG};
use crate::hbm::types::*;
use crate::sim::SimBus;

#[test]
fn data_lane_maps_to_dword_and_byte() {
    let topo = Hbm2eTopology;
    let pos = topo.gpu_lane_to_memory_dword_byte(0, 75, LaneType::Data).unwrap();
    assert_eq!(pos, DwordByte { dword: 2, byte: 1 });
    assert_eq!(lane_bit_in_byte(75, LaneType::Data), 3);
    assert_eq!(topo.memory_to_gpu_lane(0, pos, 3, LaneType::Data).unwrap(), 75);

    let pos = topo.gpu_lane_to_memory_dword_byte(0, 13, LaneType::Dm).unwrap();
    assert_eq!(pos, DwordByte { dword: 3, byte: 1 });
}

#[test]
fn hbm3_swizzles_dwords_on_odd_sites() {
    let topo = Hbm3Topology;
    assert_eq!(topo.gpu_lane_to_memory_dword_byte(0, 75, LaneType::Data).unwrap().dword, 2);
    assert_eq!(topo.gpu_lane_to_memory_dword_byte(1, 75, LaneType::Data).unwrap().dword, 1);
    assert_eq!(topo.gpu_lane_to_memory_dword_byte(3, 13, LaneType::Dbi).unwrap(), DwordByte { dword: 0, byte: 1 });
    assert_eq!(topo.gpu_lane_to_memory_dword_byte(2, 13, LaneType::Dbi).unwrap(), DwordByte { dword: 3, byte: 1 });
}

#[test]
fn lane_mapping_round_trips_on_every_site() {
    for generation in [Generation::Hbm2e, Generation::Hbm3] {
        let topo = topology_for(generation);
        for site in 0..MAX_SITES {
            for lane in 0..DATA_LANES_PER_CHANNEL {
                let pos = topo.gpu_lane_to_memory_dword_byte(site, lane, LaneType::Data).unwrap();
                let bit = lane_bit_in_byte(lane, LaneType::Data);
                assert_eq!(topo.memory_to_gpu_lane(site, pos, bit, LaneType::Data).unwrap(), lane);
            }
            for lane in 0..BYTE_LANES_PER_CHANNEL {
                for lane_type in [LaneType::Dm, LaneType::Dbi] {
                    let pos = topo.gpu_lane_to_memory_dword_byte(site, lane, lane_type).unwrap();
                    assert_eq!(topo.memory_to_gpu_lane(site, pos, 0, lane_type).unwrap(), lane);
                }
            }
        }
    }
}

#[test]
fn out_of_range_lanes_are_rejected() {
    let topo = Hbm2eTopology;
    assert!(matches!(
        topo.gpu_lane_to_memory_dword_byte(0, 128, LaneType::Data),
        Err(RepairError::InvalidArgument(_))
    ));
    assert!(matches!(
        topo.gpu_lane_to_memory_dword_byte(0, 16, LaneType::Dm),
        Err(RepairError::InvalidArgument(_))
    ));
    assert!(topo.gpu_lane_to_memory_dword_byte(0, 3, LaneType::Addr).is_err());
    assert!(topo.gpu_lane_to_memory_dword_byte(4, 3, LaneType::Data).is_err());
}

#[test]
fn bus_addressing() {
    let topo = Hbm2eTopology;
    assert_eq!(topo.site_channel_to_bus(2, 5).unwrap(), (10, 1));
    assert_eq!(topo.bus_to_site_channel(10, 1).unwrap(), (2, 5));
    for site in 0..MAX_SITES {
        for channel in 0..MAX_CHANNELS {
            let (bus, subp) = topo.site_channel_to_bus(site, channel).unwrap();
            assert_eq!(topo.bus_to_site_channel(bus, subp).unwrap(), (site, channel));
        }
    }
    assert!(topo.bus_to_site_channel(16, 0).is_err());
    assert!(topo.site_channel_to_bus(0, 8).is_err());
}

#[test]
fn fuse_repairs_map_back_to_gpu_lanes() {
    let topo = Hbm2eTopology;
    let lanes = topo.gpu_lane_to_fuse_repairs(1, 5, 2, 0x004E).unwrap();
    assert_eq!(lanes, vec![LaneError { bus_id: 6, lane_bit: 75, lane_type: LaneType::Data }]);
    assert!(topo.gpu_lane_to_fuse_repairs(1, 5, 2, 0x0000).unwrap().is_empty());
}

#[test]
fn link_repair_register_is_decoded() {
    let bus = Arc::new(SimBus::new());
    let topo = Hbm2eTopology;
    assert_eq!(link_repair_instance(6, 1, 2), 54);
    bus.set(LINK_REPAIR_REG, 54, 0x8000_004E);
    let lanes = topo.read_link_repairs(bus.as_ref(), 6, 1, 2).unwrap();
    assert_eq!(lanes, vec![LaneError { bus_id: 6, lane_bit: 75, lane_type: LaneType::Data }]);

    // bypass clear only warns
    bus.set(LINK_REPAIR_REG, 54, 0x0000_004E);
    assert_eq!(topo.read_link_repairs(bus.as_ref(), 6, 1, 2).unwrap().len(), 1);

    bus.set(LINK_REPAIR_REG, 54, 0x8000_00FA);
    assert!(matches!(topo.read_link_repairs(bus.as_ref(), 6, 1, 2), Err(RepairError::Decode(_))));
}

#[test]
fn link_repair_register_follows_hbm3_swizzle() {
    let bus = Arc::new(SimBus::new());
    let topo = Hbm3Topology;
    bus.set(LINK_REPAIR_REG, link_repair_instance(4, 0, 0), 0x8000_FF01);
    let lanes = topo.read_link_repairs(bus.as_ref(), 4, 0, 0).unwrap();
    assert_eq!(lanes, vec![LaneError { bus_id: 4, lane_bit: 96, lane_type: LaneType::Data }]);
}
