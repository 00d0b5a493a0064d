use crate::error::{DecodeError, RepairError};
use crate::hbm::remap::{merge, RemapCodec, RemapEntry, LANE_SLOTS_PER_BYTE};
use crate::hbm::types::{Generation, LaneType};

fn entries(codec: &RemapCodec, value: u16) -> Vec<(u8, LaneType)> {
    codec
        .decode(value)
        .unwrap()
        .iter()
        .map(|e| (e.offset, e.lane_type))
        .collect()
}

#[test]
fn no_repair_sentinels_decode_empty() {
    assert!(RemapCodec::new(Generation::Hbm2e).decode(0x0000).unwrap().is_empty());
    assert!(RemapCodec::new(Generation::Hbm3).decode(0xFFFF).unwrap().is_empty());
}

#[test]
fn upper_byte_dm_in_first_pair() {
    let codec = RemapCodec::new(Generation::Hbm2e);
    assert_eq!(entries(&codec, 0x000E), vec![(8, LaneType::Dm)]);
}

#[test]
fn hbm2e_truth_table() {
    let codec = RemapCodec::new(Generation::Hbm2e);
    assert_eq!(entries(&codec, 0x00F1), vec![(0, LaneType::Data)]);
    assert_eq!(entries(&codec, 0x00F9), vec![(0, LaneType::Dbi)]);
    assert_eq!(entries(&codec, 0x008E), vec![(15, LaneType::Data)]);
    assert_eq!(entries(&codec, 0xF500), vec![(20, LaneType::Data)]);
    assert_eq!(entries(&codec, 0x3EF1), vec![(0, LaneType::Data), (26, LaneType::Data)]);
}

#[test]
fn hbm3_truth_table() {
    let codec = RemapCodec::new(Generation::Hbm3);
    assert_eq!(entries(&codec, 0xFF01), vec![(0, LaneType::Data)]);
    assert_eq!(entries(&codec, 0xFF00), vec![(0, LaneType::Dm)]);
    assert_eq!(entries(&codec, 0xFF9E), vec![(8, LaneType::Dbi)]);
    assert_eq!(entries(&codec, 0x08FF), vec![(23, LaneType::Data)]);
}

#[test]
fn reserved_type_codes_are_rejected() {
    let codec = RemapCodec::new(Generation::Hbm2e);
    for code in 10u8..=15 {
        let upper = ((code as u16) << 4) | 0xE;
        assert_eq!(
            codec.decode(upper),
            Err(DecodeError::UnsupportedEncoding { value: upper, byte_pair: 0, type_code: code })
        );
        assert!(codec.decode(0xF0 | code as u16).is_err());
        assert!(codec.decode((upper << 8) | 0x00F1).is_err());
    }
}

#[test]
fn lower_byte_with_foreign_fill_is_rejected() {
    let hbm2e = RemapCodec::new(Generation::Hbm2e);
    assert_eq!(hbm2e.decode(0x0001), Err(DecodeError::UnexpectedFill { value: 0x0001, byte_pair: 0, fill: 0 }));
    assert_eq!(hbm2e.decode(0x3100), Err(DecodeError::UnexpectedFill { value: 0x3100, byte_pair: 1, fill: 3 }));
    let hbm3 = RemapCodec::new(Generation::Hbm3);
    assert_eq!(hbm3.decode(0xFFF1), Err(DecodeError::UnexpectedFill { value: 0xFFF1, byte_pair: 0, fill: 0xF }));
}

#[test]
fn every_decodable_value_round_trips() {
    for generation in [Generation::Hbm2e, Generation::Hbm3] {
        let codec = RemapCodec::new(generation);
        let mut decodable = 0;
        for value in 0..=u16::MAX {
            let Ok(decoded) = codec.decode(value) else {
                continue;
            };
            decodable += 1;
            assert_eq!(decoded.is_empty(), value == codec.no_repair(), "{:?} {:#06x}", generation, value);
            assert_eq!(codec.encode(&decoded).unwrap(), value, "{:?} {:#06x}", generation, value);
        }
        // per pair: no repair, 16 DATA, 2 DM, 2 DBI
        assert_eq!(decodable, 21 * 21, "{:?}", generation);
    }
}

#[test]
fn encode_rejects_two_repairs_in_one_pair() {
    let codec = RemapCodec::new(Generation::Hbm2e);
    let conflict = [
        RemapEntry { offset: 0, lane_type: LaneType::Data },
        RemapEntry { offset: 8, lane_type: LaneType::Dm },
    ];
    assert!(matches!(
        codec.encode(&conflict),
        Err(RepairError::Decode(DecodeError::PairConflict { byte_pair: 0 }))
    ));
}

#[test]
fn lane_remap_values_and_masks() {
    let codec = RemapCodec::new(Generation::Hbm2e);
    let remap = codec.lane_remap(1, 3, LaneType::Data).unwrap();
    assert_eq!(remap.value, 0x004E);
    assert_eq!(remap.field_mask, 0x00FF);
    assert_eq!(remap.lane_mask, 1 << (LANE_SLOTS_PER_BYTE + 3));

    let remap = codec.lane_remap(2, 5, LaneType::Dm).unwrap();
    assert_eq!(remap.value, 0xF000);
    assert_eq!(remap.field_mask, 0xFF00);
    assert_eq!(remap.lane_mask, 1 << (2 * LANE_SLOTS_PER_BYTE + 8));

    let hbm3 = RemapCodec::new(Generation::Hbm3).lane_remap(3, 0, LaneType::Dbi).unwrap();
    assert_eq!(hbm3.value, 0x9EFF);

    assert!(matches!(codec.lane_remap(0, 0, LaneType::Addr), Err(RepairError::InvalidArgument(_))));
    assert!(matches!(codec.lane_remap(4, 0, LaneType::Data), Err(RepairError::InvalidArgument(_))));
}

#[test]
fn repaired_lanes_keep_dm_apart_from_data_zero() {
    let codec = RemapCodec::new(Generation::Hbm2e);
    let data0 = codec.lane_remap(0, 0, LaneType::Data).unwrap();
    let dm0 = codec.lane_remap(0, 0, LaneType::Dm).unwrap();
    let repaired = codec.repaired_lanes(data0.value).unwrap();
    assert_eq!(repaired & data0.lane_mask, data0.lane_mask);
    assert_eq!(repaired & dm0.lane_mask, 0);
}

#[test]
fn merge_replaces_only_the_masked_pair() {
    let codec = RemapCodec::new(Generation::Hbm2e);
    let mut value = 0x004E;
    assert!(codec.pair_in_use(value, 0x00FF));
    assert!(!codec.pair_in_use(value, 0xFF00));
    merge(&mut value, 0xF000, 0xFF00);
    assert_eq!(value, 0xF04E);

    let mut existing = 0x3E00;
    let remap = codec.encode_into(&mut existing, 0, 0, LaneType::Data).unwrap();
    assert_eq!(remap.value, 0x00F1);
    assert_eq!(existing, 0x3EF1);
}
