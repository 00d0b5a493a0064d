use std::sync::Arc;
use std::time::Duration;

use crate::base::lock::{owner_token, HW_MUTEX_REG};
use crate::error::RepairError;
use crate::sim::{BusAccess, SimBus};
use crate::wir::shadow::*;
use crate::wir::{Opcode, RegisterTransport, TransportKind, TransportOp, WrapperInstruction};

fn engine() -> (Arc<SimBus>, ShadowRegisterEngine) {
    let bus = Arc::new(SimBus::new());
    let engine = ShadowRegisterEngine::new(bus.clone());
    (bus, engine)
}

#[test]
fn write_programs_instruction_length_and_masked_words() {
    let (bus, engine) = engine();
    let instr = WrapperInstruction::new(1, Opcode::MBIST);
    engine.write_wrapper_data(2, instr, &[0xDEAD_BEEF, 0xFFFF_FF12], 40).unwrap();
    assert_eq!(bus.writes_to(WIR_INSTR_REG), vec![instr.packed()]);
    assert_eq!(bus.writes_to(WDR_LENGTH_REG), vec![40]);
    assert_eq!(bus.writes_to(WDR_DATA_REG), vec![0xDEAD_BEEF, 0x12]);
    assert!(bus.writes().iter().all(|(_, instance, _)| *instance == 2));

    // every write is followed by a privilege status read
    let accesses = bus.accesses();
    for (i, access) in accesses.iter().enumerate() {
        if let BusAccess::Write { .. } = access {
            assert!(matches!(
                accesses.get(i + 1),
                Some(BusAccess::Read { reg, .. }) if reg == PRIV_STATUS_REG
            ));
        }
    }
}

#[test]
fn read_shifts_the_final_partial_word() {
    let (bus, engine) = engine();
    bus.queue_reads(WDR_DATA_REG, 0, [0x1111_2222, 0xAB00_0000]);
    let data = engine.read_wrapper_data(0, WrapperInstruction::broadcast(Opcode::DEVICE_ID), 40).unwrap();
    assert_eq!(data, vec![0x1111_2222, 0xAB]);

    bus.queue_reads(WDR_DATA_REG, 0, [0x8000_0000]);
    let data = engine.read_wrapper_data(0, WrapperInstruction::broadcast(Opcode::DEVICE_ID), 1).unwrap();
    assert_eq!(data, vec![1]);
}

#[test]
fn privilege_violation_stops_the_access() {
    let (bus, engine) = engine();
    bus.set(PRIV_STATUS_REG, 1, HBM3_PRIV_VIOLATION);
    let result = engine.write_wrapper_data(1, WrapperInstruction::new(0, Opcode::SOFT_LANE_REPAIR), &[0, 0], 64);
    assert!(matches!(
        result,
        Err(RepairError::PrivilegeViolation { site: 1, status: HBM3_PRIV_VIOLATION })
    ));
    assert!(bus.writes_to(WDR_DATA_REG).is_empty());
    assert!(matches!(engine.reset_site(1), Err(RepairError::PrivilegeViolation { .. })));
}

#[test]
fn custom_privilege_code() {
    let bus = Arc::new(SimBus::new());
    let engine = ShadowRegisterEngine::with_priv_code(bus.clone(), 0xDEAD);
    bus.set(PRIV_STATUS_REG, 0, HBM3_PRIV_VIOLATION);
    assert!(engine.select_channel(0, 3).is_ok());
    bus.set(PRIV_STATUS_REG, 0, 0xDEAD);
    assert!(engine.select_channel(0, 3).is_err());
}

#[test]
fn poll_times_out_on_a_busy_wrapper() {
    let (bus, engine) = engine();
    bus.set(WIR_STATUS_REG, 0, 1);
    let err = engine.poll_wrapper_idle(0, false, Duration::from_secs(1)).unwrap_err();
    assert!(matches!(err, RepairError::Timeout { site: 0, .. }));
    assert!(err.is_retryable());

    let timeout = Duration::from_millis(2);
    match engine.poll_wrapper_idle(0, true, timeout) {
        Err(RepairError::Timeout { waited, .. }) => assert!(waited >= timeout),
        other => panic!("expected timeout, got {:?}", other),
    }
}

#[test]
fn poll_returns_once_idle() {
    let (bus, engine) = engine();
    bus.queue_reads(WIR_STATUS_REG, 3, [1, 1, 0]);
    engine.poll_wrapper_idle(3, true, Duration::from_secs(1)).unwrap();
    let polls = bus
        .accesses()
        .iter()
        .filter(|a| matches!(a, BusAccess::Read { reg, .. } if reg == WIR_STATUS_REG))
        .count();
    assert_eq!(polls, 3);
}

#[test]
fn reset_pulses_the_site_reset_register() {
    let (bus, engine) = engine();
    engine.reset_site(3).unwrap();
    assert_eq!(bus.writes(), vec![(SITE_RESET_REG.to_string(), 3, 1), (SITE_RESET_REG.to_string(), 3, 0)]);
}

#[test]
fn hardware_mutex_is_taken_and_released() {
    let (bus, engine) = engine();
    // another owner holds the mutex for two polls
    bus.queue_reads(HW_MUTEX_REG, 0, [0x77, 0x77]);
    {
        let guard = engine.acquire().unwrap();
        assert!(guard.holds_hw_mutex());
        assert_eq!(bus.get(HW_MUTEX_REG, 0), owner_token());
    }
    assert_eq!(bus.writes_to(HW_MUTEX_REG), vec![owner_token(), 0]);
}

#[test]
fn capabilities() {
    let (_bus, engine) = engine();
    assert_eq!(engine.kind(), TransportKind::ShadowRegister);
    assert!(engine.supports(TransportOp::PollWrapperIdle));
    assert!(!engine.supports(TransportOp::AssertMask));
    assert!(matches!(
        engine.toggle_clock(0, 600),
        Err(RepairError::Unsupported { op: TransportOp::ToggleClock, transport: TransportKind::ShadowRegister })
    ));
    assert!(matches!(engine.select_channel(0, 8), Err(RepairError::InvalidArgument(_))));
    assert!(matches!(
        engine.write_wrapper_data(0, WrapperInstruction::broadcast(Opcode::TMRS), &[0], 33),
        Err(RepairError::InvalidArgument(_))
    ));
}
