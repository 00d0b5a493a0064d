use crate::error::RepairError;
use crate::hbm::types::{Generation, RepairType};
use crate::mbist::*;
use crate::sim::config::TimingConfig;
use crate::sim::SimulatedStack;
use crate::wir::{Opcode, RegisterTransport, TransportKind, TransportOp, WrapperInstruction};

fn fast_timing() -> TimingConfig {
    TimingConfig {
        wake_step_us: 0,
        soft_repair_gap_us: 0,
        fuse_burn_us: 0,
        wrapper_clock_khz: 1_000_000,
        mbist_poll_us: 0,
    }
}

fn samsung() -> HbmSequencer<Samsung> {
    HbmSequencer::new(fast_timing())
}

fn addr() -> RowAddress {
    RowAddress { site: 0, rank: 1, channel: 2, bank: 5, row: 0x1234 }
}

#[test]
fn row_payload_layout() {
    let a = addr();
    assert_eq!(a.payload(), 1 << 20 | 1 << 18 | 5 << 14 | 0x1234);
    assert_eq!(a.hard_payload(1), a.payload() | 1 << 21);
    assert!(RowAddress { bank: 16, ..a }.validate().is_err());
    assert!(RowAddress { row: 1 << 14, ..a }.validate().is_err());
}

#[test]
fn spare_rows_count_down_as_fuses_blow() {
    let stack = SimulatedStack::for_generation(Generation::Hbm2e);
    let seq = samsung();
    let a = addr();
    assert_eq!(seq.spare_rows_available(&stack, a.site, a.rank, a.channel, a.bank).unwrap(), 2);
    assert!(stack.fuse_spare_row(a.site, a.channel, a.rank, a.bank));
    assert_eq!(seq.spare_rows_available(&stack, a.site, a.rank, a.channel, a.bank).unwrap(), 1);
    assert!(stack.fuse_spare_row(a.site, a.channel, a.rank, a.bank));
    assert_eq!(seq.spare_rows_available(&stack, a.site, a.rank, a.channel, a.bank).unwrap(), 0);
    assert!(!stack.fuse_spare_row(a.site, a.channel, a.rank, a.bank));
    // other banks are untouched
    assert_eq!(seq.spare_rows_available(&stack, a.site, a.rank, a.channel, a.bank + 1).unwrap(), 2);
}

#[test]
fn hard_row_repair_burns_one_spare_and_resets() {
    let stack = SimulatedStack::for_generation(Generation::Hbm2e);
    let mut seq = samsung();
    let a = addr();
    seq.hard_row_repair(&stack, false, a).unwrap();
    assert_eq!(stack.resets(a.site), 1);
    assert_eq!(stack.calls(TransportOp::WriteBypass), 2);
    assert!(stack.calls(TransportOp::ToggleClock) >= 2);
    assert_eq!(seq.spare_rows_available(&stack, a.site, a.rank, a.channel, a.bank).unwrap(), 1);
}

#[test]
fn shadow_stack_waits_instead_of_clocking() {
    let stack = SimulatedStack::for_generation(Generation::Hbm3);
    let mut seq = samsung();
    seq.hard_row_repair(&stack, false, addr()).unwrap();
    assert_eq!(stack.calls(TransportOp::ToggleClock), 0);
    assert_eq!(stack.resets(0), 1);
}

#[test]
fn pseudo_hard_repair_leaves_fuses_alone() {
    let stack = SimulatedStack::for_generation(Generation::Hbm2e);
    let mut seq = samsung();
    let a = addr();
    seq.row_repair(&stack, RepairType::Hard, true, a).unwrap();
    seq.lane_repair(&stack, RepairType::Hard, true, 0, 2, &[0, 0]).unwrap();
    assert_eq!(stack.write_calls(), 0);
    assert_eq!(stack.resets(a.site), 0);
    assert_eq!(seq.spare_rows_available(&stack, a.site, a.rank, a.channel, a.bank).unwrap(), 2);
}

#[test]
fn site_reset_runs_even_when_programming_fails() {
    let stack = SimulatedStack::for_generation(Generation::Hbm2e);
    let mut seq = samsung();
    stack.fail_next(TransportOp::WriteWrapperData);
    let result = seq.hard_row_repair(&stack, false, addr());
    assert!(matches!(result, Err(RepairError::Bus(_))));
    assert_eq!(stack.resets(0), 1);

    stack.fail_next(TransportOp::ResetSite);
    assert!(matches!(seq.hard_row_repair(&stack, false, addr()), Err(RepairError::Bus(_))));
}

#[test]
fn soft_repair_wakes_once_and_detects_reset() {
    let stack = SimulatedStack::for_generation(Generation::Hbm3);
    let mut seq = samsung();
    let a = addr();
    assert!(!seq.was_reset_since_last_soft_repair(&stack, a.site).unwrap());

    seq.soft_row_repair(&stack, a).unwrap();
    // three TMRS writes, one MRDS write, payload twice
    assert_eq!(stack.calls(TransportOp::WriteWrapperData), 6);
    assert!(!seq.was_reset_since_last_soft_repair(&stack, a.site).unwrap());

    seq.soft_row_repair(&stack, RowAddress { row: 0x42, ..a }).unwrap();
    assert_eq!(stack.calls(TransportOp::WriteWrapperData), 8);

    stack.reset_site(a.site).unwrap();
    assert!(seq.was_reset_since_last_soft_repair(&stack, a.site).unwrap());
    seq.soft_row_repair(&stack, a).unwrap();
    assert_eq!(stack.calls(TransportOp::WriteWrapperData), 14);
    assert!(!seq.was_reset_since_last_soft_repair(&stack, a.site).unwrap());
}

#[test]
fn skhynix_wake_values_are_read_back() {
    let stack = SimulatedStack::for_generation(Generation::Hbm2e);
    let mut seq = HbmSequencer::<SkHynix>::new(fast_timing());
    seq.soft_row_repair(&stack, addr()).unwrap();
    let tmrs = stack
        .read_wrapper_data(0, WrapperInstruction::broadcast(Opcode::TMRS), SkHynix::TMRS_BITS)
        .unwrap();
    assert_eq!(tmrs, vec![SkHynix::WAKE_TMRS[2]]);
    assert!(!seq.was_reset_since_last_soft_repair(&stack, 0).unwrap());
}

#[test]
fn hard_lane_repair_survives_reset() {
    let stack = SimulatedStack::new(Generation::Hbm2e, TransportKind::JtagBitBang);
    let mut seq = samsung();
    seq.lane_repair(&stack, RepairType::Soft, false, 1, 3, &[0x4E, 0]).unwrap();
    seq.lane_repair(&stack, RepairType::Hard, false, 1, 3, &[0, 0xF100]).unwrap();
    assert_eq!(stack.resets(1), 1);
    assert_eq!(stack.lane_repair_words(1, 3, Opcode::HARD_LANE_REPAIR), vec![0, 0xF100]);
    assert_eq!(stack.lane_repair_words(1, 3, Opcode::SOFT_LANE_REPAIR), vec![0, 0]);
    assert!(matches!(
        seq.lane_repair(&stack, RepairType::Soft, false, 1, 3, &[0]),
        Err(RepairError::InvalidArgument(_))
    ));
}

#[test]
fn mbist_runs_to_completion() {
    let stack = SimulatedStack::for_generation(Generation::Hbm2e);
    let mut seq = samsung();
    assert_eq!(seq.state(0), MbistState::Idle);
    assert_eq!(seq.start(&stack, 0, MbistPattern::MarchC).unwrap(), MbistState::Running);
    stack.script_mbist_status(0, [0, 1 | 0b11 << 2]);
    assert_eq!(seq.poll_completion(&stack, 0, MbistPattern::MarchC).unwrap(), MbistState::Incomplete);
    assert_eq!(seq.state(0), MbistState::Running);
    let done = seq.poll_completion(&stack, 0, MbistPattern::MarchC).unwrap();
    assert_eq!(done, MbistState::Complete { repairable: true, bad_rows: 3 });
    assert!(done.is_terminal());
    assert_eq!(seq.state(0), done);
}

#[test]
fn retention_pattern_is_not_implemented() {
    let stack = SimulatedStack::for_generation(Generation::Hbm2e);
    let mut seq = samsung();
    assert_eq!(seq.start(&stack, 0, MbistPattern::Retention).unwrap(), MbistState::Unsupported);
    assert_eq!(stack.write_calls(), 0);
    assert_eq!(sequencer_for(crate::hbm::types::Vendor::Skhynix, fast_timing()).vendor(), crate::hbm::types::Vendor::Skhynix);
}
