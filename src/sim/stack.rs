use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::base::lock::{lock_local, AccessGuard};
use crate::error::{RepairError, RepairResult};
use crate::hbm::remap::RemapCodec;
use crate::hbm::types::{Channel, Generation, Site, MAX_CHANNELS, MAX_SITES, NUM_BANKS};
use crate::mbist::spare_rows::{spare_row_scan_value, FUSED_FLAG, PSEUDO_CHANNELS, SPARE_ROWS_PER_BANK, SPARE_ROW_DWORDS};
use crate::mbist::LANE_REPAIR_BITS;
use crate::sim::config::SimConfig;
use crate::utils::{words_for, BitSlice};
use crate::wir::{check_length, Opcode, RegisterTransport, TransportKind, TransportOp, WrapperInstruction};

/// Status word reported by a finished MBIST run that found nothing.
pub const MBIST_PASS: u32 = 1;

#[derive(Default)]
struct StackState {
    /// Last data written per (site, channel, opcode).
    wdr: HashMap<(Site, u8, u8), Vec<u32>>,
    /// Spare-row scan values whose fuse has been blown, per (site, channel).
    fused: HashSet<(Site, u8, u32)>,
    mbist_status: HashMap<Site, Vec<u32>>,
    calls: HashMap<TransportOp, usize>,
    resets: HashMap<Site, usize>,
    fail_next: HashSet<TransportOp>,
}

/// Behavioural model of the wrapper registers of a whole stack.
///
/// Mimics the capability set of one of the two real transports so that
/// transport-dependent paths are exercised. A site reset drops soft repair
/// and wake state; fused rows and hard lane repairs persist.
pub struct SimulatedStack {
    mimic: TransportKind,
    codec: RemapCodec,
    lock: Mutex<()>,
    state: Mutex<StackState>,
}

const SOFT_STATE: [u8; 4] = [Opcode::SOFT_LANE_REPAIR, Opcode::SOFT_REPAIR, Opcode::TMRS, Opcode::MODE_REGISTER_DUMP_SET];

impl SimulatedStack {
    pub fn new(generation: Generation, mimic: TransportKind) -> Self {
        Self {
            mimic,
            codec: RemapCodec::new(generation),
            lock: Mutex::new(()),
            state: Mutex::new(StackState::default()),
        }
    }

    /// Transport flavour the generation is normally wired to.
    pub fn for_generation(generation: Generation) -> Self {
        let mimic = match generation {
            Generation::Hbm2e => TransportKind::JtagBitBang,
            Generation::Hbm3 => TransportKind::ShadowRegister,
        };
        Self::new(generation, mimic)
    }

    /// Blow `cfg.prefused_rows` random spare rows, reproducibly from `cfg.seed`.
    pub fn with_sim_config(self, cfg: &SimConfig, ranks: u32) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        for _ in 0..cfg.prefused_rows {
            let site = rng.gen_range(0..MAX_SITES);
            let channel = rng.gen_range(0..MAX_CHANNELS);
            let rank = rng.gen_range(0..ranks.max(1));
            let bank = rng.gen_range(0..NUM_BANKS);
            self.fuse_spare_row(site, channel, rank, bank);
        }
        info!("simulated stack: {} spare rows pre-fused (seed {})", cfg.prefused_rows, cfg.seed);
        self
    }

    fn state(&self) -> MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blow the first free spare row of a bank for both pseudo channels and
    /// both dwords. Returns false when the bank has no spare row left.
    pub fn fuse_spare_row(&self, site: Site, channel: Channel, rank: u32, bank: u32) -> bool {
        let mut state = self.state();
        let Some(spare) = Self::free_spare(&state, site, channel, rank, bank, None) else {
            return false;
        };
        for pc in 0..PSEUDO_CHANNELS {
            for dword in 0..SPARE_ROW_DWORDS {
                let scan = spare_row_scan_value(channel, pc, dword, spare, rank, bank);
                state.fused.insert((site, channel as u8, scan));
            }
        }
        true
    }

    fn free_spare(state: &StackState, site: Site, channel: Channel, rank: u32, bank: u32, dword: Option<u32>) -> Option<u32> {
        let dwords: Vec<u32> = match dword {
            Some(dword) => vec![dword],
            None => (0..SPARE_ROW_DWORDS).collect(),
        };
        (0..SPARE_ROWS_PER_BANK).find(|spare| {
            (0..PSEUDO_CHANNELS).all(|pc| {
                dwords.iter().all(|dword| {
                    let scan = spare_row_scan_value(channel, pc, *dword, *spare, rank, bank);
                    !state.fused.contains(&(site, channel as u8, scan))
                })
            })
        })
    }

    /// Status words returned by successive MBIST_STATUS reads of a site. The
    /// last word sticks.
    pub fn script_mbist_status(&self, site: Site, words: impl IntoIterator<Item = u32>) {
        self.state().mbist_status.insert(site, words.into_iter().collect());
    }

    /// Make the next call of `op` fail with a bus error.
    pub fn fail_next(&self, op: TransportOp) {
        self.state().fail_next.insert(op);
    }

    pub fn calls(&self, op: TransportOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Calls that change wrapper or fuse state.
    pub fn write_calls(&self) -> usize {
        [
            TransportOp::WriteWrapperData,
            TransportOp::WriteBypass,
            TransportOp::SelectChannel,
            TransportOp::AssertMask,
            TransportOp::ResetSite,
        ]
        .iter()
        .map(|op| self.calls(*op))
        .sum()
    }

    pub fn resets(&self, site: Site) -> usize {
        self.state().resets.get(&site).copied().unwrap_or(0)
    }

    /// Current contents of a channel's soft or hard lane repair register.
    pub fn lane_repair_words(&self, site: Site, channel: Channel, opcode: u8) -> Vec<u32> {
        let state = self.state();
        self.lane_words(&state, site, channel as u8, opcode)
    }

    /// Write lane repair data directly, as if left by an earlier run.
    pub fn preload(&self, site: Site, instr: WrapperInstruction, data: Vec<u32>) {
        self.state().wdr.insert((site, instr.channel, instr.opcode), data);
    }

    fn lane_words(&self, state: &StackState, site: Site, channel: u8, opcode: u8) -> Vec<u32> {
        state.wdr.get(&(site, channel, opcode)).cloned().unwrap_or_else(|| {
            let sentinel = self.codec.no_repair() as u32;
            vec![sentinel << 16 | sentinel; words_for(LANE_REPAIR_BITS)]
        })
    }

    fn enter(&self, op: TransportOp, site: Site) -> RepairResult<MutexGuard<'_, StackState>> {
        if !self.supports(op) {
            return Err(RepairError::unsupported(op, self.mimic));
        }
        if site >= MAX_SITES {
            return Err(RepairError::invalid(format!("site {} out of range", site)));
        }
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if state.fail_next.remove(&op) {
            return Err(anyhow!("simulated fault in {:?} on site {}", op, site).into());
        }
        Ok(state)
    }

    fn blow_row_fuse(state: &mut StackState, site: Site, channel: u8, payload: u32) {
        let rank = payload.sel(19, 18);
        let bank = payload.sel(17, 14);
        let dword = payload.sel(21, 21);
        let Some(spare) = Self::free_spare(state, site, channel as u32, rank, bank, Some(dword)) else {
            debug!("site {} ch {}: no spare row left for {:#08x}", site, channel, payload);
            return;
        };
        for pc in 0..PSEUDO_CHANNELS {
            let scan = spare_row_scan_value(channel as u32, pc, dword, spare, rank, bank);
            state.fused.insert((site, channel, scan));
        }
    }
}

impl RegisterTransport for SimulatedStack {
    fn kind(&self) -> TransportKind {
        self.mimic
    }

    fn supports(&self, op: TransportOp) -> bool {
        match self.mimic {
            TransportKind::JtagBitBang => op != TransportOp::PollWrapperIdle,
            TransportKind::ShadowRegister => !matches!(op, TransportOp::AssertMask | TransportOp::ToggleClock),
        }
    }

    fn acquire(&self) -> RepairResult<AccessGuard<'_>> {
        Ok(AccessGuard::local(lock_local(&self.lock)))
    }

    fn read_wrapper_data(&self, site: Site, instr: WrapperInstruction, length_bits: u32) -> RepairResult<Vec<u32>> {
        let mut state = self.enter(TransportOp::ReadWrapperData, site)?;
        let words = words_for(length_bits);
        let key = (site, instr.channel, instr.opcode);
        let mut data = match instr.opcode {
            Opcode::SOFT_LANE_REPAIR | Opcode::HARD_LANE_REPAIR => self.lane_words(&state, site, instr.channel, instr.opcode),
            Opcode::SPARE_ROW_QUERY => {
                let scan = state.wdr.get(&key).and_then(|d| d.first().copied()).unwrap_or(0);
                let fused = state.fused.contains(&(site, instr.channel, scan));
                vec![if fused { scan | FUSED_FLAG } else { scan }]
            }
            Opcode::MBIST_STATUS => {
                let script = state.mbist_status.entry(site).or_default();
                let word = if script.len() > 1 { script.remove(0) } else { script.first().copied().unwrap_or(MBIST_PASS) };
                vec![word]
            }
            _ => state.wdr.get(&key).cloned().unwrap_or_default(),
        };
        data.resize(words, 0);
        Ok(data)
    }

    fn write_wrapper_data(&self, site: Site, instr: WrapperInstruction, data: &[u32], length_bits: u32) -> RepairResult<()> {
        check_length(data, length_bits)?;
        let mut state = self.enter(TransportOp::WriteWrapperData, site)?;
        let data = data[..words_for(length_bits)].to_vec();
        debug!("sim site {}: {} <- {:08x?}", site, instr, data);
        if instr.opcode == Opcode::HARD_REPAIR {
            Self::blow_row_fuse(&mut state, site, instr.channel, data[0]);
        }
        state.wdr.insert((site, instr.channel, instr.opcode), data);
        Ok(())
    }

    fn write_bypass(&self, site: Site, channel: Channel) -> RepairResult<()> {
        let _state = self.enter(TransportOp::WriteBypass, site)?;
        debug!("sim site {}: bypass ch {}", site, channel);
        Ok(())
    }

    fn select_channel(&self, site: Site, channel: Channel) -> RepairResult<()> {
        let _state = self.enter(TransportOp::SelectChannel, site)?;
        debug!("sim site {}: select ch {}", site, channel);
        Ok(())
    }

    fn assert_mask(&self, site: Site) -> RepairResult<()> {
        let _state = self.enter(TransportOp::AssertMask, site)?;
        Ok(())
    }

    fn reset_site(&self, site: Site) -> RepairResult<()> {
        let mut state = self.enter(TransportOp::ResetSite, site)?;
        state.wdr.retain(|(s, _, opcode), _| *s != site || !SOFT_STATE.contains(opcode));
        state.mbist_status.remove(&site);
        *state.resets.entry(site).or_default() += 1;
        info!("sim site {}: reset", site);
        Ok(())
    }

    fn toggle_clock(&self, site: Site, cycles: u32) -> RepairResult<()> {
        let _state = self.enter(TransportOp::ToggleClock, site)?;
        debug!("sim site {}: {} wrapper clocks", site, cycles);
        Ok(())
    }

    fn poll_wrapper_idle(&self, site: Site, _blocking: bool, _timeout: Duration) -> RepairResult<()> {
        let _state = self.enter(TransportOp::PollWrapperIdle, site)?;
        Ok(())
    }
}
