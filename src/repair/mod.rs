//! Lane and row repair orchestration on top of the transports, topology and
//! vendor sequencer.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::base::bus::RegisterBus;
use crate::error::{RepairError, RepairResult};
use crate::hbm::remap::{merge, RemapCodec, RemapValue};
use crate::hbm::topology::{lane_bit_in_byte, topology_for, Topology};
use crate::hbm::types::*;
use crate::mbist::{sequencer_for, MbistPattern, MbistSequencer, MbistState, RowAddress, LANE_REPAIR_BITS};
use crate::sim::config::{HbmConfig, RepairConfig, RepairSettings, TimingConfig};
use crate::wir::jtag::ShiftOrder;
use crate::wir::{JtagBitBangEngine, Opcode, RegisterTransport, ShadowRegisterEngine, TransportKind, TransportOp, WrapperInstruction};

pub mod telemetry;
pub mod transaction;

pub use telemetry::{JsonlSink, LogSink, MemorySink, TelemetrySink};
pub use transaction::{Outcome, RepairTarget, RepairTransaction};

/// GPU-side hook run after a successful soft lane repair so the memory
/// controller stops routing traffic over the repaired lanes.
pub trait GpuHbmInterface: Send {
    fn reconfigure_lanes(&mut self, site: Site, channel: Channel, lanes: &[LaneError]) -> RepairResult<()>;
}

/// Transport wired to a generation's wrapper: bit-banged JTAG for HBM2e,
/// shadow registers for HBM3.
pub fn transport_for(generation: Generation, bus: Arc<dyn RegisterBus>) -> Arc<dyn RegisterTransport> {
    match generation {
        Generation::Hbm2e => Arc::new(JtagBitBangEngine::new(bus, ShiftOrder::MsbFirst)),
        Generation::Hbm3 => Arc::new(ShadowRegisterEngine::new(bus)),
    }
}

/// Remap value of one dword inside the 64-bit lane repair register.
fn dword_remap(words: &[u32], dword: u32) -> RemapValue {
    let word = words.get((dword / 2) as usize).copied().unwrap_or(0);
    (word >> (16 * (dword % 2))) as RemapValue
}

fn set_dword_remap(words: &mut [u32], dword: u32, value: RemapValue) {
    if let Some(word) = words.get_mut((dword / 2) as usize) {
        let shift = 16 * (dword % 2);
        *word = (*word & !(0xFFFF << shift)) | (value as u32) << shift;
    }
}

pub struct RepairOrchestrator {
    hbm: HbmConfig,
    settings: RepairSettings,
    timing: TimingConfig,
    transport: Arc<dyn RegisterTransport>,
    topology: Box<dyn Topology>,
    codec: RemapCodec,
    sequencer: Box<dyn MbistSequencer>,
    gpu: Option<Box<dyn GpuHbmInterface>>,
    telemetry: Arc<dyn TelemetrySink>,
    origin_test_id: Option<u32>,
}

impl RepairOrchestrator {
    pub fn new(config: &RepairConfig, transport: Arc<dyn RegisterTransport>) -> RepairResult<Self> {
        config.hbm.validate()?;
        let topology = topology_for(config.hbm.generation);
        let codec = topology.codec();
        let telemetry: Arc<dyn TelemetrySink> = match &config.telemetry.jsonl {
            Some(path) => Arc::new(JsonlSink::open(path).map_err(anyhow::Error::from)?),
            None => Arc::new(LogSink),
        };
        info!(
            "repair engine: {:?} {:?} over {:?} transport",
            config.hbm.generation,
            config.hbm.vendor,
            transport.kind()
        );
        Ok(Self {
            hbm: config.hbm.clone(),
            settings: config.repair,
            timing: config.timing,
            transport,
            topology,
            codec,
            sequencer: sequencer_for(config.hbm.vendor, config.timing),
            gpu: None,
            telemetry,
            origin_test_id: None,
        })
    }

    pub fn with_gpu_interface(mut self, gpu: Box<dyn GpuHbmInterface>) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn topology(&self) -> &dyn Topology {
        self.topology.as_ref()
    }

    pub fn origin_test_id(&self) -> Option<u32> {
        self.origin_test_id
    }

    fn check_site_channel(&self, site: Site, channel: Channel) -> RepairResult<()> {
        if !self.hbm.site_active(site) {
            return Err(RepairError::invalid(format!("site {} is not active", site)));
        }
        if !self.hbm.channel_available(site, channel) {
            return Err(RepairError::invalid(format!("channel {} of site {} is not available", channel, site)));
        }
        Ok(())
    }

    /// Repair one failing lane by merging its remap into the channel's lane
    /// repair register. A transaction record is emitted whatever the outcome.
    ///
    /// `pseudo_hard_repair` turns hard lane repairs into dry runs as it does
    /// for rows. `skip_fuse_repair_check` only gates the spare-row probe; the
    /// lane precondition checks are controlled by `skip_verify`.
    pub fn lane_repair(
        &mut self,
        repair: RepairType,
        skip_verify: bool,
        pseudo: bool,
        site: Site,
        channel: Channel,
        lane: &LaneError,
    ) -> RepairResult<RepairTransaction> {
        let pseudo = pseudo || (!repair.is_soft() && self.settings.pseudo_hard_repair);
        let mut tx = RepairTransaction::lane(repair, site, channel, *lane, skip_verify, pseudo);
        let start = Instant::now();
        let result = self.lane_repair_inner(&mut tx, repair, skip_verify, pseudo, site, channel, lane);
        tx.finish(&result, start.elapsed().as_micros() as u64);
        self.telemetry.emit(&tx);
        match result {
            Ok(()) => {
                info!("{} of {}: done", tx.describe(), lane);
                Ok(tx)
            }
            Err(err) => {
                error!("{} of {} failed: {}", tx.describe(), lane, err);
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lane_repair_inner(
        &mut self,
        tx: &mut RepairTransaction,
        repair: RepairType,
        skip_verify: bool,
        pseudo: bool,
        site: Site,
        channel: Channel,
        lane: &LaneError,
    ) -> RepairResult<()> {
        self.check_site_channel(site, channel)?;
        let (bus_id, _) = self.topology.site_channel_to_bus(site, channel)?;
        if bus_id != lane.bus_id {
            return Err(RepairError::invalid(format!(
                "{} does not belong to site {} channel {} (bus {})",
                lane, site, channel, bus_id
            )));
        }

        let t = Arc::clone(&self.transport);
        let _guard = t.acquire()?;

        // the shadow transport needs a clean wrapper before fuse programming
        if !repair.is_soft() && t.kind() == TransportKind::ShadowRegister && !pseudo {
            t.reset_site(site)?;
        }

        let opcode = match repair {
            RepairType::Soft => Opcode::SOFT_LANE_REPAIR,
            RepairType::Hard => Opcode::HARD_LANE_REPAIR,
        };
        let instr = WrapperInstruction::new(channel, opcode);
        let before = t.read_wrapper_data(site, instr, LANE_REPAIR_BITS)?;
        tx.before = before.clone();

        let pos = self.topology.gpu_lane_to_memory_dword_byte(site, lane.lane_bit, lane.lane_type)?;
        tx.dword = Some(pos.dword);
        tx.byte = Some(pos.byte);
        let bit = lane_bit_in_byte(lane.lane_bit, lane.lane_type);
        let remap = self.codec.lane_remap(pos.byte, bit, lane.lane_type)?;
        tx.remap_value = Some(remap.value);
        tx.remap_mask = Some(remap.field_mask);

        let mut current = dword_remap(&before, pos.dword);
        if !skip_verify {
            let repaired = self.codec.repaired_lanes(current)?;
            if repaired & remap.lane_mask == remap.lane_mask {
                return Err(RepairError::AlreadyRepaired);
            }
            if self.codec.pair_in_use(current, remap.field_mask) {
                return Err(RepairError::SpareLanesNotAvailable);
            }
        }

        merge(&mut current, remap.value, remap.field_mask);
        let mut data = before.clone();
        set_dword_remap(&mut data, pos.dword, current);
        self.sequencer.lane_repair(t.as_ref(), repair, pseudo, site, channel, &data)?;

        if repair.is_soft() && !pseudo {
            if let Some(gpu) = self.gpu.as_mut() {
                let lanes = self.topology.gpu_lane_to_fuse_repairs(site, channel, pos.dword, current)?;
                gpu.reconfigure_lanes(site, channel, &lanes)?;
            }
        }

        tx.after = if pseudo {
            before
        } else {
            t.read_wrapper_data(site, instr, LANE_REPAIR_BITS)?
        };
        Ok(())
    }

    /// Repair one failing row. Hard repairs first make sure a spare row is
    /// left unless the settings skip that check.
    pub fn row_repair(&mut self, repair: RepairType, pseudo: bool, row: &RowError) -> RepairResult<RepairTransaction> {
        self.origin_test_id = row.origin_test_id;
        let pseudo = pseudo || (!repair.is_soft() && self.settings.pseudo_hard_repair);
        let mut tx = RepairTransaction::row(repair, row, pseudo);
        let start = Instant::now();
        let result = self.row_repair_inner(&mut tx, repair, pseudo, row);
        tx.finish(&result, start.elapsed().as_micros() as u64);
        self.telemetry.emit(&tx);
        self.origin_test_id = None;
        match result {
            Ok(()) => {
                info!("{} of {}: done", tx.describe(), row);
                Ok(tx)
            }
            Err(err) => {
                error!("{} of {} failed: {}", tx.describe(), row, err);
                Err(err)
            }
        }
    }

    fn row_repair_inner(&mut self, tx: &mut RepairTransaction, repair: RepairType, pseudo: bool, row: &RowError) -> RepairResult<()> {
        let (site, channel) = self.topology.bus_to_site_channel(row.bus_id, row.subpartition)?;
        tx.site = Some(site);
        tx.channel = Some(channel);
        self.check_site_channel(site, channel)?;
        if row.rank >= self.hbm.ranks() {
            return Err(RepairError::invalid(format!(
                "rank {} out of range for stack height {}",
                row.rank, self.hbm.stack_height
            )));
        }
        let addr = RowAddress {
            site,
            rank: row.rank,
            channel,
            bank: row.bank,
            row: row.row,
        };
        addr.validate()?;

        let t = Arc::clone(&self.transport);
        let _guard = t.acquire()?;
        if !repair.is_soft() {
            if self.settings.skip_fuse_repair_check {
                warn!("{}: spare row check skipped by settings", addr);
            } else if pseudo {
                // probing writes scan values into the wrapper
                info!("{}: spare row check not run in pseudo mode", addr);
            } else {
                let available = self
                    .sequencer
                    .spare_rows_available(t.as_ref(), addr.site, addr.rank, addr.channel, addr.bank)?;
                if available == 0 {
                    return Err(RepairError::SpareRowsNotAvailable);
                }
            }
        }
        self.sequencer.row_repair(t.as_ref(), repair, pseudo, addr)
    }

    pub fn spare_rows_available(&self, site: Site, rank: u32, channel: Channel, bank: u32) -> RepairResult<u32> {
        self.check_site_channel(site, channel)?;
        let t = Arc::clone(&self.transport);
        let _guard = t.acquire()?;
        self.sequencer.spare_rows_available(t.as_ref(), site, rank, channel, bank)
    }

    pub fn was_reset_since_last_soft_repair(&self, site: Site) -> RepairResult<bool> {
        let t = Arc::clone(&self.transport);
        let _guard = t.acquire()?;
        self.sequencer.was_reset_since_last_soft_repair(t.as_ref(), site)
    }

    /// Start an MBIST pattern and poll until it finishes or `timeout` expires.
    pub fn run_mbist(&mut self, site: Site, pattern: MbistPattern, timeout: Duration) -> RepairResult<MbistState> {
        if !self.hbm.site_active(site) {
            return Err(RepairError::invalid(format!("site {} is not active", site)));
        }
        let t = Arc::clone(&self.transport);
        let _guard = t.acquire()?;
        let state = self.sequencer.start(t.as_ref(), site, pattern)?;
        if state == MbistState::Unsupported {
            return Err(RepairError::UnsupportedPattern(format!("{:?} on {:?}", pattern, self.sequencer.vendor())));
        }
        let start = Instant::now();
        if t.supports(TransportOp::PollWrapperIdle) {
            t.poll_wrapper_idle(site, true, timeout)?;
        }
        loop {
            let state = self.sequencer.poll_completion(t.as_ref(), site, pattern)?;
            if state.is_terminal() {
                info!("site {}: {:?} MBIST finished: {:?}", site, pattern, state);
                return Ok(state);
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(RepairError::Timeout { site, waited });
            }
            thread::sleep(self.timing.mbist_poll().min(timeout - waited));
        }
    }

    /// Lanes the GPU link repair register currently remaps on one bus.
    pub fn link_repairs(&self, bus: &dyn RegisterBus, bus_id: u32, subpartition: u32) -> RepairResult<Vec<LaneError>> {
        let mut lanes = Vec::new();
        for dword in 0..DWORDS_PER_CHANNEL {
            lanes.extend(self.topology.read_link_repairs(bus, bus_id, subpartition, dword)?);
        }
        Ok(lanes)
    }
}
