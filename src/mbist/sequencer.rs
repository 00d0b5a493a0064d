use std::collections::HashMap;
use std::marker::PhantomData;
use std::thread;
use std::time::Duration;

use log::{debug, error, info};

use crate::error::{RepairError, RepairResult};
use crate::hbm::types::{Channel, RepairType, Site, Vendor};
use crate::mbist::spare_rows::{spare_row_scan_value, FUSED_FLAG, PSEUDO_CHANNELS, SPARE_ROWS_PER_BANK, SPARE_ROW_DWORDS};
use crate::mbist::vendor::VendorProtocol;
use crate::mbist::*;
use crate::sim::config::TimingConfig;
use crate::wir::{Opcode, RegisterTransport, TransportOp, WrapperInstruction};

/// MBIST and repair sequences for one memory vendor.
pub struct HbmSequencer<V: VendorProtocol> {
    timing: TimingConfig,
    states: HashMap<Site, MbistState>,
    /// Last TMRS value written by the wake sequence, per site.
    wake: HashMap<Site, u32>,
    _vendor: PhantomData<V>,
}

impl<V: VendorProtocol> HbmSequencer<V> {
    pub fn new(timing: TimingConfig) -> Self {
        Self {
            timing,
            states: HashMap::new(),
            wake: HashMap::new(),
            _vendor: PhantomData,
        }
    }

    /// Clock the wrapper where the transport can, otherwise wait it out.
    fn settle(&self, t: &dyn RegisterTransport, site: Site, cycles: u32, fallback: Duration) -> RepairResult<()> {
        if t.supports(TransportOp::ToggleClock) {
            t.toggle_clock(site, cycles)
        } else {
            thread::sleep(fallback);
            Ok(())
        }
    }

    /// Three TMRS writes and one MRDS write, each followed by the wake delay.
    fn wake_up(&mut self, t: &dyn RegisterTransport, site: Site) -> RepairResult<()> {
        info!("site {}: soft repair wake sequence", site);
        let tmrs = WrapperInstruction::broadcast(Opcode::TMRS);
        for value in V::WAKE_TMRS {
            t.write_wrapper_data(site, tmrs, &[value], V::TMRS_BITS)?;
            thread::sleep(self.timing.wake_step());
        }
        let mrds = WrapperInstruction::broadcast(Opcode::MODE_REGISTER_DUMP_SET);
        t.write_wrapper_data(site, mrds, &[V::WAKE_MRDS], V::MRDS_BITS)?;
        thread::sleep(self.timing.wake_step());
        self.wake.insert(site, V::WAKE_TMRS[V::WAKE_TMRS.len() - 1]);
        Ok(())
    }

    fn probe_spare_row(&self, t: &dyn RegisterTransport, site: Site, channel: Channel, scan: u32) -> RepairResult<bool> {
        let instr = WrapperInstruction::new(channel, Opcode::SPARE_ROW_QUERY);
        t.write_wrapper_data(site, instr, &[scan], 32)?;
        self.settle(t, site, V::SPARE_ROW_SETTLE_CYCLES, self.timing.wrapper_cycles(V::SPARE_ROW_SETTLE_CYCLES))?;
        let readback = t.read_wrapper_data(site, instr, 32)?;
        let fused = readback.first().copied() == Some(scan | FUSED_FLAG);
        debug!("site {} ch {}: spare probe {:#010x} -> {:?} (fused {})", site, channel, scan, readback, fused);
        Ok(fused)
    }
}

/// Run `program`, then reset the site no matter how `program` ended. The
/// first error wins; a reset failure is reported when programming succeeded.
pub fn with_site_reset<F>(t: &dyn RegisterTransport, site: Site, program: F) -> RepairResult<()>
where
    F: FnOnce() -> RepairResult<()>,
{
    let programmed = program();
    let reset = t.reset_site(site);
    if let Err(err) = &reset {
        error!("site {}: mandatory reset after fuse programming failed: {}", site, err);
    }
    programmed.and(reset)
}

impl<V: VendorProtocol> MbistSequencer for HbmSequencer<V> {
    fn vendor(&self) -> Vendor {
        V::VENDOR
    }

    fn state(&self, site: Site) -> MbistState {
        self.states.get(&site).copied().unwrap_or(MbistState::Idle)
    }

    fn start(&mut self, t: &dyn RegisterTransport, site: Site, pattern: MbistPattern) -> RepairResult<MbistState> {
        let state = match V::mbist_payload(pattern) {
            None => {
                info!("site {}: {:?} MBIST not implemented for {:?}", site, pattern, V::VENDOR);
                MbistState::Unsupported
            }
            Some(payload) => {
                let instr = WrapperInstruction::broadcast(Opcode::MBIST);
                t.write_wrapper_data(site, instr, &payload, V::MBIST_PAYLOAD_BITS)?;
                info!("site {}: {:?} MBIST started", site, pattern);
                MbistState::Running
            }
        };
        self.states.insert(site, state);
        Ok(state)
    }

    fn poll_completion(&mut self, t: &dyn RegisterTransport, site: Site, pattern: MbistPattern) -> RepairResult<MbistState> {
        if V::mbist_payload(pattern).is_none() {
            return Ok(MbistState::Unsupported);
        }
        let status = t.read_wrapper_data(site, WrapperInstruction::broadcast(Opcode::MBIST_STATUS), MBIST_STATUS_BITS)?;
        let word = status.first().copied().unwrap_or(0);
        let state = V::STATUS.decode(word);
        debug!("site {}: MBIST status {:#010x} -> {:?}", site, word, state);
        if state != MbistState::Incomplete {
            self.states.insert(site, state);
        }
        Ok(state)
    }

    fn spare_rows_available(&self, t: &dyn RegisterTransport, site: Site, rank: u32, channel: Channel, bank: u32) -> RepairResult<u32> {
        let mut available = 0;
        for spare in 0..SPARE_ROWS_PER_BANK {
            let mut fused = false;
            for pc in 0..PSEUDO_CHANNELS {
                for dword in 0..SPARE_ROW_DWORDS {
                    let scan = spare_row_scan_value(channel, pc, dword, spare, rank, bank);
                    fused |= self.probe_spare_row(t, site, channel, scan)?;
                }
            }
            if !fused {
                available += 1;
            }
        }
        info!("site {} ch {} rank {} bank {}: {} spare rows available", site, channel, rank, bank, available);
        Ok(available)
    }

    fn soft_row_repair(&mut self, t: &dyn RegisterTransport, addr: RowAddress) -> RepairResult<()> {
        addr.validate()?;
        let awake = self.wake.contains_key(&addr.site) && !self.was_reset_since_last_soft_repair(t, addr.site)?;
        if !awake {
            self.wake_up(t, addr.site)?;
        }
        let instr = WrapperInstruction::new(addr.channel, Opcode::SOFT_REPAIR);
        let payload = addr.payload();
        info!("{}: soft row repair payload {:#08x}", addr, payload);
        t.write_wrapper_data(addr.site, instr, &[payload], ROW_REPAIR_BITS)?;
        thread::sleep(self.timing.soft_repair_gap());
        t.write_wrapper_data(addr.site, instr, &[payload], ROW_REPAIR_BITS)
    }

    fn hard_row_repair(&mut self, t: &dyn RegisterTransport, pseudo: bool, addr: RowAddress) -> RepairResult<()> {
        addr.validate()?;
        let instr = WrapperInstruction::new(addr.channel, Opcode::HARD_REPAIR);
        if pseudo {
            for dword in 0..SPARE_ROW_DWORDS {
                info!("{}: pseudo hard repair dword {} payload {:#08x} (not written)", addr, dword, addr.hard_payload(dword));
            }
            return Ok(());
        }
        let result = with_site_reset(t, addr.site, || {
            for dword in 0..SPARE_ROW_DWORDS {
                let payload = addr.hard_payload(dword);
                info!("{}: hard repair dword {} payload {:#08x}", addr, dword, payload);
                t.write_wrapper_data(addr.site, instr, &[payload], HARD_ROW_REPAIR_BITS)?;
                self.settle(t, addr.site, V::FUSE_BURN_CYCLES, self.timing.fuse_burn())?;
                t.write_bypass(addr.site, addr.channel)?;
            }
            Ok(())
        });
        // the reset also dropped any soft repair state
        self.wake.remove(&addr.site);
        result
    }

    fn lane_repair(&mut self, t: &dyn RegisterTransport, repair: RepairType, pseudo: bool, site: Site, channel: Channel, data: &[u32]) -> RepairResult<()> {
        if data.len() * 32 < LANE_REPAIR_BITS as usize {
            return Err(RepairError::invalid(format!("lane repair needs {} bits", LANE_REPAIR_BITS)));
        }
        let opcode = match repair {
            RepairType::Soft => Opcode::SOFT_LANE_REPAIR,
            RepairType::Hard => Opcode::HARD_LANE_REPAIR,
        };
        let instr = WrapperInstruction::new(channel, opcode);
        if pseudo {
            info!("site {} ch {}: pseudo {:?} lane repair {:08x?} (not written)", site, channel, repair, data);
            return Ok(());
        }
        match repair {
            RepairType::Soft => t.write_wrapper_data(site, instr, data, LANE_REPAIR_BITS),
            RepairType::Hard => {
                let result = with_site_reset(t, site, || {
                    t.write_wrapper_data(site, instr, data, LANE_REPAIR_BITS)?;
                    self.settle(t, site, V::FUSE_BURN_CYCLES, self.timing.fuse_burn())?;
                    t.write_bypass(site, channel)
                });
                self.wake.remove(&site);
                result
            }
        }
    }

    fn was_reset_since_last_soft_repair(&self, t: &dyn RegisterTransport, site: Site) -> RepairResult<bool> {
        let Some(expected) = self.wake.get(&site).copied() else {
            return Ok(false);
        };
        let tmrs = t.read_wrapper_data(site, WrapperInstruction::broadcast(Opcode::TMRS), V::TMRS_BITS)?;
        let current = tmrs.first().copied().unwrap_or(0);
        Ok(current != expected)
    }
}
