//! Wrapper access through the host-to-JTAG bridge.
//!
//! Every wrapper operation is a fixed sequence of scan-vector writes. The bus
//! accepts any vector silently, so the order below is the protocol: a
//! reordered sequence latches the wrong instruction or data without error.
//!
//! 1. instruction chain: bypass every site except the target
//! 2. mask chain: enable the target's scan path
//! 3. `INIT`, then five `WCLK` toggles to settle
//! 4. `SELECT` + one `WCLK` pulse
//! 5. shift the 12-bit instruction, one `WSI` level + `WCLK` pulse per bit
//! 6. `SELECT|WCLK`, then `INSTR_UPDATE` to latch
//! 7. read: `DATA_CAPTURE`, then shift out one sampled bit per `WCLK`
//! 8. write: shift in data bits, two `DATA_UPDATE` pulses, trailing clocks
//! 9. mask chain cleared (always, see [`MaskGuard`])

use std::sync::{Arc, Mutex};

use log::{debug, error};
use num_derive::FromPrimitive;

use crate::base::bus::RegisterBus;
use crate::base::lock::{lock_local, AccessGuard};
use crate::error::{RepairError, RepairResult};
use crate::hbm::types::{Channel, Site, MAX_CHANNELS, MAX_SITES};
use crate::utils::{set_word_bit, word_bit, words_for, BitSlice};
use crate::wir::{check_length, Opcode, RegisterTransport, TransportKind, TransportOp, WrapperInstruction};

pub const H2J_CHAIN_CFG: &str = "H2J_CHAIN_CFG";
pub const H2J_CHAIN_DATA: &str = "H2J_CHAIN_DATA";
pub const H2J_CHAIN_CTRL: &str = "H2J_CHAIN_CTRL";

pub const CTRL_SHIFT_IN: u32 = 1;
pub const CTRL_CAPTURE: u32 = 2;

/// Composite control word flags driven through the control chain.
#[derive(Debug)]
pub struct Ctl;
impl Ctl {
    pub const INIT: u32 = 1 << 0;
    pub const SELECT: u32 = 1 << 1;
    pub const WCLK: u32 = 1 << 2;
    pub const DATA_CAPTURE: u32 = 1 << 3;
    pub const INSTR_UPDATE: u32 = 1 << 4;
    pub const DATA_UPDATE: u32 = 1 << 5;
    pub const WSI_0: u32 = 1 << 6;
    pub const WSI_1: u32 = 1 << 7;

    pub fn wsi(bit: bool) -> u32 {
        if bit {
            Self::WSI_1
        } else {
            Self::WSI_0
        }
    }
}

#[derive(Debug, FromPrimitive, Clone, Copy, PartialEq, Eq)]
pub enum ScanChain {
    Instruction = 0,
    Mask = 1,
    Control = 2,
    Readback = 3,
}

/// Control chain length per site index.
pub const CONTROL_CHAIN_LEN: [u32; MAX_SITES as usize] = [22, 26, 30, 34];
pub const SITE_CHAIN_LEN: u32 = MAX_SITES;
pub const READBACK_CHAIN_LEN: u32 = 32;
const ALL_SITES: u32 = (1 << MAX_SITES) - 1;
const SETTLE_TOGGLES: u32 = 5;
const TRAILING_TOGGLES: u32 = 3;

impl ScanChain {
    pub fn length(self, site: Site) -> u32 {
        match self {
            ScanChain::Instruction | ScanChain::Mask => SITE_CHAIN_LEN,
            ScanChain::Control => CONTROL_CHAIN_LEN[site as usize],
            ScanChain::Readback => READBACK_CHAIN_LEN,
        }
    }

    pub fn config_word(self, site: Site) -> u32 {
        self as u32 | (self.length(site) << 8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOrder {
    MsbFirst,
    LsbFirst,
}

/// Read-path channel permutation compensating the bridge's channel-select
/// wiring. Applied on reads only; writes use the channel as given.
const READ_CHANNEL_FIX: [u8; MAX_CHANNELS as usize] = [0, 1, 2, 3, 5, 4, 7, 6];

pub fn channel_select_fix_on_read(channel: u8) -> u8 {
    READ_CHANNEL_FIX.get(channel as usize).copied().unwrap_or(channel)
}

static BRIDGE_LOCK: Mutex<()> = Mutex::new(());

pub struct JtagBitBangEngine {
    bus: Arc<dyn RegisterBus>,
    instr_order: ShiftOrder,
}

/// Clears the site's mask bit when the transaction scope ends, on every exit
/// path. A mask bit left set corrupts the next transaction.
pub struct MaskGuard<'a> {
    engine: &'a JtagBitBangEngine,
    site: Site,
}

impl Drop for MaskGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.engine.scan(ScanChain::Mask, self.site, 0) {
            error!("site {}: failed to clear scan mask: {}", self.site, err);
        }
    }
}

impl JtagBitBangEngine {
    pub fn new(bus: Arc<dyn RegisterBus>, instr_order: ShiftOrder) -> Self {
        Self { bus, instr_order }
    }

    fn check_site(site: Site) -> RepairResult<()> {
        if site >= MAX_SITES {
            return Err(RepairError::invalid(format!("site {} out of range", site)));
        }
        Ok(())
    }

    /// One primitive scan-vector write.
    fn scan(&self, chain: ScanChain, site: Site, value: u32) -> RepairResult<()> {
        self.bus.write32(H2J_CHAIN_CFG, 0, chain.config_word(site))?;
        self.bus.write32(H2J_CHAIN_DATA, 0, value)?;
        self.bus.write32(H2J_CHAIN_CTRL, 0, CTRL_SHIFT_IN)?;
        Ok(())
    }

    fn ctrl(&self, site: Site, flags: u32) -> RepairResult<()> {
        self.scan(ScanChain::Control, site, flags)
    }

    fn pulse(&self, site: Site, flags: u32) -> RepairResult<()> {
        self.ctrl(site, flags | Ctl::WCLK)?;
        self.ctrl(site, flags)
    }

    /// Wrapper serial output of `site`, sampled through the read-back chain.
    fn sample(&self, site: Site) -> RepairResult<bool> {
        self.bus.write32(H2J_CHAIN_CFG, 0, ScanChain::Readback.config_word(site))?;
        self.bus.write32(H2J_CHAIN_CTRL, 0, CTRL_CAPTURE)?;
        let word = self.bus.read32(H2J_CHAIN_DATA, 0)?;
        Ok(word.bit(site))
    }

    /// Phases 1 and 2: route the scan path to `site`.
    fn open(&self, site: Site) -> RepairResult<MaskGuard<'_>> {
        Self::check_site(site)?;
        self.scan(ScanChain::Instruction, site, ALL_SITES & !(1 << site))?;
        let guard = MaskGuard { engine: self, site };
        self.scan(ScanChain::Mask, site, 1 << site)?;
        Ok(guard)
    }

    /// Phase 3.
    fn settle(&self, site: Site) -> RepairResult<()> {
        self.ctrl(site, Ctl::INIT)?;
        for _ in 0..SETTLE_TOGGLES {
            self.pulse(site, Ctl::INIT)?;
        }
        Ok(())
    }

    /// Phases 4 to 6.
    fn shift_instruction(&self, site: Site, instr: WrapperInstruction) -> RepairResult<()> {
        self.ctrl(site, Ctl::SELECT)?;
        self.ctrl(site, Ctl::SELECT | Ctl::WCLK)?;
        let packed = instr.packed();
        for i in 0..WrapperInstruction::BITS {
            let idx = match self.instr_order {
                ShiftOrder::MsbFirst => WrapperInstruction::BITS - 1 - i,
                ShiftOrder::LsbFirst => i,
            };
            let wsi = Ctl::wsi(packed.bit(idx));
            self.ctrl(site, Ctl::SELECT | wsi)?;
            self.ctrl(site, Ctl::SELECT | wsi | Ctl::WCLK)?;
        }
        self.ctrl(site, Ctl::SELECT | Ctl::WCLK)?;
        self.ctrl(site, Ctl::INSTR_UPDATE)?;
        self.ctrl(site, Ctl::INSTR_UPDATE | Ctl::WCLK)?;
        self.ctrl(site, Ctl::INIT)
    }

    /// Phase 7: bits come out MSB first.
    fn shift_out(&self, site: Site, length_bits: u32) -> RepairResult<Vec<u32>> {
        self.ctrl(site, Ctl::DATA_CAPTURE)?;
        self.ctrl(site, Ctl::DATA_CAPTURE | Ctl::WCLK)?;
        self.ctrl(site, Ctl::INIT)?;
        let mut out = vec![0u32; words_for(length_bits)];
        for idx in (0..length_bits).rev() {
            self.ctrl(site, Ctl::INIT | Ctl::WCLK)?;
            let bit = self.sample(site)?;
            self.ctrl(site, Ctl::INIT)?;
            set_word_bit(&mut out, idx, bit);
        }
        Ok(out)
    }

    /// Phase 8: bits go in MSB first.
    fn shift_in(&self, site: Site, data: &[u32], length_bits: u32) -> RepairResult<()> {
        for idx in (0..length_bits).rev() {
            let wsi = Ctl::wsi(word_bit(data, idx));
            self.ctrl(site, wsi)?;
            self.ctrl(site, wsi | Ctl::WCLK)?;
        }
        for _ in 0..2 {
            self.ctrl(site, Ctl::DATA_UPDATE)?;
            self.ctrl(site, Ctl::DATA_UPDATE | Ctl::WCLK)?;
        }
        self.ctrl(site, Ctl::INIT)?;
        for _ in 0..TRAILING_TOGGLES {
            self.pulse(site, Ctl::INIT)?;
        }
        Ok(())
    }
}

impl RegisterTransport for JtagBitBangEngine {
    fn kind(&self) -> TransportKind {
        TransportKind::JtagBitBang
    }

    fn supports(&self, op: TransportOp) -> bool {
        op != TransportOp::PollWrapperIdle
    }

    /// The bridge has no hardware mutex; the process-wide bridge lock makes
    /// the single-writer rule explicit.
    fn acquire(&self) -> RepairResult<AccessGuard<'_>> {
        Ok(AccessGuard::local(lock_local(&BRIDGE_LOCK)))
    }

    fn read_wrapper_data(&self, site: Site, instr: WrapperInstruction, length_bits: u32) -> RepairResult<Vec<u32>> {
        if length_bits == 0 {
            return Err(RepairError::invalid("zero-length wrapper data read"));
        }
        let fixed = WrapperInstruction {
            channel: channel_select_fix_on_read(instr.channel),
            ..instr
        };
        debug!("jtag site {}: read {} bits via {}", site, length_bits, fixed);
        let _mask = self.open(site)?;
        self.settle(site)?;
        self.shift_instruction(site, fixed)?;
        self.shift_out(site, length_bits)
    }

    fn write_wrapper_data(&self, site: Site, instr: WrapperInstruction, data: &[u32], length_bits: u32) -> RepairResult<()> {
        check_length(data, length_bits)?;
        debug!("jtag site {}: write {} bits via {}", site, length_bits, instr);
        let _mask = self.open(site)?;
        self.settle(site)?;
        self.shift_instruction(site, instr)?;
        self.shift_in(site, data, length_bits)
    }

    fn write_bypass(&self, site: Site, channel: Channel) -> RepairResult<()> {
        let _mask = self.open(site)?;
        self.settle(site)?;
        self.shift_instruction(site, WrapperInstruction::new(channel, Opcode::BYPASS))?;
        self.shift_in(site, &[0], 1)
    }

    fn select_channel(&self, site: Site, channel: Channel) -> RepairResult<()> {
        if channel >= MAX_CHANNELS {
            return Err(RepairError::invalid(format!("channel {} out of range", channel)));
        }
        let _mask = self.open(site)?;
        self.settle(site)?;
        self.shift_instruction(site, WrapperInstruction::new(channel, Opcode::BYPASS))
    }

    fn assert_mask(&self, site: Site) -> RepairResult<()> {
        Self::check_site(site)?;
        self.scan(ScanChain::Mask, site, 1 << site)
    }

    fn reset_site(&self, site: Site) -> RepairResult<()> {
        debug!("jtag site {}: reset", site);
        let _mask = self.open(site)?;
        self.settle(site)?;
        self.shift_instruction(site, WrapperInstruction::broadcast(Opcode::HBM_RESET))?;
        self.shift_in(site, &[1], 1)
    }

    fn toggle_clock(&self, site: Site, cycles: u32) -> RepairResult<()> {
        let _mask = self.open(site)?;
        for _ in 0..cycles {
            self.pulse(site, Ctl::INIT)?;
        }
        Ok(())
    }
}

/// Vector count of one wrapper transaction, excluding per-bit sampling reads.
pub fn transaction_vector_count(length_bits: u32, write: bool) -> usize {
    let prologue = 2 + 1 + 2 * SETTLE_TOGGLES + 2 + 2 * WrapperInstruction::BITS + 4;
    let body = if write {
        2 * length_bits + 4 + 1 + 2 * TRAILING_TOGGLES
    } else {
        3 + 2 * length_bits
    };
    (prologue + body + 1) as usize
}

