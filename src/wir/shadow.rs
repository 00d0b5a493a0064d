//! Wrapper access through the memory-mapped shadow registers.
//!
//! An access programs the instruction and bit length, then moves the data
//! through the data register one 32-bit word at a time. Read responses are
//! delivered MSB-aligned, so a final partial word is shifted down.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::base::bus::RegisterBus;
use crate::base::lock::{acquire_hw_mutex, lock_local, owner_token, AccessGuard};
use crate::error::{RepairError, RepairResult};
use crate::hbm::types::{Channel, Site, MAX_CHANNELS, MAX_SITES};
use crate::utils::{words_for, BitSlice};
use crate::wir::{check_length, Opcode, RegisterTransport, TransportKind, TransportOp, WrapperInstruction};

pub const WIR_INSTR_REG: &str = "HBM_WIR_INSTR";
pub const WDR_LENGTH_REG: &str = "HBM_WDR_LENGTH";
pub const WDR_DATA_REG: &str = "HBM_WDR_DATA";
pub const WIR_STATUS_REG: &str = "HBM_WIR_STATUS";
pub const PRIV_STATUS_REG: &str = "HBM_PRIV_STATUS";
pub const SITE_RESET_REG: &str = "HBM_SITE_RESET";

const WIR_STATUS_BUSY_BIT: u32 = 0;
const IDLE_POLL_INTERVAL: Duration = Duration::from_micros(10);

/// Status reported by the privilege checker after a rejected write.
pub const HBM3_PRIV_VIOLATION: u32 = 0xBADF_5040;

static SHADOW_LOCK: Mutex<()> = Mutex::new(());

pub struct ShadowRegisterEngine {
    bus: Arc<dyn RegisterBus>,
    priv_violation: u32,
    owner: u32,
}

impl ShadowRegisterEngine {
    pub fn new(bus: Arc<dyn RegisterBus>) -> Self {
        Self::with_priv_code(bus, HBM3_PRIV_VIOLATION)
    }

    pub fn with_priv_code(bus: Arc<dyn RegisterBus>, priv_violation: u32) -> Self {
        Self { bus, priv_violation, owner: owner_token() }
    }

    fn check_site(site: Site) -> RepairResult<()> {
        if site >= MAX_SITES {
            return Err(RepairError::invalid(format!("site {} out of range", site)));
        }
        Ok(())
    }

    /// Register write followed by the mandatory privilege check.
    fn write_checked(&self, site: Site, reg: &str, value: u32) -> RepairResult<()> {
        self.bus.write32(reg, site, value)?;
        let status = self.bus.read32(PRIV_STATUS_REG, site)?;
        if status == self.priv_violation {
            error!("site {}: write to {} rejected by privilege checker", site, reg);
            return Err(RepairError::PrivilegeViolation { site, status });
        }
        Ok(())
    }

    fn program(&self, site: Site, instr: WrapperInstruction, length_bits: u32) -> RepairResult<()> {
        Self::check_site(site)?;
        self.write_checked(site, WIR_INSTR_REG, instr.packed())?;
        self.write_checked(site, WDR_LENGTH_REG, length_bits)
    }
}

impl RegisterTransport for ShadowRegisterEngine {
    fn kind(&self) -> TransportKind {
        TransportKind::ShadowRegister
    }

    fn supports(&self, op: TransportOp) -> bool {
        !matches!(op, TransportOp::AssertMask | TransportOp::ToggleClock)
    }

    fn acquire(&self) -> RepairResult<AccessGuard<'_>> {
        let local = lock_local(&SHADOW_LOCK);
        let hw = acquire_hw_mutex(Arc::clone(&self.bus), self.owner)?;
        Ok(AccessGuard::with_hw(local, hw))
    }

    fn read_wrapper_data(&self, site: Site, instr: WrapperInstruction, length_bits: u32) -> RepairResult<Vec<u32>> {
        if length_bits == 0 {
            return Err(RepairError::invalid("zero-length wrapper data read"));
        }
        debug!("shadow site {}: read {} bits via {}", site, length_bits, instr);
        self.program(site, instr, length_bits)?;
        let count = words_for(length_bits);
        let tail = length_bits % 32;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let mut word = self.bus.read32(WDR_DATA_REG, site)?;
            if i == count - 1 && tail != 0 {
                word >>= 32 - tail;
            }
            out.push(word);
        }
        Ok(out)
    }

    fn write_wrapper_data(&self, site: Site, instr: WrapperInstruction, data: &[u32], length_bits: u32) -> RepairResult<()> {
        check_length(data, length_bits)?;
        debug!("shadow site {}: write {} bits via {}", site, length_bits, instr);
        self.program(site, instr, length_bits)?;
        let count = words_for(length_bits);
        let tail = length_bits % 32;
        for (i, word) in data.iter().take(count).enumerate() {
            let word = if i == count - 1 && tail != 0 {
                word.sel(tail - 1, 0)
            } else {
                *word
            };
            self.write_checked(site, WDR_DATA_REG, word)?;
        }
        Ok(())
    }

    fn write_bypass(&self, site: Site, channel: Channel) -> RepairResult<()> {
        self.write_wrapper_data(site, WrapperInstruction::new(channel, Opcode::BYPASS), &[0], 1)
    }

    fn select_channel(&self, site: Site, channel: Channel) -> RepairResult<()> {
        if channel >= MAX_CHANNELS {
            return Err(RepairError::invalid(format!("channel {} out of range", channel)));
        }
        Self::check_site(site)?;
        self.write_checked(site, WIR_INSTR_REG, WrapperInstruction::new(channel, Opcode::BYPASS).packed())
    }

    fn reset_site(&self, site: Site) -> RepairResult<()> {
        Self::check_site(site)?;
        debug!("shadow site {}: reset", site);
        self.write_checked(site, SITE_RESET_REG, 1)?;
        self.write_checked(site, SITE_RESET_REG, 0)
    }

    fn poll_wrapper_idle(&self, site: Site, blocking: bool, timeout: Duration) -> RepairResult<()> {
        Self::check_site(site)?;
        let start = Instant::now();
        loop {
            let status = self.bus.read32(WIR_STATUS_REG, site)?;
            if !status.bit(WIR_STATUS_BUSY_BIT) {
                return Ok(());
            }
            let waited = start.elapsed();
            if !blocking || waited >= timeout {
                return Err(RepairError::Timeout { site, waited });
            }
            thread::sleep(IDLE_POLL_INTERVAL);
        }
    }
}
