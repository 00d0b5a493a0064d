use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::bail;
use num_traits::FromPrimitive;

use crate::base::bus::RegisterBus;
use crate::wir::jtag::{ScanChain, CTRL_SHIFT_IN, H2J_CHAIN_CFG, H2J_CHAIN_CTRL, H2J_CHAIN_DATA};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusAccess {
    Read { reg: String, instance: u32, value: u32 },
    Write { reg: String, instance: u32, value: u32 },
}

#[derive(Default)]
struct SimBusState {
    regs: HashMap<(String, u32), u32>,
    read_queues: HashMap<(String, u32), VecDeque<u32>>,
    log: Vec<BusAccess>,
    writes: usize,
    fail_write_at: Option<usize>,
}

/// Register file standing in for the register bus: writes land in a map,
/// reads return scripted values first and the stored value otherwise.
/// Every access is logged in order.
#[derive(Default)]
pub struct SimBus {
    state: Mutex<SimBusState>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimBusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set(&self, reg: &str, instance: u32, value: u32) {
        self.lock().regs.insert((reg.to_string(), instance), value);
    }

    pub fn get(&self, reg: &str, instance: u32) -> u32 {
        self.lock().regs.get(&(reg.to_string(), instance)).copied().unwrap_or(0)
    }

    /// Values returned, in order, by the next reads of `reg`.
    pub fn queue_reads(&self, reg: &str, instance: u32, values: impl IntoIterator<Item = u32>) {
        self.lock()
            .read_queues
            .entry((reg.to_string(), instance))
            .or_default()
            .extend(values);
    }

    /// Make the `n`th write from now (0-based) fail with a bus error.
    pub fn fail_write_at(&self, n: usize) {
        let mut state = self.lock();
        state.fail_write_at = Some(state.writes + n);
    }

    pub fn accesses(&self) -> Vec<BusAccess> {
        self.lock().log.clone()
    }

    pub fn writes(&self) -> Vec<(String, u32, u32)> {
        self.lock()
            .log
            .iter()
            .filter_map(|access| match access {
                BusAccess::Write { reg, instance, value } => Some((reg.clone(), *instance, *value)),
                BusAccess::Read { .. } => None,
            })
            .collect()
    }

    pub fn writes_to(&self, reg: &str) -> Vec<u32> {
        self.writes()
            .into_iter()
            .filter(|(r, _, _)| r == reg)
            .map(|(_, _, value)| value)
            .collect()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Host-to-JTAG scan vectors (chain, value) reconstructed from the log.
    pub fn scan_vectors(&self) -> Vec<(ScanChain, u32)> {
        let mut vectors = Vec::new();
        let mut chain = None;
        let mut data = 0;
        for (reg, _, value) in self.writes() {
            match reg.as_str() {
                H2J_CHAIN_CFG => chain = ScanChain::from_u32(value & 0xFF),
                H2J_CHAIN_DATA => data = value,
                H2J_CHAIN_CTRL if value == CTRL_SHIFT_IN => {
                    if let Some(chain) = chain {
                        vectors.push((chain, data));
                    }
                }
                _ => {}
            }
        }
        vectors
    }
}

impl RegisterBus for SimBus {
    fn read32_impl(&self, reg: &str, instance: u32) -> Result<u32, anyhow::Error> {
        let mut state = self.lock();
        let key = (reg.to_string(), instance);
        let value = match state.read_queues.get_mut(&key).and_then(|q| q.pop_front()) {
            Some(value) => value,
            None => state.regs.get(&key).copied().unwrap_or(0),
        };
        state.log.push(BusAccess::Read { reg: reg.to_string(), instance, value });
        Ok(value)
    }

    fn write32_impl(&self, reg: &str, instance: u32, value: u32) -> Result<(), anyhow::Error> {
        let mut state = self.lock();
        let idx = state.writes;
        state.writes += 1;
        if state.fail_write_at == Some(idx) {
            bail!("simulated bus fault writing {}[{}]", reg, instance);
        }
        state.regs.insert((reg.to_string(), instance), value);
        state.log.push(BusAccess::Write { reg: reg.to_string(), instance, value });
        Ok(())
    }
}
