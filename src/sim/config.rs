use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::*;

use crate::error::{RepairError, RepairResult};
use crate::hbm::types::{Channel, Generation, Site, Vendor, MAX_CHANNELS, MAX_SITES};

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> anyhow::Result<Self> {
        match section {
            Some(value) => Ok(value.clone().try_into()?),
            None => {
                warn!("config section not found");
                Ok(Self::default())
            }
        }
    }
}

/// Memory configuration of the GPU under test.
#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HbmConfig {
    pub generation: Generation,
    pub vendor: Vendor,
    pub active_sites: Vec<Site>,
    /// Per-site channel letters, `A` is channel 0.
    pub channels_available: Vec<String>,
    pub stack_height: u32,
}

impl Config for HbmConfig {}

impl Default for HbmConfig {
    fn default() -> Self {
        Self {
            generation: Generation::Hbm2e,
            vendor: Vendor::Samsung,
            active_sites: (0..MAX_SITES).collect(),
            channels_available: vec!["ABCDEFGH".to_string(); MAX_SITES as usize],
            stack_height: 8,
        }
    }
}

impl HbmConfig {
    pub fn site_active(&self, site: Site) -> bool {
        self.active_sites.contains(&site)
    }

    pub fn channel_available(&self, site: Site, channel: Channel) -> bool {
        if channel >= MAX_CHANNELS {
            return false;
        }
        let letter = (b'A' + channel as u8) as char;
        self.channels_available
            .get(site as usize)
            .is_some_and(|letters| letters.to_ascii_uppercase().contains(letter))
    }

    /// Rank (stack id) count addressable by the row repair payload.
    pub fn ranks(&self) -> u32 {
        (self.stack_height / 2).max(1)
    }

    pub fn validate(&self) -> RepairResult<()> {
        if ![2, 4, 8].contains(&self.stack_height) {
            return Err(RepairError::invalid(format!("unsupported stack height {}", self.stack_height)));
        }
        if let Some(site) = self.active_sites.iter().find(|s| **s >= MAX_SITES) {
            return Err(RepairError::invalid(format!("active site {} out of range", site)));
        }
        Ok(())
    }
}

/// Settings bundle handed over by the test orchestrator.
#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RepairSettings {
    pub skip_fuse_repair_check: bool,
    pub pseudo_hard_repair: bool,
}

impl Config for RepairSettings {}

/// Hardware settling delays, microseconds.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    pub wake_step_us: u64,
    pub soft_repair_gap_us: u64,
    pub fuse_burn_us: u64,
    /// Wrapper clock, kHz. Transports that cannot toggle the clock sleep for
    /// the vendor's spare-row settle cycle count at this rate instead.
    pub wrapper_clock_khz: u64,
    pub mbist_poll_us: u64,
}

impl Config for TimingConfig {}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            wake_step_us: 1_000,
            soft_repair_gap_us: 2_000,
            fuse_burn_us: 500_000,
            wrapper_clock_khz: 10_000,
            mbist_poll_us: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn wake_step(&self) -> Duration {
        Duration::from_micros(self.wake_step_us)
    }

    pub fn soft_repair_gap(&self) -> Duration {
        Duration::from_micros(self.soft_repair_gap_us)
    }

    pub fn fuse_burn(&self) -> Duration {
        Duration::from_micros(self.fuse_burn_us)
    }

    /// Wall-clock time of `cycles` wrapper clocks.
    pub fn wrapper_cycles(&self, cycles: u32) -> Duration {
        Duration::from_nanos(cycles as u64 * 1_000_000 / self.wrapper_clock_khz.max(1))
    }

    pub fn mbist_poll(&self) -> Duration {
        Duration::from_micros(self.mbist_poll_us)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub jsonl: Option<PathBuf>,
}

impl Config for TelemetryConfig {}

/// Simulated stack used when no register bus is attached.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    pub seed: u64,
    pub prefused_rows: u32,
    pub log_level: u64,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            prefused_rows: 0,
            log_level: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepairConfig {
    pub hbm: HbmConfig,
    pub repair: RepairSettings,
    pub timing: TimingConfig,
    pub telemetry: TelemetryConfig,
    pub sim: SimConfig,
}

impl RepairConfig {
    pub fn from_table(table: &Table) -> anyhow::Result<Self> {
        Ok(Self {
            hbm: HbmConfig::from_section(table.get("hbm")).context("cannot deserialize [hbm]")?,
            repair: RepairSettings::from_section(table.get("repair")).context("cannot deserialize [repair]")?,
            timing: TimingConfig::from_section(table.get("timing")).context("cannot deserialize [timing]")?,
            telemetry: TelemetryConfig::from_section(table.get("telemetry")).context("cannot deserialize [telemetry]")?,
            sim: SimConfig::from_section(table.get("sim")).context("cannot deserialize [sim]")?,
        })
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let table: Table = toml::from_str(text)?;
        Self::from_table(&table)
    }
}
