use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use num_traits::FromPrimitive;
use toml::Table;

use hbm_repair::hbm::types::{Generation, LaneError, LaneType, RepairType, RowError, Vendor};
use hbm_repair::hbm::RemapCodec;
use hbm_repair::mbist::MbistPattern;
use hbm_repair::sim::config::RepairConfig;
use hbm_repair::sim::SimulatedStack;
use hbm_repair::wir::RegisterTransport;
use hbm_repair::RepairOrchestrator;

#[derive(Parser)]
#[command(version, about = "HBM lane and row repair against a simulated stack")]
struct RepairArgs {
    #[arg(long, help = "Path to config.toml")]
    config: Option<PathBuf>,
    #[arg(long, help = "Override memory generation (hbm2e, hbm3)")]
    generation: Option<Generation>,
    #[arg(long, help = "Override memory vendor (samsung, skhynix)")]
    vendor: Option<Vendor>,
    #[arg(long, help = "Enable log at level (0:none, 1:info, 2:debug)")]
    log: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a 16-bit remap value
    Decode {
        #[arg(value_parser = parse_u16)]
        value: u16,
    },
    /// Repair one failing lane
    Lane {
        #[arg(long)]
        site: u32,
        #[arg(long)]
        channel: u32,
        #[arg(long, help = "Channel-relative GPU lane number")]
        lane: u32,
        #[arg(long, value_parser = parse_lane_type, default_value = "data")]
        lane_type: LaneType,
        #[arg(long)]
        hard: bool,
        #[arg(long)]
        skip_verify: bool,
        #[arg(long)]
        pseudo: bool,
    },
    /// Repair one failing row
    Row {
        #[arg(long)]
        bus: u32,
        #[arg(long, default_value_t = 0)]
        subpartition: u32,
        #[arg(long, default_value_t = 0)]
        rank: u32,
        #[arg(long)]
        bank: u32,
        #[arg(long, value_parser = parse_u32)]
        row: u32,
        #[arg(long)]
        hard: bool,
        #[arg(long)]
        pseudo: bool,
        #[arg(long)]
        test_id: Option<u32>,
    },
    /// Count unfused spare rows of a bank
    SpareRows {
        #[arg(long)]
        site: u32,
        #[arg(long, default_value_t = 0)]
        rank: u32,
        #[arg(long)]
        channel: u32,
        #[arg(long)]
        bank: u32,
    },
    /// Run an MBIST pattern and report the result
    Mbist {
        #[arg(long)]
        site: u32,
        #[arg(long, value_parser = parse_pattern, default_value = "march-c")]
        pattern: MbistPattern,
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
}

fn parse_u32(text: &str) -> Result<u32, String> {
    match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    }
    .map_err(|err| format!("bad number '{}': {}", text, err))
}

fn parse_u16(text: &str) -> Result<u16, String> {
    let value = parse_u32(text)?;
    u16::try_from(value).map_err(|_| format!("{:#x} does not fit in 16 bits", value))
}

fn parse_lane_type(text: &str) -> Result<LaneType, String> {
    match text.to_ascii_lowercase().as_str() {
        "data" => Ok(LaneType::Data),
        "dbi" => Ok(LaneType::Dbi),
        "dm" => Ok(LaneType::Dm),
        "addr" => Ok(LaneType::Addr),
        other => other
            .parse::<u32>()
            .ok()
            .and_then(LaneType::from_u32)
            .ok_or_else(|| format!("unknown lane type '{}'", text)),
    }
}

fn parse_pattern(text: &str) -> Result<MbistPattern, String> {
    match text {
        "march-c" => Ok(MbistPattern::MarchC),
        "checkerboard" => Ok(MbistPattern::Checkerboard),
        "row-stripe" => Ok(MbistPattern::RowStripe),
        "retention" => Ok(MbistPattern::Retention),
        _ => Err(format!("unknown pattern '{}'", text)),
    }
}

fn load_config(argv: &RepairArgs) -> anyhow::Result<RepairConfig> {
    let mut config = match &argv.config {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
            let table: Table = toml::from_str(&text).context("cannot parse config toml")?;
            RepairConfig::from_table(&table)?
        }
        None => RepairConfig::default(),
    };

    // override toml configs with argv
    config.hbm.generation = argv.generation.unwrap_or(config.hbm.generation);
    config.hbm.vendor = argv.vendor.unwrap_or(config.hbm.vendor);
    config.sim.log_level = argv.log.unwrap_or(config.sim.log_level);
    Ok(config)
}

fn init_logging(level: u64) {
    let filter = match level {
        0 => "off",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
}

fn build_engine(config: &RepairConfig) -> anyhow::Result<RepairOrchestrator> {
    let stack = SimulatedStack::for_generation(config.hbm.generation).with_sim_config(&config.sim, config.hbm.ranks());
    let transport: Arc<dyn RegisterTransport> = Arc::new(stack);
    Ok(RepairOrchestrator::new(config, transport)?)
}

fn repair_type(hard: bool) -> RepairType {
    if hard {
        RepairType::Hard
    } else {
        RepairType::Soft
    }
}

pub fn main() -> anyhow::Result<()> {
    let argv = RepairArgs::parse();
    let config = load_config(&argv)?;
    init_logging(config.sim.log_level);

    match argv.command {
        Command::Decode { value } => {
            let codec = RemapCodec::new(config.hbm.generation);
            let entries = codec.decode(value)?;
            if entries.is_empty() {
                println!("{:#06x}: no repair", value);
            }
            for entry in entries {
                println!("{:#06x}: {} lane at dword offset {}", value, entry.lane_type, entry.offset);
            }
        }
        Command::Lane { site, channel, lane, lane_type, hard, skip_verify, pseudo } => {
            let mut engine = build_engine(&config)?;
            let (bus_id, _) = engine.topology().site_channel_to_bus(site, channel)?;
            let lane = LaneError { bus_id, lane_bit: lane, lane_type };
            let tx = engine.lane_repair(repair_type(hard), skip_verify, pseudo, site, channel, &lane)?;
            println!("{}", serde_json::to_string_pretty(&tx)?);
        }
        Command::Row { bus, subpartition, rank, bank, row, hard, pseudo, test_id } => {
            let mut engine = build_engine(&config)?;
            let row = RowError {
                bus_id: bus,
                subpartition,
                rank,
                bank,
                row,
                name: "cli".to_string(),
                origin_test_id: test_id,
            };
            let tx = engine.row_repair(repair_type(hard), pseudo, &row)?;
            println!("{}", serde_json::to_string_pretty(&tx)?);
        }
        Command::SpareRows { site, rank, channel, bank } => {
            let engine = build_engine(&config)?;
            let available = engine.spare_rows_available(site, rank, channel, bank)?;
            println!("site {} ch {} rank {} bank {}: {} spare rows available", site, channel, rank, bank, available);
        }
        Command::Mbist { site, pattern, timeout_ms } => {
            let mut engine = build_engine(&config)?;
            let state = engine
                .run_mbist(site, pattern, Duration::from_millis(timeout_ms))
                .map_err(|err| anyhow!("MBIST on site {} failed: {}", site, err))?;
            println!("site {}: {:?}", site, state);
        }
    }
    Ok(())
}
