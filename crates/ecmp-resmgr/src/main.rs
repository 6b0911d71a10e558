//! ecmp-replay - runs switch state snapshots through the ECMP resource manager
//!
//! Prints a JSON report with the output delta count, merges and stats of
//! every step.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use sonic_ecmp_resmgr::config::{DEFAULT_MAKE_BEFORE_BREAK_BUFFER, DEFAULT_MAX_HW_ECMP_GROUPS};
use sonic_ecmp_resmgr::replay::{load_scenario, replay};
use sonic_ecmp_resmgr::state::SwitchingMode;
use sonic_ecmp_resmgr::{EcmpResourceManager, EcmpResourceManagerConfig};

/// Replay switch states through the ECMP resource manager
#[derive(Parser, Debug)]
#[command(name = "ecmp-replay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario file: JSON object with a "states" list of switch states
    scenario: PathBuf,

    /// Hardware ECMP group limit
    #[arg(long, default_value_t = DEFAULT_MAX_HW_ECMP_GROUPS)]
    max_ecmp_groups: u32,

    /// Hardware ECMP member limit
    #[arg(long)]
    max_ecmp_members: Option<u32>,

    /// Compression threshold percent (0 disables compression)
    #[arg(long, default_value_t = 0)]
    compression_threshold: u32,

    /// Backup switching mode (e.g. per_packet_random)
    #[arg(long)]
    backup_mode: Option<SwitchingMode>,

    /// Groups kept free for make-before-break
    #[arg(long, default_value_t = DEFAULT_MAKE_BEFORE_BREAK_BUFFER)]
    mbb_buffer: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Pretty-print the report
    #[arg(long)]
    pretty: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("ecmp-replay failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let mut config = EcmpResourceManagerConfig::new(args.max_ecmp_groups)
        .with_compression_threshold(args.compression_threshold)
        .with_make_before_break_buffer(args.mbb_buffer);
    if let Some(max_members) = args.max_ecmp_members {
        config = config.with_max_hw_ecmp_members(max_members);
    }
    if let Some(mode) = args.backup_mode {
        config = config.with_backup_switching_mode(mode);
    }

    let mut manager = EcmpResourceManager::new(config).context("invalid configuration")?;

    let scenario = load_scenario(&args.scenario)?;
    info!(
        "Replaying {} states from {}",
        scenario.states.len(),
        args.scenario.display()
    );

    let report = replay(&mut manager, &scenario).context("replay failed")?;
    let json = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);
    Ok(())
}
