//! simlink demo binary
//!
//! - `simlink host` runs a toy pasture simulation with the bridge attached
//! - `simlink optimizer` connects to a bridge and nudges grazers home

mod world;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use simlink_bridge::{Bridge, ChannelState};
use simlink_client::{ClientConfig, OptimizerClient, Reply};
use simlink_core::{ADDRESS_VAR, Action, Command, ConfigProvider, EnvOverrides, JsonFileConfig, ParamValue};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;
use world::Pasture;

const DEFAULT_ADDRESS: &str = "tcp://127.0.0.1:5559";

#[derive(Parser)]
#[command(name = "simlink", version, about = "Tick-synchronized simulation/optimizer bridge")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the demo simulation with a bridge attached
    Host {
        /// Bridge configuration (JSON); defaults apply when missing
        #[arg(default_value = "simlink.json")]
        config: PathBuf,
        /// Simulation ticks per second
        #[arg(long, default_value_t = 20)]
        tps: u32,
        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
        /// Number of grazers in the pasture
        #[arg(long, default_value_t = 8)]
        herd: u64,
    },
    /// Connect to a bridge and steer the herd
    Optimizer {
        /// Bridge address; falls back to $SIMLINK_ADDRESS, then the default port
        address: Option<String>,
        /// Stop after this many snapshots
        #[arg(long)]
        rounds: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let debug_from_config = match &cli.command {
        Mode::Host { config, .. } => JsonFileConfig::new(config)
            .load()
            .map(|c| c.debug_logging)
            .unwrap_or(false),
        Mode::Optimizer { .. } => false,
    };
    let level = if cli.verbose || debug_from_config {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Mode::Host {
            config,
            tps,
            ticks,
            herd,
        } => run_host(config, tps, ticks, herd),
        Mode::Optimizer { address, rounds } => {
            let address = address
                .or_else(|| std::env::var(ADDRESS_VAR).ok())
                .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(run_optimizer(&address, rounds))
        }
    }
}

/// Fixed-rate simulation loop on the main thread
fn run_host(config: PathBuf, tps: u32, ticks: Option<u64>, herd: u64) -> Result<()> {
    let provider = EnvOverrides::new(JsonFileConfig::new(&config));
    let Some(mut bridge) = Bridge::init(&provider)
        .with_context(|| format!("starting bridge from {}", config.display()))?
    else {
        info!("Bridge disabled; nothing to do");
        return Ok(());
    };
    if let Some(endpoint) = bridge.local_endpoint() {
        info!("Optimizers can reach the bridge at {}", endpoint);
    }

    let mut pasture = Pasture::new(herd);
    let period = Duration::from_secs_f64(1.0 / f64::from(tps.max(1)));
    let mut tick = 0;
    let mut last_state = bridge.channel_state();

    while ticks.is_none_or(|limit| tick < limit) {
        let started = Instant::now();
        pasture.step();
        let report = bridge.on_tick(tick, &mut pasture);
        if report.commands_rejected > 0 {
            warn!("Tick {}: {} commands rejected", tick, report.commands_rejected);
        }

        let state = bridge.channel_state();
        if state != last_state {
            info!("Bridge link {:?} -> {:?}", last_state, state);
            last_state = state;
        }
        if state == ChannelState::Closed {
            break;
        }

        tick += 1;
        if let Some(rest) = period.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }

    let stats = bridge.stats().clone();
    bridge.shutdown();
    info!(
        "Host stopped after {} ticks: {} snapshots, {} commands applied, {} rejected",
        tick, stats.snapshots_enqueued, stats.commands_applied, stats.commands_rejected
    );
    Ok(())
}

/// Wait for snapshots and move the hungriest grazer back to the origin
async fn run_optimizer(address: &str, rounds: Option<u64>) -> Result<()> {
    let mut client = loop {
        match OptimizerClient::connect_with(address, ClientConfig::default()).await {
            Ok(client) => break client,
            Err(e) => {
                warn!("Bridge at {} not reachable ({}); retrying", address, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    };
    info!("Connected to {}", address);

    let mut seen = 0;
    while rounds.is_none_or(|limit| seen < limit) {
        let snapshot = match client.next_snapshot(Duration::from_secs(10)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("No snapshot: {}", e);
                client.heartbeat().await?;
                continue;
            }
        };
        seen += 1;
        info!(
            "Snapshot tick {} with {} entities ({})",
            snapshot.tick,
            snapshot.entities.len(),
            &snapshot.state_hash[..12.min(snapshot.state_hash.len())]
        );

        let hungriest = snapshot.entities.iter().max_by(|a, b| {
            let hunger = |e: &simlink_core::EntityState| {
                e.attributes.get("Hunger").and_then(ParamValue::as_f64).unwrap_or(0.0)
            };
            hunger(a).total_cmp(&hunger(b))
        });
        let Some(target) = hungriest else {
            continue;
        };

        let correlation_id = client.next_correlation_id();
        let command = Command::new(correlation_id, Action::MoveEntity)
            .with_param("Entity", ParamValue::Entity(target.id))
            .with_param("Position", ParamValue::Vec3([0.0, 0.0, 0.0]))
            .targeting(snapshot.tick + 10);
        client.send_command(&command).await?;

        match client.await_reply(correlation_id, Duration::from_secs(5)).await {
            Ok(Reply::Ack(ack)) => info!("Moved grazer {} at tick {}", target.id, ack.applied_tick),
            Ok(Reply::Error(e)) => warn!("Move of grazer {} refused ({}): {}", target.id, e.code, e.message),
            Err(e) => warn!("No reply for command {}: {}", correlation_id, e),
        }
    }

    client.close().await?;
    Ok(())
}
