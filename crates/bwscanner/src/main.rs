//! `bwscanner`: inspect the relay population and the measurement paths
//! that a Tor bandwidth scanner would use.
//!
//! Relays come from a cached consensus document.  Configuration is read
//! from `bwscanner_defaults.toml` (built in), then from the files given
//! with `-f` (or the default per-user file), then from `-c` options.

#![warn(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::unwrap_used)]

mod cfgpath;
mod config;
mod source;
mod stats;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use argh::FromArgs;
use tor_bwscan::{FsStateStore, StateStore};
use tor_relaylist::{Fingerprint, RelayList, RelaySet};
use tracing::{info, Level};

use crate::config::BwScannerConfig;
use crate::source::CachedConsensus;

#[derive(FromArgs, Debug, Clone)]
/// Inspect the relays and measurement paths of a Tor bandwidth scanner.
struct Args {
    /// override the default location(s) for the configuration file
    #[argh(option, short = 'f')]
    rc: Vec<String>,
    /// override a configuration option (uses toml syntax)
    #[argh(option, short = 'c')]
    cfg: Vec<String>,
    /// what to do
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug, Clone)]
#[argh(subcommand)]
/// A bwscanner command.
enum Command {
    /// Summarize the relays.
    Relays(RelaysCmd),
    /// Plan a path for one relay.
    Path(PathCmd),
    /// Show the saved scanner state.
    State(StateCmd),
}

#[derive(FromArgs, Debug, Clone)]
#[argh(subcommand, name = "relays")]
/// Summarize the relays in the cached consensus.
struct RelaysCmd {
    /// destination port to check exits against
    #[argh(option, short = 'p')]
    port: Option<u16>,
}

#[derive(FromArgs, Debug, Clone)]
#[argh(subcommand, name = "path")]
/// Show the role and helper that measuring a relay would use.
struct PathCmd {
    /// fingerprint of the relay to measure
    #[argh(positional)]
    fingerprint: String,
    /// destination port to check exits against
    #[argh(option, short = 'p')]
    port: Option<u16>,
}

#[derive(FromArgs, Debug, Clone)]
#[argh(subcommand, name = "state")]
/// Show what the scanner remembers across restarts.
struct StateCmd {}

/// Install a log subscriber, at trace level if `trace`.
fn setup_logging(trace: bool) {
    let level = if trace { Level::TRACE } else { Level::DEBUG };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the relays named by our configuration.
async fn load_relays(config: &BwScannerConfig) -> Result<Arc<RelaySet>> {
    let path = config.storage.consensus_file()?;
    let relays = RelayList::new(
        Arc::new(CachedConsensus::new(path.clone())),
        config.relays.clone(),
    );
    relays
        .refresh()
        .await
        .with_context(|| format!("can't load relays from {}", path.display()))
}

/// Print what `store` remembers.
fn show_state(store: &dyn StateStore) -> Result<()> {
    let state = match store.load()? {
        Some(s) => s,
        None => {
            println!("No saved state.");
            return Ok(());
        }
    };
    if let Some(started) = state.scanner_started {
        let started = chrono::DateTime::<chrono::Utc>::from(UNIX_EPOCH + Duration::from_secs(started));
        println!("Scanner started: {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!("Rounds finished: {}", state.rounds);
    println!(
        "Recent consensuses: {}",
        state.history.recent_consensus.len()
    );
    println!(
        "Recent measurement attempts: {}",
        state.history.recent_measurement_attempt.len()
    );
    println!("Relays remembered: {}", state.history.relays.len());
    Ok(())
}

/// Print which result files exist in `dir`.
fn show_results(dir: &Path) -> Result<()> {
    let mut days: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".txt"))
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e).with_context(|| format!("can't read {}", dir.display())),
    };
    days.sort();
    match days.last() {
        Some(last) => println!("Result files: {} (latest {})", days.len(), last),
        None => println!("Result files: none"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    let dflt_config = config::default_config_file();
    let config = config::load(dflt_config.as_deref(), &args.rc, &args.cfg)?;
    setup_logging(config.logging.trace);
    config.validate().context("invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        match &args.command {
            Command::Relays(cmd) => {
                let set = load_relays(&config).await?;
                let port = cmd.port.unwrap_or_else(|| config.destination_port());
                print!("{}", stats::RelayStats::new(&set, port));
            }
            Command::Path(cmd) => {
                let fp: Fingerprint = cmd.fingerprint.parse()?;
                let set = load_relays(&config).await?;
                let port = cmd.port.unwrap_or_else(|| config.destination_port());
                let text = stats::describe_path(&mut rand::thread_rng(), &set, &fp, port)?;
                print!("{}", text);
            }
            Command::State(_) => {
                let dir = config.storage.state_dir()?;
                info!("Reading state from {}", dir.display());
                let store = FsStateStore::from_path(&dir)?;
                show_state(&store)?;
                show_results(&config.storage.results_dir()?)?;
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}
