//! Tally command-line sync peer
//!
//! Runs one sync session over TCP against a JSON data file:
//! 1. `host` prints a connection code, reads the peer's answer code and
//!    requests the exchange
//! 2. `join` reads the host's code, prints the answer code and serves the
//!    host's request
//!
//! Usage:
//!   tally-peer host --data office.json --direction send
//!   tally-peer join --data field.json
//!
//! Codes are exchanged by copy and paste; the data file is rewritten only
//! after a successful import.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tally_peer::{
    DirectionArg, Outcome, Peer, PolicyArg, default_selection, load_config,
    load_or_generate_peer_id, open_store, parse_project_ids,
};
use tally_store::LocalStore;
use tally_sync::transport::TcpConfig;
use tally_sync::{DeviceIdentity, SyncSelection};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{Level, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "tally-peer")]
#[command(about = "Sync Tally data with another device over the local network")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// JSON data file to sync
    #[arg(short, long, global = true, default_value = "tally-data.json")]
    data: PathBuf,

    /// Sync config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Device name shown to the peer
    #[arg(short, long, global = true)]
    label: Option<String>,

    /// Path to the peer id file
    #[arg(short, long, global = true, default_value = "tally-peer.id")]
    identity: PathBuf,

    /// Listen and advertise on loopback only
    #[arg(long, global = true)]
    loopback: bool,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a session and request an exchange
    Host {
        /// Which way data flows, seen from this device
        #[arg(long, value_enum, default_value = "bidirectional")]
        direction: DirectionArg,

        /// How to treat projects and records both devices hold
        #[arg(long, value_enum, default_value = "keep-newer")]
        policy: PolicyArg,

        /// Project ids to exchange (default: everything the direction covers)
        #[arg(short, long = "project")]
        projects: Vec<String>,
    },
    /// Answer a session created on another device
    Join {
        /// The host's connection code (read from stdin when omitted)
        #[arg(long)]
        offer: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.common.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(log_level).into())
        .from_env_lossy();
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let common = &cli.common;
    let config = load_config(common.config.as_deref(), common.label.as_deref())?;
    let peer_id = load_or_generate_peer_id(&common.identity)?;
    let identity = DeviceIdentity::new(peer_id, config.device_label.clone());
    let tcp = if common.loopback {
        TcpConfig::loopback()
    } else {
        TcpConfig::default()
    };
    info!("Tally peer {} ({}) starting", identity.label, identity.peer_id);

    let store = open_store(&common.data)?;
    let mut peer = Peer::start(identity, store, config, tcp);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let outcome = match cli.command {
        Command::Host {
            direction,
            policy,
            projects,
        } => {
            let explicit = parse_project_ids(&projects)?;
            let offer = peer.offer().await?;
            println!("\n========================================");
            println!("  Tally Sync Session");
            println!("========================================");
            println!("  Pairing code: {}", offer.pairing_code.display_grouped());
            println!("\n  Connection code for the other device:\n");
            println!("{}", offer.token);
            println!("\n  Paste the answer code and press enter:");
            println!("========================================\n");

            let answer = stdin
                .next_line()
                .await
                .context("Failed to read answer code")?
                .context("No answer code given")?;
            peer.complete(&answer).await?;
            let remote = peer.wait_for_metadata().await?;

            let local = peer.store().list_projects()?;
            let ids = default_selection(direction.into(), &explicit, &local, &remote);
            if ids.is_empty() {
                bail!("nothing to exchange");
            }
            info!("Requesting {} projects", ids.len());
            peer.request(SyncSelection::new(ids, direction.into(), policy.into()))
                .await?;
            peer.finish().await?
        }
        Command::Join { offer } => {
            let offer = match offer {
                Some(offer) => offer,
                None => {
                    println!("Paste the connection code and press enter:");
                    stdin
                        .next_line()
                        .await
                        .context("Failed to read connection code")?
                        .context("No connection code given")?
                }
            };
            let answer = peer.answer(&offer).await?;
            println!("\n========================================");
            println!("  Answer code for the host:\n");
            println!("{answer}");
            println!("========================================\n");
            peer.finish().await?
        }
    };

    let saved = report(&outcome, &peer, &common.data)?;
    peer.shutdown().await?;
    if !saved && !matches!(outcome, Outcome::Cancelled { .. }) {
        bail!("sync did not complete");
    }
    Ok(())
}

/// Prints the outcome and saves the data file after an import. Returns
/// whether the run succeeded.
fn report(outcome: &Outcome, peer: &Peer, data: &Path) -> Result<bool> {
    match outcome {
        Outcome::Completed(summary) => {
            println!("{}", summary.message);
            if summary.projects_imported + summary.records_imported > 0 {
                peer.store()
                    .save(data)
                    .with_context(|| format!("Failed to save {}", data.display()))?;
                info!("Saved {}", data.display());
            }
            Ok(summary.success)
        }
        Outcome::Cancelled { by_peer } => {
            let who = if *by_peer { "the other device" } else { "this device" };
            println!("Sync cancelled by {who}");
            Ok(false)
        }
        Outcome::Failed { code, message } => {
            warn!("Sync failed ({code}): {message}");
            Ok(false)
        }
    }
}
