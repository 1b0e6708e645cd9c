//! Building blocks of the `tally-peer` binary.
//!
//! A [`Peer`] wraps one orchestrator running over TCP against a JSON
//! snapshot store. The binary drives it from the terminal; tests drive two
//! of them against each other on loopback.

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tally_model::Project;
use tally_store::{LocalStore, MemoryStore};
use tally_sync::transport::{TcpConfig, TcpTransport};
use tally_sync::{
    ConflictPolicy, DeviceIdentity, Direction, ImportSummary, OrchestratorConfig,
    OrchestratorHandle, SessionOffer, SyncConfig, SyncEvent, SyncMetadata, SyncResult,
    SyncSelection, Transport, TransportFactory, create_orchestrator,
};
use tally_types::{PeerId, ProjectId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// `--direction` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DirectionArg {
    Send,
    Receive,
    Bidirectional,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Send => Direction::Send,
            DirectionArg::Receive => Direction::Receive,
            DirectionArg::Bidirectional => Direction::Bidirectional,
        }
    }
}

/// `--policy` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    KeepLocal,
    KeepRemote,
    KeepNewer,
}

impl From<PolicyArg> for ConflictPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::KeepLocal => ConflictPolicy::KeepLocal,
            PolicyArg::KeepRemote => ConflictPolicy::KeepRemote,
            PolicyArg::KeepNewer => ConflictPolicy::KeepNewer,
        }
    }
}

/// Loads a sync config file (or the defaults) and applies the label override.
pub fn load_config(path: Option<&Path>, label: Option<&str>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            SyncConfig::from_json(&json)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => SyncConfig::default(),
    };
    if let Some(label) = label {
        config.device_label = label.to_string();
    }
    Ok(config)
}

/// Reads this device's peer id from `path`, creating it on first use.
pub fn load_or_generate_peer_id(path: &Path) -> Result<PeerId> {
    if path.exists() {
        info!("Loading peer id from {}", path.display());
        let text = std::fs::read_to_string(path).context("Failed to read identity file")?;
        PeerId::parse(text.trim()).context("Failed to decode peer id")
    } else {
        let peer_id = PeerId::new();
        info!("Generating new peer id at {}", path.display());
        std::fs::write(path, peer_id.to_string()).context("Failed to write identity file")?;
        Ok(peer_id)
    }
}

/// Parses `--project` arguments.
pub fn parse_project_ids(values: &[String]) -> Result<Vec<ProjectId>> {
    values
        .iter()
        .map(|v| ProjectId::parse(v.trim()).with_context(|| format!("Invalid project id {v:?}")))
        .collect()
}

/// Projects to request when none were named: everything this device sends
/// plus everything it pulls, as far as each side's inventory goes.
pub fn default_selection(
    direction: Direction,
    explicit: &[ProjectId],
    local: &[Project],
    remote: &SyncMetadata,
) -> BTreeSet<ProjectId> {
    if !explicit.is_empty() {
        return explicit.iter().copied().collect();
    }
    let mut ids = BTreeSet::new();
    if direction.requester_sends() {
        ids.extend(local.iter().map(|p| p.id));
    }
    if direction.responder_sends() {
        ids.extend(remote.projects.iter().map(|p| p.id));
    }
    ids
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(ImportSummary),
    Cancelled { by_peer: bool },
    Failed { code: String, message: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(summary) if summary.success)
    }
}

/// One orchestrator over TCP with a snapshot-backed store.
pub struct Peer {
    handle: OrchestratorHandle,
    events: mpsc::Receiver<SyncEvent>,
    store: Arc<MemoryStore>,
    task: JoinHandle<SyncResult<()>>,
}

impl Peer {
    /// Spawns the orchestrator task.
    pub fn start(
        identity: DeviceIdentity,
        store: MemoryStore,
        config: SyncConfig,
        tcp: TcpConfig,
    ) -> Self {
        let store = Arc::new(store);
        let transports: TransportFactory =
            Box::new(move || Box::new(TcpTransport::new(tcp.clone())) as Box<dyn Transport>);
        let (handle, events, command_rx, orchestrator) = create_orchestrator(
            identity,
            store.clone(),
            config,
            OrchestratorConfig::default(),
            transports,
        );
        let task = tokio::spawn(orchestrator.run(command_rx));
        Self {
            handle,
            events,
            store,
            task,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Starts a session as the offering side.
    pub async fn offer(&self) -> Result<SessionOffer> {
        Ok(self.handle.create_session().await?)
    }

    /// Answers an offer token and returns the answer token.
    pub async fn answer(&self, offer_token: &str) -> Result<String> {
        Ok(self.handle.join_session(offer_token.trim()).await?)
    }

    pub async fn complete(&self, answer_token: &str) -> Result<()> {
        Ok(self.handle.complete_connection(answer_token.trim()).await?)
    }

    /// Waits for the peer's inventory.
    pub async fn wait_for_metadata(&mut self) -> Result<SyncMetadata> {
        loop {
            match self.next_event().await? {
                SyncEvent::MetadataReceived {
                    metadata,
                    conflicts,
                } => {
                    info!(
                        "{} holds {} projects / {} records, {} shared",
                        metadata.peer_label,
                        metadata.project_count,
                        metadata.record_count,
                        conflicts.len()
                    );
                    return Ok(metadata);
                }
                SyncEvent::Failed { code, message } => bail!("sync failed ({code}): {message}"),
                other => log_event(&other),
            }
        }
    }

    /// Sends a selection and waits for the peer's verdict.
    pub async fn request(&mut self, selection: SyncSelection) -> Result<()> {
        self.handle.send_selection(selection).await?;
        loop {
            match self.next_event().await? {
                SyncEvent::SelectionAccepted(_) => return Ok(()),
                SyncEvent::SelectionRejected { reason } => bail!("peer rejected the selection: {reason}"),
                SyncEvent::Failed { code, message } => bail!("sync failed ({code}): {message}"),
                other => log_event(&other),
            }
        }
    }

    /// Waits until the run ends one way or another.
    pub async fn finish(&mut self) -> Result<Outcome> {
        loop {
            match self.next_event().await? {
                SyncEvent::Completed(summary) => return Ok(Outcome::Completed(summary)),
                SyncEvent::Cancelled { by_peer } => return Ok(Outcome::Cancelled { by_peer }),
                SyncEvent::Failed { code, message } => return Ok(Outcome::Failed { code, message }),
                other => log_event(&other),
            }
        }
    }

    /// Closes the session and stops the orchestrator.
    pub async fn shutdown(self) -> Result<()> {
        if let Err(e) = self.handle.close().await {
            warn!("Close failed: {e}");
        }
        self.handle.shutdown().await?;
        self.task.await.context("Orchestrator task panicked")??;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<SyncEvent> {
        self.events
            .recv()
            .await
            .context("Orchestrator stopped unexpectedly")
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::PhaseChanged(phase) => info!("Phase: {phase}"),
        SyncEvent::Reconnecting {
            attempt,
            max_attempts,
        } => warn!("Connection lost, reconnecting ({attempt}/{max_attempts})"),
        SyncEvent::SelectionReceived(selection) => info!(
            "Peer requested {} projects ({:?})",
            selection.project_ids.len(),
            selection.direction
        ),
        SyncEvent::Progress(progress) => debug!(
            "{:?}: {}/{} chunks",
            progress.direction, progress.sent_chunks, progress.total_chunks
        ),
        other => debug!("Event: {other:?}"),
    }
}

/// Loads the snapshot at `path`, or an empty store.
pub fn open_store(path: &Path) -> Result<MemoryStore> {
    let store = MemoryStore::load_or_default(path)
        .with_context(|| format!("Failed to load data file {}", path.display()))?;
    info!(
        "Loaded {} projects, {} records from {}",
        store.list_projects()?.len(),
        store.record_count()?,
        path.display()
    );
    Ok(store)
}
