//! Sync orchestrator - sequences one sync run end to end.
//!
//! The orchestrator ties together:
//! - the session (pairing handshake, link health, framed messages)
//! - the sync engine (metadata, payloads, request review)
//! - chunked transfer and payload application
//!
//! It owns all I/O and runs as a single task. Callers talk to it through an
//! [`OrchestratorHandle`] and observe it through one [`SyncEvent`] stream.

use crate::applicator::{ImportSummary, PayloadApplicator};
use crate::chunk::{IncomingTransfer, OutgoingTransfer, TransferProgress};
use crate::config::SyncConfig;
use crate::conflict::ConflictInfo;
use crate::descriptor::{DescriptorCodec, Role};
use crate::engine::{DeviceIdentity, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::pairing::PairingCode;
use crate::protocol::{
    CancelMessage, DataChunkMessage, DataCompleteMessage, Envelope, ErrorMessage, Message,
    MessageKind, PROTOCOL_VERSION, RejectMessage, SyncMetadata, SyncSelection,
};
use crate::session::{SessionManager, SessionSignal, SessionState};
use crate::transport::{Transport, TransportEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tally_store::{LocalStore, StoreError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Builds a fresh transport for every new session.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

type Reply<T> = oneshot::Sender<SyncResult<T>>;

/// Commands that can be sent to the orchestrator.
#[derive(Debug)]
pub enum SyncCommand {
    /// Start a session as the offering device.
    CreateSession { reply: Reply<SessionOffer> },
    /// The scanner opened on the answering device.
    ExpectOffer { reply: Reply<()> },
    /// Answer a scanned offer token.
    JoinSession { offer: String, reply: Reply<String> },
    /// Finish the handshake with the scanned answer token.
    CompleteConnection { answer: String, reply: Reply<()> },
    /// Request an exchange of the selected projects.
    SendSelection {
        selection: SyncSelection,
        reply: Reply<()>,
    },
    /// Start streaming a staged payload (manual send mode).
    SendData { reply: Reply<()> },
    /// Cancel the running transfer.
    Cancel { reply: Reply<()> },
    /// Close the current session.
    Close { reply: Reply<()> },
    /// Stop the orchestrator.
    Shutdown,
}

/// What the offering device shows the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOffer {
    /// Text token to render as a QR code.
    pub token: String,
    pub pairing_code: PairingCode,
}

/// Sync run phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Connecting,
    Connected,
    MetadataExchanged,
    Selecting,
    Transferring,
    Complete,
    Cancelled,
    Error,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::MetadataExchanged => "metadata_exchanged",
            Self::Selecting => "selecting",
            Self::Transferring => "transferring",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Events emitted by the orchestrator for the UI.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PhaseChanged(SyncPhase),
    SessionStateChanged(SessionState),
    /// The link dropped and a recovery attempt started.
    Reconnecting { attempt: u32, max_attempts: u32 },
    /// The peer's inventory arrived.
    MetadataReceived {
        metadata: SyncMetadata,
        conflicts: Vec<ConflictInfo>,
    },
    /// This device accepted the peer's selection.
    SelectionReceived(SyncSelection),
    /// The peer accepted this device's selection.
    SelectionAccepted(SyncSelection),
    SelectionRejected { reason: String },
    Progress(TransferProgress),
    Completed(ImportSummary),
    Cancelled { by_peer: bool },
    /// Terminal failure of the session.
    Failed { code: String, message: String },
}

/// Configuration for the sync orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Start streaming as soon as a selection is accepted. When off, the
    /// payload is staged until `send_data`.
    pub auto_send: bool,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_send: true,
            command_buffer: 32,
        }
    }
}

/// Handle to send commands to the orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<SyncCommand>,
}

impl OrchestratorHandle {
    /// Sends a raw command.
    pub async fn send(&self, cmd: SyncCommand) -> Result<(), mpsc::error::SendError<SyncCommand>> {
        self.command_tx.send(cmd).await
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SyncCommand) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .await
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)?
    }

    /// Starts a session and returns the offer to display.
    pub async fn create_session(&self) -> SyncResult<SessionOffer> {
        self.request(|reply| SyncCommand::CreateSession { reply }).await
    }

    pub async fn expect_offer(&self) -> SyncResult<()> {
        self.request(|reply| SyncCommand::ExpectOffer { reply }).await
    }

    /// Answers a scanned offer token; returns the answer token.
    pub async fn join_session(&self, offer: impl Into<String>) -> SyncResult<String> {
        let offer = offer.into();
        self.request(|reply| SyncCommand::JoinSession { offer, reply })
            .await
    }

    pub async fn complete_connection(&self, answer: impl Into<String>) -> SyncResult<()> {
        let answer = answer.into();
        self.request(|reply| SyncCommand::CompleteConnection { answer, reply })
            .await
    }

    pub async fn send_selection(&self, selection: SyncSelection) -> SyncResult<()> {
        self.request(|reply| SyncCommand::SendSelection { selection, reply })
            .await
    }

    pub async fn send_data(&self) -> SyncResult<()> {
        self.request(|reply| SyncCommand::SendData { reply }).await
    }

    pub async fn cancel(&self) -> SyncResult<()> {
        self.request(|reply| SyncCommand::Cancel { reply }).await
    }

    pub async fn close(&self) -> SyncResult<()> {
        self.request(|reply| SyncCommand::Close { reply }).await
    }

    /// Shuts down the orchestrator.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.command_tx
            .send(SyncCommand::Shutdown)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

/// One accepted selection being carried out.
struct Exchange {
    selection: SyncSelection,
    sends: bool,
    receives: bool,
    /// Payload prepared but not yet streaming.
    staged: Option<OutgoingTransfer>,
    outgoing: Option<OutgoingTransfer>,
    sent: (usize, usize),
    /// Message id of our `data-complete`, awaiting the peer's ack.
    complete_id: Option<String>,
    outgoing_done: bool,
    incoming: Option<IncomingTransfer>,
    incoming_done: bool,
    imported: Option<ImportSummary>,
}

impl Exchange {
    fn new(selection: SyncSelection, requester: bool) -> Self {
        let direction = selection.direction;
        let (sends, receives) = if requester {
            (direction.requester_sends(), direction.responder_sends())
        } else {
            (direction.responder_sends(), direction.requester_sends())
        };
        Self {
            selection,
            sends,
            receives,
            staged: None,
            outgoing: None,
            sent: (0, 0),
            complete_id: None,
            outgoing_done: false,
            incoming: receives.then(IncomingTransfer::new),
            incoming_done: false,
            imported: None,
        }
    }

    fn is_done(&self) -> bool {
        (!self.sends || self.outgoing_done) && (!self.receives || self.incoming_done)
    }

    fn summary(&self) -> ImportSummary {
        match &self.imported {
            Some(imported) => imported.clone(),
            None => ImportSummary::sent(self.sent.0, self.sent.1),
        }
    }
}

/// The sync orchestrator.
pub struct SyncOrchestrator {
    engine: SyncEngine,
    store: Arc<dyn LocalStore>,
    config: OrchestratorConfig,
    codec: DescriptorCodec,
    transports: TransportFactory,
    session: Option<SessionManager>,
    phase: SyncPhase,
    remote_meta: Option<SyncMetadata>,
    exchange: Option<Exchange>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Runs the orchestrator event loop until shutdown or until every
    /// handle is dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<SyncCommand>) -> SyncResult<()> {
        info!("[SYNC] Orchestrator started for peer {}", self.engine.peer_id());

        loop {
            let deadline = self.session.as_ref().and_then(SessionManager::next_deadline);
            let pump_ready = self.should_pump();

            tokio::select! {
                biased;

                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("[SYNC] All handles dropped, stopping");
                        break;
                    };
                    debug!("[SYNC] Received command: {:?}", cmd);
                    if !self.handle_command(cmd).await {
                        info!("[SYNC] Orchestrator shutting down");
                        break;
                    }
                }

                event = next_transport_event(self.session.as_mut()) => {
                    if let Some(session) = self.session.as_mut() {
                        session.handle_transport_event(event).await;
                    }
                }

                _ = sleep_until(deadline) => {
                    if let Some(session) = self.session.as_mut() {
                        session.on_timer().await;
                    }
                }

                _ = std::future::ready(()), if pump_ready => {
                    self.pump().await;
                }
            }

            self.process_signals().await;
        }

        if let Some(session) = self.session.as_mut() {
            session.close().await;
        }
        Ok(())
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Returns false on shutdown.
    async fn handle_command(&mut self, cmd: SyncCommand) -> bool {
        match cmd {
            SyncCommand::CreateSession { reply } => {
                let result = self.create_session().await;
                let _ = reply.send(result);
            }
            SyncCommand::ExpectOffer { reply } => {
                self.replace_session().await;
                let result = match self.session.as_mut() {
                    Some(session) => session.expect_offer(),
                    None => Err(SyncError::invalid_state("wait for an offer", self.phase)),
                };
                let _ = reply.send(result);
            }
            SyncCommand::JoinSession { offer, reply } => {
                let result = self.join_session(&offer).await;
                let _ = reply.send(result);
            }
            SyncCommand::CompleteConnection { answer, reply } => {
                let result = self.complete_connection(&answer).await;
                let _ = reply.send(result);
            }
            SyncCommand::SendSelection { selection, reply } => {
                let result = self.send_selection(selection).await;
                let _ = reply.send(result);
            }
            SyncCommand::SendData { reply } => {
                let result = self.send_data();
                let _ = reply.send(result);
            }
            SyncCommand::Cancel { reply } => {
                let result = self.cancel().await;
                let _ = reply.send(result);
            }
            SyncCommand::Close { reply } => {
                self.close().await;
                let _ = reply.send(Ok(()));
            }
            SyncCommand::Shutdown => return false,
        }
        true
    }

    /// Closes any prior session and starts a fresh one.
    async fn replace_session(&mut self) {
        if let Some(mut old) = self.session.take() {
            old.close().await;
            for signal in old.drain_signals() {
                if let SessionSignal::StateChanged(state) = signal {
                    self.emit(SyncEvent::SessionStateChanged(state)).await;
                }
            }
        }
        self.exchange = None;
        self.remote_meta = None;
        let transport = (self.transports)();
        self.session = Some(SessionManager::new(
            transport,
            self.engine.identity().clone(),
            self.engine.config().clone(),
        ));
        self.set_phase(SyncPhase::Idle).await;
    }

    async fn create_session(&mut self) -> SyncResult<SessionOffer> {
        self.replace_session().await;
        self.set_phase(SyncPhase::Connecting).await;
        let session = self.session_mut("create a session")?;
        let (descriptor, pairing_code) = session.create_session().await?;
        Ok(SessionOffer {
            token: self.codec.encode(&descriptor),
            pairing_code,
        })
    }

    async fn join_session(&mut self, token: &str) -> SyncResult<String> {
        let offer = self.codec.decode_expecting(token, Role::Offer)?;
        let reuse = self
            .session
            .as_ref()
            .is_some_and(|s| s.state() == SessionState::WaitingForOffer);
        if !reuse {
            self.replace_session().await;
        }
        self.set_phase(SyncPhase::Connecting).await;
        let session = self.session_mut("join a session")?;
        let answer = session.join_session(&offer).await?;
        Ok(self.codec.encode(&answer))
    }

    async fn complete_connection(&mut self, token: &str) -> SyncResult<()> {
        let answer = self.codec.decode_expecting(token, Role::Answer)?;
        self.session_mut("complete the connection")?
            .complete_connection(&answer)
            .await
    }

    async fn send_selection(&mut self, selection: SyncSelection) -> SyncResult<()> {
        if !matches!(
            self.phase,
            SyncPhase::MetadataExchanged | SyncPhase::Complete | SyncPhase::Cancelled
        ) {
            return Err(SyncError::invalid_state("send a selection", self.phase));
        }
        let session = self.session_mut("send a selection")?;
        if session.send_tracked(Message::SyncRequest(selection.clone())).await.is_none() {
            return Err(SyncError::TransportFailure("selection could not be sent".into()));
        }
        info!(
            "[SYNC] Requested {} projects ({:?})",
            selection.project_ids.len(),
            selection.direction
        );
        self.set_phase(SyncPhase::Selecting).await;
        Ok(())
    }

    fn send_data(&mut self) -> SyncResult<()> {
        let staged = self.exchange.as_mut().and_then(|ex| {
            let staged = ex.staged.take()?;
            Some((ex, staged))
        });
        match staged {
            Some((ex, transfer)) => {
                debug!("Streaming staged payload of {} chunks", transfer.total_chunks());
                ex.outgoing = Some(transfer);
                Ok(())
            }
            None => Err(SyncError::invalid_state("send data", self.phase)),
        }
    }

    async fn cancel(&mut self) -> SyncResult<()> {
        if self.phase != SyncPhase::Transferring {
            return Err(SyncError::invalid_state("cancel", self.phase));
        }
        if let Some(session) = self.session.as_mut() {
            let cancel = Message::Cancel(CancelMessage {
                reason: Some("cancelled by user".into()),
            });
            if !session.send(cancel).await {
                warn!("[SYNC] Cancel could not be delivered to the peer");
            }
        }
        self.stop_transfer(false).await;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close().await;
        }
        self.exchange = None;
        self.set_phase(SyncPhase::Idle).await;
    }

    fn session_mut(&mut self, operation: &'static str) -> SyncResult<&mut SessionManager> {
        let phase = self.phase;
        self.session
            .as_mut()
            .ok_or_else(|| SyncError::invalid_state(operation, phase))
    }

    // ── Session signals ──────────────────────────────────────────

    async fn process_signals(&mut self) {
        loop {
            let signals = match self.session.as_mut() {
                Some(session) => session.drain_signals(),
                None => return,
            };
            if signals.is_empty() {
                return;
            }
            for signal in signals {
                self.on_signal(signal).await;
            }
        }
    }

    async fn on_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::StateChanged(state) => {
                self.emit(SyncEvent::SessionStateChanged(state)).await;
            }
            SessionSignal::Opened => self.on_opened().await,
            SessionSignal::Reopened => {
                info!("[SYNC] Resuming in phase {}", self.phase);
            }
            SessionSignal::Reconnecting {
                attempt,
                max_attempts,
            } => {
                self.emit(SyncEvent::Reconnecting {
                    attempt,
                    max_attempts,
                })
                .await;
            }
            SessionSignal::Message(envelope) => self.on_message(envelope).await,
            SessionSignal::Acknowledged { message_id, kind } => {
                self.on_acknowledged(&message_id, kind).await;
            }
            SessionSignal::Failed(err) => self.enter_error(&err).await,
            SessionSignal::PeerClosed => {
                if self.exchange.is_some() {
                    self.fail(SyncError::TransportFailure(
                        "peer closed the session during the transfer".into(),
                    ))
                    .await;
                } else {
                    self.set_phase(SyncPhase::Idle).await;
                }
            }
        }
    }

    async fn on_opened(&mut self) {
        self.set_phase(SyncPhase::Connected).await;
        let metadata = match self.blocking(|engine, store| engine.metadata(store)).await {
            Ok(metadata) => metadata,
            Err(e) => return self.fail(e).await,
        };
        info!(
            "[SYNC] Sending metadata: {} projects, {} records",
            metadata.project_count, metadata.record_count
        );
        if let Some(session) = self.session.as_mut() {
            if session.send_tracked(Message::Metadata(metadata)).await.is_none() {
                warn!("[SYNC] Metadata could not be sent");
            }
        }
    }

    async fn on_message(&mut self, envelope: Envelope) {
        let Envelope {
            message,
            message_id,
            ..
        } = envelope;
        match message {
            Message::Metadata(metadata) => self.on_metadata(metadata).await,
            Message::SyncRequest(selection) => self.on_request(selection).await,
            Message::SyncAccept(selection) => {
                if self.phase != SyncPhase::Selecting {
                    warn!("[SYNC] Unexpected sync-accept in phase {}", self.phase);
                    return;
                }
                self.emit(SyncEvent::SelectionAccepted(selection.clone())).await;
                self.start_exchange(selection, true).await;
            }
            Message::SyncReject(RejectMessage { reason }) => {
                if self.phase != SyncPhase::Selecting {
                    warn!("[SYNC] Unexpected sync-reject in phase {}", self.phase);
                    return;
                }
                info!("[SYNC] Selection rejected: {reason}");
                self.set_phase(SyncPhase::MetadataExchanged).await;
                self.emit(SyncEvent::SelectionRejected { reason }).await;
            }
            Message::DataChunk(chunk) => self.on_chunk(chunk).await,
            Message::DataComplete(complete) => self.on_data_complete(complete, &message_id).await,
            Message::Cancel(CancelMessage { reason }) => {
                if self.exchange.is_none() {
                    debug!("Cancel outside a transfer ignored");
                    return;
                }
                info!(
                    "[SYNC] Peer cancelled: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.stop_transfer(true).await;
            }
            Message::Error(ErrorMessage { code, message }) => {
                let err = SyncError::Protocol(format!("peer reported {code}: {message}"));
                if let Some(session) = self.session.as_mut() {
                    session.abort(err).await;
                }
            }
            Message::Ack(_) | Message::Heartbeat => {}
        }
    }

    async fn on_metadata(&mut self, metadata: SyncMetadata) {
        if metadata.version != PROTOCOL_VERSION {
            return self
                .fail(SyncError::Protocol(format!(
                    "protocol version mismatch: expected {PROTOCOL_VERSION}, got {}",
                    metadata.version
                )))
                .await;
        }

        let remote = metadata.clone();
        let conflicts = match self
            .blocking(move |engine, store| engine.conflicts(store, &remote))
            .await
        {
            Ok(conflicts) => conflicts,
            Err(e) => return self.fail(e).await,
        };
        info!(
            "[SYNC] Metadata from {}: {} projects, {} conflicts",
            metadata.peer_label,
            metadata.project_count,
            conflicts.len()
        );

        self.remote_meta = Some(metadata.clone());
        if self.phase == SyncPhase::Connected {
            self.set_phase(SyncPhase::MetadataExchanged).await;
        }
        self.emit(SyncEvent::MetadataReceived {
            metadata,
            conflicts,
        })
        .await;
    }

    async fn on_request(&mut self, selection: SyncSelection) {
        let busy = self.exchange.is_some() || self.phase == SyncPhase::Selecting;
        let verdict = if busy {
            Ok(Err(RejectMessage {
                reason: "peer is busy with another exchange".into(),
            }))
        } else {
            let request = selection.clone();
            let requester = self.remote_meta.clone();
            self.blocking(move |engine, store| {
                engine.review_request(store, &request, requester.as_ref())
            })
            .await
        };

        match verdict {
            Err(e) => self.fail(e).await,
            Ok(Err(reject)) => {
                info!("[SYNC] Rejecting selection: {}", reject.reason);
                if let Some(session) = self.session.as_mut() {
                    session.send_tracked(Message::SyncReject(reject)).await;
                }
            }
            Ok(Ok(())) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if session
                    .send_tracked(Message::SyncAccept(selection.clone()))
                    .await
                    .is_none()
                {
                    return self
                        .fail(SyncError::TransportFailure("accept could not be sent".into()))
                        .await;
                }
                self.emit(SyncEvent::SelectionReceived(selection.clone())).await;
                self.start_exchange(selection, false).await;
            }
        }
    }

    async fn on_acknowledged(&mut self, message_id: &str, kind: MessageKind) {
        debug!("Peer acknowledged {kind} {message_id}");
        let Some(ex) = self.exchange.as_mut() else {
            return;
        };
        if ex.complete_id.as_deref() == Some(message_id) {
            ex.outgoing_done = true;
            self.maybe_finish().await;
        }
    }

    // ── Transfer ─────────────────────────────────────────────────

    async fn start_exchange(&mut self, selection: SyncSelection, requester: bool) {
        let mut exchange = Exchange::new(selection, requester);

        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.begin_transfer() {
                return self.fail(e).await;
            }
        }
        self.set_phase(SyncPhase::Transferring).await;

        if exchange.sends {
            let ids = exchange.selection.project_ids.clone();
            let payload = match self
                .blocking(move |engine, store| engine.payload(store, &ids))
                .await
            {
                Ok(payload) => payload,
                Err(e) => return self.fail(e).await,
            };
            exchange.sent = (payload.projects.len(), payload.records.len());
            let transfer = match OutgoingTransfer::new(&payload, self.engine.config().chunk_size) {
                Ok(transfer) => transfer,
                Err(e) => return self.fail(e).await,
            };
            info!(
                "[SYNC] Sending {} projects, {} records in {} chunks",
                exchange.sent.0,
                exchange.sent.1,
                transfer.total_chunks()
            );
            if self.config.auto_send {
                exchange.outgoing = Some(transfer);
            } else {
                exchange.staged = Some(transfer);
            }
        }

        self.exchange = Some(exchange);
    }

    fn should_pump(&self) -> bool {
        let channel_open = self
            .session
            .as_ref()
            .is_some_and(|s| s.channel().is_open());
        channel_open
            && self.phase == SyncPhase::Transferring
            && self.exchange.as_ref().is_some_and(|ex| ex.outgoing.is_some())
    }

    /// Sends one chunk, or the closing `data-complete`.
    async fn pump(&mut self) {
        let (Some(session), Some(ex)) = (self.session.as_mut(), self.exchange.as_mut()) else {
            return;
        };
        let Some(outgoing) = ex.outgoing.as_mut() else {
            return;
        };

        if let Some(chunk) = outgoing.next_message() {
            if !session.send(chunk).await {
                return self
                    .fail(SyncError::TransportFailure("chunk could not be sent".into()))
                    .await;
            }
            let progress = outgoing.progress();
            self.emit(SyncEvent::Progress(progress)).await;
            return;
        }

        let complete = outgoing.complete_message();
        ex.outgoing = None;
        match session.send_tracked(complete).await {
            Some(id) => {
                debug!("data-complete sent as {id}");
                ex.complete_id = Some(id);
            }
            None => {
                self.fail(SyncError::TransportFailure(
                    "data-complete could not be sent".into(),
                ))
                .await;
            }
        }
    }

    async fn on_chunk(&mut self, chunk: DataChunkMessage) {
        let Some(incoming) = self.exchange.as_mut().and_then(|ex| ex.incoming.as_mut()) else {
            debug!("Chunk {} outside a transfer ignored", chunk.index);
            return;
        };
        match incoming.accept(chunk) {
            Ok(progress) => self.emit(SyncEvent::Progress(progress)).await,
            Err(e) => self.fail(e).await,
        }
    }

    /// Applies the reassembled payload, then acks the `data-complete`. A
    /// failure sends `error` instead, so the sender never sees both.
    async fn on_data_complete(&mut self, complete: DataCompleteMessage, message_id: &str) {
        let Some(ex) = self.exchange.as_mut() else {
            debug!("data-complete outside a transfer ignored");
            return;
        };
        let Some(mut incoming) = ex.incoming.take() else {
            warn!("[SYNC] data-complete while not receiving");
            return;
        };
        let policy = ex.selection.resolve_conflicts;

        let payload = match incoming.finish_payload(&complete) {
            Ok(payload) => payload,
            Err(e) => return self.fail(e).await,
        };
        info!(
            "[SYNC] Received {} projects, {} records",
            payload.projects.len(),
            payload.records.len()
        );

        let summary = match self
            .blocking(move |_, store| Ok(PayloadApplicator::new(policy).apply(store, &payload)))
            .await
        {
            Ok(summary) => summary,
            Err(e) => return self.fail(e).await,
        };
        info!("[SYNC] {}", summary.message);

        if let Some(session) = self.session.as_mut() {
            if !session.acknowledge(message_id).await {
                warn!("[SYNC] data-complete ack could not be sent");
            }
        }
        if let Some(ex) = self.exchange.as_mut() {
            ex.incoming_done = true;
            ex.imported = Some(summary);
        }
        self.maybe_finish().await;
    }

    async fn maybe_finish(&mut self) {
        if !self.exchange.as_ref().is_some_and(Exchange::is_done) {
            return;
        }
        let Some(exchange) = self.exchange.take() else {
            return;
        };
        if let Some(session) = self.session.as_mut() {
            session.end_transfer();
        }
        self.set_phase(SyncPhase::Complete).await;
        self.emit(SyncEvent::Completed(exchange.summary())).await;
    }

    /// Drops the running exchange after a cancel from either side.
    async fn stop_transfer(&mut self, by_peer: bool) {
        if let Some(mut exchange) = self.exchange.take() {
            if let Some(outgoing) = exchange.outgoing.as_mut() {
                outgoing.cancel();
            }
            if let Some(incoming) = exchange.incoming.as_mut() {
                incoming.cancel();
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.end_transfer();
        }
        self.set_phase(SyncPhase::Cancelled).await;
        self.emit(SyncEvent::Cancelled { by_peer }).await;
    }

    // ── Failure ──────────────────────────────────────────────────

    /// Reports the error to the peer, then ends the session.
    async fn fail(&mut self, err: SyncError) {
        match self.session.as_mut() {
            Some(session) => {
                session.send(Message::Error(ErrorMessage::from(&err))).await;
                session.abort(err).await;
            }
            None => self.enter_error(&err).await,
        }
    }

    async fn enter_error(&mut self, err: &SyncError) {
        self.exchange = None;
        self.set_phase(SyncPhase::Error).await;
        self.emit(SyncEvent::Failed {
            code: err.code().to_string(),
            message: err.to_string(),
        })
        .await;
    }

    // ── Helpers ──────────────────────────────────────────────────

    async fn set_phase(&mut self, phase: SyncPhase) {
        if self.phase == phase {
            return;
        }
        info!("[SYNC] Phase {} -> {}", self.phase, phase);
        self.phase = phase;
        self.emit(SyncEvent::PhaseChanged(phase)).await;
    }

    /// Blocks while the observer's buffer is full.
    async fn emit(&mut self, event: SyncEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("No event listener");
        }
    }

    /// Runs store work on a blocking thread.
    async fn blocking<T, F>(&mut self, work: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SyncEngine, &dyn LocalStore) -> SyncResult<T> + Send + 'static,
    {
        let engine = self.engine.clone();
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || work(&engine, store.as_ref()))
            .await
            .map_err(|e| SyncError::Store(StoreError::InvalidData(format!("store task failed: {e}"))))?
    }
}

async fn next_transport_event(session: Option<&mut SessionManager>) -> TransportEvent {
    match session {
        Some(session) => session.next_transport_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Creates an orchestrator and the channels around it.
///
/// The event receiver must be drained continuously. Events are delivered
/// with backpressure: once `event_buffer` events are unread the loop waits,
/// and heartbeats, timers and commands wait with it. Do not issue a command
/// and await its reply from the only task that reads events while the buffer
/// may be full.
pub fn create_orchestrator(
    identity: DeviceIdentity,
    store: Arc<dyn LocalStore>,
    config: SyncConfig,
    orchestrator_config: OrchestratorConfig,
    transports: TransportFactory,
) -> (
    OrchestratorHandle,
    mpsc::Receiver<SyncEvent>,
    mpsc::Receiver<SyncCommand>,
    SyncOrchestrator,
) {
    let (command_tx, command_rx) = mpsc::channel(orchestrator_config.command_buffer.max(1));
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
    let codec = DescriptorCodec::new(config.max_token_length);

    let handle = OrchestratorHandle { command_tx };
    let orchestrator = SyncOrchestrator {
        engine: SyncEngine::new(identity, config),
        store,
        config: orchestrator_config,
        codec,
        transports,
        session: None,
        phase: SyncPhase::Idle,
        remote_meta: None,
        exchange: None,
        event_tx,
    };

    (handle, event_rx, command_rx, orchestrator)
}
