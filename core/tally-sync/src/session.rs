//! Session manager - owns the transport and the connection lifecycle.
//!
//! The session is a single owned state machine. Every transition replaces
//! the one authoritative [`Phase`] value; timers are not separate tasks but
//! deadlines stored in the phase, which the orchestrator sleeps until and
//! then hands back to [`SessionManager::on_timer`].
//!
//! Observable effects (state changes, inbound messages, failures) are queued
//! as [`SessionSignal`]s and drained by the orchestrator after every call.

use crate::channel::{Inbound, MessageChannel};
use crate::config::SyncConfig;
use crate::descriptor::{ConnectionDescriptor, DecodeError, Role};
use crate::engine::DeviceIdentity;
use crate::error::{SyncError, SyncResult};
use crate::pairing::PairingCode;
use crate::protocol::{AckMessage, Envelope, Message, MessageKind};
use crate::transport::{LinkState, Transport, TransportEvent, TransportEvents};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Externally visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    CreatingOffer,
    WaitingForOffer,
    WaitingForScan,
    CreatingAnswer,
    WaitingForConnection,
    Connected,
    Transferring,
    Reconnecting,
    Closed,
    Error,
}

impl SessionState {
    /// Whether messages can flow.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Connected | Self::Transferring)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::CreatingOffer => "creating_offer",
            Self::WaitingForOffer => "waiting_for_offer",
            Self::WaitingForScan => "waiting_for_scan",
            Self::CreatingAnswer => "creating_answer",
            Self::WaitingForConnection => "waiting_for_connection",
            Self::Connected => "connected",
            Self::Transferring => "transferring",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Effects of a session call, in the order they happened.
#[derive(Debug)]
pub enum SessionSignal {
    StateChanged(SessionState),
    /// The channel opened for the first time.
    Opened,
    /// The channel came back after an outage.
    Reopened,
    Reconnecting { attempt: u32, max_attempts: u32 },
    Message(Envelope),
    Acknowledged { message_id: String, kind: MessageKind },
    /// The session entered `error`.
    Failed(SyncError),
    /// The peer closed the session.
    PeerClosed,
}

/// Internal state with the data each state needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    CreatingOffer,
    WaitingForOffer,
    WaitingForScan { deadline: Instant },
    CreatingAnswer,
    WaitingForConnection { deadline: Instant },
    Open { transferring: bool, next_heartbeat: Instant },
    /// Link dropped; waiting out the grace period before recovery.
    Unstable { transferring: bool, grace_until: Instant },
    Reconnecting { transferring: bool, attempt: u32, next_attempt: Instant },
    Closed,
    Error,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Self::Idle => SessionState::Idle,
            Self::CreatingOffer => SessionState::CreatingOffer,
            Self::WaitingForOffer => SessionState::WaitingForOffer,
            Self::WaitingForScan { .. } => SessionState::WaitingForScan,
            Self::CreatingAnswer => SessionState::CreatingAnswer,
            Self::WaitingForConnection { .. } => SessionState::WaitingForConnection,
            Self::Open { transferring, .. } | Self::Unstable { transferring, .. } => {
                if *transferring {
                    SessionState::Transferring
                } else {
                    SessionState::Connected
                }
            }
            Self::Reconnecting { .. } => SessionState::Reconnecting,
            Self::Closed => SessionState::Closed,
            Self::Error => SessionState::Error,
        }
    }

    fn transferring(&self) -> Option<bool> {
        match self {
            Self::Open { transferring, .. }
            | Self::Unstable { transferring, .. }
            | Self::Reconnecting { transferring, .. } => Some(*transferring),
            _ => None,
        }
    }
}

/// Owns one transport for the lifetime of one session.
pub struct SessionManager {
    identity: DeviceIdentity,
    config: SyncConfig,
    transport: Box<dyn Transport>,
    events: Option<TransportEvents>,
    backlog: VecDeque<TransportEvent>,
    channel: MessageChannel,
    phase: Phase,
    pairing_code: Option<PairingCode>,
    remote: Option<ConnectionDescriptor>,
    signals: Vec<SessionSignal>,
    released: bool,
}

impl SessionManager {
    pub fn new(mut transport: Box<dyn Transport>, identity: DeviceIdentity, config: SyncConfig) -> Self {
        let events = transport.take_events();
        Self {
            identity,
            config,
            transport,
            events,
            backlog: VecDeque::new(),
            channel: MessageChannel::new(),
            phase: Phase::Idle,
            pairing_code: None,
            remote: None,
            signals: Vec::new(),
            released: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.phase.state()
    }

    pub fn pairing_code(&self) -> Option<&PairingCode> {
        self.pairing_code.as_ref()
    }

    /// The peer's descriptor once known.
    pub fn remote(&self) -> Option<&ConnectionDescriptor> {
        self.remote.as_ref()
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    /// Takes the signals queued since the last call.
    pub fn drain_signals(&mut self) -> Vec<SessionSignal> {
        std::mem::take(&mut self.signals)
    }

    // ── Handshake ────────────────────────────────────────────────

    /// Starts a session as the offering side.
    ///
    /// Waits for candidate gathering (bounded), then arms the connection
    /// timeout and enters `waiting_for_scan`.
    pub async fn create_session(&mut self) -> SyncResult<(ConnectionDescriptor, PairingCode)> {
        if self.phase != Phase::Idle {
            return Err(SyncError::invalid_state("create a session", self.state()));
        }
        self.set_phase(Phase::CreatingOffer);

        let description = match self.transport.create_offer().await {
            Ok(description) => description,
            Err(e) => return Err(self.fail_with(e).await),
        };
        let candidates = self.gather_candidates().await;
        let code = PairingCode::generate(self.config.pairing_code_length);
        let descriptor = ConnectionDescriptor {
            role: Role::Offer,
            session_description: description,
            candidates,
            pairing_code: code.clone(),
            peer_id: self.identity.peer_id,
            peer_label: self.identity.label.clone(),
        };

        self.pairing_code = Some(code.clone());
        let deadline = Instant::now() + self.config.session_timeout();
        self.set_phase(Phase::WaitingForScan { deadline });
        info!("[SYNC] Offer ready, pairing code {}", code.display_grouped());
        Ok((descriptor, code))
    }

    /// Marks that the user opened the scanner on the answering device.
    pub fn expect_offer(&mut self) -> SyncResult<()> {
        if self.phase != Phase::Idle {
            return Err(SyncError::invalid_state("wait for an offer", self.state()));
        }
        self.set_phase(Phase::WaitingForOffer);
        Ok(())
    }

    /// Answers a scanned offer.
    pub async fn join_session(&mut self, offer: &ConnectionDescriptor) -> SyncResult<ConnectionDescriptor> {
        if offer.role != Role::Offer {
            return Err(DecodeError::WrongRole {
                expected: Role::Offer,
                actual: offer.role,
            }
            .into());
        }
        if !matches!(self.phase, Phase::Idle | Phase::WaitingForOffer) {
            return Err(SyncError::invalid_state("join a session", self.state()));
        }
        self.set_phase(Phase::CreatingAnswer);

        let description = match self
            .transport
            .accept_offer(&offer.session_description, &offer.candidates)
            .await
        {
            Ok(description) => description,
            Err(e) => return Err(self.fail_with(e).await),
        };
        let candidates = self.gather_candidates().await;
        let answer = ConnectionDescriptor {
            role: Role::Answer,
            session_description: description,
            candidates,
            pairing_code: offer.pairing_code.clone(),
            peer_id: self.identity.peer_id,
            peer_label: self.identity.label.clone(),
        };

        self.pairing_code = Some(offer.pairing_code.clone());
        self.remote = Some(offer.clone());
        let deadline = Instant::now() + self.config.session_timeout();
        self.set_phase(Phase::WaitingForConnection { deadline });
        info!("[SYNC] Answered offer from {}", offer.peer_label);
        Ok(answer)
    }

    /// Completes an offer with the scanned answer.
    pub async fn complete_connection(&mut self, answer: &ConnectionDescriptor) -> SyncResult<()> {
        if answer.role != Role::Answer {
            return Err(DecodeError::WrongRole {
                expected: Role::Answer,
                actual: answer.role,
            }
            .into());
        }
        let Phase::WaitingForScan { deadline } = self.phase else {
            return Err(SyncError::invalid_state("complete the connection", self.state()));
        };
        if self.pairing_code.as_ref() != Some(&answer.pairing_code) {
            return Err(SyncError::PairingMismatch);
        }

        if let Err(e) = self
            .transport
            .accept_answer(&answer.session_description, &answer.candidates)
            .await
        {
            return Err(self.fail_with(e).await);
        }
        self.remote = Some(answer.clone());
        self.set_phase(Phase::WaitingForConnection { deadline });
        info!("[SYNC] Answer accepted from {}", answer.peer_label);
        Ok(())
    }

    async fn gather_candidates(&mut self) -> Vec<String> {
        let deadline = Instant::now() + self.config.gathering_timeout();
        let mut candidates = Vec::new();
        let Some(events) = self.events.as_mut() else {
            return candidates;
        };
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(TransportEvent::Candidate(candidate))) => candidates.push(candidate),
                Ok(Some(TransportEvent::GatheringComplete)) | Ok(None) => break,
                Ok(Some(other)) => self.backlog.push_back(other),
                Err(_) => {
                    warn!("Candidate gathering timed out with {} candidates", candidates.len());
                    break;
                }
            }
        }
        debug!("Gathered {} candidates", candidates.len());
        candidates
    }

    // ── Transfer bracketing ──────────────────────────────────────

    /// Enters `transferring`. Only valid while connected.
    pub fn begin_transfer(&mut self) -> SyncResult<()> {
        match self.phase {
            Phase::Open {
                transferring: false,
                next_heartbeat,
            } => {
                self.set_phase(Phase::Open {
                    transferring: true,
                    next_heartbeat,
                });
                Ok(())
            }
            _ => Err(SyncError::invalid_state("start a transfer", self.state())),
        }
    }

    /// Leaves `transferring`, keeping any outage state.
    pub fn end_transfer(&mut self) {
        let next = match self.phase {
            Phase::Open { next_heartbeat, .. } => Phase::Open {
                transferring: false,
                next_heartbeat,
            },
            Phase::Unstable { grace_until, .. } => Phase::Unstable {
                transferring: false,
                grace_until,
            },
            Phase::Reconnecting {
                attempt,
                next_attempt,
                ..
            } => Phase::Reconnecting {
                transferring: false,
                attempt,
                next_attempt,
            },
            other => other,
        };
        self.set_phase(next);
    }

    // ── Messaging ────────────────────────────────────────────────

    /// Sends a message. Returns false when the channel is not open.
    pub async fn send(&mut self, message: Message) -> bool {
        self.channel.send(self.transport.as_mut(), message).await
    }

    /// Sends a message and returns its id for ack tracking.
    pub async fn send_tracked(&mut self, message: Message) -> Option<String> {
        self.channel.send_tracked(self.transport.as_mut(), message).await
    }

    /// Acks an inbound message the session left for the caller to confirm.
    pub async fn acknowledge(&mut self, message_id: &str) -> bool {
        self.send(Message::Ack(AckMessage {
            message_id: message_id.to_string(),
        }))
        .await
    }

    // ── Event loop hooks ─────────────────────────────────────────

    /// Next transport event. Never resolves once the transport is gone.
    pub async fn next_transport_event(&mut self) -> TransportEvent {
        if let Some(event) = self.backlog.pop_front() {
            return event;
        }
        if let Some(events) = self.events.as_mut() {
            if let Some(event) = events.recv().await {
                return event;
            }
            self.events = None;
        }
        std::future::pending().await
    }

    /// The next instant [`on_timer`](Self::on_timer) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::WaitingForScan { deadline } | Phase::WaitingForConnection { deadline } => {
                Some(deadline)
            }
            Phase::Open { next_heartbeat, .. } => Some(next_heartbeat),
            Phase::Unstable { grace_until, .. } => Some(grace_until),
            Phase::Reconnecting { next_attempt, .. } => Some(next_attempt),
            _ => None,
        }
    }

    /// Runs whatever deadline has passed.
    pub async fn on_timer(&mut self) {
        let now = Instant::now();
        match self.phase {
            Phase::WaitingForScan { deadline } | Phase::WaitingForConnection { deadline }
                if deadline <= now =>
            {
                warn!("[SYNC] No connection within {:?}", self.config.session_timeout());
                self.fail_with(SyncError::ConnectionTimeout).await;
            }
            Phase::Open {
                transferring,
                next_heartbeat,
            } if next_heartbeat <= now => {
                if !self.send(Message::Heartbeat).await {
                    debug!("Heartbeat not sent");
                }
                self.phase = Phase::Open {
                    transferring,
                    next_heartbeat: now + self.config.heartbeat_interval(),
                };
            }
            Phase::Unstable {
                transferring,
                grace_until,
            } if grace_until <= now => {
                self.attempt_reconnect(transferring, 1).await;
            }
            Phase::Reconnecting {
                transferring,
                attempt,
                next_attempt,
            } if next_attempt <= now => {
                self.attempt_reconnect(transferring, attempt + 1).await;
            }
            _ => {}
        }
    }

    /// Applies one transport event.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Candidate(candidate) => {
                debug!("Late candidate ignored: {candidate}");
            }
            TransportEvent::GatheringComplete => {}
            TransportEvent::Frame(frame) => self.handle_frame(&frame).await,
            TransportEvent::StateChanged(state) => self.handle_link_state(state).await,
        }
    }

    async fn handle_frame(&mut self, frame: &str) {
        if !self.channel.is_open() {
            debug!("Frame received while channel closed, dropping");
            return;
        }
        match self.channel.receive(frame) {
            Some(Inbound::Message(envelope)) => {
                // data-complete is acked by the caller once the payload is applied.
                if envelope.kind() != MessageKind::DataComplete {
                    if let Some(ack) = MessageChannel::ack_for(&envelope) {
                        self.send(ack).await;
                    }
                }
                if envelope.kind() == MessageKind::Heartbeat {
                    return;
                }
                self.signals.push(SessionSignal::Message(envelope));
            }
            Some(Inbound::Acknowledged { message_id, kind }) => {
                self.signals
                    .push(SessionSignal::Acknowledged { message_id, kind });
            }
            None => {}
        }
    }

    async fn handle_link_state(&mut self, link: LinkState) {
        let now = Instant::now();
        match (link, self.phase) {
            (LinkState::Connected, Phase::WaitingForScan { .. } | Phase::WaitingForConnection { .. }) => {
                self.set_phase(Phase::Open {
                    transferring: false,
                    next_heartbeat: now + self.config.heartbeat_interval(),
                });
                info!("[SYNC] Channel open");
                self.signals.push(SessionSignal::Opened);
            }
            (
                LinkState::Connected,
                Phase::Unstable { transferring, .. } | Phase::Reconnecting { transferring, .. },
            ) => {
                self.set_phase(Phase::Open {
                    transferring,
                    next_heartbeat: now + self.config.heartbeat_interval(),
                });
                info!("[SYNC] Channel recovered");
                self.signals.push(SessionSignal::Reopened);
            }
            (LinkState::Disconnected, Phase::Open { transferring, .. }) => {
                warn!("[SYNC] Link lost, waiting {:?} before recovery", self.config.disconnect_grace());
                self.set_phase(Phase::Unstable {
                    transferring,
                    grace_until: now + self.config.disconnect_grace(),
                });
            }
            (LinkState::Failed, Phase::Open { transferring, .. } | Phase::Unstable { transferring, .. }) => {
                warn!("[SYNC] Link failed");
                self.attempt_reconnect(transferring, 1).await;
            }
            (LinkState::Failed, Phase::WaitingForConnection { .. } | Phase::WaitingForScan { .. }) => {
                self.fail_with(SyncError::TransportFailure("connection failed".into()))
                    .await;
            }
            (
                LinkState::Closed,
                Phase::Open { .. }
                | Phase::Unstable { .. }
                | Phase::Reconnecting { .. }
                | Phase::WaitingForConnection { .. },
            ) => {
                info!("[SYNC] Peer closed the session");
                self.set_phase(Phase::Closed);
                self.release().await;
                self.signals.push(SessionSignal::PeerClosed);
            }
            (link, phase) => {
                debug!("Link {link} in {:?}, nothing to do", phase.state());
            }
        }
    }

    async fn attempt_reconnect(&mut self, transferring: bool, attempt: u32) {
        let max_attempts = self.config.max_reconnect_attempts;
        if attempt > max_attempts {
            self.fail_with(SyncError::TransportFailure(format!(
                "connection lost, {max_attempts} reconnection attempts failed"
            )))
            .await;
            return;
        }

        info!("[SYNC] Reconnection attempt {attempt}/{max_attempts}");
        self.set_phase(Phase::Reconnecting {
            transferring,
            attempt,
            next_attempt: Instant::now() + self.config.reconnect_delay(),
        });
        self.signals.push(SessionSignal::Reconnecting {
            attempt,
            max_attempts,
        });
        if let Err(e) = self.transport.restart().await {
            warn!("Restart attempt {attempt} failed: {e}");
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Closes the session. Idempotent.
    pub async fn close(&mut self) {
        if matches!(self.phase, Phase::Closed | Phase::Error) {
            self.release().await;
            return;
        }
        self.set_phase(Phase::Closed);
        self.release().await;
        info!("[SYNC] Session closed");
    }

    /// Ends the session with `err` unless it already failed.
    pub async fn abort(&mut self, err: SyncError) {
        if self.phase == Phase::Error {
            debug!("Session already failed, dropping: {err}");
            return;
        }
        self.fail_with(err).await;
    }

    /// Enters `error`, releases the transport and queues the failure.
    /// Returns a copy of the error for callers that also propagate it.
    async fn fail_with(&mut self, err: SyncError) -> SyncError {
        warn!("[SYNC] Session failed: {err}");
        self.set_phase(Phase::Error);
        self.release().await;
        let copy = clone_error(&err);
        self.signals.push(SessionSignal::Failed(err));
        copy
    }

    async fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.transport.close().await;
        }
    }

    fn set_phase(&mut self, next: Phase) {
        let before = self.phase.state();
        self.phase = next;
        self.channel.set_open(matches!(next, Phase::Open { .. }));
        let after = next.state();
        if before != after {
            debug!("Session {before} -> {after}");
            self.signals.push(SessionSignal::StateChanged(after));
        }
    }

    /// Whether a transfer is bracketed, regardless of link health.
    pub fn is_transferring(&self) -> bool {
        self.phase.transferring().unwrap_or(false)
    }
}

/// Rebuilds an error for a second owner. Wrapped store/serde errors are
/// flattened to their message.
fn clone_error(err: &SyncError) -> SyncError {
    match err {
        SyncError::DescriptorDecode(e) => SyncError::DescriptorDecode(e.clone()),
        SyncError::PairingMismatch => SyncError::PairingMismatch,
        SyncError::ConnectionTimeout => SyncError::ConnectionTimeout,
        SyncError::TransportFailure(m) => SyncError::TransportFailure(m.clone()),
        SyncError::PayloadDecode(m) => SyncError::PayloadDecode(m.clone()),
        SyncError::LockedRecord(m) => SyncError::LockedRecord(m.clone()),
        SyncError::Cancelled => SyncError::Cancelled,
        SyncError::InvalidState { operation, state } => SyncError::InvalidState {
            operation: *operation,
            state: state.clone(),
        },
        SyncError::Protocol(m) => SyncError::Protocol(m.clone()),
        SyncError::ChannelClosed => SyncError::ChannelClosed,
        other => SyncError::Protocol(other.to_string()),
    }
}
