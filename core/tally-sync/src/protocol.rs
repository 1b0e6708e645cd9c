//! Sync protocol messages and types.
//!
//! Every frame on the direct channel is one JSON envelope:
//! `{ "type", "payload", "timestamp", "messageId" }`. The `type` string picks
//! the payload shape. Receivers ignore types they do not know, so newer
//! peers can add message types without breaking older ones.
//!
//! A session runs:
//! 1. Both sides send `metadata` (what projects they hold)
//! 2. One side sends `sync-request` with its selection
//! 3. The other answers `sync-accept` or `sync-reject`
//! 4. Payload flows as `data-chunk`s closed by `data-complete`
//! 5. Either side may `cancel` a running transfer

use crate::conflict::ConflictPolicy;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use tally_model::{Project, Record};
use tally_types::{PeerId, ProjectId, Timestamp};

/// Protocol version carried in metadata.
pub const PROTOCOL_VERSION: u32 = 1;

/// The type tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Metadata,
    SyncRequest,
    SyncAccept,
    SyncReject,
    DataChunk,
    DataComplete,
    Cancel,
    Ack,
    Error,
    Heartbeat,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        Self::Metadata,
        Self::SyncRequest,
        Self::SyncAccept,
        Self::SyncReject,
        Self::DataChunk,
        Self::DataComplete,
        Self::Cancel,
        Self::Ack,
        Self::Error,
        Self::Heartbeat,
    ];

    /// The wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::SyncRequest => "sync-request",
            Self::SyncAccept => "sync-accept",
            Self::SyncReject => "sync-reject",
            Self::DataChunk => "data-chunk",
            Self::DataComplete => "data-complete",
            Self::Cancel => "cancel",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Parses a wire name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Whether the receiver confirms delivery with an `ack`.
    pub fn requires_ack(&self) -> bool {
        matches!(
            self,
            Self::Metadata
                | Self::SyncRequest
                | Self::SyncAccept
                | Self::SyncReject
                | Self::DataComplete
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Metadata(SyncMetadata),
    SyncRequest(SyncSelection),
    /// Echoes the accepted selection.
    SyncAccept(SyncSelection),
    SyncReject(RejectMessage),
    DataChunk(DataChunkMessage),
    DataComplete(DataCompleteMessage),
    Cancel(CancelMessage),
    Ack(AckMessage),
    Error(ErrorMessage),
    Heartbeat,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Metadata(_) => MessageKind::Metadata,
            Self::SyncRequest(_) => MessageKind::SyncRequest,
            Self::SyncAccept(_) => MessageKind::SyncAccept,
            Self::SyncReject(_) => MessageKind::SyncReject,
            Self::DataChunk(_) => MessageKind::DataChunk,
            Self::DataComplete(_) => MessageKind::DataComplete,
            Self::Cancel(_) => MessageKind::Cancel,
            Self::Ack(_) => MessageKind::Ack,
            Self::Error(_) => MessageKind::Error,
            Self::Heartbeat => MessageKind::Heartbeat,
        }
    }

    /// Serializes the payload part of the envelope.
    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Metadata(m) => serde_json::to_value(m),
            Self::SyncRequest(s) | Self::SyncAccept(s) => serde_json::to_value(s),
            Self::SyncReject(r) => serde_json::to_value(r),
            Self::DataChunk(c) => serde_json::to_value(c),
            Self::DataComplete(c) => serde_json::to_value(c),
            Self::Cancel(c) => serde_json::to_value(c),
            Self::Ack(a) => serde_json::to_value(a),
            Self::Error(e) => serde_json::to_value(e),
            Self::Heartbeat => Ok(Value::Null),
        }
    }

    /// Rebuilds a message from its kind and payload.
    pub fn from_parts(kind: MessageKind, payload: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::Metadata => Self::Metadata(serde_json::from_value(payload)?),
            MessageKind::SyncRequest => Self::SyncRequest(serde_json::from_value(payload)?),
            MessageKind::SyncAccept => Self::SyncAccept(serde_json::from_value(payload)?),
            MessageKind::SyncReject => Self::SyncReject(serde_json::from_value(payload)?),
            MessageKind::DataChunk => Self::DataChunk(serde_json::from_value(payload)?),
            MessageKind::DataComplete => Self::DataComplete(serde_json::from_value(payload)?),
            MessageKind::Cancel => Self::Cancel(serde_json::from_value(payload)?),
            MessageKind::Ack => Self::Ack(serde_json::from_value(payload)?),
            MessageKind::Error => Self::Error(serde_json::from_value(payload)?),
            MessageKind::Heartbeat => Self::Heartbeat,
        })
    }
}

/// Why an inbound frame was not turned into an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not JSON, missing envelope fields, or a payload that does not fit its type.
    Malformed(String),
    /// A well-formed envelope of a type this build does not know.
    UnknownType(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed frame: {msg}"),
            Self::UnknownType(kind) => write!(f, "unknown message type: {kind}"),
        }
    }
}

impl std::error::Error for FrameError {}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    timestamp: Timestamp,
    message_id: String,
}

/// A message plus its envelope fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub timestamp: Timestamp,
    pub message_id: String,
}

impl Envelope {
    /// Wraps a message with a fresh id and the current time.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            timestamp: Timestamp::now(),
            message_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serializes the envelope as one JSON frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let raw = RawEnvelope {
            kind: self.kind().as_str().to_string(),
            payload: self.message.payload()?,
            timestamp: self.timestamp,
            message_id: self.message_id.clone(),
        };
        serde_json::to_string(&raw)
    }

    /// Parses one JSON frame.
    pub fn from_json(frame: &str) -> Result<Self, FrameError> {
        let raw: RawEnvelope =
            serde_json::from_str(frame).map_err(|e| FrameError::Malformed(e.to_string()))?;
        let kind = MessageKind::parse(&raw.kind).ok_or(FrameError::UnknownType(raw.kind))?;
        let message = Message::from_parts(kind, raw.payload)
            .map_err(|e| FrameError::Malformed(format!("{kind} payload: {e}")))?;
        Ok(Self {
            message,
            timestamp: raw.timestamp,
            message_id: raw.message_id,
        })
    }
}

// ── Payloads ────────────────────────────────────────────────────

/// What a device holds, sent once right after the channel opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    #[serde(default = "default_version")]
    pub version: u32,
    pub peer_id: PeerId,
    pub peer_label: String,
    pub project_count: usize,
    pub record_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Timestamp>,
    #[serde(default)]
    pub projects: Vec<ProjectSummary>,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl SyncMetadata {
    /// Builds metadata from project summaries.
    pub fn new(peer_id: PeerId, peer_label: impl Into<String>, projects: Vec<ProjectSummary>) -> Self {
        let record_count = projects.iter().map(|p| p.record_count).sum();
        let last_updated = projects.iter().map(|p| p.updated_at).max();
        Self {
            version: PROTOCOL_VERSION,
            peer_id,
            peer_label: peer_label.into(),
            project_count: projects.len(),
            record_count,
            last_updated,
            projects,
        }
    }

    /// Looks up a project summary by id.
    pub fn project(&self, id: &ProjectId) -> Option<&ProjectSummary> {
        self.projects.iter().find(|p| &p.id == id)
    }
}

/// Per-project line of [`SyncMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub title: String,
    pub record_count: usize,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub is_completed: bool,
}

impl ProjectSummary {
    pub fn from_project(project: &Project, record_count: usize) -> Self {
        Self {
            id: project.id,
            title: project.title.clone(),
            record_count,
            updated_at: project.updated_at,
            start_date: project.start_date,
            is_completed: project.is_completed,
        }
    }
}

/// Which way data flows, seen from the device that sent the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The requester pushes its data.
    Send,
    /// The requester pulls the peer's data.
    Receive,
    /// Both.
    Bidirectional,
}

impl Direction {
    pub fn requester_sends(&self) -> bool {
        matches!(self, Self::Send | Self::Bidirectional)
    }

    pub fn responder_sends(&self) -> bool {
        matches!(self, Self::Receive | Self::Bidirectional)
    }
}

/// What the user picked to exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSelection {
    pub project_ids: BTreeSet<ProjectId>,
    pub direction: Direction,
    pub resolve_conflicts: ConflictPolicy,
}

impl SyncSelection {
    pub fn new(
        project_ids: impl IntoIterator<Item = ProjectId>,
        direction: Direction,
        resolve_conflicts: ConflictPolicy,
    ) -> Self {
        Self {
            project_ids: project_ids.into_iter().collect(),
            direction,
            resolve_conflicts,
        }
    }
}

/// The data actually transferred.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncDataPayload {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub records: Vec<Record>,
}

impl SyncDataPayload {
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty() && self.records.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectMessage {
    pub reason: String,
}

/// One slice of the serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChunkMessage {
    pub index: u32,
    pub total: u32,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCompleteMessage {
    pub total_chunks: u32,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    pub message_id: String,
}

/// Error reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Machine-readable error kind.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn version_mismatch(expected: u32, got: u32) -> Self {
        Self::new(
            "version_mismatch",
            format!("protocol version mismatch: expected {expected}, got {got}"),
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new("internal", msg)
    }
}

impl From<&crate::SyncError> for ErrorMessage {
    fn from(err: &crate::SyncError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}
