//! Peer-to-peer sync engine for Tally.
//!
//! Two devices exchange selected projects and their records over a direct
//! channel, after a one-time pairing: the offering device shows a QR token,
//! the answering device scans it and shows its own token back.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Descriptor**: encodes offers/answers as compact text tokens
//! - **Session**: owned state machine for handshake, heartbeat and recovery
//! - **Transport**: the direct channel (TCP, or in-memory for tests)
//! - **Channel / Protocol**: typed envelopes with delivery acknowledgements
//! - **Chunk**: bounded-size payload streaming and reassembly
//! - **Conflict / Fingerprint / Applicator**: import with conflict policies and
//!   content-duplicate detection
//! - **Orchestrator**: sequences a sync run and emits [`SyncEvent`]s
//!
//! ## Sync Process
//!
//! 1. **Pairing**: offer token out, answer token back, same pairing code
//! 2. **Metadata**: both sides announce what they hold
//! 3. **Selection**: one side requests projects and a direction
//! 4. **Transfer**: payloads are streamed in chunks
//! 5. **Apply**: the importing side resolves conflicts and skips duplicates
//!
//! # Example
//!
//! ```
//! use tally_sync::{DeviceIdentity, SyncConfig, SyncEngine};
//! use tally_types::PeerId;
//!
//! let identity = DeviceIdentity::new(PeerId::new(), "My Laptop");
//! let engine = SyncEngine::new(identity, SyncConfig::with_label("My Laptop"));
//! assert_eq!(engine.config().device_label, "My Laptop");
//! ```

pub mod applicator;
pub mod channel;
pub mod chunk;
mod config;
pub mod conflict;
pub mod descriptor;
mod engine;
mod error;
pub mod fingerprint;
mod orchestrator;
pub mod pairing;
pub mod protocol;
pub mod session;
pub mod transport;

pub use applicator::{ImportSummary, PayloadApplicator};
pub use channel::{ChannelStats, Inbound, MessageChannel};
pub use chunk::{
    IncomingTransfer, MAX_TRANSFER_CHUNKS, OutgoingTransfer, TransferDirection, TransferPhase,
    TransferProgress, split_into_chunks,
};
pub use config::{DEFAULT_CHUNK_SIZE, DEFAULT_PAIRING_CODE_LENGTH, SyncConfig};
pub use conflict::{ConflictInfo, ConflictKind, ConflictPolicy, Resolution, detect_conflicts};
pub use descriptor::{ConnectionDescriptor, DecodeError, DescriptorCodec, Role};
pub use engine::{DeviceIdentity, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use fingerprint::{FingerprintIndex, fingerprint};
pub use orchestrator::{
    OrchestratorConfig, OrchestratorHandle, SessionOffer, SyncCommand, SyncEvent,
    SyncOrchestrator, SyncPhase, TransportFactory, create_orchestrator,
};
pub use pairing::{PAIRING_ALPHABET, PairingCode, PairingCodeError};
pub use protocol::{
    Direction, Envelope, Message, MessageKind, PROTOCOL_VERSION, ProjectSummary, SyncDataPayload,
    SyncMetadata, SyncSelection,
};
pub use session::{SessionManager, SessionSignal, SessionState};
pub use transport::{LinkState, Transport, TransportEvent, TransportEvents};
