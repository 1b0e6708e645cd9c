//! Transport layer abstraction.
//!
//! A [`Transport`] is the direct channel between the two devices, below the
//! message layer. It knows how to produce an offer, answer an offer, accept
//! an answer and move opaque text frames. Everything it observes
//! (reachability candidates, link state, inbound frames) arrives on one
//! event stream that the session drains.
//!
//! Implementations:
//! - [`memory::MemoryTransport`]: in-process pair for tests, with simulated
//!   outages
//! - [`tcp::TcpTransport`]: the offerer listens, the answerer dials one of
//!   the advertised `ip:port` candidates

use crate::error::SyncResult;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

pub mod codec;
pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{TcpConfig, TcpTransport};

/// State of the underlying link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Lost, possibly temporarily.
    Disconnected,
    /// Lost and the transport gave up on its own.
    Failed,
    /// The peer closed the link deliberately.
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local reachability candidate was gathered.
    Candidate(String),
    /// No more candidates will be gathered.
    GatheringComplete,
    StateChanged(LinkState),
    /// One inbound text frame, in send order.
    Frame(String),
}

/// Receiving half of a transport's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A direct channel to one peer.
#[async_trait]
pub trait Transport: Send {
    /// Hands out the event stream. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<TransportEvents>;

    /// Starts a session as the offering side. Returns the session
    /// description; candidates follow on the event stream.
    async fn create_offer(&mut self) -> SyncResult<String>;

    /// Answers a remote offer. Returns the answer's session description.
    async fn accept_offer(&mut self, offer: &str, candidates: &[String]) -> SyncResult<String>;

    /// Completes an offer with the remote answer.
    async fn accept_answer(&mut self, answer: &str, candidates: &[String]) -> SyncResult<()>;

    /// Sends one text frame.
    async fn send(&mut self, frame: String) -> SyncResult<()>;

    /// Attempts in-place recovery of a dropped link. Success is reported as
    /// `StateChanged(Connected)` on the event stream.
    async fn restart(&mut self) -> SyncResult<()>;

    /// Releases the link. Idempotent.
    async fn close(&mut self);
}
