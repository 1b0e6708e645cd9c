//! Message channel over a transport.
//!
//! Wraps protocol messages in envelopes, refuses to send while the link is
//! not open, and keeps delivery-confirmation bookkeeping: messages whose kind
//! requires an `ack` stay pending until the peer confirms them.

use crate::protocol::{AckMessage, Envelope, FrameError, Message, MessageKind};
use crate::transport::Transport;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Frame counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_ignored: u64,
}

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A message for the layers above.
    Message(Envelope),
    /// The peer confirmed one of our pending messages.
    Acknowledged { message_id: String, kind: MessageKind },
}

#[derive(Debug, Default)]
pub struct MessageChannel {
    open: bool,
    pending: HashMap<String, MessageKind>,
    stats: ChannelStats,
}

impl MessageChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Opened and closed by the session as the link comes and goes.
    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    /// Sends a message. Returns false if the channel is closed or the
    /// transport refused the frame.
    pub async fn send(&mut self, transport: &mut dyn Transport, message: Message) -> bool {
        self.send_tracked(transport, message).await.is_some()
    }

    /// Like [`send`](Self::send) but returns the envelope's message id.
    pub async fn send_tracked(
        &mut self,
        transport: &mut dyn Transport,
        message: Message,
    ) -> Option<String> {
        if !self.open {
            debug!("Dropping {} while channel is closed", message.kind());
            return None;
        }

        let envelope = Envelope::new(message);
        let frame = match envelope.to_json() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {}: {e}", envelope.kind());
                return None;
            }
        };
        if let Err(e) = transport.send(frame).await {
            warn!("Transport refused {}: {e}", envelope.kind());
            return None;
        }

        self.stats.frames_sent += 1;
        if envelope.kind().requires_ack() {
            self.pending.insert(envelope.message_id.clone(), envelope.kind());
        }
        Some(envelope.message_id)
    }

    /// Decodes one inbound frame. Unknown and malformed frames are logged
    /// and dropped.
    pub fn receive(&mut self, frame: &str) -> Option<Inbound> {
        let envelope = match Envelope::from_json(frame) {
            Ok(envelope) => envelope,
            Err(FrameError::UnknownType(kind)) => {
                debug!("Ignoring message of unknown type {kind:?}");
                self.stats.frames_ignored += 1;
                return None;
            }
            Err(e) => {
                warn!("Ignoring frame: {e}");
                self.stats.frames_ignored += 1;
                return None;
            }
        };
        self.stats.frames_received += 1;

        if let Message::Ack(AckMessage { message_id }) = &envelope.message {
            return match self.pending.remove(message_id) {
                Some(kind) => Some(Inbound::Acknowledged {
                    message_id: message_id.clone(),
                    kind,
                }),
                None => {
                    debug!("Ack for unknown message {message_id}");
                    None
                }
            };
        }
        Some(Inbound::Message(envelope))
    }

    /// The `ack` owed for an inbound envelope, if its kind requires one.
    pub fn ack_for(envelope: &Envelope) -> Option<Message> {
        envelope.kind().requires_ack().then(|| {
            Message::Ack(AckMessage {
                message_id: envelope.message_id.clone(),
            })
        })
    }

    /// Whether a sent message still awaits its ack.
    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }
}
