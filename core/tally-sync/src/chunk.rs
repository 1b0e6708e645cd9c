//! Chunked payload transfer.
//!
//! The sender serializes the whole payload to JSON text, slices it into
//! bounded chunks and emits them in order followed by a `data-complete`
//! marker. The receiver fills a sparse buffer and reassembles only when
//! every slot is present.

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{DataChunkMessage, DataCompleteMessage, Message, SyncDataPayload};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Upper bound on the chunk count of one transfer. The receiver sizes its
/// buffer from a peer-supplied total, so anything above this is refused
/// before allocating.
pub const MAX_TRANSFER_CHUNKS: u32 = 1 << 18;

/// Which end of a transfer this progress describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Sending,
    Receiving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    Preparing,
    Transferring,
    Complete,
    Cancelled,
    Error,
}

/// Progress of one transfer.
///
/// On the receiving side `sent_*` counts what has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub phase: TransferPhase,
    pub total_chunks: u32,
    pub sent_chunks: u32,
    pub total_bytes: u64,
    pub sent_bytes: u64,
    pub direction: TransferDirection,
}

impl TransferProgress {
    /// Completed share in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        f64::from(self.sent_chunks) / f64::from(self.total_chunks)
    }
}

/// Splits text into pieces of at most `chunk_size` bytes without cutting a
/// UTF-8 character. A character wider than `chunk_size` gets a piece of its
/// own. Empty text yields a single empty piece so the receiver still learns
/// the chunk count.
pub fn split_into_chunks(text: &str, chunk_size: usize) -> Vec<String> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    if text.is_empty() {
        return vec![String::new()];
    }

    let mut out = Vec::with_capacity(text.len() / size + 1);
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + size).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + 1;
            while !text.is_char_boundary(end) {
                end += 1;
            }
        }
        out.push(text[start..end].to_string());
        start = end;
    }
    out
}

// ── Sending ─────────────────────────────────────────────────────

/// Sender-side state of one transfer.
#[derive(Debug)]
pub struct OutgoingTransfer {
    chunks: Vec<String>,
    next: usize,
    total_bytes: u64,
    sent_bytes: u64,
    phase: TransferPhase,
}

impl OutgoingTransfer {
    /// Serializes a payload and prepares its chunks.
    pub fn new(payload: &SyncDataPayload, chunk_size: usize) -> SyncResult<Self> {
        let text = serde_json::to_string(payload)?;
        let transfer = Self::from_text(&text, chunk_size);
        if transfer.total_chunks() > MAX_TRANSFER_CHUNKS {
            return Err(SyncError::Protocol(format!(
                "payload needs {} chunks, limit is {MAX_TRANSFER_CHUNKS}",
                transfer.total_chunks()
            )));
        }
        Ok(transfer)
    }

    pub fn from_text(text: &str, chunk_size: usize) -> Self {
        let chunks = split_into_chunks(text, chunk_size);
        debug!("Prepared {} chunks for {} bytes", chunks.len(), text.len());
        Self {
            chunks,
            next: 0,
            total_bytes: text.len() as u64,
            sent_bytes: 0,
            phase: TransferPhase::Transferring,
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// The next `data-chunk` message, or `None` once all chunks went out or
    /// the transfer was cancelled.
    pub fn next_message(&mut self) -> Option<Message> {
        if self.phase != TransferPhase::Transferring {
            return None;
        }
        let data = self.chunks.get(self.next)?.clone();
        self.sent_bytes += data.len() as u64;
        let message = Message::DataChunk(DataChunkMessage {
            index: self.next as u32,
            total: self.total_chunks(),
            data,
        });
        self.next += 1;
        Some(message)
    }

    /// Whether every chunk has been handed out.
    pub fn all_chunks_sent(&self) -> bool {
        self.next >= self.chunks.len()
    }

    /// The closing `data-complete` message. Marks the transfer complete.
    pub fn complete_message(&mut self) -> Message {
        self.phase = TransferPhase::Complete;
        Message::DataComplete(DataCompleteMessage {
            total_chunks: self.total_chunks(),
            total_bytes: self.total_bytes,
        })
    }

    pub fn cancel(&mut self) {
        self.phase = TransferPhase::Cancelled;
    }

    pub fn progress(&self) -> TransferProgress {
        TransferProgress {
            phase: self.phase,
            total_chunks: self.total_chunks(),
            sent_chunks: self.next as u32,
            total_bytes: self.total_bytes,
            sent_bytes: self.sent_bytes,
            direction: TransferDirection::Sending,
        }
    }
}

// ── Receiving ───────────────────────────────────────────────────

/// Receiver-side reassembly buffer.
#[derive(Debug, Default)]
pub struct IncomingTransfer {
    slots: Vec<Option<String>>,
    received: u32,
    received_bytes: u64,
    cancelled: bool,
}

impl IncomingTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores one chunk. Duplicates overwrite their slot.
    pub fn accept(&mut self, chunk: DataChunkMessage) -> SyncResult<TransferProgress> {
        if chunk.total == 0 || chunk.index >= chunk.total {
            return Err(SyncError::PayloadDecode(format!(
                "chunk index {} out of range for {} chunks",
                chunk.index, chunk.total
            )));
        }
        if chunk.total > MAX_TRANSFER_CHUNKS {
            return Err(SyncError::PayloadDecode(format!(
                "{} chunks exceed the limit of {MAX_TRANSFER_CHUNKS}",
                chunk.total
            )));
        }
        if self.slots.is_empty() {
            self.slots = vec![None; chunk.total as usize];
        } else if self.slots.len() != chunk.total as usize {
            return Err(SyncError::PayloadDecode(format!(
                "chunk total changed from {} to {}",
                self.slots.len(),
                chunk.total
            )));
        }

        let slot = &mut self.slots[chunk.index as usize];
        match slot.take() {
            Some(previous) => self.received_bytes -= previous.len() as u64,
            None => self.received += 1,
        }
        self.received_bytes += chunk.data.len() as u64;
        *slot = Some(chunk.data);
        Ok(self.progress())
    }

    /// Whether every slot is filled.
    pub fn is_complete(&self) -> bool {
        !self.slots.is_empty() && self.received as usize == self.slots.len()
    }

    /// Reassembles the text after `data-complete`.
    ///
    /// Fails if slots are missing or the sender's totals disagree with what
    /// arrived.
    pub fn finish(&mut self, complete: &DataCompleteMessage) -> SyncResult<String> {
        if complete.total_chunks as usize != self.slots.len() {
            return Err(SyncError::PayloadDecode(format!(
                "expected {} chunks, buffer holds {}",
                complete.total_chunks,
                self.slots.len()
            )));
        }
        if !self.is_complete() {
            return Err(SyncError::PayloadDecode(format!(
                "transfer incomplete: {} of {} chunks received",
                self.received,
                self.slots.len()
            )));
        }
        if complete.total_bytes != self.received_bytes {
            return Err(SyncError::PayloadDecode(format!(
                "expected {} bytes, received {}",
                complete.total_bytes, self.received_bytes
            )));
        }

        let mut text = String::with_capacity(self.received_bytes as usize);
        for slot in self.slots.drain(..) {
            text.push_str(slot.as_deref().unwrap_or_default());
        }
        self.received = 0;
        self.received_bytes = 0;
        Ok(text)
    }

    /// Reassembles and parses the payload.
    pub fn finish_payload(&mut self, complete: &DataCompleteMessage) -> SyncResult<SyncDataPayload> {
        let text = self.finish(complete)?;
        serde_json::from_str(&text).map_err(|e| SyncError::PayloadDecode(e.to_string()))
    }

    /// Drops everything received so far.
    pub fn cancel(&mut self) {
        self.slots.clear();
        self.received = 0;
        self.received_bytes = 0;
        self.cancelled = true;
    }

    pub fn progress(&self) -> TransferProgress {
        let phase = if self.cancelled {
            TransferPhase::Cancelled
        } else if self.is_complete() {
            TransferPhase::Complete
        } else {
            TransferPhase::Transferring
        };
        TransferProgress {
            phase,
            total_chunks: self.slots.len() as u32,
            sent_chunks: self.received,
            total_bytes: self.received_bytes,
            sent_bytes: self.received_bytes,
            direction: TransferDirection::Receiving,
        }
    }
}
