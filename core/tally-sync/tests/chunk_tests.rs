mod common;

use common::{project, record};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tally_sync::protocol::{DataChunkMessage, DataCompleteMessage};
use tally_sync::{
    DEFAULT_CHUNK_SIZE, IncomingTransfer, MAX_TRANSFER_CHUNKS, Message, OutgoingTransfer,
    SyncDataPayload, SyncError, TransferDirection, TransferPhase, split_into_chunks,
};

fn drain(outgoing: &mut OutgoingTransfer) -> Vec<DataChunkMessage> {
    let mut chunks = Vec::new();
    while let Some(message) = outgoing.next_message() {
        match message {
            Message::DataChunk(chunk) => chunks.push(chunk),
            other => panic!("unexpected {other:?}"),
        }
    }
    chunks
}

fn complete_of(outgoing: &mut OutgoingTransfer) -> DataCompleteMessage {
    match outgoing.complete_message() {
        Message::DataComplete(complete) => complete,
        other => panic!("unexpected {other:?}"),
    }
}

fn sample_payload() -> SyncDataPayload {
    let p = project("Hay 2024", 100);
    let records = (1..=20)
        .map(|day| record(p.id, day, f64::from(day) * 1.5, 100).with_comment("Ballen gepresst ✓"))
        .collect();
    SyncDataPayload {
        projects: vec![p],
        records,
    }
}

// ── Splitting ───────────────────────────────────────────────────

#[test]
fn empty_text_yields_one_empty_chunk() {
    assert_eq!(split_into_chunks("", 16), vec![String::new()]);
}

#[test]
fn splits_at_chunk_size() {
    let chunks = split_into_chunks("abcdefghij", 4);
    assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
}

#[test]
fn never_cuts_a_character() {
    // "€" is three bytes; a 4-byte budget fits one plus one ASCII byte.
    let chunks = split_into_chunks("€€€", 4);
    assert_eq!(chunks, vec!["€", "€", "€"]);
}

#[test]
fn character_wider_than_chunk_gets_its_own_chunk() {
    let chunks = split_into_chunks("a😀b", 2);
    assert_eq!(chunks, vec!["a", "😀", "b"]);
}

#[test]
fn zero_chunk_size_uses_default() {
    let text = "x".repeat(40_000);
    let chunks = split_into_chunks(&text, 0);
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].len(), 16 * 1024);
}

// ── Sender ──────────────────────────────────────────────────────

#[test]
fn sender_emits_indexed_chunks_then_complete() {
    let mut outgoing = OutgoingTransfer::from_text("0123456789", 3);
    assert_eq!(outgoing.total_chunks(), 4);

    let chunks = drain(&mut outgoing);
    assert!(outgoing.all_chunks_sent());
    let complete = complete_of(&mut outgoing);

    assert_eq!(
        chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    assert!(chunks.iter().all(|c| c.total == 4));
    assert_eq!(
        complete,
        DataCompleteMessage {
            total_chunks: 4,
            total_bytes: 10
        }
    );
    assert_eq!(outgoing.progress().phase, TransferPhase::Complete);
}

#[test]
fn sender_progress_tracks_chunks_and_bytes() {
    let mut outgoing = OutgoingTransfer::from_text("abcdef", 4);

    outgoing.next_message();
    let progress = outgoing.progress();

    assert_eq!(progress.direction, TransferDirection::Sending);
    assert_eq!(progress.sent_chunks, 1);
    assert_eq!(progress.sent_bytes, 4);
    assert_eq!(progress.total_bytes, 6);
    assert!((progress.fraction() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn cancelled_sender_stops_emitting() {
    let mut outgoing = OutgoingTransfer::from_text("abcdefgh", 2);
    outgoing.next_message();

    outgoing.cancel();

    assert_eq!(outgoing.next_message(), None);
    assert_eq!(outgoing.progress().phase, TransferPhase::Cancelled);
}

// ── Receiver ────────────────────────────────────────────────────

#[test]
fn payload_survives_chunked_transfer() {
    let payload = sample_payload();
    let mut outgoing = OutgoingTransfer::new(&payload, 64).unwrap();
    let mut incoming = IncomingTransfer::new();

    for chunk in drain(&mut outgoing) {
        incoming.accept(chunk).unwrap();
    }
    assert!(incoming.is_complete());
    let received = incoming.finish_payload(&complete_of(&mut outgoing)).unwrap();

    assert_eq!(received, payload);
}

#[test]
fn multi_megabyte_payload_survives_default_chunking() {
    let p = project("Silage 2024", 100);
    let records = (0..20_000u32)
        .map(|i| {
            record(p.id, i % 28 + 1, f64::from(i), 100)
                .with_comment(format!("trailer {i} from the lower meadow, weighed at the yard"))
        })
        .collect();
    let payload = SyncDataPayload {
        projects: vec![p],
        records,
    };
    let mut outgoing = OutgoingTransfer::new(&payload, DEFAULT_CHUNK_SIZE).unwrap();
    let received = {
        let chunks = drain(&mut outgoing);
        assert!(chunks.len() > 100);
        assert!(chunks.iter().all(|c| c.data.len() <= DEFAULT_CHUNK_SIZE));

        let mut incoming = IncomingTransfer::new();
        for chunk in chunks {
            incoming.accept(chunk).unwrap();
        }
        let complete = complete_of(&mut outgoing);
        assert!(complete.total_bytes > 2 * 1024 * 1024);
        incoming.finish_payload(&complete).unwrap()
    };

    assert_eq!(received, payload);
}

#[test]
fn text_filling_whole_chunks_has_no_trailing_chunk() {
    let text = "ab".repeat(DEFAULT_CHUNK_SIZE);
    let mut outgoing = OutgoingTransfer::from_text(&text, DEFAULT_CHUNK_SIZE);
    assert_eq!(outgoing.total_chunks(), 2);

    let chunks = drain(&mut outgoing);
    assert!(chunks.iter().all(|c| c.data.len() == DEFAULT_CHUNK_SIZE));
    let mut incoming = IncomingTransfer::new();
    for chunk in chunks {
        incoming.accept(chunk).unwrap();
    }

    assert_eq!(incoming.finish(&complete_of(&mut outgoing)).unwrap(), text);
}

#[test]
fn duplicate_chunks_are_idempotent() {
    let mut outgoing = OutgoingTransfer::from_text("hello world", 4);
    let chunks = drain(&mut outgoing);
    let mut incoming = IncomingTransfer::new();

    for chunk in chunks.iter().chain(chunks.iter()) {
        incoming.accept(chunk.clone()).unwrap();
    }

    let progress = incoming.progress();
    assert_eq!(progress.sent_chunks, 3);
    assert_eq!(progress.sent_bytes, 11);
    assert_eq!(
        incoming.finish(&complete_of(&mut outgoing)).unwrap(),
        "hello world"
    );
}

#[test]
fn index_out_of_range_is_an_error() {
    let mut incoming = IncomingTransfer::new();
    let err = incoming
        .accept(DataChunkMessage {
            index: 3,
            total: 3,
            data: "x".into(),
        })
        .unwrap_err();
    assert!(matches!(err, SyncError::PayloadDecode(_)));
}

#[test]
fn oversized_total_is_refused_before_allocating() {
    let mut incoming = IncomingTransfer::new();
    let err = incoming
        .accept(DataChunkMessage {
            index: 0,
            total: u32::MAX,
            data: "x".into(),
        })
        .unwrap_err();

    assert!(matches!(err, SyncError::PayloadDecode(msg) if msg.contains("exceed")));
    assert_eq!(incoming.progress().total_chunks, 0);
}

#[test]
fn total_at_the_limit_is_accepted() {
    let mut incoming = IncomingTransfer::new();
    let progress = incoming
        .accept(DataChunkMessage {
            index: MAX_TRANSFER_CHUNKS - 1,
            total: MAX_TRANSFER_CHUNKS,
            data: "x".into(),
        })
        .unwrap();

    assert_eq!(progress.total_chunks, MAX_TRANSFER_CHUNKS);
    assert!(!incoming.is_complete());
}

#[test]
fn sender_refuses_payload_beyond_the_chunk_limit() {
    let p = project("Hay", 1);
    let huge = record(p.id, 1, 1.0, 1).with_comment("x".repeat(MAX_TRANSFER_CHUNKS as usize));
    let payload = SyncDataPayload {
        projects: vec![p],
        records: vec![huge],
    };

    let err = OutgoingTransfer::new(&payload, 1).unwrap_err();

    assert!(matches!(err, SyncError::Protocol(_)));
}

#[test]
fn changing_total_is_an_error() {
    let mut incoming = IncomingTransfer::new();
    incoming
        .accept(DataChunkMessage {
            index: 0,
            total: 3,
            data: "a".into(),
        })
        .unwrap();

    let err = incoming
        .accept(DataChunkMessage {
            index: 1,
            total: 4,
            data: "b".into(),
        })
        .unwrap_err();

    assert!(matches!(err, SyncError::PayloadDecode(_)));
}

#[test]
fn complete_with_missing_chunks_is_an_error() {
    let mut outgoing = OutgoingTransfer::from_text("abcdefghi", 3);
    let chunks = drain(&mut outgoing);
    let mut incoming = IncomingTransfer::new();
    incoming.accept(chunks[0].clone()).unwrap();
    incoming.accept(chunks[2].clone()).unwrap();

    let err = incoming.finish(&complete_of(&mut outgoing)).unwrap_err();

    assert!(matches!(err, SyncError::PayloadDecode(msg) if msg.contains("2 of 3")));
}

#[test]
fn byte_count_mismatch_is_an_error() {
    let mut outgoing = OutgoingTransfer::from_text("abcdef", 3);
    let mut incoming = IncomingTransfer::new();
    for chunk in drain(&mut outgoing) {
        incoming.accept(chunk).unwrap();
    }

    let err = incoming
        .finish(&DataCompleteMessage {
            total_chunks: 2,
            total_bytes: 7,
        })
        .unwrap_err();

    assert!(matches!(err, SyncError::PayloadDecode(_)));
}

#[test]
fn unparseable_payload_is_a_decode_error() {
    let mut outgoing = OutgoingTransfer::from_text("{\"projects\": [", 5);
    let mut incoming = IncomingTransfer::new();
    for chunk in drain(&mut outgoing) {
        incoming.accept(chunk).unwrap();
    }

    let err = incoming
        .finish_payload(&complete_of(&mut outgoing))
        .unwrap_err();

    assert!(matches!(err, SyncError::PayloadDecode(_)));
}

#[test]
fn cancel_discards_buffer() {
    let mut incoming = IncomingTransfer::new();
    incoming
        .accept(DataChunkMessage {
            index: 0,
            total: 2,
            data: "ab".into(),
        })
        .unwrap();

    incoming.cancel();

    let progress = incoming.progress();
    assert_eq!(progress.phase, TransferPhase::Cancelled);
    assert_eq!(progress.sent_chunks, 0);
    assert_eq!(progress.sent_bytes, 0);
    assert!(!incoming.is_complete());
}

// =============================================================================
// PROPERTY TESTS
// =============================================================================

mod chunk_properties {
    use super::*;

    fn text_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![
                prop::char::range('a', 'z'),
                Just('é'),
                Just('€'),
                Just('😀'),
                Just('"'),
            ],
            0..300,
        )
        .prop_map(|chars| chars.into_iter().collect())
    }

    proptest! {
        /// Concatenating the chunks restores the text, and no chunk exceeds
        /// the budget unless it holds a single wide character.
        #[test]
        fn split_is_lossless_and_bounded(text in text_strategy(), size in 1usize..40) {
            let chunks = split_into_chunks(&text, size);

            prop_assert_eq!(chunks.concat(), text);
            for chunk in &chunks {
                prop_assert!(chunk.len() <= size || chunk.chars().count() == 1);
            }
        }

        /// Reassembly does not depend on arrival order.
        #[test]
        fn reassembly_is_order_independent(
            text in text_strategy(),
            size in 1usize..32,
            seed in any::<u64>(),
        ) {
            let mut outgoing = OutgoingTransfer::from_text(&text, size);
            let mut chunks = drain(&mut outgoing);
            let n = chunks.len();
            for i in (1..n).rev() {
                let j = (seed.wrapping_mul(i as u64 + 7) % (i as u64 + 1)) as usize;
                chunks.swap(i, j);
            }

            let mut incoming = IncomingTransfer::new();
            for chunk in chunks {
                incoming.accept(chunk).unwrap();
            }

            prop_assert_eq!(incoming.finish(&complete_of(&mut outgoing)).unwrap(), text);
        }
    }
}
