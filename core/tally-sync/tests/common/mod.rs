//! Helpers shared by the integration tests.
#![allow(dead_code)]

use chrono::NaiveDate;
use tally_model::{Project, Record};
use tally_sync::transport::{MemoryNetwork, MemoryTransport};
use tally_sync::{LinkState, Transport, TransportEvent, TransportEvents};
use tally_types::{ProjectId, Timestamp};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn ts(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis)
}

pub fn project(title: &str, updated_at: i64) -> Project {
    Project::new(title).with_timestamps(ts(1), ts(updated_at))
}

pub fn record(project_id: ProjectId, day: u32, quantity: f64, updated_at: i64) -> Record {
    Record::new(project_id, date(2024, 5, day), quantity, "kg")
        .with_timestamps(ts(1), ts(updated_at))
}

/// Two memory transports with an established link, plus their event streams
/// drained up to `Connected`.
pub async fn linked_pair() -> (
    MemoryNetwork,
    (MemoryTransport, TransportEvents),
    (MemoryTransport, TransportEvents),
) {
    let network = MemoryNetwork::new();
    let mut offerer = network.transport();
    let mut answerer = network.transport();
    let mut offerer_rx = offerer.take_events().unwrap();
    let mut answerer_rx = answerer.take_events().unwrap();

    let offer = offerer.create_offer().await.unwrap();
    let answer = answerer.accept_offer(&offer, &[]).await.unwrap();
    offerer.accept_answer(&answer, &[]).await.unwrap();

    wait_for_state(&mut offerer_rx, LinkState::Connected).await;
    wait_for_state(&mut answerer_rx, LinkState::Connected).await;
    (network, (offerer, offerer_rx), (answerer, answerer_rx))
}

/// Skips events until the link reaches `state`.
pub async fn wait_for_state(rx: &mut TransportEvents, state: LinkState) {
    loop {
        match rx.recv().await {
            Some(TransportEvent::StateChanged(s)) if s == state => return,
            Some(_) => continue,
            None => panic!("event stream ended before {state}"),
        }
    }
}

/// Next inbound frame, skipping everything else.
pub async fn next_frame(rx: &mut TransportEvents) -> String {
    loop {
        match rx.recv().await {
            Some(TransportEvent::Frame(frame)) => return frame,
            Some(_) => continue,
            None => panic!("event stream ended before a frame arrived"),
        }
    }
}

/// Routes `tracing` output through the test harness. Filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
