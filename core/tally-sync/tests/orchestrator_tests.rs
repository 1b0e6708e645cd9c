mod common;

use common::{init_tracing, project, record};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tally_model::Project;
use tally_store::{LocalStore, MemoryStore};
use tally_sync::transport::MemoryNetwork;
use tally_sync::{
    ConflictKind, ConflictPolicy, DeviceIdentity, Direction, ImportSummary, OrchestratorConfig,
    OrchestratorHandle, SyncConfig, SyncError, SyncEvent, SyncPhase, SyncSelection,
    Transport, TransportFactory, create_orchestrator,
};
use tally_types::{PeerId, ProjectId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ── Harness ─────────────────────────────────────────────────────

/// Anything events can be read from.
trait EventStream {
    async fn next(&mut self) -> Option<SyncEvent>;
}

impl EventStream for mpsc::Receiver<SyncEvent> {
    async fn next(&mut self) -> Option<SyncEvent> {
        self.recv().await
    }
}

impl EventStream for mpsc::UnboundedReceiver<SyncEvent> {
    async fn next(&mut self) -> Option<SyncEvent> {
        self.recv().await
    }
}

struct Device<E> {
    handle: OrchestratorHandle,
    events: E,
    store: Arc<MemoryStore>,
    task: JoinHandle<tally_sync::SyncResult<()>>,
}

fn start(
    network: &MemoryNetwork,
    label: &str,
    store: MemoryStore,
    config: SyncConfig,
    orchestrator_config: OrchestratorConfig,
) -> Device<mpsc::Receiver<SyncEvent>> {
    init_tracing();
    let store = Arc::new(store);
    let net = network.clone();
    let transports: TransportFactory =
        Box::new(move || Box::new(net.transport()) as Box<dyn Transport>);
    let (handle, events, command_rx, orchestrator) = create_orchestrator(
        DeviceIdentity::new(PeerId::new(), label),
        store.clone(),
        SyncConfig {
            device_label: label.into(),
            ..config
        },
        orchestrator_config,
        transports,
    );
    let task = tokio::spawn(orchestrator.run(command_rx));
    Device {
        handle,
        events,
        store,
        task,
    }
}

/// Starts a device whose events are drained into an unbounded queue, so a
/// slow test never stalls the orchestrator.
fn device(network: &MemoryNetwork, label: &str, store: MemoryStore) -> Device<mpsc::UnboundedReceiver<SyncEvent>> {
    device_with(network, label, store, SyncConfig::default(), OrchestratorConfig::default())
}

fn device_with(
    network: &MemoryNetwork,
    label: &str,
    store: MemoryStore,
    config: SyncConfig,
    orchestrator_config: OrchestratorConfig,
) -> Device<mpsc::UnboundedReceiver<SyncEvent>> {
    let Device {
        handle,
        mut events,
        store,
        task,
    } = start(network, label, store, config, orchestrator_config);
    let (tx, forwarded) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(event).is_err() {
                break;
            }
        }
    });
    Device {
        handle,
        events: forwarded,
        store,
        task,
    }
}

/// Reads events until one matches, failing after ten seconds.
async fn wait_for<S: EventStream>(
    events: &mut S,
    what: &str,
    matches: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    let search = async {
        loop {
            match events.next().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream ended while waiting for {what}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), search)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn completed<S: EventStream>(events: &mut S) -> ImportSummary {
    match wait_for(events, "completion", |e| {
        matches!(e, SyncEvent::Completed(_) | SyncEvent::Failed { .. })
    })
    .await
    {
        SyncEvent::Completed(summary) => summary,
        other => panic!("sync failed: {other:?}"),
    }
}

/// Pairs two devices and waits until both hold the other's metadata.
async fn connect<A: EventStream, B: EventStream>(office: &mut Device<A>, field: &mut Device<B>) {
    let offer = office.handle.create_session().await.unwrap();
    assert_eq!(offer.pairing_code.as_str().len(), 6);
    let answer = field.handle.join_session(offer.token).await.unwrap();
    office.handle.complete_connection(answer).await.unwrap();

    let is_metadata = |e: &SyncEvent| matches!(e, SyncEvent::MetadataReceived { .. });
    wait_for(&mut field.events, "field metadata", is_metadata).await;
    wait_for(&mut office.events, "office metadata", is_metadata).await;
}

fn store_with(project: &Project, records: usize) -> MemoryStore {
    let store = MemoryStore::new();
    store.upsert_project(project).unwrap();
    for i in 0..records {
        let day = (i % 28) as u32 + 1;
        let r = record(project.id, day, i as f64, 10).with_comment(format!("harvest batch {i}"));
        store.upsert_record(&r).unwrap();
    }
    store
}

fn send(ids: impl IntoIterator<Item = ProjectId>, direction: Direction) -> SyncSelection {
    SyncSelection::new(ids, direction, ConflictPolicy::KeepNewer)
}

// ── Transfers ───────────────────────────────────────────────────

#[tokio::test]
async fn sends_a_new_project() {
    let network = MemoryNetwork::new();
    let wheat = project("Wheat", 10);
    let mut office = device(&network, "Office", store_with(&wheat, 3));
    let mut field = device(&network, "Field", MemoryStore::new());
    connect(&mut office, &mut field).await;

    office
        .handle
        .send_selection(send([wheat.id], Direction::Send))
        .await
        .unwrap();

    let received = completed(&mut field.events).await;
    assert!(received.success);
    assert_eq!(received.projects_imported, 1);
    assert_eq!(received.records_imported, 3);

    let sent = completed(&mut office.events).await;
    assert_eq!(sent, ImportSummary::sent(1, 3));

    assert_eq!(field.store.get_project(&wheat.id).unwrap(), Some(wheat.clone()));
    assert_eq!(field.store.list_records(&wheat.id).unwrap().len(), 3);
}

#[tokio::test]
async fn pulls_a_peer_project() {
    let network = MemoryNetwork::new();
    let rye = project("Rye", 10);
    let mut office = device(&network, "Office", MemoryStore::new());
    let mut field = device(&network, "Field", store_with(&rye, 4));
    connect(&mut office, &mut field).await;

    office
        .handle
        .send_selection(send([rye.id], Direction::Receive))
        .await
        .unwrap();

    let accepted = wait_for(&mut office.events, "accept", |e| {
        matches!(e, SyncEvent::SelectionAccepted(_))
    })
    .await;
    let SyncEvent::SelectionAccepted(selection) = accepted else {
        unreachable!()
    };
    assert_eq!(selection.direction, Direction::Receive);

    let received = completed(&mut office.events).await;
    assert_eq!(received.records_imported, 4);
    assert_eq!(completed(&mut field.events).await, ImportSummary::sent(1, 4));
    assert_eq!(office.store.record_count().unwrap(), 4);
}

#[tokio::test]
async fn exchanges_both_ways() {
    let network = MemoryNetwork::new();
    let oats = project("Oats", 10);
    let rye = project("Rye", 10);
    let mut office = device(&network, "Office", store_with(&oats, 2));
    let mut field = device(&network, "Field", store_with(&rye, 5));
    connect(&mut office, &mut field).await;

    office
        .handle
        .send_selection(send([oats.id, rye.id], Direction::Bidirectional))
        .await
        .unwrap();

    let at_office = completed(&mut office.events).await;
    let at_field = completed(&mut field.events).await;
    assert_eq!((at_office.projects_imported, at_office.records_imported), (1, 5));
    assert_eq!((at_field.projects_imported, at_field.records_imported), (1, 2));
    assert_eq!(office.store.record_count().unwrap(), 7);
    assert_eq!(field.store.record_count().unwrap(), 7);
}

#[tokio::test]
async fn content_duplicates_are_not_imported_twice() {
    let network = MemoryNetwork::new();
    let wheat = project("Wheat", 10);
    let shared = record(wheat.id, 1, 12.0, 10).with_comment("north field");
    let mut twin = shared.clone();
    twin.id = tally_types::RecordId::new();
    let fresh = record(wheat.id, 2, 8.0, 10);

    let office_store = MemoryStore::new();
    office_store.upsert_project(&wheat).unwrap();
    office_store.upsert_record(&shared).unwrap();
    office_store.upsert_record(&fresh).unwrap();
    let field_store = MemoryStore::new();
    field_store.upsert_project(&wheat).unwrap();
    field_store.upsert_record(&twin).unwrap();

    let mut office = device(&network, "Office", office_store);
    let mut field = device(&network, "Field", field_store);

    let offer = office.handle.create_session().await.unwrap();
    let answer = field.handle.join_session(offer.token).await.unwrap();
    office.handle.complete_connection(answer).await.unwrap();
    let metadata = wait_for(&mut office.events, "metadata", |e| {
        matches!(e, SyncEvent::MetadataReceived { .. })
    })
    .await;
    let SyncEvent::MetadataReceived { conflicts, .. } = metadata else {
        unreachable!()
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::BothModified);

    office
        .handle
        .send_selection(send([wheat.id], Direction::Send))
        .await
        .unwrap();

    let summary = completed(&mut field.events).await;
    assert_eq!(summary.projects_skipped, 1);
    assert_eq!(summary.records_imported, 1);
    assert_eq!(summary.records_skipped, 1);
    assert_eq!(field.store.record_count().unwrap(), 2);
    assert!(field.store.get_record(&shared.id).unwrap().is_none());
}

#[tokio::test]
async fn staged_payload_waits_for_send_data() {
    let network = MemoryNetwork::new();
    let rye = project("Rye", 10);
    let mut office = device(&network, "Office", MemoryStore::new());
    let mut field = device_with(
        &network,
        "Field",
        store_with(&rye, 2),
        SyncConfig::default(),
        OrchestratorConfig {
            auto_send: false,
            ..OrchestratorConfig::default()
        },
    );
    connect(&mut office, &mut field).await;

    let err = office.handle.send_data().await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidState { .. }));

    office
        .handle
        .send_selection(send([rye.id], Direction::Receive))
        .await
        .unwrap();
    wait_for(&mut field.events, "request", |e| {
        matches!(e, SyncEvent::SelectionReceived(_))
    })
    .await;
    assert_eq!(office.store.record_count().unwrap(), 0);

    field.handle.send_data().await.unwrap();

    assert_eq!(completed(&mut office.events).await.records_imported, 2);
    assert!(completed(&mut field.events).await.success);
}

// ── Rejection ───────────────────────────────────────────────────

#[tokio::test]
async fn unknown_projects_are_rejected() {
    let network = MemoryNetwork::new();
    let mut office = device(&network, "Office", MemoryStore::new());
    let mut field = device(&network, "Field", MemoryStore::new());
    connect(&mut office, &mut field).await;

    office
        .handle
        .send_selection(send([ProjectId::new()], Direction::Receive))
        .await
        .unwrap();

    let rejected = wait_for(&mut office.events, "rejection", |e| {
        matches!(e, SyncEvent::SelectionRejected { .. })
    })
    .await;
    let SyncEvent::SelectionRejected { reason } = rejected else {
        unreachable!()
    };
    assert_eq!(reason, "1 selected project(s) not found on this device");

    // The run is still usable afterwards.
    office
        .handle
        .send_selection(send([ProjectId::new()], Direction::Send))
        .await
        .unwrap();
    assert!(completed(&mut field.events).await.success);
}

#[tokio::test]
async fn selection_before_metadata_is_refused() {
    let network = MemoryNetwork::new();
    let office = device(&network, "Office", MemoryStore::new());

    let err = office
        .handle
        .send_selection(send([ProjectId::new()], Direction::Send))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidState { .. }));
}

// ── Cancellation ────────────────────────────────────────────────

#[tokio::test]
async fn receiver_cancels_midway() {
    let network = MemoryNetwork::new();
    let barley = project("Barley", 10);
    let mut office = device_with(
        &network,
        "Office",
        store_with(&barley, 300),
        SyncConfig {
            chunk_size: 256,
            ..SyncConfig::default()
        },
        OrchestratorConfig::default(),
    );
    // One-slot event buffer: the receiver only moves on as events are read.
    let mut field = start(
        &network,
        "Field",
        MemoryStore::new(),
        SyncConfig {
            event_buffer: 1,
            ..SyncConfig::default()
        },
        OrchestratorConfig::default(),
    );
    connect(&mut office, &mut field).await;

    office
        .handle
        .send_selection(send([barley.id], Direction::Send))
        .await
        .unwrap();

    let mut cancel_task = None;
    let by_peer = loop {
        match field.events.recv().await.expect("field events") {
            SyncEvent::Progress(progress) if cancel_task.is_none() && progress.fraction() >= 0.4 => {
                let handle = field.handle.clone();
                cancel_task = Some(tokio::spawn(async move { handle.cancel().await }));
            }
            SyncEvent::Cancelled { by_peer } => break by_peer,
            SyncEvent::Completed(summary) => panic!("transfer finished before cancel: {summary:?}"),
            _ => {}
        }
    };
    assert!(!by_peer);
    cancel_task.unwrap().await.unwrap().unwrap();
    let mut rest = field.events;
    tokio::spawn(async move { while rest.recv().await.is_some() {} });

    let sender_side = wait_for(&mut office.events, "peer cancel", |e| {
        matches!(e, SyncEvent::Cancelled { .. } | SyncEvent::Completed(_))
    })
    .await;
    assert!(matches!(sender_side, SyncEvent::Cancelled { by_peer: true }));

    assert!(field.store.get_project(&barley.id).unwrap().is_none());
    assert_eq!(field.store.record_count().unwrap(), 0);

    let err = field.handle.cancel().await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidState { .. }));
}

#[tokio::test]
async fn sender_cancels_midway() {
    let network = MemoryNetwork::new();
    let barley = project("Barley", 10);
    // One-slot event buffer: the sender only moves on as events are read.
    let mut office = start(
        &network,
        "Office",
        store_with(&barley, 300),
        SyncConfig {
            chunk_size: 256,
            event_buffer: 1,
            ..SyncConfig::default()
        },
        OrchestratorConfig::default(),
    );
    let mut field = device(&network, "Field", MemoryStore::new());
    connect(&mut office, &mut field).await;

    office
        .handle
        .send_selection(send([barley.id], Direction::Send))
        .await
        .unwrap();

    let mut cancel_task = None;
    let by_peer = loop {
        match office.events.recv().await.expect("office events") {
            SyncEvent::Progress(progress) if cancel_task.is_none() && progress.fraction() >= 0.4 => {
                assert!(progress.sent_chunks < progress.total_chunks);
                let handle = office.handle.clone();
                cancel_task = Some(tokio::spawn(async move { handle.cancel().await }));
            }
            SyncEvent::Cancelled { by_peer } => break by_peer,
            SyncEvent::Completed(summary) => panic!("transfer finished before cancel: {summary:?}"),
            _ => {}
        }
    };
    assert!(!by_peer);
    cancel_task.unwrap().await.unwrap().unwrap();
    let mut rest = office.events;
    tokio::spawn(async move { while rest.recv().await.is_some() {} });

    let receiver_side = wait_for(&mut field.events, "peer cancel", |e| {
        matches!(
            e,
            SyncEvent::Cancelled { .. } | SyncEvent::Completed(_) | SyncEvent::Failed { .. }
        )
    })
    .await;
    assert!(matches!(receiver_side, SyncEvent::Cancelled { by_peer: true }));

    assert!(field.store.get_project(&barley.id).unwrap().is_none());
    assert_eq!(field.store.record_count().unwrap(), 0);
}

#[tokio::test]
async fn unread_events_hold_back_the_receiver() {
    let network = MemoryNetwork::new();
    let oats = project("Oats", 10);
    let mut office = device(&network, "Office", store_with(&oats, 40));
    let mut field = start(
        &network,
        "Field",
        MemoryStore::new(),
        SyncConfig {
            chunk_size: 128,
            event_buffer: 1,
            ..SyncConfig::default()
        },
        OrchestratorConfig::default(),
    );
    connect(&mut office, &mut field).await;

    office
        .handle
        .send_selection(send([oats.id], Direction::Send))
        .await
        .unwrap();

    let early = tokio::time::timeout(
        Duration::from_millis(300),
        wait_for(&mut office.events, "completion", |e| {
            matches!(e, SyncEvent::Completed(_))
        }),
    )
    .await;
    assert!(early.is_err(), "sender completed while the receiver was stalled");
    assert_eq!(field.store.record_count().unwrap(), 0);

    assert_eq!(completed(&mut field.events).await.records_imported, 40);
    assert_eq!(completed(&mut office.events).await, ImportSummary::sent(1, 40));
}

// ── Failures and teardown ───────────────────────────────────────

#[tokio::test]
async fn undecodable_payload_fails_both_sides_once() {
    let network = MemoryNetwork::new();
    let wheat = project("Wheat", 10);
    let store = store_with(&wheat, 2);
    // Non-finite numbers serialize as null, which the receiver cannot parse.
    store.upsert_record(&record(wheat.id, 3, f64::NAN, 10)).unwrap();
    let mut office = device(&network, "Office", store);
    let mut field = device(&network, "Field", MemoryStore::new());
    connect(&mut office, &mut field).await;

    office
        .handle
        .send_selection(send([wheat.id], Direction::Send))
        .await
        .unwrap();

    let terminal = |e: &SyncEvent| matches!(e, SyncEvent::Completed(_) | SyncEvent::Failed { .. });
    let at_field = wait_for(&mut field.events, "receiver outcome", terminal).await;
    assert!(matches!(&at_field, SyncEvent::Failed { code, .. } if code == "payload_decode"));

    let at_office = wait_for(&mut office.events, "sender outcome", terminal).await;
    let SyncEvent::Failed { code, message } = at_office else {
        panic!("sender reported {at_office:?}");
    };
    assert_eq!(code, "protocol");
    assert!(message.contains("payload_decode"));

    assert_eq!(field.store.record_count().unwrap(), 0);
}


#[tokio::test(start_paused = true)]
async fn unanswered_offer_fails_with_timeout() {
    let network = MemoryNetwork::new();
    let mut office = device_with(
        &network,
        "Office",
        MemoryStore::new(),
        SyncConfig {
            session_timeout_ms: 1_000,
            ..SyncConfig::default()
        },
        OrchestratorConfig::default(),
    );

    office.handle.create_session().await.unwrap();
    let failed = wait_for(&mut office.events, "failure", |e| {
        matches!(e, SyncEvent::Failed { .. })
    })
    .await;
    let SyncEvent::Failed { code, message } = failed else {
        unreachable!()
    };
    assert_eq!(code, "connection_timeout");
    assert_eq!(message, "connection timed out");
}

#[tokio::test]
async fn bad_tokens_are_reported_to_the_caller() {
    let network = MemoryNetwork::new();
    let office = device(&network, "Office", MemoryStore::new());
    let field = device(&network, "Field", MemoryStore::new());

    let err = field.handle.join_session("definitely not a token").await.unwrap_err();
    assert!(matches!(err, SyncError::DescriptorDecode(_)));

    let offer = office.handle.create_session().await.unwrap();
    let err = office.handle.complete_connection(offer.token).await.unwrap_err();
    assert!(matches!(err, SyncError::DescriptorDecode(_)));
}

#[tokio::test]
async fn peer_close_returns_to_idle() {
    let network = MemoryNetwork::new();
    let mut office = device(&network, "Office", MemoryStore::new());
    let mut field = device(&network, "Field", MemoryStore::new());
    connect(&mut office, &mut field).await;

    office.handle.close().await.unwrap();

    wait_for(&mut field.events, "idle", |e| {
        matches!(e, SyncEvent::PhaseChanged(SyncPhase::Idle))
    })
    .await;
}

#[tokio::test]
async fn shutdown_stops_the_task() {
    let network = MemoryNetwork::new();
    let office = device(&network, "Office", MemoryStore::new());

    office.handle.shutdown().await.unwrap();
    office.task.await.unwrap().unwrap();

    let err = office.handle.create_session().await.unwrap_err();
    assert!(matches!(err, SyncError::ChannelClosed));
}
