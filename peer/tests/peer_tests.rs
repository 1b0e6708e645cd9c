use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use tally_model::{Project, Record};
use tally_peer::{
    Outcome, Peer, default_selection, load_config, load_or_generate_peer_id, open_store,
    parse_project_ids,
};
use tally_store::{LocalStore, MemoryStore};
use tally_sync::transport::TcpConfig;
use tally_sync::{
    ConflictPolicy, DeviceIdentity, Direction, ProjectSummary, SyncConfig, SyncMetadata,
    SyncSelection,
};
use tally_types::{PeerId, ProjectId};

fn project_with_records(title: &str, records: u32) -> (Project, Vec<Record>) {
    let project = Project::new(title);
    let records = (1..=records)
        .map(|day| {
            let date = NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
            Record::new(project.id, date, f64::from(day), "kg")
        })
        .collect();
    (project, records)
}

fn store_of(project: &Project, records: &[Record]) -> MemoryStore {
    let store = MemoryStore::new();
    store.upsert_project(project).unwrap();
    for record in records {
        store.upsert_record(record).unwrap();
    }
    store
}

// ── Configuration ───────────────────────────────────────────────

#[test]
fn config_defaults_without_file() {
    let config = load_config(None, None).unwrap();
    assert_eq!(config, SyncConfig::default());
}

#[test]
fn config_file_and_label_override() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.json");
    std::fs::write(&path, r#"{ "device_label": "Field laptop", "chunk_size": 1024 }"#).unwrap();

    let config = load_config(Some(&path), Some("Barn tablet")).unwrap();
    assert_eq!(config.chunk_size, 1024);
    assert_eq!(config.device_label, "Barn tablet");
    assert_eq!(config.session_timeout_ms, SyncConfig::default().session_timeout_ms);
}

#[test]
fn broken_config_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = load_config(Some(&path), None).unwrap_err();
    assert!(err.to_string().contains("sync.json"), "{err}");
}

#[test]
fn peer_id_is_created_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peer.id");

    let first = load_or_generate_peer_id(&path).unwrap();
    let second = load_or_generate_peer_id(&path).unwrap();
    assert_eq!(first, second);
}

// ── Selection ───────────────────────────────────────────────────

#[test]
fn project_ids_are_parsed() {
    let id = ProjectId::new();
    assert_eq!(parse_project_ids(&[format!(" {id} ")]).unwrap(), vec![id]);
    assert!(parse_project_ids(&["nope".to_string()]).is_err());
}

#[test]
fn default_selection_follows_direction() {
    let (mine, _) = project_with_records("Mine", 0);
    let (theirs, _) = project_with_records("Theirs", 0);
    let remote = SyncMetadata::new(
        PeerId::new(),
        "Field",
        vec![ProjectSummary::from_project(&theirs, 0)],
    );
    let local = [mine.clone()];

    let send = default_selection(Direction::Send, &[], &local, &remote);
    assert_eq!(send.into_iter().collect::<Vec<_>>(), vec![mine.id]);

    let receive = default_selection(Direction::Receive, &[], &local, &remote);
    assert_eq!(receive.into_iter().collect::<Vec<_>>(), vec![theirs.id]);

    let both = default_selection(Direction::Bidirectional, &[], &local, &remote);
    assert_eq!(both.len(), 2);

    let explicit = ProjectId::new();
    let named = default_selection(Direction::Send, &[explicit], &local, &remote);
    assert_eq!(named.into_iter().collect::<Vec<_>>(), vec![explicit]);
}

// ── Loopback session ────────────────────────────────────────────

#[tokio::test]
async fn loopback_session_syncs_and_saves() {
    let (wheat, records) = project_with_records("Wheat", 5);
    let mut host = Peer::start(
        DeviceIdentity::new(PeerId::new(), "Office"),
        store_of(&wheat, &records),
        SyncConfig::with_label("Office"),
        TcpConfig::loopback(),
    );
    let mut joiner = Peer::start(
        DeviceIdentity::new(PeerId::new(), "Field"),
        MemoryStore::new(),
        SyncConfig::with_label("Field"),
        TcpConfig::loopback(),
    );

    let offer = host.offer().await.unwrap();
    let answer = joiner.answer(&offer.token).await.unwrap();
    host.complete(&answer).await.unwrap();
    let remote = host.wait_for_metadata().await.unwrap();
    assert_eq!(remote.peer_label, "Field");

    host.request(SyncSelection::new(
        [wheat.id],
        Direction::Send,
        ConflictPolicy::KeepNewer,
    ))
    .await
    .unwrap();
    let (sent, received) = tokio::join!(host.finish(), joiner.finish());
    let (sent, received) = (sent.unwrap(), received.unwrap());

    assert!(sent.is_success());
    let Outcome::Completed(summary) = received else {
        panic!("expected completion, got {received:?}");
    };
    assert_eq!(summary.records_imported, 5);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("field.json");
    joiner.store().save(&path).unwrap();
    let reloaded = open_store(&path).unwrap();
    assert_eq!(reloaded.record_count().unwrap(), 5);
    assert_eq!(reloaded.get_project(&wheat.id).unwrap(), Some(wheat));

    host.shutdown().await.unwrap();
    joiner.shutdown().await.unwrap();
}
