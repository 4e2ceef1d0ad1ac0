//! End-to-end collector tests over both storage backends.
//!
//! Each scenario drives the public `Collector` surface: session creation,
//! batch ingestion, close and the idle reaper.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use sessionlog_core::observer::ObservedEvent;
use sessionlog_core::store::{CloseOutcome, SessionStore, TelemetryStore, WriteGuard};
use sessionlog_core::{
    Batch, Channel, ClickRow, Collector, CollectorError, ManualClock, MouseRow, Pose,
    RecordingObserver, RegistryBuilder, Session, SessionId, SessionMeta, SpatialRow, Storage, TooltipRow,
};
use sessionlog_storage::{InMemoryStorage, SqliteStorage};

// ─── Helpers ──────────────────────────────────────────────────────────────────

const T0: i64 = 1_459_857_752_022;

fn quiet<S: Storage + 'static>(store: Arc<S>) -> Collector {
    RegistryBuilder::new().reaper_enabled(false).start(store)
}

async fn sqlite_collector() -> Collector {
    quiet(Arc::new(SqliteStorage::in_memory().await.unwrap()))
}

fn clicks(times: &[i64]) -> Batch {
    Batch::Click(
        times
            .iter()
            .map(|&t| ClickRow {
                timestamp_ms: t,
                button_id: format!("btn-{t}"),
            })
            .collect(),
    )
}

fn spatial(object: &str, start_ms: i64, end_ms: i64) -> SpatialRow {
    SpatialRow {
        object_id: object.into(),
        start_ms,
        end_ms,
        pose: Pose {
            x: 20.0,
            y: 23.4,
            zoom: -1.0,
            alpha: 234.0,
            beta: 234.0,
            gamma: 234.0,
        },
    }
}

// ─── Sessions ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_session_is_rejected() {
    let collector = sqlite_collector().await;
    collector.create_session("demo", "demo_model", T0).await.unwrap();

    let err = collector
        .create_session("demo", "demo_model", T0)
        .await
        .unwrap_err();
    assert!(matches!(err, CollectorError::DuplicateSession { start_ms: T0, .. }));

    // A different model at the same instant is a different session.
    collector.create_session("demo", "other_model", T0).await.unwrap();
}

#[tokio::test]
async fn lookup_normalises_identifiers() {
    let collector = sqlite_collector().await;
    let id = collector
        .create_session("  Demo ", "DEMO_Model", T0)
        .await
        .unwrap();

    let found = collector
        .registry()
        .lookup(&SessionMeta::new("demo", "demo_model", T0))
        .await
        .unwrap();
    assert_eq!(found, id);

    let err = collector
        .registry()
        .lookup(&SessionMeta::new("demo", "demo_model", T0 + 1))
        .await
        .unwrap_err();
    assert!(matches!(err, CollectorError::NotFound(_)));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let collector = sqlite_collector().await;
    let ghost = SessionId::from("00000000-0000-7000-8000-000000000000");

    let err = collector.ingest(&ghost, &clicks(&[T0])).await.unwrap_err();
    assert!(matches!(err, CollectorError::NotFound(_)));

    let err = collector.end_session(&ghost, T0).await.unwrap_err();
    assert!(matches!(err, CollectorError::NotFound(_)));

    let err = collector.registry().exists(&ghost).await.unwrap_err();
    assert!(matches!(err, CollectorError::NotFound(_)));
}

#[tokio::test]
async fn close_is_monotonic() {
    let collector = sqlite_collector().await;
    let id = collector.create_session("demo", "m", T0).await.unwrap();

    collector.end_session(&id, T0 + 1_000).await.unwrap();
    // Same or later time: already closed, nothing changes.
    collector.end_session(&id, T0 + 1_000).await.unwrap();
    collector.end_session(&id, T0 + 5_000).await.unwrap();

    let err = collector.end_session(&id, T0 + 500).await.unwrap_err();
    assert_eq!(
        err,
        CollectorError::CloseRegression {
            session_id: id.to_string(),
            recorded_ms: T0 + 1_000,
            requested_ms: T0 + 500,
        }
    );

    let session = collector.registry().get(&id).await.unwrap();
    assert_eq!(session.end_ms, Some(T0 + 1_000));
}

#[tokio::test]
async fn end_before_start_is_invalid() {
    let collector = sqlite_collector().await;
    let id = collector.create_session("demo", "m", T0).await.unwrap();

    let err = collector.end_session(&id, T0 - 1).await.unwrap_err();
    assert!(matches!(err, CollectorError::Validation(_)));
    assert!(collector.registry().get(&id).await.unwrap().is_open());
}

// ─── Ingestion ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn empty_batch_writes_nothing() {
    let collector = sqlite_collector().await;
    let id = collector.create_session("demo", "m", T0).await.unwrap();
    let before = collector.registry().get(&id).await.unwrap();

    assert_eq!(collector.ingest(&id, &Batch::Tooltip(vec![])).await.unwrap(), 0);

    let after = collector.registry().get(&id).await.unwrap();
    assert_eq!(before, after);
    for channel in Channel::ALL {
        assert_eq!(collector.engine().count(&id, channel).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn rows_are_stored_in_order() {
    let collector = sqlite_collector().await;
    let id = collector.create_session("demo", "m", T0).await.unwrap();

    let batch = Batch::Mouse(vec![
        MouseRow { timestamp_ms: T0 + 10, object_id: "3d".into(), down_up: 1 },
        MouseRow { timestamp_ms: T0 + 20, object_id: "3d".into(), down_up: 0 },
        MouseRow { timestamp_ms: T0 + 30, object_id: "3d".into(), down_up: 1 },
    ]);
    assert_eq!(collector.ingest(&id, &batch).await.unwrap(), 3);
    assert_eq!(collector.engine().rows(&id, Channel::Mouse).await.unwrap(), batch);
}

#[tokio::test]
async fn failing_row_rolls_back_whole_batch() {
    let collector = sqlite_collector().await;
    let id = collector.create_session("demo", "m", T0).await.unwrap();

    // Row 3 repeats row 1's timestamp.
    let err = collector
        .ingest(&id, &clicks(&[T0 + 1, T0 + 2, T0 + 3, T0 + 1]))
        .await
        .unwrap_err();
    match err {
        CollectorError::ConstraintViolation(msg) => assert!(msg.starts_with("click row 3"), "{msg}"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(collector.engine().count(&id, Channel::Click).await.unwrap(), 0);

    // The same rows without the duplicate go in afterwards.
    assert_eq!(
        collector.ingest(&id, &clicks(&[T0 + 1, T0 + 2, T0 + 3])).await.unwrap(),
        3
    );
}

#[tokio::test]
async fn overlapping_intervals_are_rejected() {
    for collector in [
        sqlite_collector().await,
        quiet(Arc::new(InMemoryStorage::new())),
    ] {
        let id = collector.create_session("demo", "m", T0).await.unwrap();

        let first = Batch::Spatial(vec![spatial("3d", T0, T0 + 23_000)]);
        assert_eq!(collector.ingest(&id, &first).await.unwrap(), 1);

        let overlapping = Batch::Spatial(vec![spatial("3d", T0 + 10_000, T0 + 30_000)]);
        let err = collector.ingest(&id, &overlapping).await.unwrap_err();
        assert!(err.is_constraint(), "{err}");

        // Touching intervals and other objects are fine.
        let adjacent = Batch::Spatial(vec![
            spatial("3d", T0 + 23_000, T0 + 30_000),
            spatial("map", T0 + 10_000, T0 + 30_000),
        ]);
        assert_eq!(collector.ingest(&id, &adjacent).await.unwrap(), 2);
        assert_eq!(collector.engine().count(&id, Channel::Spatial).await.unwrap(), 3);

        // Overlap inside one batch rejects the whole batch.
        let same_batch = Batch::Spatial(vec![
            spatial("globe", T0, T0 + 23_000),
            spatial("globe", T0 + 10_000, T0 + 30_000),
        ]);
        let err = collector.ingest(&id, &same_batch).await.unwrap_err();
        assert!(err.is_constraint(), "{err}");
        assert_eq!(collector.engine().count(&id, Channel::Spatial).await.unwrap(), 3);
    }
}

#[tokio::test]
async fn closed_session_accepts_late_rows_up_to_end() {
    let collector = sqlite_collector().await;
    let id = collector.create_session("demo", "m", T0).await.unwrap();
    let end = T0 + 60_000;
    collector.end_session(&id, end).await.unwrap();

    // Buffered rows that happened before the close still land.
    assert_eq!(collector.ingest(&id, &clicks(&[T0 + 5, end])).await.unwrap(), 2);

    let err = collector
        .ingest(&id, &clicks(&[end - 1, end + 1]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CollectorError::StaleWrite {
            session_id: id.to_string(),
            event_ms: end + 1,
            end_ms: end,
        }
    );
    assert_eq!(collector.engine().count(&id, Channel::Click).await.unwrap(), 2);
}

#[tokio::test]
async fn interval_end_counts_toward_stale_check() {
    let collector = sqlite_collector().await;
    let id = collector.create_session("demo", "m", T0).await.unwrap();
    collector.end_session(&id, T0 + 1_000).await.unwrap();

    let tooltip = Batch::Tooltip(vec![TooltipRow {
        object_id: "legend".into(),
        start_ms: T0 + 500,
        end_ms: T0 + 1_500,
        start_x: 1.0,
        start_y: 2.0,
        end_x: 3.0,
        end_y: 4.0,
    }]);
    let err = collector.ingest(&id, &tooltip).await.unwrap_err();
    assert!(matches!(err, CollectorError::StaleWrite { .. }));
}

#[tokio::test]
async fn json_payloads_are_accepted_in_both_shapes() {
    let collector = sqlite_collector().await;
    let id = collector.create_session("demo", "m", T0).await.unwrap();

    let bare = json!([{ "timestamp": T0, "button": "play" }]);
    assert_eq!(collector.ingest_json(&id, Channel::Click, bare).await.unwrap(), 1);

    let wrapped = json!({ "data": [{
        "objectId": "3d", "start": T0, "end": T0 + 23_000,
        "x": 20, "y": 23.4, "zoom": -1, "alpha": 234, "beta": 234, "gamma": 234
    }]});
    assert_eq!(collector.ingest_json(&id, Channel::Spatial, wrapped).await.unwrap(), 1);

    let err = collector
        .ingest_json(&id, Channel::Mouse, json!([{ "timestamp": "soon" }]))
        .await
        .unwrap_err();
    assert!(matches!(err, CollectorError::Validation(_)));
}

#[tokio::test]
async fn observer_sees_every_outcome() {
    let observer = Arc::new(RecordingObserver::new());
    let collector = RegistryBuilder::new()
        .reaper_enabled(false)
        .observer(observer.clone())
        .start(Arc::new(InMemoryStorage::new()));

    let id = collector.create_session("demo", "m", T0).await.unwrap();
    collector.ingest(&id, &clicks(&[T0 + 1])).await.unwrap();
    let err = collector.ingest(&id, &clicks(&[T0 + 1])).await.unwrap_err();
    collector.end_session(&id, T0 + 10).await.unwrap();

    assert_eq!(
        observer.events(),
        vec![
            ObservedEvent::Created(id.clone()),
            ObservedEvent::Ingested(id.clone(), Channel::Click, 1),
            ObservedEvent::Rejected(id.clone(), Channel::Click, err),
            ObservedEvent::Closed(id, T0 + 10),
        ]
    );
}

#[tokio::test]
async fn json_payloads_with_rfc3339_times_and_object_key() {
    let collector = sqlite_collector().await;
    let start = 1_495_561_000_000;
    let id = collector.create_session("demo", "m", start).await.unwrap();

    let spatial = json!({ "data": [{
        "x": 0.0, "y": 0.0, "zoom": 350.0, "alpha": 0.0, "beta": 0.0, "gamma": 0.0,
        "start": "2017-05-23T13:37:53.5580000-04:00",
        "end": "2017-05-23T13:37:53.5580000-04:00",
        "objectId": "3d_brain"
    }]});
    assert_eq!(collector.ingest_json(&id, Channel::Spatial, spatial).await.unwrap(), 1);

    let tooltip = json!({ "data": [{
        "object": "legend",
        "start": "2017-05-23T17:38:00.000Z",
        "end": "2017-05-23T17:38:02.500Z",
        "start_x": 20.0, "start_y": 23.0, "end_x": 40.0, "end_y": 50.0
    }]});
    assert_eq!(collector.ingest_json(&id, Channel::Tooltip, tooltip).await.unwrap(), 1);

    match collector.engine().rows(&id, Channel::Tooltip).await.unwrap() {
        Batch::Tooltip(rows) => {
            assert_eq!(rows[0].object_id, "legend");
            assert_eq!(rows[0].start_ms, 1_495_561_080_000);
            assert_eq!(rows[0].end_ms, 1_495_561_082_500);
        }
        other => panic!("wrong channel: {other:?}"),
    }
}

// ─── Idle sweep ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn manual_sweep_closes_only_idle_sessions() {
    let clock = Arc::new(ManualClock::new(1_000));
    let collector = RegistryBuilder::new()
        .reaper_enabled(false)
        .clock(clock.clone())
        .start(Arc::new(SqliteStorage::in_memory().await.unwrap()));

    let idle = collector.create_session("idle", "m", T0).await.unwrap();
    let busy = collector.create_session("busy", "m", T0).await.unwrap();

    clock.advance(200);
    collector.ingest(&busy, &clicks(&[T0 + 1])).await.unwrap();
    clock.advance(200);

    assert_eq!(collector.registry().sweep_idle(300).await.unwrap(), 1);

    let idle = collector.registry().get(&idle).await.unwrap();
    assert_eq!(idle.end_ms, Some(1_400));
    assert!(collector.registry().get(&busy).await.unwrap().is_open());
}

#[tokio::test]
async fn reaper_closes_idle_but_not_active_sessions() {
    let collector = RegistryBuilder::new()
        .idle_timeout_ms(250)
        .start(Arc::new(SqliteStorage::in_memory().await.unwrap()));

    let idle = collector.create_session("idle", "m", T0).await.unwrap();
    let active = collector.create_session("active", "m", T0).await.unwrap();

    for step in 0..12 {
        collector
            .ingest(&active, &clicks(&[T0 + step]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(!collector.registry().get(&idle).await.unwrap().is_open());
    assert!(collector.registry().get(&active).await.unwrap().is_open());
    assert!(!collector.reaper_exited());

    collector.shutdown().await.unwrap();
}

// ─── Reaper failure ───────────────────────────────────────────────────────────

/// Delegates to [`InMemoryStorage`] except for the idle sweep, which fails.
#[derive(Default)]
struct FailingSweepStore {
    inner: InMemoryStorage,
}

#[async_trait]
impl SessionStore for FailingSweepStore {
    async fn insert_session(&self, session: &Session) -> Result<(), CollectorError> {
        self.inner.insert_session(session).await
    }

    async fn find_session_id(&self, meta: &SessionMeta) -> Result<Option<SessionId>, CollectorError> {
        self.inner.find_session_id(meta).await
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, CollectorError> {
        self.inner.get_session(id).await
    }

    async fn set_session_end(&self, id: &SessionId, end_ms: i64) -> Result<CloseOutcome, CollectorError> {
        self.inner.set_session_end(id, end_ms).await
    }

    async fn close_idle(&self, _now_ms: i64, _cutoff_ms: i64) -> Result<u64, CollectorError> {
        Err(CollectorError::Storage("disk gone".into()))
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, CollectorError> {
        self.inner.list_sessions().await
    }
}

#[async_trait]
impl TelemetryStore for FailingSweepStore {
    async fn insert_batch(
        &self,
        session_id: &SessionId,
        batch: &Batch,
        guard: WriteGuard,
    ) -> Result<u64, CollectorError> {
        self.inner.insert_batch(session_id, batch, guard).await
    }

    async fn count_rows(&self, session_id: &SessionId, channel: Channel) -> Result<u64, CollectorError> {
        self.inner.count_rows(session_id, channel).await
    }

    async fn fetch_batch(&self, session_id: &SessionId, channel: Channel) -> Result<Batch, CollectorError> {
        self.inner.fetch_batch(session_id, channel).await
    }
}

#[tokio::test]
async fn failed_sweep_stops_reaper_and_reaches_owner() {
    let mut collector = RegistryBuilder::new()
        .idle_timeout_ms(50)
        .start(Arc::new(FailingSweepStore::default()));
    assert!(!collector.reaper_exited());

    let outcome = tokio::time::timeout(Duration::from_secs(5), collector.reaper_exit())
        .await
        .expect("reaper should exit after the first failed sweep");
    assert_eq!(outcome, Err(CollectorError::Storage("disk gone".into())));
    assert!(collector.reaper_exited());

    // Sessions are still served after the reaper is gone.
    collector.create_session("demo", "m", T0).await.unwrap();
}

#[tokio::test]
async fn shutdown_surfaces_earlier_sweep_failure() {
    let collector = RegistryBuilder::new()
        .idle_timeout_ms(50)
        .start(Arc::new(FailingSweepStore::default()));

    for _ in 0..100 {
        if collector.reaper_exited() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(collector.reaper_exited());

    let err = collector.shutdown().await.unwrap_err();
    assert_eq!(err, CollectorError::Storage("disk gone".into()));
}
