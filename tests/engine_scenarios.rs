//! End-to-end behaviour of the engine against both store backends.
//!
//! Every scenario drives rounds by hand on a manual clock, so delays and retry
//! backoff are exercised without sleeping.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use worker_engine::clock::ManualClock;
use worker_engine::config::{EngineConfig, StoreBackend};
use worker_engine::engine::Engine;
use worker_engine::error::{HandlerError, NotifyError, QueueError, ScheduleError};
use worker_engine::handlers::HandlerOutput;
use worker_engine::notify::{Outcome, OutcomeStatus, ResultNotifier};
use worker_engine::queue::EnqueueRequest;
use worker_engine::store::{LibSqlBackend, MemoryStore, TaskStore};
use worker_engine::worker::{Task, TaskStatus};

/// Maximum time any concurrent test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Records every notification.
#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(Option<String>, Outcome)>>,
}

impl RecordingNotifier {
    async fn count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl ResultNotifier for RecordingNotifier {
    async fn notify(
        &self,
        requester_ref: Option<&str>,
        outcome: &Outcome,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .await
            .push((requester_ref.map(String::from), outcome.clone()));
        Ok(())
    }
}

/// A notifier whose transport is always down.
struct BrokenNotifier;

#[async_trait]
impl ResultNotifier for BrokenNotifier {
    async fn notify(&self, _: Option<&str>, _: &Outcome) -> Result<(), NotifyError> {
        Err(NotifyError::SendFailed {
            reason: "connection refused".into(),
        })
    }
}

struct Fixture {
    name: &'static str,
    engine: Engine,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
}

async fn stores() -> Vec<(&'static str, Arc<dyn TaskStore>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new()) as Arc<dyn TaskStore>),
        ("libsql", Arc::new(LibSqlBackend::new_memory().await.unwrap())),
    ]
}

async fn fixtures(configure: impl Fn(&mut EngineConfig)) -> Vec<Fixture> {
    let mut fixtures = Vec::new();
    for (name, store) in stores().await {
        let mut config = EngineConfig {
            store: StoreBackend::Memory,
            ..EngineConfig::default()
        };
        configure(&mut config);
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = Engine::new(config, store, clock.clone()).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        engine.set_notifier(notifier.clone()).await;
        fixtures.push(Fixture {
            name,
            engine,
            clock,
            notifier,
        });
    }
    fixtures
}

async fn status_of(engine: &Engine, id: Uuid) -> Task {
    engine.get_task(id).await.unwrap().unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_higher_priority_claimed_first() {
    for f in fixtures(|c| c.dispatch.batch_size = 1).await {
        f.engine
            .register_fn("job", |_ctx, _payload| async {
                Ok::<_, HandlerError>(HandlerOutput::default())
            })
            .await;

        let low = f
            .engine
            .enqueue(EnqueueRequest::new("job", serde_json::Value::Null).with_priority(5))
            .await
            .unwrap();
        let high = f
            .engine
            .enqueue(EnqueueRequest::new("job", serde_json::Value::Null).with_priority(9))
            .await
            .unwrap();

        let report = f.engine.run_round().await.unwrap();
        assert_eq!(report.claimed, 1, "[{}]", f.name);
        assert_eq!(status_of(&f.engine, high).await.status, TaskStatus::Completed, "[{}]", f.name);
        assert_eq!(status_of(&f.engine, low).await.status, TaskStatus::Pending, "[{}]", f.name);
    }
}

#[tokio::test]
async fn scenario_b_always_failing_handler_ends_failed_once() {
    for f in fixtures(|_| {}).await {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.engine
            .register_fn("flaky", move |_ctx, _payload| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<HandlerOutput, _>(HandlerError::Failed("upstream 500".into())) }
            })
            .await;

        let id = f
            .engine
            .enqueue(
                EnqueueRequest::new("flaky", serde_json::Value::Null)
                    .with_max_retries(2)
                    .with_requester("chat:42"),
            )
            .await
            .unwrap();

        // initial attempt plus two retries, each after the fixed retry delay
        for round in 0..3 {
            let report = f.engine.run_round().await.unwrap();
            assert_eq!(report.claimed, 1, "[{}] round {round}", f.name);
            if round < 2 {
                assert_eq!(report.retried, 1, "[{}] round {round}", f.name);
                assert_eq!(f.notifier.count().await, 0, "[{}] premature notification", f.name);
                // not eligible again until the retry delay has passed
                assert_eq!(f.engine.run_round().await.unwrap().claimed, 0);
                f.clock.advance(chrono::Duration::seconds(300));
            }
        }

        let task = status_of(&f.engine, id).await;
        assert_eq!(task.status, TaskStatus::Failed, "[{}]", f.name);
        assert_eq!(task.retry_count, 2, "[{}]", f.name);
        assert_eq!(task.error_message.as_deref(), Some("upstream 500"));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "[{}]", f.name);

        let sent = f.notifier.sent.lock().await;
        assert_eq!(sent.len(), 1, "[{}]", f.name);
        assert_eq!(sent[0].0.as_deref(), Some("chat:42"));
        assert_eq!(sent[0].1.status, OutcomeStatus::Failure);
        assert_eq!(sent[0].1.error.as_deref(), Some("upstream 500"));
        assert_eq!(sent[0].1.retry_count, 2);

        // nothing left to do
        f.clock.advance(chrono::Duration::hours(1));
        assert_eq!(f.engine.run_round().await.unwrap().claimed, 0);
    }
}

#[tokio::test]
async fn scenario_c_delay_is_honored() {
    for f in fixtures(|_| {}).await {
        f.engine
            .register_fn("later", |_ctx, _payload| async {
                Ok::<_, HandlerError>(HandlerOutput::default())
            })
            .await;

        let id = f
            .engine
            .enqueue(EnqueueRequest::new("later", serde_json::Value::Null).with_delay_secs(60))
            .await
            .unwrap();

        assert_eq!(f.engine.run_round().await.unwrap().claimed, 0, "[{}]", f.name);
        f.clock.advance(chrono::Duration::seconds(59));
        assert_eq!(f.engine.run_round().await.unwrap().claimed, 0, "[{}]", f.name);
        f.clock.advance(chrono::Duration::seconds(2));
        assert_eq!(f.engine.run_round().await.unwrap().claimed, 1, "[{}]", f.name);

        let task = status_of(&f.engine, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.started_at.unwrap() >= task.created_at + chrono::Duration::seconds(60));
    }
}

#[tokio::test]
async fn scenario_d_unknown_type_fails_immediately() {
    for f in fixtures(|_| {}).await {
        let id = f
            .engine
            .enqueue(EnqueueRequest::new("ghost", serde_json::Value::Null))
            .await
            .unwrap();

        let report = f.engine.run_round().await.unwrap();
        assert_eq!(report.failed, 1, "[{}]", f.name);

        let task = status_of(&f.engine, id).await;
        assert_eq!(task.status, TaskStatus::Failed, "[{}]", f.name);
        assert_eq!(task.retry_count, 0, "[{}]", f.name);
        assert!(task.error_message.unwrap().contains("ghost"));
        assert_eq!(f.notifier.count().await, 1, "[{}]", f.name);
    }
}

// ── Properties ──────────────────────────────────────────────────────

#[tokio::test]
async fn priority_then_age_ordering() {
    for f in fixtures(|c| c.dispatch.batch_size = 1).await {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        f.engine
            .register_fn("job", move |_ctx, payload| {
                let seen = seen.clone();
                async move {
                    seen.lock().await.push(payload["n"].as_i64().unwrap_or(-1));
                    Ok::<_, HandlerError>(HandlerOutput::default())
                }
            })
            .await;

        for (n, priority) in [(1, 3), (2, 7), (3, 7), (4, 10), (5, 1)] {
            f.engine
                .enqueue(
                    EnqueueRequest::new("job", serde_json::json!({ "n": n }))
                        .with_priority(priority),
                )
                .await
                .unwrap();
            f.clock.advance(chrono::Duration::seconds(1));
        }

        for _ in 0..5 {
            f.engine.run_round().await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![4, 2, 3, 1, 5], "[{}]", f.name);
    }
}

#[tokio::test]
async fn timeout_consumes_retries_then_fails() {
    for f in fixtures(|c| c.execution.handler_timeout = Duration::from_millis(50)).await {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        f.engine
            .register_fn("hang", move |_ctx, _payload| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    std::future::pending::<()>().await;
                    Ok::<_, HandlerError>(HandlerOutput::default())
                }
            })
            .await;

        let id = f
            .engine
            .enqueue(EnqueueRequest::new("hang", serde_json::Value::Null).with_max_retries(1))
            .await
            .unwrap();

        let first = f.engine.run_round().await.unwrap();
        assert_eq!(first.retried, 1, "[{}]", f.name);
        assert_eq!(status_of(&f.engine, id).await.retry_count, 1);

        f.clock.advance(chrono::Duration::seconds(300));
        let second = f.engine.run_round().await.unwrap();
        assert_eq!(second.failed, 1, "[{}]", f.name);

        let task = status_of(&f.engine, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("timeout"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.notifier.count().await, 1);
    }
}

#[tokio::test]
async fn notifier_failure_does_not_touch_task() {
    for f in fixtures(|_| {}).await {
        f.engine.set_notifier(Arc::new(BrokenNotifier)).await;
        f.engine
            .register_fn("ok", |_ctx, _payload| async {
                Ok::<_, HandlerError>(HandlerOutput::text("fine"))
            })
            .await;

        let id = f
            .engine
            .enqueue(EnqueueRequest::new("ok", serde_json::Value::Null))
            .await
            .unwrap();
        let report = f.engine.run_round().await.unwrap();
        assert_eq!(report.completed, 1, "[{}]", f.name);
        assert_eq!(status_of(&f.engine, id).await.status, TaskStatus::Completed);
        assert_eq!(f.engine.run_round().await.unwrap().claimed, 0);
    }
}

#[tokio::test]
async fn schedules_produce_tasks() {
    for f in fixtures(|_| {}).await {
        f.engine
            .register_fn("digest", |_ctx, _payload| async {
                Ok::<_, HandlerError>(HandlerOutput::default())
            })
            .await;
        f.engine
            .add_schedule("hourly", "@every 1h", "digest", serde_json::json!({"k": 1}), 6)
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::hours(1));
        assert_eq!(f.engine.tick_schedules().await.unwrap(), 1, "[{}]", f.name);
        f.engine.run_schedule_now("hourly").await.unwrap();

        let pending = f.engine.list_tasks(TaskStatus::Pending, 10).await.unwrap();
        assert_eq!(pending.len(), 2, "[{}]", f.name);
        assert!(pending.iter().all(|t| t.origin == "schedule:hourly" && t.priority == 6));

        let report = f.engine.run_round().await.unwrap();
        assert_eq!(report.completed, 2);

        let listed = f.engine.list_schedules().await.unwrap();
        assert_eq!(listed[0].fire_count, 2);
        assert_eq!(listed[0].next_fire_at, Some(t0() + chrono::Duration::hours(2)));
    }
}

#[tokio::test]
async fn out_of_range_inputs_are_rejected() {
    for f in fixtures(|_| {}).await {
        let err = f
            .engine
            .enqueue(EnqueueRequest::new("t", serde_json::Value::Null).with_delay_secs(i64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::DelayTooLarge { .. }), "[{}]", f.name);

        let err = f
            .engine
            .add_schedule("huge", "@every 9999999999999999s", "t", serde_json::Value::Null, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidTrigger { .. }), "[{}]", f.name);

        let err = f
            .engine
            .add_schedule("loud", "@every 60s", "t", serde_json::Value::Null, 99)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ScheduleError::Queue(QueueError::InvalidPriority { .. })),
            "[{}]",
            f.name
        );

        f.clock.advance(chrono::Duration::minutes(2));
        assert_eq!(f.engine.tick_schedules().await.unwrap(), 0);
        assert!(f.engine.list_schedules().await.unwrap().is_empty());
        assert!(f.engine.list_tasks(TaskStatus::Pending, 10).await.unwrap().is_empty());
    }
}

// ── At-most-one claim ───────────────────────────────────────────────

async fn race_claims(stores: Vec<Arc<dyn TaskStore>>, total: usize) -> Vec<Uuid> {
    let now = t0();
    for i in 0..total {
        let task = Task::new("job", serde_json::json!({ "i": i }), 5, now);
        stores[0].insert_task(&task).await.unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..4 {
        let store = Arc::clone(&stores[worker % stores.len()]);
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            let mut idle_rounds = 0;
            while idle_rounds < 3 {
                match store.claim_batch(now, 3, Uuid::new_v4()).await {
                    Ok(batch) if batch.is_empty() => idle_rounds += 1,
                    Ok(batch) => claimed.extend(batch.into_iter().map(|t| t.id)),
                    // a busy database fails the round; try again
                    Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                }
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all
}

fn assert_claimed_once(ids: &[Uuid], total: usize) {
    let unique: HashSet<&Uuid> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len(), "a task was claimed twice");
    assert_eq!(ids.len(), total, "every task claimed exactly once");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatchers_claim_each_task_once_memory() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let ids = tokio::time::timeout(TEST_TIMEOUT, race_claims(vec![store], 60))
        .await
        .expect("test timed out");
    assert_claimed_once(&ids, 60);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatchers_claim_each_task_once_libsql_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");
    let a: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let b: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());

    let ids = tokio::time::timeout(TEST_TIMEOUT, race_claims(vec![a.clone(), b], 60))
        .await
        .expect("test timed out");
    assert_claimed_once(&ids, 60);

    let counts = a.count_by_status().await.unwrap();
    assert_eq!(counts.get(&TaskStatus::Processing), Some(&60));
}

// ── Durability ──────────────────────────────────────────────────────

#[tokio::test]
async fn pending_tasks_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.db");
    let config = EngineConfig {
        store: StoreBackend::LibSql { path: path.clone() },
        ..EngineConfig::default()
    };

    let id = {
        let engine = Engine::open(config.clone()).await.unwrap();
        engine
            .enqueue(EnqueueRequest::new("later", serde_json::json!({"x": 1})))
            .await
            .unwrap()
    };

    let engine = Engine::open(config).await.unwrap();
    engine
        .register_fn("later", |_ctx, payload| async move {
            Ok::<_, HandlerError>(HandlerOutput::json(payload))
        })
        .await;
    assert_eq!(engine.run_round().await.unwrap().completed, 1);
    let task = engine.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.output, Some(serde_json::json!({"x": 1})));
}
