//! Forecast Scheduler Tests
//!
//! Scheduling runs on tokio's paused clock with a manual wall clock, so
//! delays can be asserted exactly. Ticks are driven by hand through
//! `ForecastScheduler::tick`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use asset_insight::storage::{DatapointStore, PredictedDatapointStore, StoreError};
use asset_insight::types::{DatapointPeriod, NumericValue};
use asset_insight::{
    AttributeRef, ForecastAttribute, ForecastConfig, ForecastScheduler, InMemoryStore,
    ManualClock, PredictedDatapoint, SchedulerSettings, ValueDatapoint, ValueType,
};

const MINUTE: i64 = 60_000;
const HOUR: i64 = 60 * MINUTE;
const T0: i64 = 1_700_000_000_000;

fn attribute(name: &str, forecast_period: i64, forecast_count: u32) -> ForecastAttribute {
    ForecastAttribute::new(
        AttributeRef::new("meter", name),
        ValueType::Float64,
        ForecastConfig::new(HOUR, 2, forecast_period, forecast_count),
    )
}

#[derive(Default)]
struct CountingStore {
    inner: InMemoryStore,
    purges: AtomicUsize,
}

impl PredictedDatapointStore for CountingStore {
    fn purge(&self, attribute: &AttributeRef) -> Result<(), StoreError> {
        self.purges.fetch_add(1, Ordering::SeqCst);
        self.inner.purge(attribute)
    }

    fn write_batch(
        &self,
        attribute: &AttributeRef,
        datapoints: &[PredictedDatapoint],
    ) -> Result<(), StoreError> {
        self.inner.write_batch(attribute, datapoints)
    }

    fn read_all(&self, attribute: &AttributeRef) -> Result<Vec<PredictedDatapoint>, StoreError> {
        self.inner.read_all(attribute)
    }
}

struct UnavailableStore;

impl DatapointStore for UnavailableStore {
    fn query_range(
        &self,
        _attribute: &AttributeRef,
        _from: i64,
        _to: i64,
    ) -> Result<Vec<ValueDatapoint>, StoreError> {
        Err(StoreError::Backend("connection refused".to_string()))
    }

    fn period(&self, _attribute: &AttributeRef) -> Result<DatapointPeriod, StoreError> {
        Err(StoreError::Backend("connection refused".to_string()))
    }
}

/// Parks the first history query until the test releases it.
struct GatedStore {
    inner: Arc<InMemoryStore>,
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl GatedStore {
    fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl DatapointStore for GatedStore {
    fn query_range(
        &self,
        attribute: &AttributeRef,
        from: i64,
        to: i64,
    ) -> Result<Vec<ValueDatapoint>, StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.query_range(attribute, from, to)
    }

    fn period(&self, attribute: &AttributeRef) -> Result<DatapointPeriod, StoreError> {
        self.inner.period(attribute)
    }
}

/// Two hourly values behind an hour-aligned `now`, enough for one horizon.
fn seeded_power(now: i64) -> (Arc<InMemoryStore>, AttributeRef) {
    let store = Arc::new(InMemoryStore::new());
    let power = AttributeRef::new("meter", "power");
    store
        .append_datapoint(&power, ValueDatapoint::new(now - 2 * HOUR + 5 * MINUTE, 10.0))
        .unwrap();
    store
        .append_datapoint(&power, ValueDatapoint::new(now - HOUR + 5 * MINUTE, 20.0))
        .unwrap();
    (store, power)
}

fn scheduler(
    datapoints: Arc<dyn DatapointStore>,
    predicted: Arc<dyn PredictedDatapointStore>,
    clock: Arc<ManualClock>,
) -> ForecastScheduler {
    ForecastScheduler::new(datapoints, predicted, clock, SchedulerSettings::default()).unwrap()
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn single_task_follows_soonest_due_timestamp() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(InMemoryStore::new());
    let scheduler = scheduler(store.clone(), store, clock.clone());

    scheduler.add(vec![attribute("a", 10 * MINUTE, 1), attribute("b", 4 * MINUTE, 1)]);
    // New attributes are due immediately
    assert_eq!(scheduler.next_due(), Some(T0));
    assert_eq!(scheduler.scheduled_delay(), Some(Duration::ZERO));

    scheduler.tick();
    assert_eq!(scheduler.next_due(), Some(T0 + 4 * MINUTE));
    assert_eq!(scheduler.scheduled_delay(), Some(Duration::from_secs(4 * 60)));

    clock.advance(4 * MINUTE);
    scheduler.tick();
    assert_eq!(scheduler.next_due(), Some(T0 + 8 * MINUTE));
    assert_eq!(scheduler.scheduled_delay(), Some(Duration::from_secs(4 * 60)));
    assert_eq!(
        scheduler
            .attribute(&AttributeRef::new("meter", "a"))
            .unwrap()
            .timestamps(),
        &[T0 + 10 * MINUTE]
    );
}

#[tokio::test(start_paused = true)]
async fn delete_removes_schedule_and_purges_once() {
    let clock = Arc::new(ManualClock::new(T0));
    let predicted = Arc::new(CountingStore::default());
    let scheduler = scheduler(Arc::new(InMemoryStore::new()), predicted.clone(), clock);

    scheduler.add(vec![attribute("a", 10 * MINUTE, 1), attribute("b", 4 * MINUTE, 1)]);
    scheduler.tick();
    let purges_after_tick = predicted.purges.load(Ordering::SeqCst);

    let b = AttributeRef::new("meter", "b");
    scheduler.delete(&b).unwrap();

    assert!(!scheduler.contains(&b));
    assert_eq!(scheduler.next_due(), Some(T0 + 10 * MINUTE));
    assert_eq!(predicted.purges.load(Ordering::SeqCst), purges_after_tick + 1);
}

#[tokio::test]
async fn delete_during_tick_leaves_no_predictions() {
    let now = T0 - T0 % HOUR;
    let clock = Arc::new(ManualClock::new(now));
    let (store, power) = seeded_power(now);
    let gated = Arc::new(GatedStore::new(store.clone()));
    let scheduler = scheduler(gated.clone(), store.clone(), clock);
    scheduler.add(vec![attribute("power", 10 * MINUTE, 1)]);

    let ticking = scheduler.clone();
    let tick = std::thread::spawn(move || ticking.tick());
    gated.entered.wait();
    scheduler.delete(&power).unwrap();
    gated.release.wait();
    tick.join().unwrap();

    assert!(!scheduler.contains(&power));
    assert!(store.read_all(&power).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn add_inside_safe_window_keeps_pending_task() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(InMemoryStore::new());
    let scheduler = scheduler(store.clone(), store, clock);

    scheduler.add(vec![attribute("a", 10 * MINUTE, 1)]);
    scheduler.tick();
    assert_eq!(scheduler.scheduled_delay(), Some(Duration::from_secs(10 * 60)));

    tokio::time::advance(Duration::from_secs(10 * 60 - 1)).await;
    scheduler.add(vec![attribute("b", 4 * MINUTE, 1)]);

    // The imminent tick picks up "b"
    assert!(scheduler.contains(&AttributeRef::new("meter", "b")));
    assert_eq!(scheduler.scheduled_delay(), Some(Duration::from_secs(1)));
    assert_eq!(scheduler.next_due(), Some(T0 + 10 * MINUTE));
}

#[tokio::test(start_paused = true)]
async fn restart_resumes_persisted_schedule() {
    let clock = Arc::new(ManualClock::new(T0));
    let predicted = Arc::new(InMemoryStore::new());
    let stored = AttributeRef::new("meter", "stored");
    predicted
        .write_batch(
            &stored,
            &[
                PredictedDatapoint {
                    timestamp: T0 - 5 * MINUTE,
                    value: NumericValue::Float(1.0),
                },
                PredictedDatapoint {
                    timestamp: T0 + 5 * MINUTE,
                    value: NumericValue::Float(2.0),
                },
            ],
        )
        .unwrap();
    let scheduler = scheduler(Arc::new(InMemoryStore::new()), predicted, clock);

    scheduler
        .init(vec![attribute("stored", 10 * MINUTE, 1), attribute("fresh", 10 * MINUTE, 1)])
        .unwrap();

    assert_eq!(
        scheduler.attribute(&stored).unwrap().timestamps(),
        &[T0 + 5 * MINUTE]
    );
    assert_eq!(
        scheduler
            .attribute(&AttributeRef::new("meter", "fresh"))
            .unwrap()
            .timestamps(),
        &[T0, T0 + 10 * MINUTE]
    );
    assert_eq!(scheduler.scheduled_delay(), Some(Duration::ZERO));
}

#[tokio::test(start_paused = true)]
async fn failed_tick_falls_back_to_retry_delay() {
    let clock = Arc::new(ManualClock::new(T0));
    let settings = SchedulerSettings {
        fallback_delay: Duration::from_secs(60),
        ..SchedulerSettings::default()
    };
    let scheduler = ForecastScheduler::new(
        Arc::new(UnavailableStore),
        Arc::new(InMemoryStore::new()),
        clock,
        settings,
    )
    .unwrap();

    scheduler.add(vec![attribute("a", 10 * MINUTE, 1)]);
    scheduler.tick();

    assert_eq!(scheduler.scheduled_delay(), Some(Duration::from_secs(60)));
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_distant_task() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(InMemoryStore::new());
    let scheduler = scheduler(store.clone(), store, clock);

    assert!(scheduler.shutdown(Duration::from_secs(1)).await);

    scheduler.add(vec![attribute("a", 10 * MINUTE, 1)]);
    scheduler.tick();
    assert!(scheduler.scheduled_delay().is_some());

    assert!(scheduler.shutdown(Duration::from_secs(1)).await);
    assert_eq!(scheduler.scheduled_delay(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_interrupts_tick_that_outlives_timeout() {
    let now = T0 - T0 % HOUR;
    let clock = Arc::new(ManualClock::new(now));
    let (store, _) = seeded_power(now);
    let gated = Arc::new(GatedStore::new(store.clone()));
    let settings = SchedulerSettings {
        shutdown_poll: Duration::from_millis(10),
        ..SchedulerSettings::default()
    };
    let scheduler = ForecastScheduler::new(gated.clone(), store, clock, settings).unwrap();

    // Due now, so the background task starts a tick and parks in the store
    scheduler.add(vec![attribute("power", 10 * MINUTE, 1)]);
    let entered = Arc::clone(&gated);
    tokio::task::spawn_blocking(move || entered.entered.wait())
        .await
        .unwrap();

    assert!(!scheduler.shutdown(Duration::from_millis(100)).await);
    assert_eq!(scheduler.scheduled_delay(), None);

    let release = Arc::clone(&gated);
    tokio::task::spawn_blocking(move || release.release.wait())
        .await
        .unwrap();
}

// ============================================================================
// Background Task
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_task_writes_predictions() {
    let now = T0 - T0 % HOUR;
    let clock = Arc::new(ManualClock::new(now));
    let (store, power) = seeded_power(now);
    let scheduler = scheduler(store.clone(), store.clone(), clock);

    scheduler.add(vec![attribute("power", 10 * MINUTE, 1)]);

    let mut predicted = Vec::new();
    for _ in 0..200 {
        predicted = store.read_all(&power).unwrap();
        if !predicted.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(predicted.len(), 1);
    assert_eq!(predicted[0].timestamp, now + 10 * MINUTE);
    match predicted[0].value {
        NumericValue::Float(v) => assert!((v - 50.0 / 3.0).abs() < 1e-9),
        other => panic!("expected float, got {other:?}"),
    }

    assert!(scheduler.shutdown(Duration::from_secs(1)).await);
}
