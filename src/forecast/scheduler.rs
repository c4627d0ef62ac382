//! Forecast Scheduler
//!
//! One pending task for all forecast attributes. Each attribute keeps its
//! upcoming due timestamps; the task sleeps until the earliest one, runs a
//! tick, and reschedules itself.
//!
//! ## Tick
//!
//! 1. Under the state lock: drop passed timestamps, regenerate the schedule
//!    of every attribute, select the attributes that are due
//! 2. Without the lock: compute forecasts in parallel (rayon), then purge
//!    and rewrite each attribute's predictions
//! 3. Under the lock: refresh next-due timestamps and reschedule
//!
//! A failed tick is retried after the fallback delay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rayon::prelude::*;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config;
use crate::config::defaults::{
    FALLBACK_SCHEDULE_DELAY, SAFE_CANCEL_WINDOW, SHUTDOWN_POLL_INTERVAL, STOP_TIMEOUT,
};
use crate::storage::{DatapointStore, PredictedDatapointStore, StoreError};
use crate::types::{AttributeRef, PredictedDatapoint};

use super::model::{compute_forecasts, forecast_timestamps};
use super::{ForecastAttribute, ForecastConfig, ForecastError};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// A pending task closer to its start than this is left alone
    pub safe_cancel_window: Duration,
    /// Delay after a failed tick, or when nothing has a due timestamp
    pub fallback_delay: Duration,
    /// Poll interval while waiting for an in-flight tick on shutdown
    pub shutdown_poll: Duration,
    /// Default wait for an in-flight tick on shutdown
    pub stop_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            safe_cancel_window: SAFE_CANCEL_WINDOW,
            fallback_delay: FALLBACK_SCHEDULE_DELAY,
            shutdown_poll: SHUTDOWN_POLL_INTERVAL,
            stop_timeout: STOP_TIMEOUT,
        }
    }
}

impl SchedulerSettings {
    pub fn from_config() -> Self {
        config::get().map_or_else(Self::default, |c| Self {
            safe_cancel_window: Duration::from_millis(c.forecast.safe_cancel_window_ms),
            fallback_delay: Duration::from_millis(c.forecast.fallback_delay_ms),
            shutdown_poll: Duration::from_millis(c.forecast.shutdown_poll_ms),
            stop_timeout: c.forecast.stop_timeout(),
        })
    }
}

// ============================================================================
// State
// ============================================================================

struct ScheduledTask {
    id: u64,
    due: Instant,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    fn remaining(&self) -> Duration {
        self.due.saturating_duration_since(Instant::now())
    }

    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

#[derive(Default)]
struct SchedulerState {
    attributes: HashMap<AttributeRef, ForecastAttribute>,
    next_due: HashMap<AttributeRef, i64>,
    task: Option<ScheduledTask>,
}

impl SchedulerState {
    fn purge_timestamps(&mut self, now: i64) {
        for attribute in self.attributes.values_mut() {
            if attribute.timestamps().first().is_some_and(|&t| t <= now) {
                let kept = attribute
                    .timestamps()
                    .iter()
                    .copied()
                    .filter(|&t| t > now)
                    .collect();
                attribute.set_timestamps(kept);
            }
        }
    }

    fn add_forecast_timestamps(&mut self, now: i64, restart: bool) {
        for attribute in self.attributes.values_mut() {
            let next = next_timestamps(attribute.timestamps(), now, attribute.config(), restart);
            attribute.set_timestamps(next);
        }
    }

    fn update_next_due(&mut self) {
        self.next_due = self
            .attributes
            .iter()
            .filter_map(|(key, a)| a.timestamps().first().map(|&t| (key.clone(), t)))
            .collect();
    }

    fn due_attributes(&self, now: i64) -> Vec<ForecastAttribute> {
        self.attributes
            .iter()
            .filter(|(key, _)| self.next_due.get(*key).is_some_and(|&due| due <= now))
            .map(|(_, a)| a.clone())
            .collect()
    }
}

/// Regenerate one attribute's due timestamps, keeping the phase of the
/// existing schedule.
///
/// - No existing timestamps: `now` followed by one full run
/// - Otherwise the new run is shifted onto the existing first timestamp and
///   advanced by whole forecast periods until it is no longer in the past
/// - On restart, `now` is prepended when the stored schedule is behind or
///   shorter than a full run
pub(crate) fn next_timestamps(
    existing: &[i64],
    now: i64,
    config: &ForecastConfig,
    restart: bool,
) -> Vec<i64> {
    let mut next = forecast_timestamps(now, config);
    let (Some(&first_existing), Some(&first_next)) = (existing.first(), next.first()) else {
        next.insert(0, now);
        return next;
    };

    let shift = first_existing - first_next;
    next.iter_mut().for_each(|t| *t += shift);
    while next.first().is_some_and(|&t| t < now) {
        next.iter_mut().for_each(|t| *t += config.forecast_period_ms);
    }

    if restart && (first_existing < now || next.len() > existing.len()) {
        next.insert(0, now);
    }
    next
}

/// Drop attributes whose config cannot be scheduled.
fn validated(attributes: Vec<ForecastAttribute>) -> Vec<ForecastAttribute> {
    attributes
        .into_iter()
        .filter(|a| match a.config().validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("[ForecastScheduler] Skipping {}: {}", a.attribute(), e);
                false
            }
        })
        .collect()
}

// ============================================================================
// Scheduler
// ============================================================================

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    datapoints: Arc<dyn DatapointStore>,
    predicted: Arc<dyn PredictedDatapointStore>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    settings: SchedulerSettings,
    task_ids: AtomicU64,
}

/// Cheap to clone; clones share the same schedule.
#[derive(Clone)]
pub struct ForecastScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for ForecastScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForecastScheduler")
            .field("attributes", &self.attribute_count())
            .field("next_due", &self.next_due())
            .finish_non_exhaustive()
    }
}

impl ForecastScheduler {
    /// Create a scheduler bound to the current tokio runtime.
    pub fn new(
        datapoints: Arc<dyn DatapointStore>,
        predicted: Arc<dyn PredictedDatapointStore>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Result<Self, ForecastError> {
        let runtime = Handle::try_current().map_err(|e| ForecastError::Runtime(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState::default()),
                datapoints,
                predicted,
                clock,
                runtime,
                settings,
                task_ids: AtomicU64::new(0),
            }),
        })
    }

    /// Load previously persisted schedules and start.
    ///
    /// Each attribute resumes from its stored predictions that are not yet
    /// in the past.
    pub fn init(&self, attributes: Vec<ForecastAttribute>) -> Result<(), ForecastError> {
        let now = self.inner.clock.now_millis();
        let attributes = validated(attributes);
        let mut restored = Vec::with_capacity(attributes.len());
        for mut attribute in attributes {
            let mut timestamps: Vec<i64> = self
                .inner
                .predicted
                .read_all(attribute.attribute())?
                .into_iter()
                .map(|p| p.timestamp)
                .filter(|&t| t >= now)
                .collect();
            timestamps.sort_unstable();
            attribute.set_timestamps(timestamps);
            restored.push(attribute);
        }

        let mut state = self.inner.state();
        let count = restored.len();
        for attribute in restored {
            state.attributes.insert(attribute.attribute().clone(), attribute);
        }
        self.inner.start(&mut state, now, true);
        info!("[ForecastScheduler] Restored {} forecast attributes", count);
        Ok(())
    }

    /// Add (or replace) attributes.
    ///
    /// A pending task far enough in the future is rescheduled so new
    /// attributes are forecast right away; otherwise the imminent tick
    /// picks them up.
    pub fn add(&self, attributes: Vec<ForecastAttribute>) {
        let attributes = validated(attributes);
        if attributes.is_empty() {
            return;
        }
        let now = self.inner.clock.now_millis();
        let mut state = self.inner.state();
        for attribute in attributes {
            debug!("[ForecastScheduler] Adding {}", attribute.attribute());
            state.attributes.insert(attribute.attribute().clone(), attribute);
        }

        let reschedule = state
            .task
            .as_ref()
            .map_or(true, |task| task.remaining() > self.inner.settings.safe_cancel_window);
        if reschedule {
            if let Some(task) = state.task.take() {
                task.stop();
            }
            self.inner.start(&mut state, now, false);
        }
    }

    /// Remove an attribute and purge its predictions.
    ///
    /// The purge runs under the state lock, so a tick computing this
    /// attribute either writes before it or skips the write.
    pub fn delete(&self, attribute: &AttributeRef) -> Result<(), StoreError> {
        let mut state = self.inner.state();
        state.attributes.remove(attribute);
        state.next_due.remove(attribute);
        debug!("[ForecastScheduler] Removed {}", attribute);
        self.inner.predicted.purge(attribute)
    }

    pub fn contains(&self, attribute: &AttributeRef) -> bool {
        self.inner.state().attributes.contains_key(attribute)
    }

    pub fn attribute_count(&self) -> usize {
        self.inner.state().attributes.len()
    }

    /// Snapshot of one attribute with its pending due timestamps.
    pub fn attribute(&self, attribute: &AttributeRef) -> Option<ForecastAttribute> {
        self.inner.state().attributes.get(attribute).cloned()
    }

    /// Earliest next-due timestamp across attributes.
    pub fn next_due(&self) -> Option<i64> {
        self.inner.state().next_due.values().min().copied()
    }

    /// Time until the pending task starts, if one is scheduled.
    pub fn scheduled_delay(&self) -> Option<Duration> {
        self.inner.state().task.as_ref().map(ScheduledTask::remaining)
    }

    /// Run one tick on the calling thread.
    ///
    /// Replaces the pending task with the one the tick schedules.
    pub fn tick(&self) {
        self.inner.run_tick(None, &CancellationToken::new());
    }

    /// Stop scheduling.
    ///
    /// A pending task is cancelled once its start is further away than the
    /// safe cancel window; a task about to run (or running) is awaited for
    /// up to `timeout` and then interrupted. Returns `false` only when the
    /// task had to be interrupted.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            {
                let mut state = self.inner.state();
                let stop_now = match state.task.as_ref() {
                    None => {
                        info!("[ForecastScheduler] Stopped (no pending task)");
                        return true;
                    }
                    Some(task) => {
                        task.handle.is_finished()
                            || task.remaining() > self.inner.settings.safe_cancel_window
                    }
                };
                if stop_now {
                    if let Some(task) = state.task.take() {
                        task.stop();
                    }
                    info!("[ForecastScheduler] Stopped");
                    return true;
                }
                if started.elapsed() > timeout {
                    if let Some(task) = state.task.take() {
                        task.stop();
                    }
                    warn!(
                        "[ForecastScheduler] Forecast run still in progress after {:?}, interrupted",
                        timeout
                    );
                    return false;
                }
            }
            tokio::time::sleep(self.inner.settings.shutdown_poll).await;
        }
    }

    /// Shutdown with the configured stop timeout.
    pub async fn stop(&self) -> bool {
        self.shutdown(self.inner.settings.stop_timeout).await
    }
}

impl SchedulerInner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start scheduling unless a task is already pending.
    fn start(self: &Arc<Self>, state: &mut SchedulerState, now: i64, restart: bool) {
        if state.task.is_some() {
            return;
        }
        state.add_forecast_timestamps(now, restart);
        state.update_next_due();
        self.schedule_next(state, None, now);
    }

    /// Schedule for the earliest next-due timestamp.
    fn schedule_next(self: &Arc<Self>, state: &mut SchedulerState, current: Option<u64>, now: i64) {
        let delay = match state.next_due.values().min() {
            Some(&due) => Duration::from_millis(u64::try_from(due - now).unwrap_or(0)),
            None if !state.attributes.is_empty() => self.settings.fallback_delay,
            None => {
                Self::replace_task(state, current, None);
                debug!("[ForecastScheduler] No forecast attributes, idle");
                return;
            }
        };
        self.schedule(state, current, delay);
    }

    fn schedule(self: &Arc<Self>, state: &mut SchedulerState, current: Option<u64>, delay: Duration) {
        let id = self.task_ids.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(self);

        let handle = self.runtime.spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let worker = Arc::clone(&inner);
            let worker_token = token.clone();
            let result =
                tokio::task::spawn_blocking(move || worker.run_tick(Some(id), &worker_token)).await;
            if let Err(e) = result {
                error!("[ForecastScheduler] Forecast task failed: {}", e);
                if !token.is_cancelled() {
                    let mut state = inner.state();
                    inner.schedule(&mut state, Some(id), inner.settings.fallback_delay);
                }
            }
        });

        let task = ScheduledTask {
            id,
            due: Instant::now() + delay,
            cancel,
            handle,
        };
        Self::replace_task(state, current, Some(task));
        debug!("[ForecastScheduler] Next forecast run in {:?}", delay);
    }

    /// Swap the pending task. The task that is doing the swap is left to
    /// finish; any other is cancelled.
    fn replace_task(state: &mut SchedulerState, current: Option<u64>, next: Option<ScheduledTask>) {
        let previous = std::mem::replace(&mut state.task, next);
        if let Some(previous) = previous {
            if Some(previous.id) != current {
                previous.stop();
            }
        }
    }

    fn run_tick(self: &Arc<Self>, current: Option<u64>, token: &CancellationToken) {
        if let Err(e) = self.tick(current, token) {
            error!("[ForecastScheduler] Forecast run failed: {}", e);
            if !token.is_cancelled() {
                let mut state = self.state();
                self.schedule(&mut state, current, self.settings.fallback_delay);
            }
        }
    }

    fn tick(self: &Arc<Self>, current: Option<u64>, token: &CancellationToken) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let due = {
            let mut state = self.state();
            state.purge_timestamps(now);
            state.add_forecast_timestamps(now, false);
            state.purge_timestamps(now);
            state.due_attributes(now)
        };

        let results: Vec<(AttributeRef, Result<Option<Vec<PredictedDatapoint>>, StoreError>)> = due
            .par_iter()
            .filter(|_| !token.is_cancelled())
            .map(|a| {
                (
                    a.attribute().clone(),
                    compute_forecasts(self.datapoints.as_ref(), a, now),
                )
            })
            .collect();

        let mut written = 0usize;
        for (attribute, result) in results {
            if token.is_cancelled() {
                break;
            }
            // Fewer pending timestamps than horizons: keep the old predictions
            let Some(predicted) = result? else {
                continue;
            };
            let state = self.state();
            // Deleted while its forecast was computed
            if !state.attributes.contains_key(&attribute) {
                continue;
            }
            self.predicted.purge(&attribute)?;
            self.predicted.write_batch(&attribute, &predicted)?;
            drop(state);
            written += predicted.len();
        }

        let mut state = self.state();
        if token.is_cancelled() {
            debug!("[ForecastScheduler] Forecast run interrupted");
            return Ok(());
        }
        state.update_next_due();
        self.schedule_next(&mut state, current, now);
        if !due.is_empty() {
            info!(
                "[ForecastScheduler] Forecast run: {} attributes, {} predicted datapoints",
                due.len(),
                written
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

    fn config(forecast_period: i64, forecast_count: u32) -> ForecastConfig {
        ForecastConfig::new(60 * MINUTE, 2, forecast_period, forecast_count)
    }

    #[test]
    fn test_first_schedule_is_due_now() {
        let next = next_timestamps(&[], 1_000, &config(MINUTE, 2), false);
        assert_eq!(next, vec![1_000, 1_000 + MINUTE, 1_000 + 2 * MINUTE]);
    }

    #[test]
    fn test_schedule_keeps_existing_phase() {
        let now = 100 * MINUTE;
        let next = next_timestamps(&[now + 3 * MINUTE], now, &config(10 * MINUTE, 2), false);
        assert_eq!(next, vec![now + 3 * MINUTE, now + 13 * MINUTE]);
    }

    #[test]
    fn test_schedule_behind_now_is_advanced() {
        let now = 100 * MINUTE;
        let next = next_timestamps(&[now - 25 * MINUTE], now, &config(10 * MINUTE, 1), false);
        assert_eq!(next, vec![now + 5 * MINUTE]);
    }

    #[test]
    fn test_restart_with_short_schedule_runs_now() {
        let now = 100 * MINUTE;
        let next = next_timestamps(&[now + 5 * MINUTE], now, &config(10 * MINUTE, 3), true);
        assert_eq!(next[0], now);
        assert_eq!(&next[1..], &[now + 5 * MINUTE, now + 15 * MINUTE, now + 25 * MINUTE]);

        let full = next_timestamps(&[now + 5 * MINUTE], now, &config(10 * MINUTE, 1), true);
        assert_eq!(full, vec![now + 5 * MINUTE]);
    }

    #[test]
    fn test_invalid_configs_are_dropped() {
        let valid = ForecastAttribute::new(
            AttributeRef::new("e", "ok"),
            crate::types::ValueType::Float64,
            config(MINUTE, 1),
        );
        let invalid = ForecastAttribute::new(
            AttributeRef::new("e", "zero"),
            crate::types::ValueType::Float64,
            config(0, 1),
        );
        let kept = validated(vec![valid.clone(), invalid]);
        assert_eq!(kept, vec![valid]);
    }

    #[test]
    fn test_purge_and_due_selection() {
        let key = AttributeRef::new("e", "a");
        let mut attribute = ForecastAttribute::new(
            key.clone(),
            crate::types::ValueType::Float64,
            config(MINUTE, 2),
        );
        attribute.set_timestamps(vec![10, 20, 30]);

        let mut state = SchedulerState::default();
        state.attributes.insert(key.clone(), attribute);
        state.update_next_due();
        assert_eq!(state.next_due.get(&key), Some(&10));
        assert_eq!(state.due_attributes(9).len(), 0);
        assert_eq!(state.due_attributes(10).len(), 1);

        state.purge_timestamps(20);
        assert_eq!(state.attributes[&key].timestamps(), &[30]);
    }
}
