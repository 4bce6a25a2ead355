//! Progress Manager
//!
//! Concurrency-bounded worker pool that pulls pending items from the import
//! state manager, processes them and reports each finished item to an
//! observer.
//!
//! All in-flight items are multiplexed inside a single dispatcher task, so the
//! concurrency bound limits outstanding futures, not threads. Stopping the pool
//! never aborts in-flight work: those items still run to completion and are
//! reported.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::imports::{ImportItemProcessor, ImportStateManager};
use crate::telemetry::BackgroundMetrics;
use crate::types::{ImportItem, ItemResult};

/// Receives per-item results and run completion.
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    /// Called once per finished item, in completion order.
    async fn next(&self, result: ItemResult);

    /// Called once when a run has exhausted its supply and drained.
    ///
    /// `run` is the id returned by the [`ProgressManager::start`] call that
    /// armed the run. A `start` racing with completion yields a newer id.
    async fn complete(&self, run: u64);
}

/// Event forwarded by [`ChannelProgressObserver`].
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    Next(ItemResult),
    Complete,
}

/// Observer forwarding events into an unbounded channel.
pub struct ChannelProgressObserver {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressObserver for ChannelProgressObserver {
    async fn next(&self, result: ItemResult) {
        if self.tx.send(ProgressEvent::Next(result)).is_err() {
            debug!("Progress receiver dropped");
        }
    }

    async fn complete(&self, _run: u64) {
        if self.tx.send(ProgressEvent::Complete).is_err() {
            debug!("Progress receiver dropped");
        }
    }
}

#[derive(Debug, Default)]
struct PoolControl {
    /// Dispatch of new items is allowed.
    running: bool,
    /// A dispatcher task exists.
    driver_active: bool,
    /// `start` was called since the dispatcher last looked.
    rearm: bool,
    /// Id handed out by the latest `start`.
    run: u64,
}

struct PoolInner {
    state_manager: Arc<dyn ImportStateManager>,
    processor: Arc<dyn ImportItemProcessor>,
    observer: Arc<dyn ProgressObserver>,
    concurrency: AtomicUsize,
    include_errors: AtomicBool,
    in_flight: AtomicUsize,
    control: Mutex<PoolControl>,
    active_tx: watch::Sender<bool>,
    metrics: Option<Arc<BackgroundMetrics>>,
}

/// What the dispatcher does once nothing is in flight.
enum IdleStep {
    Dispatch,
    Complete(u64),
    Exit,
}

impl PoolInner {
    fn control(&self) -> MutexGuard<'_, PoolControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether another item may be claimed now. Consumes a pending re-arm.
    fn may_dispatch(&self, exhausted: &mut bool, outstanding: usize) -> bool {
        let mut control = self.control();
        if control.rearm {
            control.rearm = false;
            *exhausted = false;
        }
        control.running && !*exhausted && outstanding < self.concurrency.load(Ordering::SeqCst)
    }

    fn pause_after_claim_failure(&self) {
        self.control().running = false;
    }

    fn idle_step(&self, exhausted: bool) -> IdleStep {
        let mut control = self.control();
        if control.rearm {
            return IdleStep::Dispatch;
        }
        if control.running && exhausted {
            control.running = false;
            return IdleStep::Complete(control.run);
        }
        if !control.running {
            control.driver_active = false;
            self.active_tx.send_replace(false);
            return IdleStep::Exit;
        }
        IdleStep::Dispatch
    }

    async fn drive(self: Arc<Self>) {
        debug!("Import dispatcher started");
        let mut in_flight = FuturesUnordered::new();
        let mut exhausted = false;

        loop {
            while self.may_dispatch(&mut exhausted, in_flight.len()) {
                match self.state_manager.claim_next().await {
                    Ok(Some(item)) => {
                        self.in_flight.fetch_add(1, Ordering::SeqCst);
                        in_flight.push(self.clone().run_item(item));
                    }
                    Ok(None) => {
                        debug!("Import supply exhausted");
                        exhausted = true;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to claim next import item; pausing");
                        self.pause_after_claim_failure();
                    }
                }
            }

            if in_flight.next().await.is_some() {
                continue;
            }

            match self.idle_step(exhausted) {
                IdleStep::Dispatch => continue,
                IdleStep::Complete(run) => {
                    info!(run, "Import run complete");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_run_completed();
                    }
                    self.observer.complete(run).await;
                }
                IdleStep::Exit => break,
            }
        }

        debug!("Import dispatcher stopped");
    }

    async fn run_item(self: Arc<Self>, item: ImportItem) {
        let result = match self.processor.process(&item).await {
            Ok(()) => ItemResult::success(&item),
            Err(e) => {
                warn!(item_id = %item.id, url = %item.url, error = %e, "Import item failed");
                let err = self
                    .include_errors
                    .load(Ordering::SeqCst)
                    .then(|| e.to_string());
                ItemResult::failure(&item, err)
            }
        };

        if let Err(e) = self.state_manager.record_outcome(&item, &result).await {
            error!(item_id = %item.id, error = %e, "Failed to record import outcome");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_item(result.is_success());
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.observer.next(result).await;
    }
}

/// Worker pool driving an import run.
pub struct ProgressManager {
    inner: Arc<PoolInner>,
}

impl ProgressManager {
    /// Create a stopped pool.
    pub fn new(
        state_manager: Arc<dyn ImportStateManager>,
        processor: Arc<dyn ImportItemProcessor>,
        observer: Arc<dyn ProgressObserver>,
        concurrency: usize,
    ) -> Self {
        let (active_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                state_manager,
                processor,
                observer,
                concurrency: AtomicUsize::new(concurrency.max(1)),
                include_errors: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                control: Mutex::new(PoolControl::default()),
                active_tx,
                metrics: None,
            }),
        }
    }

    /// Attach a metrics collector. Only effective before the first `start`.
    pub fn with_metrics(mut self, metrics: Arc<BackgroundMetrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = Some(metrics);
        }
        self
    }

    /// Start or resume dispatching.
    ///
    /// Idempotent while running. Items added to the supply since the last
    /// exhaustion are picked up. Returns the run id later passed to
    /// [`ProgressObserver::complete`]. Must be called within a tokio runtime.
    pub fn start(&self) -> u64 {
        let (run, spawn) = {
            let mut control = self.inner.control();
            control.running = true;
            control.rearm = true;
            control.run += 1;
            let spawn = !control.driver_active;
            if spawn {
                control.driver_active = true;
                self.inner.active_tx.send_replace(true);
            }
            (control.run, spawn)
        };

        if spawn {
            info!(run, concurrency = self.concurrency(), "Starting import dispatcher");
            tokio::spawn(self.inner.clone().drive());
        }
        run
    }

    /// Stop dispatching new items. In-flight items still finish and are reported.
    pub fn stop(&self) {
        let mut control = self.inner.control();
        if control.running {
            info!(in_flight = self.in_flight(), "Stopping import dispatcher");
        }
        control.running = false;
    }

    /// Wait until the dispatcher has drained its in-flight items and exited.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.active_tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|active| !*active).await;
    }

    /// Change the concurrency bound for future dispatch decisions. Values
    /// below one are clamped. Returns the applied bound.
    pub fn set_concurrency(&self, concurrency: usize) -> usize {
        let applied = concurrency.max(1);
        if applied != concurrency {
            warn!(requested = concurrency, applied, "Clamping import concurrency");
        }
        self.inner.concurrency.store(applied, Ordering::SeqCst);
        applied
    }

    /// Whether failure messages are attached to reported item results.
    pub fn set_include_errors(&self, include: bool) {
        self.inner.include_errors.store(include, Ordering::SeqCst);
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency.load(Ordering::SeqCst)
    }

    pub fn include_errors(&self) -> bool {
        self.inner.include_errors.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.control().running
    }

    /// Items currently being processed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imports::{InMemoryImportStateManager, MockItemProcessor};
    use crate::types::{AllowTypes, ImportType, ItemStatus};
    use std::time::Duration;

    fn items(count: usize) -> Vec<ImportItem> {
        (0..count)
            .map(|i| ImportItem::new(i.to_string(), format!("https://example.com/{}", i), ImportType::History))
            .collect()
    }

    async fn state_with(count: usize) -> Arc<InMemoryImportStateManager> {
        let state = Arc::new(InMemoryImportStateManager::new());
        state.set_allow_types(AllowTypes::all()).await;
        state.add_items(items(count));
        state
    }

    async fn collect_run(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for progress")
                .expect("observer dropped");
            let done = event == ProgressEvent::Complete;
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn test_run_reports_every_item_then_completes() {
        let state = state_with(10).await;
        let processor = Arc::new(MockItemProcessor::new().with_delay(Duration::from_millis(5)));
        let (observer, mut rx) = ChannelProgressObserver::new();
        let metrics = Arc::new(BackgroundMetrics::new());

        let pool = ProgressManager::new(state.clone(), processor.clone(), Arc::new(observer), 3)
            .with_metrics(metrics.clone());
        pool.start();

        let events = collect_run(&mut rx).await;
        assert_eq!(events.len(), 11);
        assert_eq!(events.last(), Some(&ProgressEvent::Complete));
        assert!(processor.peak_concurrency() <= 3);

        pool.wait_idle().await;
        assert!(!pool.is_running());
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(state.done_count(), 10);
        assert_eq!(metrics.snapshot().items_succeeded, 10);
        assert_eq!(metrics.snapshot().runs_completed, 1);
    }

    #[tokio::test]
    async fn test_failed_items_are_reported_and_run_continues() {
        let state = state_with(3).await;
        let processor = Arc::new(MockItemProcessor::new());
        processor.fail_item("1");
        let (observer, mut rx) = ChannelProgressObserver::new();

        let pool = ProgressManager::new(state.clone(), processor, Arc::new(observer), 1);
        pool.set_include_errors(true);
        pool.start();

        let events = collect_run(&mut rx).await;
        let failed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Next(result) if result.status == ItemStatus::Error => Some(result),
                _ => None,
            })
            .collect();

        assert_eq!(events.len(), 4);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "1");
        assert!(failed[0].err.as_deref().unwrap().contains("Mock processing failure"));
        assert_eq!(state.failed_count(), 1);
    }

    #[tokio::test]
    async fn test_error_details_omitted_by_default() {
        let state = state_with(1).await;
        let processor = Arc::new(MockItemProcessor::new());
        processor.fail_item("0");
        let (observer, mut rx) = ChannelProgressObserver::new();

        let pool = ProgressManager::new(state, processor, Arc::new(observer), 1);
        pool.start();

        let events = collect_run(&mut rx).await;
        match &events[0] {
            ProgressEvent::Next(result) => {
                assert_eq!(result.status, ItemStatus::Error);
                assert!(result.err.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_drains_without_complete_and_resume_finishes() {
        let state = state_with(6).await;
        let processor = Arc::new(MockItemProcessor::new().with_delay(Duration::from_millis(20)));
        let (observer, mut rx) = ChannelProgressObserver::new();

        let pool = ProgressManager::new(state.clone(), processor.clone(), Arc::new(observer), 2);
        pool.start();

        // Let the first batch get claimed, then stop.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ProgressEvent::Next(_)));
        pool.stop();
        pool.wait_idle().await;

        let mut seen = vec![first];
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(!seen.contains(&ProgressEvent::Complete));
        assert!(state.pending_count() > 0);
        assert_eq!(state.claimed_count(), 0);

        pool.start();
        seen.extend(collect_run(&mut rx).await);

        let mut ids: Vec<String> = seen
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Next(result) => Some(result.id.clone()),
                ProgressEvent::Complete => None,
            })
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4", "5"]);
        assert_eq!(processor.process_count(), 6);
    }

    #[tokio::test]
    async fn test_restart_after_exhaustion_picks_up_new_items() {
        let state = state_with(2).await;
        let (observer, mut rx) = ChannelProgressObserver::new();
        let pool = ProgressManager::new(
            state.clone(),
            Arc::new(MockItemProcessor::new()),
            Arc::new(observer),
            2,
        );

        pool.start();
        assert_eq!(collect_run(&mut rx).await.len(), 3);
        pool.wait_idle().await;

        state.add_items(vec![ImportItem::new("late", "https://late.test", ImportType::History)]);
        pool.start();
        let events = collect_run(&mut rx).await;
        assert_eq!(events.len(), 2);
    }

    struct RunRecorder {
        completed: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl ProgressObserver for RunRecorder {
        async fn next(&self, _result: ItemResult) {}

        async fn complete(&self, run: u64) {
            self.completed.lock().unwrap().push(run);
        }
    }

    #[tokio::test]
    async fn test_complete_carries_id_of_arming_start() {
        let state = state_with(1).await;
        let recorder = Arc::new(RunRecorder {
            completed: Mutex::new(Vec::new()),
        });
        let pool = ProgressManager::new(
            state.clone(),
            Arc::new(MockItemProcessor::new()),
            recorder.clone(),
            1,
        );

        let first = pool.start();
        pool.wait_idle().await;
        state.add_items(vec![ImportItem::new("late", "https://late.test", ImportType::History)]);
        let second = pool.start();
        pool.wait_idle().await;

        assert!(second > first);
        assert_eq!(*recorder.completed.lock().unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_empty_supply_completes_immediately() {
        let state = state_with(0).await;
        let (observer, mut rx) = ChannelProgressObserver::new();
        let pool = ProgressManager::new(state, Arc::new(MockItemProcessor::new()), Arc::new(observer), 1);

        pool.start();
        assert_eq!(collect_run(&mut rx).await, vec![ProgressEvent::Complete]);
    }

    #[tokio::test]
    async fn test_claim_failure_pauses_run() {
        let state = state_with(3).await;
        state.set_unavailable(true);
        let (observer, mut rx) = ChannelProgressObserver::new();
        let pool = ProgressManager::new(
            state.clone(),
            Arc::new(MockItemProcessor::new()),
            Arc::new(observer),
            1,
        );

        pool.start();
        pool.wait_idle().await;
        assert!(!pool.is_running());
        assert!(rx.try_recv().is_err());

        state.set_unavailable(false);
        pool.start();
        assert_eq!(collect_run(&mut rx).await.len(), 4);
    }

    #[test]
    fn test_set_concurrency_clamps_to_one() {
        let (observer, _rx) = ChannelProgressObserver::new();
        let pool = ProgressManager::new(
            Arc::new(InMemoryImportStateManager::new()),
            Arc::new(MockItemProcessor::new()),
            Arc::new(observer),
            0,
        );
        assert_eq!(pool.concurrency(), 1);
        assert_eq!(pool.set_concurrency(0), 1);
        assert_eq!(pool.set_concurrency(4), 4);
        assert_eq!(pool.concurrency(), 4);
    }
}
