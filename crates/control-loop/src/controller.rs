//! Controller loop.
//!
//! A [`Controller`] owns the work queue, the event sources feeding it and a
//! fixed pool of workers draining it into a [`Reconciler`]. Failed requests
//! are re-queued with per-target exponential backoff; successful ones reset
//! the target's backoff.

use crate::backoff::ExponentialBackoff;
use crate::error::ControlLoopError;
use crate::filter::EventFilter;
use crate::metrics::ControllerMetrics;
use crate::queue::WorkQueue;
use crate::request::ReconcileRequest;
use crate::router::FanOutRouter;
use crate::source::EventSource;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use kube::Api;
use kube_runtime::reflector::Store;
use reconciling::ManagedObject;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Business logic run for each reconcile request.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Error returned by a failed reconciliation
    type Error: fmt::Display + Send + Sync + 'static;

    /// Bring the target named by `request` to its desired state.
    async fn reconcile(&self, request: &ReconcileRequest) -> Result<(), Self::Error>;
}

/// Tuning knobs of a [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Number of concurrently running reconciliations
    pub concurrency: usize,
    /// Retry delays for failed targets
    pub backoff: ExponentialBackoff,
    /// Time in-flight reconciliations get to finish on shutdown
    pub shutdown_grace: Duration,
    /// Time caches get to complete their initial list
    pub cache_sync_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            backoff: ExponentialBackoff::default(),
            shutdown_grace: Duration::from_secs(30),
            cache_sync_timeout: Duration::from_secs(60),
        }
    }
}

/// Watches, queue and workers of one controller.
pub struct Controller {
    name: String,
    options: ControllerOptions,
    queue: WorkQueue<ReconcileRequest>,
    metrics: ControllerMetrics,
    sources: Vec<JoinHandle<()>>,
    pending_syncs: Vec<(String, BoxFuture<'static, bool>)>,
    ready: Arc<AtomicBool>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a controller with no watches.
    pub fn new(
        name: impl Into<String>,
        options: ControllerOptions,
        metrics: ControllerMetrics,
    ) -> Result<Self, ControlLoopError> {
        if options.concurrency == 0 {
            return Err(ControlLoopError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            name: name.into(),
            queue: WorkQueue::new(options.backoff),
            options,
            metrics,
            sources: Vec::new(),
            pending_syncs: Vec::new(),
            ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Controller name, used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue feeding the workers
    pub fn queue(&self) -> &WorkQueue<ReconcileRequest> {
        &self.queue
    }

    /// Flag set once all caches have synced, cleared on shutdown
    pub fn readiness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// Starts watching `api`, routing admitted events through `router`.
    ///
    /// Returns the reflector store kept up to date by the watch. Call
    /// [`Controller::wait_for_cache_sync`] before trusting its contents.
    pub fn watch<K: ManagedObject>(
        &mut self,
        api: Api<K>,
        filter: Arc<dyn EventFilter<K>>,
        router: FanOutRouter,
    ) -> Store<K> {
        let source = EventSource::new(filter, router, self.queue.clone(), self.metrics.clone());
        let store = source.store();

        let sync_store = store.clone();
        self.pending_syncs.push((
            K::kind_name(),
            Box::pin(async move { sync_store.wait_until_ready().await.is_ok() }),
        ));
        self.sources.push(tokio::spawn(source.run(api)));

        store
    }

    /// Waits until every watched kind has completed its initial list.
    pub async fn wait_for_cache_sync(&mut self) -> Result<(), ControlLoopError> {
        let timeout = self.options.cache_sync_timeout;
        let pending = std::mem::take(&mut self.pending_syncs);
        info!("Waiting for {} caches to sync", pending.len());

        let syncs = pending.into_iter().map(|(kind, synced)| async move {
            if synced.await {
                debug!("Cache for {} synced", kind);
                Ok(())
            } else {
                Err(ControlLoopError::CacheSync { kind })
            }
        });

        tokio::time::timeout(timeout, futures::future::try_join_all(syncs))
            .await
            .map_err(|_elapsed| ControlLoopError::CacheSyncTimeout { timeout })??;

        self.ready.store(true, Ordering::SeqCst);
        info!("✅ Caches synced");
        Ok(())
    }

    /// Runs the workers, feeding requests to `reconciler`, until `shutdown`
    /// turns true (or its sender is dropped).
    ///
    /// On shutdown the queue stops accepting requests and drops the waiting
    /// ones, watches are stopped, and in-flight reconciliations get
    /// `shutdown_grace` to finish before they are aborted.
    pub async fn run<R: Reconciler>(
        self,
        reconciler: Arc<R>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let Self {
            name,
            options,
            queue,
            metrics,
            sources,
            ready,
            ..
        } = self;

        info!("Starting {} with {} workers", name, options.concurrency);
        let mut workers = JoinSet::new();
        for worker in 0..options.concurrency {
            workers.spawn(process_requests(
                worker,
                name.clone(),
                queue.clone(),
                Arc::clone(&reconciler),
                metrics.clone(),
            ));
        }

        if shutdown.wait_for(|stop| *stop).await.is_err() {
            warn!("Shutdown channel of {} closed", name);
        }

        info!("Stopping {}", name);
        ready.store(false, Ordering::SeqCst);
        queue.shut_down();
        for source in &sources {
            source.abort();
        }

        let grace = options.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!("{} worker failed: {}", name, e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} reconciliations still running after {:?}, aborting them",
                workers.len(),
                grace
            );
            workers.shutdown().await;
        }
        info!("{} stopped", name);
    }
}

async fn process_requests<R: Reconciler>(
    worker: usize,
    controller: String,
    queue: WorkQueue<ReconcileRequest>,
    reconciler: Arc<R>,
    metrics: ControllerMetrics,
) {
    debug!(controller = %controller, worker, "Worker started");

    while let Some(request) = queue.get().await {
        metrics.set_queue_depth(queue.len());
        let start = Instant::now();
        let result = AssertUnwindSafe(reconciler.reconcile(&request))
            .catch_unwind()
            .await;
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(())) => {
                queue.forget(&request);
                metrics.observe_reconcile(true, elapsed);
                debug!(controller = %controller, target = %request, ?elapsed, "Reconciled");
            }
            Ok(Err(e)) => {
                metrics.observe_reconcile(false, elapsed);
                let retry_in = queue.add_rate_limited(request.clone());
                error!(controller = %controller, target = %request, error = %e, ?retry_in, "Reconciliation failed");
            }
            Err(_panic) => {
                metrics.observe_reconcile(false, elapsed);
                let retry_in = queue.add_rate_limited(request.clone());
                error!(controller = %controller, target = %request, ?retry_in, "Reconciler panicked");
            }
        }

        queue.done(&request);
    }

    debug!(controller = %controller, worker, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Reconciler recording runs and concurrency per target
    #[derive(Default)]
    struct RecordingReconciler {
        delay: Duration,
        state: Mutex<Recording>,
    }

    #[derive(Default)]
    struct Recording {
        runs: Vec<String>,
        running: HashMap<String, usize>,
        max_running_per_target: usize,
        running_total: usize,
        max_running_total: usize,
        // Remaining failures to inject per target
        failures: HashMap<String, usize>,
    }

    impl RecordingReconciler {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        fn fail(&self, target: &str, times: usize) {
            self.state.lock().unwrap().failures.insert(target.to_string(), times);
        }

        fn runs(&self) -> Vec<String> {
            self.state.lock().unwrap().runs.clone()
        }

        fn max_running_per_target(&self) -> usize {
            self.state.lock().unwrap().max_running_per_target
        }

        fn max_running_total(&self) -> usize {
            self.state.lock().unwrap().max_running_total
        }
    }

    #[async_trait]
    impl Reconciler for RecordingReconciler {
        type Error = String;

        async fn reconcile(&self, request: &ReconcileRequest) -> Result<(), String> {
            {
                let mut state = self.state.lock().unwrap();
                state.runs.push(request.target.clone());
                let running = state.running.entry(request.target.clone()).or_insert(0);
                *running += 1;
                let running = *running;
                state.max_running_per_target = state.max_running_per_target.max(running);
                state.running_total += 1;
                state.max_running_total = state.max_running_total.max(state.running_total);
            }

            tokio::time::sleep(self.delay).await;

            let mut state = self.state.lock().unwrap();
            if let Some(running) = state.running.get_mut(&request.target) {
                *running -= 1;
            }
            state.running_total -= 1;
            match state.failures.get_mut(&request.target) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(format!("seed {} is unreachable", request.target))
                }
                _ => Ok(()),
            }
        }
    }

    fn options(concurrency: usize) -> ControllerOptions {
        ControllerOptions {
            concurrency,
            backoff: ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(100)),
            shutdown_grace: Duration::from_millis(500),
            cache_sync_timeout: Duration::from_secs(1),
        }
    }

    fn controller(options: ControllerOptions) -> (Controller, ControllerMetrics) {
        let metrics = ControllerMetrics::new(&Registry::new(), "seed-proxy-controller").unwrap();
        let controller = Controller::new(
            "seed-proxy-controller",
            options,
            metrics.clone(),
        )
        .unwrap();
        (controller, metrics)
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_same_target_never_runs_concurrently() {
        let reconciler = Arc::new(RecordingReconciler::with_delay(Duration::from_millis(50)));
        let (controller, _metrics) = controller(options(4));
        let queue = controller.queue().clone();
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(controller.run(Arc::clone(&reconciler), shutdown));

        queue.add(ReconcileRequest::new("europe"));
        eventually("first run", || reconciler.runs().len() == 1).await;
        for _ in 0..3 {
            queue.add(ReconcileRequest::new("europe"));
        }
        eventually("follow-up run", || reconciler.runs().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(reconciler.runs(), vec!["europe", "europe"]);
        assert_eq!(reconciler.max_running_per_target(), 1);

        stop.send(true).unwrap();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_targets_run_in_parallel() {
        let reconciler = Arc::new(RecordingReconciler::with_delay(Duration::from_millis(100)));
        let (controller, _metrics) = controller(options(2));
        let queue = controller.queue().clone();
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(controller.run(Arc::clone(&reconciler), shutdown));

        for target in ["europe", "asia", "america"] {
            queue.add(ReconcileRequest::new(target));
        }
        eventually("all targets", || reconciler.runs().len() == 3).await;

        assert_eq!(reconciler.max_running_total(), 2);

        stop.send(true).unwrap();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_target_is_retried_until_success() {
        let reconciler = Arc::new(RecordingReconciler::default());
        reconciler.fail("europe", 2);
        let (controller, metrics) = controller(options(1));
        let queue = controller.queue().clone();
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(controller.run(Arc::clone(&reconciler), shutdown));

        queue.add(ReconcileRequest::new("europe"));
        eventually("success", || metrics.reconciliations(true) == 1).await;

        assert_eq!(reconciler.runs().len(), 3);
        assert_eq!(metrics.reconciliations(false), 2);
        assert_eq!(queue.num_requeues(&ReconcileRequest::new("europe")), 0);

        stop.send(true).unwrap();
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_work() {
        let reconciler = Arc::new(RecordingReconciler::with_delay(Duration::from_millis(50)));
        let (controller, metrics) = controller(options(1));
        let queue = controller.queue().clone();
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(controller.run(Arc::clone(&reconciler), shutdown));

        queue.add(ReconcileRequest::new("europe"));
        queue.add(ReconcileRequest::new("asia"));
        eventually("first run", || reconciler.runs().len() == 1).await;
        stop.send(true).unwrap();
        running.await.unwrap();

        // The in-flight run completes, the queued one is dropped
        assert_eq!(metrics.reconciliations(true), 1);
        assert_eq!(reconciler.runs(), vec!["europe"]);
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_after_grace_period() {
        let reconciler = Arc::new(RecordingReconciler::with_delay(Duration::from_secs(30)));
        let mut opts = options(1);
        opts.shutdown_grace = Duration::from_millis(50);
        let (controller, metrics) = controller(opts);
        let queue = controller.queue().clone();
        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(controller.run(Arc::clone(&reconciler), shutdown));

        queue.add(ReconcileRequest::new("europe"));
        eventually("first run", || reconciler.runs().len() == 1).await;
        stop.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metrics.reconciliations(true), 0);
    }

    #[tokio::test]
    async fn test_readiness_follows_cache_sync_and_shutdown() {
        let reconciler = Arc::new(RecordingReconciler::default());
        let (mut controller, _metrics) = controller(options(1));
        let ready = controller.readiness();
        assert!(!ready.load(Ordering::SeqCst));

        controller.wait_for_cache_sync().await.unwrap();
        assert!(ready.load(Ordering::SeqCst));

        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(controller.run(Arc::clone(&reconciler), shutdown));
        stop.send(true).unwrap();
        running.await.unwrap();
        assert!(!ready.load(Ordering::SeqCst));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let metrics = ControllerMetrics::new(&Registry::new(), "seed-proxy-controller").unwrap();
        let result = Controller::new(
            "seed-proxy-controller",
            options(0),
            metrics,
        );

        assert!(matches!(result, Err(ControlLoopError::InvalidConfig(_))));
    }
}
