//! Work orchestrator: ordered, batched, bounded submission to one backend.
//!
//! Each index gets one orchestrator. Submitted Works are queued per
//! document id and dispatched to the backend in bulk calls:
//!
//! - a document's Works are dispatched in submission order, and never while
//!   an earlier call carrying the same document is still running;
//! - different documents share bulk calls and up to `parallelism` calls
//!   run at once;
//! - Works arriving within `batch_window` of each other travel together,
//!   up to `max_batch_size` per call;
//! - purge-all, commit, refresh, optimize and flush are barriers: they run
//!   once everything submitted before them has been applied, and nothing
//!   submitted after them is dispatched until they finish.
//!
//! Buckets are keyed on document id alone, so a purge (which spans routing
//! keys) is ordered against every routing-specific Work for the same id.

use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use searchsync_search::{IndexBackend, SearchError};
use searchsync_types::{OrchestratorSettings, Work};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::commit_policy::{BatchReport, CommitPolicy};
use crate::error::IndexingError;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Queued Works before `submit` waits and `try_submit` rejects
    pub queue_bound: usize,
    pub max_batch_size: usize,
    pub batch_window: Duration,
    /// Bulk calls in flight at once
    pub parallelism: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&OrchestratorSettings::default())
    }
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self {
            queue_bound: settings.queue_bound.max(1),
            max_batch_size: settings.max_batch_size.max(1),
            batch_window: Duration::from_millis(settings.batch_window_ms),
            parallelism: settings.parallelism.max(1),
        }
    }

    pub fn with_queue_bound(mut self, bound: usize) -> Self {
        self.queue_bound = bound.max(1);
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_batch_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }
}

/// Counters exposed by [`WorkOrchestrator::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub submitted: u64,
    pub applied: u64,
    pub failed: u64,
    pub batches: u64,
    pub commits: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    submitted: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
    commits: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> OrchestratorStats {
        OrchestratorStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }
}

type Reply = oneshot::Sender<Result<(), IndexingError>>;

/// Resolves once the backend has accepted (not necessarily committed) a Work.
///
/// Await it for synchronous submission or drop it for fire-and-forget.
#[derive(Debug)]
pub struct WorkHandle {
    index: String,
    rx: oneshot::Receiver<Result<(), IndexingError>>,
}

impl Future for WorkHandle {
    type Output = Result<(), IndexingError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(IndexingError::Closed(self.index.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarrierOp {
    Commit,
    Refresh,
    Optimize,
    /// Commit, then refresh
    Flush,
}

enum Command {
    Work { work: Work, reply: Reply },
    Barrier { op: BarrierOp, reply: Reply },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Per-index submission queue in front of an [`IndexBackend`].
pub struct WorkOrchestrator {
    index: String,
    tx: mpsc::Sender<Command>,
    queue_bound: usize,
    stats: Arc<StatsCounters>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkOrchestrator {
    /// Start an orchestrator; spawns its dispatcher on the current runtime.
    pub fn start(
        index: impl Into<String>,
        backend: Arc<dyn IndexBackend>,
        policy: Arc<dyn CommitPolicy>,
        config: OrchestratorConfig,
    ) -> Self {
        let index = index.into();
        let queue_bound = config.queue_bound;
        let (tx, rx) = mpsc::channel(queue_bound);
        let stats = Arc::new(StatsCounters::default());

        info!(
            index = %index,
            policy = policy.name(),
            parallelism = config.parallelism,
            max_batch_size = config.max_batch_size,
            "Starting work orchestrator"
        );

        let dispatcher = Dispatcher {
            index: index.clone(),
            backend,
            policy,
            queue_bound,
            config,
            rx,
            segments: VecDeque::new(),
            busy: HashSet::new(),
            in_flight: JoinSet::new(),
            queued: 0,
            uncommitted: false,
            receiving: true,
            shutdown_replies: Vec::new(),
            stats: Arc::clone(&stats),
        };
        let handle = tokio::spawn(dispatcher.run());

        Self {
            index,
            tx,
            queue_bound,
            stats,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }

    /// Queue a Work, waiting for capacity when the queue is full.
    pub async fn submit(&self, work: Work) -> Result<WorkHandle, IndexingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Work { work, reply })
            .await
            .map_err(|_| IndexingError::Closed(self.index.clone()))?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(self.handle(rx))
    }

    /// Queue a Work, or fail with [`IndexingError::QueueFull`] when at capacity.
    pub fn try_submit(&self, work: Work) -> Result<WorkHandle, IndexingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(Command::Work { work, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => IndexingError::QueueFull {
                    bound: self.queue_bound,
                },
                mpsc::error::TrySendError::Closed(_) => IndexingError::Closed(self.index.clone()),
            })?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(self.handle(rx))
    }

    /// Submit and wait until the backend accepted the Work.
    pub async fn submit_and_wait(&self, work: Work) -> Result<(), IndexingError> {
        self.submit(work).await?.await
    }

    /// Remove every document of the index, ordered against other Works.
    pub async fn purge_all(&self) -> Result<(), IndexingError> {
        self.submit_and_wait(Work::purge_all()).await
    }

    /// Commit everything submitted so far.
    pub async fn commit(&self) -> Result<(), IndexingError> {
        self.barrier(BarrierOp::Commit).await
    }

    /// Make committed Works visible to readers.
    pub async fn refresh(&self) -> Result<(), IndexingError> {
        self.barrier(BarrierOp::Refresh).await
    }

    pub async fn optimize(&self) -> Result<(), IndexingError> {
        self.barrier(BarrierOp::Optimize).await
    }

    /// Apply, commit and refresh everything submitted so far.
    pub async fn flush(&self) -> Result<(), IndexingError> {
        self.barrier(BarrierOp::Flush).await
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.snapshot()
    }

    /// Drain queued Works, commit if needed and stop the dispatcher.
    ///
    /// Submissions after this fail with [`IndexingError::Closed`].
    pub async fn shutdown(&self) -> Result<(), IndexingError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        let handle = self
            .dispatcher
            .lock()
            .map_err(|_| IndexingError::Closed(self.index.clone()))?
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(index = %self.index, error = %e, "Dispatcher task failed");
            }
        }
        info!(index = %self.index, "Work orchestrator stopped");
        Ok(())
    }

    fn handle(&self, rx: oneshot::Receiver<Result<(), IndexingError>>) -> WorkHandle {
        WorkHandle {
            index: self.index.clone(),
            rx,
        }
    }

    async fn barrier(&self, op: BarrierOp) -> Result<(), IndexingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Barrier { op, reply })
            .await
            .map_err(|_| IndexingError::Closed(self.index.clone()))?;
        rx.await
            .map_err(|_| IndexingError::Closed(self.index.clone()))?
    }
}

struct Pending {
    work: Work,
    reply: Reply,
}

/// Per-document FIFO queues between two barriers.
#[derive(Default)]
struct Buckets {
    queues: HashMap<String, VecDeque<Pending>>,
    /// Document ids with queued Works, in arrival order
    order: Vec<String>,
    len: usize,
    window_started: Option<Instant>,
}

impl Buckets {
    fn push(&mut self, pending: Pending) {
        let id = pending.work.document_id.clone();
        let queue = self.queues.entry(id.clone()).or_default();
        if queue.is_empty() {
            self.order.push(id);
        }
        queue.push_back(pending);
        if self.len == 0 {
            self.window_started = Some(Instant::now());
        }
        self.len += 1;
    }

    /// Take up to `max` Works from buckets not in `busy`, marking each
    /// bucket taken from as busy.
    fn take_batch(&mut self, busy: &mut HashSet<String>, max: usize) -> (Vec<Pending>, Vec<String>) {
        let mut batch = Vec::new();
        let mut taken_ids = Vec::new();

        for id in &self.order {
            if batch.len() >= max {
                break;
            }
            if busy.contains(id) {
                continue;
            }
            let Some(queue) = self.queues.get_mut(id) else {
                continue;
            };
            while batch.len() < max {
                match queue.pop_front() {
                    Some(pending) => batch.push(pending),
                    None => break,
                }
            }
            busy.insert(id.clone());
            taken_ids.push(id.clone());
        }

        let queues = &mut self.queues;
        self.order.retain(|id| {
            let empty = queues.get(id).map(VecDeque::is_empty).unwrap_or(true);
            if empty {
                queues.remove(id);
            }
            !empty
        });
        self.len -= batch.len();
        if self.len == 0 {
            self.window_started = None;
        }
        (batch, taken_ids)
    }
}

enum Segment {
    Buckets(Buckets),
    PurgeAll(Pending),
    Barrier { op: BarrierOp, reply: Reply },
}

struct BatchDone {
    ids: Vec<String>,
    report: BatchReport,
}

struct Dispatcher {
    index: String,
    backend: Arc<dyn IndexBackend>,
    policy: Arc<dyn CommitPolicy>,
    config: OrchestratorConfig,
    queue_bound: usize,
    rx: mpsc::Receiver<Command>,
    segments: VecDeque<Segment>,
    /// Document ids carried by bulk calls in flight
    busy: HashSet<String>,
    in_flight: JoinSet<BatchDone>,
    /// Works held in segments, not yet dispatched
    queued: usize,
    uncommitted: bool,
    receiving: bool,
    shutdown_replies: Vec<oneshot::Sender<()>>,
    stats: Arc<StatsCounters>,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut ticker = self.policy.interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            self.dispatch_ready().await;

            if !self.receiving && self.segments.is_empty() && self.in_flight.is_empty() {
                break;
            }

            let deadline = self.window_deadline();
            let can_receive = self.receiving && self.queued < self.queue_bound;

            tokio::select! {
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    match joined {
                        Ok(done) => self.on_batch_done(done).await,
                        Err(e) => {
                            error!(index = %self.index, error = %e, "Bulk call task failed");
                            if self.in_flight.is_empty() {
                                self.busy.clear();
                            }
                        }
                    }
                }
                command = self.rx.recv(), if can_receive => match command {
                    Some(command) => self.accept(command),
                    None => self.receiving = false,
                },
                _ = sleep_until(deadline), if deadline.is_some() => {}
                _ = tick(&mut ticker) => {
                    if self.uncommitted {
                        self.commit().await;
                    }
                }
            }
        }

        if self.uncommitted {
            self.commit().await;
        }
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
        debug!(index = %self.index, "Dispatcher exited");
    }

    fn accept(&mut self, command: Command) {
        match command {
            Command::Work { work, reply } => {
                self.queued += 1;
                let pending = Pending { work, reply };
                if pending.work.is_purge_all() {
                    self.segments.push_back(Segment::PurgeAll(pending));
                    return;
                }
                match self.segments.back_mut() {
                    Some(Segment::Buckets(buckets)) => buckets.push(pending),
                    _ => {
                        let mut buckets = Buckets::default();
                        buckets.push(pending);
                        self.segments.push_back(Segment::Buckets(buckets));
                    }
                }
            }
            Command::Barrier { op, reply } => {
                self.segments.push_back(Segment::Barrier { op, reply });
            }
            Command::Shutdown { reply } => {
                debug!(index = %self.index, "Shutdown requested, draining queue");
                self.rx.close();
                self.shutdown_replies.push(reply);
            }
        }
    }

    /// Deadline of the batching window on the front segment, if it is
    /// still collecting.
    fn window_deadline(&self) -> Option<Instant> {
        match self.segments.front() {
            Some(Segment::Buckets(b)) if self.segments.len() == 1 && self.receiving => {
                if b.len >= self.config.max_batch_size {
                    return None;
                }
                b.window_started
                    .map(|start| start + self.config.batch_window)
                    .filter(|deadline| *deadline > Instant::now())
            }
            _ => None,
        }
    }

    async fn dispatch_ready(&mut self) {
        loop {
            let window_open = self.window_deadline().is_some();
            match self.segments.front_mut() {
                None => return,
                Some(Segment::Buckets(buckets)) => {
                    if buckets.len == 0 {
                        self.segments.pop_front();
                        continue;
                    }
                    if window_open || self.in_flight.len() >= self.config.parallelism {
                        return;
                    }
                    let (batch, ids) = buckets.take_batch(&mut self.busy, self.config.max_batch_size);
                    if batch.is_empty() {
                        return;
                    }
                    self.queued -= batch.len();
                    self.spawn_batch(batch, ids);
                }
                Some(_) => {
                    if !self.in_flight.is_empty() {
                        return;
                    }
                    match self.segments.pop_front() {
                        Some(Segment::PurgeAll(pending)) => {
                            self.queued -= 1;
                            self.run_purge_all(pending).await;
                        }
                        Some(Segment::Barrier { op, reply }) => {
                            let result = self.run_barrier(op).await;
                            let _ = reply.send(result);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn spawn_batch(&mut self, batch: Vec<Pending>, ids: Vec<String>) {
        let (works, replies): (Vec<Work>, Vec<Reply>) =
            batch.into_iter().map(|p| (p.work, p.reply)).unzip();
        let backend = Arc::clone(&self.backend);
        let index = self.index.clone();

        self.policy.batch_started();
        self.in_flight.spawn(async move {
            let report = apply_bulk(&index, backend.as_ref(), works, replies).await;
            BatchDone { ids, report }
        });
    }

    async fn on_batch_done(&mut self, done: BatchDone) {
        for id in &done.ids {
            self.busy.remove(id);
        }
        self.record(&done.report);

        let queue_idle = self.queued == 0 && self.in_flight.is_empty();
        if self.policy.commit_after_batch(&done.report, queue_idle) {
            self.commit().await;
        }
    }

    fn record(&mut self, report: &BatchReport) {
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats
            .applied
            .fetch_add(report.applied as u64, Ordering::Relaxed);
        self.stats
            .failed
            .fetch_add((report.works - report.applied) as u64, Ordering::Relaxed);
        if report.applied > 0 {
            self.uncommitted = true;
        }
    }

    async fn run_purge_all(&mut self, pending: Pending) {
        self.policy.batch_started();
        let report = apply_bulk(
            &self.index,
            self.backend.as_ref(),
            vec![pending.work],
            vec![pending.reply],
        )
        .await;
        info!(index = %self.index, "Purged all documents");
        self.record(&report);
        let queue_idle = self.queued == 0;
        if self.policy.commit_after_batch(&report, queue_idle) {
            self.commit().await;
        }
    }

    async fn run_barrier(&mut self, op: BarrierOp) -> Result<(), IndexingError> {
        match op {
            BarrierOp::Commit => self.commit_checked().await,
            BarrierOp::Refresh => Ok(self.backend.refresh().await?),
            BarrierOp::Optimize => Ok(self.backend.optimize().await?),
            BarrierOp::Flush => {
                self.commit_checked().await?;
                Ok(self.backend.refresh().await?)
            }
        }
    }

    async fn commit_checked(&mut self) -> Result<(), IndexingError> {
        self.backend.commit().await?;
        self.uncommitted = false;
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        debug!(index = %self.index, "Committed");
        Ok(())
    }

    async fn commit(&mut self) {
        if let Err(e) = self.commit_checked().await {
            warn!(index = %self.index, error = %e, "Commit failed, will retry on next trigger");
        }
    }
}

/// Run one bulk call and resolve every Work's handle.
async fn apply_bulk(
    index: &str,
    backend: &dyn IndexBackend,
    works: Vec<Work>,
    replies: Vec<Reply>,
) -> BatchReport {
    let total = works.len();
    let outcome = AssertUnwindSafe(backend.submit_bulk(&works))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(SearchError::Unavailable("backend panicked".to_string())));

    let mut applied = 0;
    match outcome {
        Ok(results) => {
            let mut results = results.into_iter();
            for reply in replies {
                let result = results.next().unwrap_or_else(|| {
                    Err(SearchError::Unavailable(
                        "backend returned fewer results than works".to_string(),
                    ))
                });
                if result.is_ok() {
                    applied += 1;
                }
                let _ = reply.send(result.map_err(IndexingError::from));
            }
        }
        Err(e) => {
            warn!(index = %index, works = total, error = %e, "Bulk call failed");
            for reply in replies {
                let _ = reply.send(Err(IndexingError::Backend(e.clone())));
            }
        }
    }

    BatchReport {
        works: total,
        applied,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_policy::{PerChangesetCommit, ScheduledCommit, SharedIndexCommit};
    use std::sync::atomic::AtomicUsize;
    use searchsync_search::{FailureMode, InMemoryBackend, LatencyJitter};
    use searchsync_types::{Document, DocumentKey, WorkOperation};
    use serde_json::json;

    fn doc(id: &str, v: i64) -> Document {
        Document::new("book", id, json!({ "v": v }))
    }

    fn start(backend: Arc<InMemoryBackend>, config: OrchestratorConfig) -> WorkOrchestrator {
        WorkOrchestrator::start("books", backend, Arc::new(PerChangesetCommit), config)
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_batch_window(Duration::from_millis(1))
            .with_parallelism(4)
    }

    #[tokio::test]
    async fn test_same_document_applied_in_order_under_jitter() {
        let backend = Arc::new(InMemoryBackend::new("books").with_latency(LatencyJitter::new(
            Duration::from_millis(0),
            Duration::from_millis(5),
        )));
        let orchestrator = start(Arc::clone(&backend), fast_config().with_max_batch_size(3));

        let mut handles = Vec::new();
        for round in 0..20 {
            for id in ["a", "b", "c"] {
                let work = if round % 2 == 0 {
                    Work::add(doc(id, round))
                } else {
                    Work::update(doc(id, round))
                };
                handles.push(orchestrator.submit(work).await.unwrap());
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }
        orchestrator.flush().await.unwrap();

        assert_eq!(backend.overlap_violations(), 0);
        for id in ["a", "b", "c"] {
            let applied: Vec<i64> = backend
                .applied_log()
                .iter()
                .filter(|w| w.document_id == id)
                .map(|w| w.payload.as_ref().unwrap().body["v"].as_i64().unwrap())
                .collect();
            assert_eq!(applied, (0..20).collect::<Vec<_>>());
            let final_doc = backend.document(&DocumentKey::new(id, None)).unwrap();
            assert_eq!(final_doc.body, json!({"v": 19}));
        }
    }

    #[tokio::test]
    async fn test_add_update_delete_leaves_no_document() {
        let backend = Arc::new(InMemoryBackend::new("books").with_latency(LatencyJitter::new(
            Duration::from_millis(0),
            Duration::from_millis(10),
        )));
        let orchestrator = start(Arc::clone(&backend), fast_config().with_max_batch_size(1));

        let a = orchestrator.submit(Work::add(doc("1", 1))).await.unwrap();
        let b = orchestrator.submit(Work::update(doc("1", 2))).await.unwrap();
        let c = orchestrator.submit(Work::delete("1", None)).await.unwrap();
        for h in [a, b, c] {
            h.await.unwrap();
        }
        orchestrator.flush().await.unwrap();

        assert!(backend.document(&DocumentKey::new("1", None)).is_none());
        assert_eq!(
            backend.applied_for(&DocumentKey::new("1", None)),
            vec![WorkOperation::Add, WorkOperation::Update, WorkOperation::Delete]
        );
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let backend = Arc::new(InMemoryBackend::new("books").with_latency(LatencyJitter::new(
            Duration::from_millis(5),
            Duration::from_millis(5),
        )));
        let orchestrator = start(
            Arc::clone(&backend),
            fast_config().with_max_batch_size(1).with_parallelism(2),
        );

        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(orchestrator.submit(Work::add(doc(&i.to_string(), i))).await.unwrap());
        }
        for h in handles {
            h.await.unwrap();
        }

        assert!(backend.peak_concurrency() <= 2);
        assert_eq!(orchestrator.stats().applied, 10);
    }

    #[tokio::test]
    async fn test_batches_coalesce_within_window() {
        let backend = Arc::new(InMemoryBackend::new("books"));
        let orchestrator = start(
            Arc::clone(&backend),
            OrchestratorConfig::default()
                .with_batch_window(Duration::from_millis(50))
                .with_max_batch_size(100),
        );

        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(orchestrator.submit(Work::add(doc(&i.to_string(), i))).await.unwrap());
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(backend.bulk_calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_work() {
        let backend = Arc::new(InMemoryBackend::new("books"));
        backend.fail_document("bad", FailureMode::Always);
        let orchestrator = start(Arc::clone(&backend), fast_config());

        let bad = orchestrator.submit(Work::add(doc("bad", 1))).await.unwrap();
        let good = orchestrator.submit(Work::add(doc("good", 1))).await.unwrap();

        assert!(matches!(
            bad.await,
            Err(IndexingError::Backend(SearchError::Rejected { .. }))
        ));
        good.await.unwrap();
        assert_eq!(orchestrator.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_whole_call_failure_fails_every_work() {
        let backend = Arc::new(InMemoryBackend::new("books"));
        backend.fail_next_calls(1);
        let orchestrator = start(
            Arc::clone(&backend),
            OrchestratorConfig::default().with_batch_window(Duration::from_millis(20)),
        );

        let a = orchestrator.submit(Work::add(doc("1", 1))).await.unwrap();
        let b = orchestrator.submit(Work::add(doc("2", 1))).await.unwrap();
        let err = a.await.unwrap_err();
        assert!(err.is_retryable());
        assert!(b.await.is_err());
    }

    #[tokio::test]
    async fn test_purge_all_is_a_barrier() {
        let backend = Arc::new(InMemoryBackend::new("books"));
        let orchestrator = start(Arc::clone(&backend), fast_config());

        orchestrator.submit(Work::add(doc("1", 1))).await.unwrap();
        let purge = orchestrator.submit(Work::purge_all()).await.unwrap();
        let after = orchestrator.submit(Work::add(doc("2", 1))).await.unwrap();
        purge.await.unwrap();
        after.await.unwrap();
        orchestrator.flush().await.unwrap();

        let log = backend.applied_log();
        let purge_at = log.iter().position(Work::is_purge_all).unwrap();
        assert_eq!(log[purge_at - 1].document_id, "1");
        assert_eq!(log[purge_at + 1].document_id, "2");
        assert_eq!(backend.committed_len(), 1);
    }

    #[tokio::test]
    async fn test_try_submit_rejects_when_full() {
        let backend = Arc::new(InMemoryBackend::new("books").with_latency(LatencyJitter::new(
            Duration::from_millis(200),
            Duration::from_millis(200),
        )));
        let orchestrator = start(
            Arc::clone(&backend),
            fast_config()
                .with_queue_bound(1)
                .with_max_batch_size(1)
                .with_parallelism(1),
        );

        let mut rejected = false;
        let mut handles = Vec::new();
        for i in 0..20 {
            match orchestrator.try_submit(Work::add(doc(&i.to_string(), i))) {
                Ok(h) => handles.push(h),
                Err(IndexingError::QueueFull { bound }) => {
                    assert_eq!(bound, 1);
                    rejected = true;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert!(rejected);
    }

    #[tokio::test]
    async fn test_submit_waits_for_capacity_then_proceeds() {
        let backend = Arc::new(InMemoryBackend::new("books").with_latency(LatencyJitter::new(
            Duration::from_millis(200),
            Duration::from_millis(200),
        )));
        let orchestrator = start(
            Arc::clone(&backend),
            fast_config()
                .with_queue_bound(1)
                .with_max_batch_size(1)
                .with_parallelism(1),
        );

        // One in flight, one held by the dispatcher, one in the channel.
        let mut handles = Vec::new();
        for i in 0..3 {
            handles.push(orchestrator.submit(Work::add(doc(&i.to_string(), i))).await.unwrap());
        }

        let blocked = tokio::time::timeout(
            Duration::from_millis(30),
            orchestrator.submit(Work::add(doc("late", 0))),
        )
        .await;
        assert!(blocked.is_err());

        handles.push(orchestrator.submit(Work::add(doc("3", 3))).await.unwrap());
        for h in handles {
            h.await.unwrap();
        }
        orchestrator.flush().await.unwrap();

        assert_eq!(orchestrator.stats().applied, 4);
        assert!(backend.document(&DocumentKey::new("late", None)).is_none());
    }

    #[tokio::test]
    async fn test_shared_policy_commits_once_after_last_writer() {
        let backend = Arc::new(InMemoryBackend::new("books").with_latency(LatencyJitter::new(
            Duration::from_millis(50),
            Duration::from_millis(50),
        )));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let writer = |name: &str| {
            WorkOrchestrator::start(
                name,
                Arc::clone(&backend) as Arc<dyn IndexBackend>,
                Arc::new(SharedIndexCommit::new(Arc::clone(&in_flight))),
                fast_config().with_max_batch_size(1).with_parallelism(2),
            )
        };
        let books = writer("books");
        let authors = writer("authors");

        let mut handles = Vec::new();
        for id in ["b1", "b2"] {
            handles.push(books.submit(Work::add(doc(id, 1))).await.unwrap());
        }
        for id in ["a1", "a2"] {
            handles.push(authors.submit(Work::add(doc(id, 1))).await.unwrap());
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(in_flight.load(Ordering::SeqCst) > 0);
        assert_eq!(backend.commit_count(), 0);

        for h in handles {
            h.await.unwrap();
        }
        for _ in 0..100 {
            if backend.commit_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(backend.commit_count(), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(backend.committed_len(), 4);
    }

    #[tokio::test]
    async fn test_scheduled_policy_commits_on_timer() {
        let backend = Arc::new(InMemoryBackend::new("books"));
        let orchestrator = WorkOrchestrator::start(
            "books",
            Arc::clone(&backend) as Arc<dyn IndexBackend>,
            Arc::new(ScheduledCommit::new(Duration::from_millis(30))),
            fast_config(),
        );

        orchestrator.submit_and_wait(Work::add(doc("1", 1))).await.unwrap();
        assert_eq!(backend.commit_count(), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(backend.commit_count() >= 1);
        assert!(backend.document(&DocumentKey::new("1", None)).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_commits() {
        let backend = Arc::new(InMemoryBackend::new("books"));
        let orchestrator = WorkOrchestrator::start(
            "books",
            Arc::clone(&backend) as Arc<dyn IndexBackend>,
            Arc::new(ScheduledCommit::new(Duration::from_secs(3600))),
            OrchestratorConfig::default().with_batch_window(Duration::from_millis(50)),
        );

        let handle = orchestrator.submit(Work::add(doc("1", 1))).await.unwrap();
        orchestrator.shutdown().await.unwrap();
        handle.await.unwrap();

        assert!(backend.document(&DocumentKey::new("1", None)).is_some());
        assert!(matches!(
            orchestrator.submit(Work::add(doc("2", 1))).await,
            Err(IndexingError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_block() {
        let backend = Arc::new(InMemoryBackend::new("books"));
        let orchestrator = start(Arc::clone(&backend), fast_config());

        drop(orchestrator.submit(Work::add(doc("1", 1))).await.unwrap());
        orchestrator.flush().await.unwrap();
        assert!(backend.document(&DocumentKey::new("1", None)).is_some());
    }
}
