//! Auto-batch queue.
//!
//! Buffers `post`/`patch` operations and releases them in batches bounded
//! by count and byte-size thresholds. A `patch` queued against a `post`
//! that hasn't been sent yet is merged into that `post` in place rather
//! than queued as a second operation, so a run that completes before its
//! creation is flushed never costs more than one wire message.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::errors::{ErrorCode, StructuredError};
use crate::run::{Run, RunUpdate};

#[derive(Debug, Clone)]
pub enum Operation {
    Post(Run),
    Patch(RunUpdate),
}

impl Operation {
    fn approx_size(&self) -> usize {
        match self {
            Operation::Post(run) => serde_json::to_vec(run).map(|b| b.len()).unwrap_or(0),
            Operation::Patch(update) => serde_json::to_vec(update).map(|b| b.len()).unwrap_or(0),
        }
    }

    fn id(&self) -> Uuid {
        match self {
            Operation::Post(run) => run.id,
            Operation::Patch(update) => update.id,
        }
    }
}

/// Thresholds that trigger an automatic flush.
#[derive(Debug, Clone, Copy)]
pub struct BatchThresholds {
    pub max_batch_size: usize,
    pub max_batch_bytes: usize,
}

impl Default for BatchThresholds {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_bytes: 20 * 1024 * 1024,
        }
    }
}

struct QueueState {
    ops: VecDeque<Operation>,
    /// Index from run id to its position in `ops`, but only while that
    /// operation is still an unsent `Post` — enables O(1) patch merge.
    pending_post_ids: HashMap<Uuid, usize>,
    pending_bytes: usize,
    draining: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            ops: VecDeque::new(),
            pending_post_ids: HashMap::new(),
            pending_bytes: 0,
            draining: false,
        }
    }
}

/// A named decision on whether a given run should be queued at all;
/// unsampled runs still get a `RunHandle` but their operations are
/// dropped before they reach the queue.
pub trait Sampler: Send + Sync {
    fn should_sample(&self) -> bool;
}

pub struct AlwaysSample;
impl Sampler for AlwaysSample {
    fn should_sample(&self) -> bool {
        true
    }
}

pub struct RatioSampler {
    pub ratio: f64,
}
impl Sampler for RatioSampler {
    fn should_sample(&self) -> bool {
        if !(0.0..=1.0).contains(&self.ratio) {
            return true;
        }
        rand::random::<f64>() < self.ratio
    }
}

/// Outcome of dispatching one batch, reported back via the queue's
/// `JoinSet` so callers can `await_pending` without leaking tasks.
#[derive(Debug)]
pub struct BatchOutcome {
    pub op_count: usize,
    pub result: Result<(), StructuredError>,
}

/// A function that actually sends a batch over the wire. Abstracted so the
/// queue has no direct dependency on the transport/http_caller modules.
pub type Sender = Arc<dyn Fn(Vec<Operation>) -> BoxFuture + Send + Sync>;
pub type BoxFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StructuredError>> + Send>>;

pub struct IngestQueue {
    state: Mutex<QueueState>,
    thresholds: BatchThresholds,
    dispatch_limit: Arc<Semaphore>,
    in_flight: Mutex<JoinSet<BatchOutcome>>,
    sender: Sender,
    manual_flush_mode: bool,
}

impl IngestQueue {
    pub fn new(thresholds: BatchThresholds, max_concurrent_batches: usize, sender: Sender) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            thresholds,
            dispatch_limit: Arc::new(Semaphore::new(max_concurrent_batches.max(1))),
            in_flight: Mutex::new(JoinSet::new()),
            sender,
            manual_flush_mode: false,
        }
    }

    pub fn with_manual_flush_mode(mut self, manual: bool) -> Self {
        self.manual_flush_mode = manual;
        self
    }

    /// Queues a run creation. Returns immediately; dispatch happens in the
    /// background once a threshold trips, unless manual-flush mode is on.
    pub async fn enqueue_post(&self, run: Run) {
        let mut state = self.state.lock().await;
        let size = Operation::approx_size(&Operation::Post(run.clone()));
        state.pending_post_ids.insert(run.id, state.ops.len());
        state.pending_bytes += size;
        state.ops.push_back(Operation::Post(run));
        drop(state);
        self.maybe_dispatch().await;
    }

    /// Queues a run update. If the matching `post` is still unsent, the
    /// update is merged directly into it instead of becoming a second
    /// queued operation.
    pub async fn enqueue_patch(&self, update: RunUpdate) {
        let mut state = self.state.lock().await;

        if let Some(&idx) = state.pending_post_ids.get(&update.id) {
            if let Some(Operation::Post(run)) = state.ops.get_mut(idx) {
                merge_update_into_run(run, &update);
                drop(state);
                self.maybe_dispatch().await;
                return;
            }
        }

        let size = Operation::approx_size(&Operation::Patch(update.clone()));
        state.pending_bytes += size;
        state.ops.push_back(Operation::Patch(update));
        drop(state);
        self.maybe_dispatch().await;
    }

    async fn maybe_dispatch(&self) {
        if self.manual_flush_mode {
            return;
        }
        let should_flush = {
            let state = self.state.lock().await;
            !state.draining
                && (state.ops.len() >= self.thresholds.max_batch_size
                    || state.pending_bytes >= self.thresholds.max_batch_bytes)
        };
        if should_flush {
            self.flush().await;
        }
    }

    /// Greedily slices the current queue into batches respecting both
    /// thresholds, and dispatches each slice concurrently, bounded by the
    /// dispatch semaphore.
    pub async fn flush(&self) {
        let batches = {
            let mut state = self.state.lock().await;
            if state.ops.is_empty() || state.draining {
                return;
            }
            state.draining = true;
            let batches = slice_into_batches(&mut state.ops, &self.thresholds);
            state.pending_post_ids.clear();
            state.pending_bytes = 0;
            state.draining = false;
            batches
        };

        let mut joinset = self.in_flight.lock().await;
        for batch in batches {
            let permit = Arc::clone(&self.dispatch_limit);
            let sender = Arc::clone(&self.sender);
            let op_count = batch.len();
            joinset.spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                let result = (sender)(batch).await;
                BatchOutcome { op_count, result }
            });
        }
    }

    /// Awaits every batch dispatched so far (including one final flush of
    /// whatever remains queued), propagating the first error encountered.
    pub async fn await_pending_batches(&self) -> Result<(), StructuredError> {
        self.flush().await;
        let mut joinset = self.in_flight.lock().await;
        let mut first_err = None;
        while let Some(joined) = joinset.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Err(e) = outcome.result {
                        first_err.get_or_insert(e);
                    }
                }
                Err(join_err) => {
                    first_err.get_or_insert(StructuredError::new(
                        ErrorCode::DRAIN_FAILED,
                        format!("batch task panicked: {join_err}"),
                    ));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn queued_len(&self) -> usize {
        self.state.lock().await.ops.len()
    }
}

fn merge_update_into_run(run: &mut Run, update: &RunUpdate) {
    if let Some(outputs) = &update.outputs {
        run.outputs = Some(crate::run::to_circular_safe_json(outputs));
    }
    if let Some(error) = &update.error {
        run.error = Some(error.clone());
    }
    if let Some(end_time) = update.end_time {
        run.end_time = Some(end_time);
    }
    if let Some(extra) = &update.extra {
        run.extra.extend(extra.clone());
    }
    if let Some(events) = &update.events {
        run.events.extend(events.clone());
    }
}

fn slice_into_batches(
    ops: &mut VecDeque<Operation>,
    thresholds: &BatchThresholds,
) -> Vec<Vec<Operation>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;

    while let Some(op) = ops.pop_front() {
        let size = op.approx_size();
        if !current.is_empty()
            && (current.len() >= thresholds.max_batch_size
                || current_bytes + size > thresholds.max_batch_bytes)
        {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(op);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{NewRun, RunBuilder, RunType};
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::json;

    fn sample_run(name: &str) -> Run {
        RunBuilder::build(
            NewRun {
                name: name.to_string(),
                run_type: RunType::Chain,
                inputs: json!({}),
                session_name: "default".into(),
                tags: vec![],
                extra: StdHashMap::new(),
                id: None,
                start_time: None,
            },
            None,
            0,
        )
    }

    fn counting_sender(counter: Arc<AtomicUsize>) -> Sender {
        Arc::new(move |batch: Vec<Operation>| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(batch.len(), Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn patch_merges_into_unsent_post() {
        let sent = Arc::new(AtomicUsize::new(0));
        let queue = IngestQueue::new(BatchThresholds::default(), 4, counting_sender(sent))
            .with_manual_flush_mode(true);

        let run = sample_run("r1");
        let id = run.id;
        queue.enqueue_post(run).await;
        queue
            .enqueue_patch(RunUpdate {
                id,
                end_time: Some(123),
                ..Default::default()
            })
            .await;

        assert_eq!(queue.queued_len().await, 1);
    }

    #[tokio::test]
    async fn count_threshold_triggers_auto_flush() {
        let sent = Arc::new(AtomicUsize::new(0));
        let thresholds = BatchThresholds {
            max_batch_size: 2,
            max_batch_bytes: usize::MAX,
        };
        let queue = IngestQueue::new(thresholds, 4, counting_sender(Arc::clone(&sent)));

        queue.enqueue_post(sample_run("a")).await;
        queue.enqueue_post(sample_run("b")).await;
        queue.await_pending_batches().await.unwrap();

        assert_eq!(sent.load(Ordering::SeqCst), 2);
        assert_eq!(queue.queued_len().await, 0);
    }

    #[tokio::test]
    async fn manual_flush_mode_requires_explicit_flush() {
        let sent = Arc::new(AtomicUsize::new(0));
        let thresholds = BatchThresholds {
            max_batch_size: 1,
            max_batch_bytes: usize::MAX,
        };
        let queue = IngestQueue::new(thresholds, 4, counting_sender(Arc::clone(&sent)))
            .with_manual_flush_mode(true);

        queue.enqueue_post(sample_run("a")).await;
        assert_eq!(sent.load(Ordering::SeqCst), 0);

        queue.await_pending_batches().await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn byte_threshold_splits_into_multiple_batches() {
        let sent = Arc::new(AtomicUsize::new(0));
        let tiny_run_bytes = serde_json::to_vec(&sample_run("sizing")).unwrap().len();
        let thresholds = BatchThresholds {
            max_batch_size: 100,
            max_batch_bytes: tiny_run_bytes + 1,
        };
        let queue = IngestQueue::new(thresholds, 4, counting_sender(Arc::clone(&sent)))
            .with_manual_flush_mode(true);

        for i in 0..5 {
            queue.enqueue_post(sample_run(&format!("r{i}"))).await;
        }
        queue.await_pending_batches().await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 5);
    }
}
