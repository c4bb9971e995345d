use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    BatchItem, DeployFailure, ErrorKind, ExecutionOutcome, ItemExecutor, ItemResult, ItemStatus,
    RetryCoordinator, RetryRequest, RetrySession, RetryStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Strict input order, one item at a time.
    #[default]
    Sequential,
    /// Up to `concurrency` items in flight, dispatched as dependencies finish.
    Parallel,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub batch_id: String,
    pub mode: ExecutionMode,
    pub items: Vec<BatchItem>,
    /// Parallel mode only. Defaults to the number of items.
    pub concurrency: Option<usize>,
    pub cancellation: Option<CancellationToken>,
}

impl BatchRequest {
    pub fn new(batch_id: impl Into<String>, mode: ExecutionMode, items: Vec<BatchItem>) -> Self {
        Self {
            batch_id: batch_id.into(),
            mode,
            items,
            concurrency: None,
            cancellation: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRunResult {
    /// One entry per requested item, in request order.
    pub results: Vec<ItemResult>,
    pub cancelled: bool,
}

impl BatchRunResult {
    pub fn result(&self, id: &str) -> Option<&ItemResult> {
        self.results.iter().find(|r| r.id == id)
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.status == ItemStatus::Succeeded)
    }
}

enum Readiness {
    Ready,
    /// A dependency is still pending or running.
    Waiting,
    /// A dependency ended without succeeding.
    Blocked(String),
}

/// Results of one run, owned by the run for its lifetime.
struct RunState<'a> {
    batch_id: &'a str,
    items: &'a [BatchItem],
    results: Vec<ItemResult>,
    index: HashMap<&'a str, usize>,
    progress: Option<&'a mpsc::UnboundedSender<ItemResult>>,
}

impl<'a> RunState<'a> {
    fn new(
        batch_id: &'a str,
        items: &'a [BatchItem],
        progress: Option<&'a mpsc::UnboundedSender<ItemResult>>,
    ) -> Self {
        let mut index = HashMap::new();
        for (idx, item) in items.iter().enumerate() {
            // duplicate ids resolve to the first occurrence
            index.entry(item.id.as_str()).or_insert(idx);
        }
        Self {
            batch_id,
            items,
            results: items.iter().map(|item| ItemResult::pending(item.id.clone())).collect(),
            index,
            progress,
        }
    }

    fn status(&self, idx: usize) -> ItemStatus {
        self.results[idx].status
    }

    fn readiness(&self, idx: usize) -> Readiness {
        let mut waiting = false;
        for dep in &self.items[idx].depends_on {
            // ids outside the batch are external and count as satisfied
            let Some(&dep_idx) = self.index.get(dep.as_str()) else {
                continue;
            };
            let status = self.status(dep_idx);
            if status.blocks_dependents() {
                return Readiness::Blocked(dep.clone());
            }
            if status != ItemStatus::Succeeded {
                waiting = true;
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    fn publish(&self, idx: usize) {
        if let Some(progress) = self.progress {
            // a dropped receiver only means nobody is watching
            let _ = progress.send(self.results[idx].clone());
        }
    }

    fn start(&mut self, idx: usize) {
        if self.results[idx].transition(ItemStatus::Running) {
            debug!(batch_id = %self.batch_id, item_id = %self.items[idx].id, "dispatching item");
            self.publish(idx);
        }
    }

    fn skip(&mut self, idx: usize, reason: String) {
        let result = &mut self.results[idx];
        if result.transition(ItemStatus::Skipped) {
            debug!(batch_id = %self.batch_id, item_id = %result.id, %reason, "skipping item");
            result.error = Some(reason);
            self.publish(idx);
        }
    }

    fn complete(&mut self, idx: usize, outcome: ExecutionOutcome) {
        if let Err(failure) = &outcome {
            warn!(
                batch_id = %self.batch_id,
                item_id = %self.items[idx].id,
                kind = ?failure.kind,
                error = %failure.message,
                "item failed"
            );
        }
        if self.results[idx].complete(outcome) {
            self.publish(idx);
        }
    }

    fn cancel_pending(&mut self) {
        for idx in 0..self.results.len() {
            if self.status(idx) == ItemStatus::Pending
                && self.results[idx].transition(ItemStatus::Cancelled)
            {
                self.publish(idx);
            }
        }
    }

    fn finish(self) -> BatchRunResult {
        let cancelled = self.results.iter().any(|r| r.status == ItemStatus::Cancelled);
        BatchRunResult {
            results: self.results,
            cancelled,
        }
    }
}

/// Drives a batch of items to completion through a caller-supplied executor.
pub struct BatchScheduler {
    executor: Arc<dyn ItemExecutor>,
    progress: Option<mpsc::UnboundedSender<ItemResult>>,
}

impl BatchScheduler {
    pub fn new(executor: Arc<dyn ItemExecutor>) -> Self {
        Self {
            executor,
            progress: None,
        }
    }

    /// Every item status change is also sent to `progress`.
    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ItemResult>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Runs every item to a terminal status. Item failures never abort the
    /// batch; they only skip the items that depend on them.
    pub async fn run_batch(&self, request: BatchRequest) -> BatchRunResult {
        let token = request.cancellation.clone().unwrap_or_default();
        let mut state = RunState::new(&request.batch_id, &request.items, self.progress.as_ref());

        info!(
            batch_id = %request.batch_id,
            mode = ?request.mode,
            items = request.items.len(),
            "batch started"
        );

        match request.mode {
            ExecutionMode::Sequential => self.run_sequential(&mut state, &token).await,
            ExecutionMode::Parallel => {
                let limit = request.concurrency.unwrap_or(request.items.len()).max(1);
                self.run_parallel(&mut state, &token, limit).await
            }
        }

        let result = state.finish();
        info!(
            batch_id = %request.batch_id,
            succeeded = result.count(ItemStatus::Succeeded),
            failed = result.count(ItemStatus::Failed),
            skipped = result.count(ItemStatus::Skipped),
            cancelled = result.count(ItemStatus::Cancelled),
            "batch finished"
        );
        result
    }

    async fn run_sequential(&self, state: &mut RunState<'_>, token: &CancellationToken) {
        for idx in 0..state.items.len() {
            if token.is_cancelled() {
                warn!(batch_id = %state.batch_id, "batch cancelled");
                state.cancel_pending();
                break;
            }
            // a pending dependency later in the list does not hold the item back
            if let Readiness::Blocked(dep) = state.readiness(idx) {
                state.skip(idx, format!("dependency {dep} did not succeed"));
                continue;
            }

            state.start(idx);
            let (_, joined) = dispatch(
                Arc::clone(&self.executor),
                idx,
                state.items[idx].clone(),
                None,
            )
            .await;
            state.complete(idx, flatten(joined));
        }
    }

    async fn run_parallel(&self, state: &mut RunState<'_>, token: &CancellationToken, limit: usize) {
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut in_flight = FuturesUnordered::new();
        let mut cancel_logged = false;

        loop {
            if token.is_cancelled() {
                if !cancel_logged {
                    warn!(batch_id = %state.batch_id, in_flight = in_flight.len(), "batch cancelled");
                    cancel_logged = true;
                }
                state.cancel_pending();
            } else {
                // a skip can unblock the skip of an earlier item, so rescan until stable
                let mut changed = true;
                while changed {
                    changed = false;
                    for idx in 0..state.items.len() {
                        if state.status(idx) != ItemStatus::Pending {
                            continue;
                        }
                        match state.readiness(idx) {
                            Readiness::Blocked(dep) => {
                                state.skip(idx, format!("dependency {dep} did not succeed"));
                                changed = true;
                            }
                            Readiness::Waiting => {}
                            Readiness::Ready => {
                                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                                    continue;
                                };
                                state.start(idx);
                                in_flight.push(dispatch(
                                    Arc::clone(&self.executor),
                                    idx,
                                    state.items[idx].clone(),
                                    Some(permit),
                                ));
                            }
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                // whatever is still pending waits on a dependency that can never finish
                for idx in 0..state.items.len() {
                    if state.status(idx) == ItemStatus::Pending {
                        state.skip(idx, "unresolvable dependency (circular depends_on)".to_string());
                    }
                }
                break;
            }

            tokio::select! {
                Some((idx, joined)) = in_flight.next() => {
                    state.complete(idx, flatten(joined));
                }
                _ = token.cancelled(), if !token.is_cancelled() => {}
            }
        }
    }
}

/// Spawns the executor for one item. The permit, if any, is held until the
/// executor returns.
fn dispatch(
    executor: Arc<dyn ItemExecutor>,
    idx: usize,
    item: BatchItem,
    permit: Option<OwnedSemaphorePermit>,
) -> impl Future<Output = (usize, Result<ExecutionOutcome, JoinError>)> {
    let handle = tokio::spawn(async move {
        let _permit = permit;
        executor.execute(&item).await
    });
    async move { (idx, handle.await) }
}

fn flatten(joined: Result<ExecutionOutcome, JoinError>) -> ExecutionOutcome {
    joined.unwrap_or_else(|e| {
        Err(DeployFailure::new(
            ErrorKind::Unknown,
            format!("executor aborted: {e}"),
        ))
    })
}

/// Routes every item through a [`RetryCoordinator`] session labelled with
/// the item id.
pub struct RetryingExecutor {
    inner: Arc<dyn ItemExecutor>,
    coordinator: Arc<RetryCoordinator>,
    cancellation: Option<CancellationToken>,
}

impl RetryingExecutor {
    pub fn new(inner: Arc<dyn ItemExecutor>, coordinator: Arc<RetryCoordinator>) -> Self {
        Self {
            inner,
            coordinator,
            cancellation: None,
        }
    }

    /// Stops retrying (not the attempt in flight) once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn coordinator(&self) -> &Arc<RetryCoordinator> {
        &self.coordinator
    }
}

#[async_trait]
impl ItemExecutor for RetryingExecutor {
    async fn execute(&self, item: &BatchItem) -> ExecutionOutcome {
        let mut request = RetryRequest::new(item.id.clone());
        if let Some(token) = &self.cancellation {
            request = request.with_cancellation(token.clone());
        }
        let session = self
            .coordinator
            .deploy(request, |_| self.inner.execute(item))
            .await;
        session_outcome(session)
    }
}

fn session_outcome(session: RetrySession) -> ExecutionOutcome {
    match session.status {
        RetryStatus::Succeeded => Ok(session.receipt.unwrap_or_default()),
        RetryStatus::Failed => Err(session.last_error().cloned().unwrap_or_else(|| {
            DeployFailure::new(ErrorKind::Unknown, "retry attempts exhausted")
        })),
        RetryStatus::Cancelled => Err(DeployFailure::new(
            ErrorKind::Unknown,
            format!("retry session {} cancelled", session.session_id),
        )),
        RetryStatus::Running => Err(DeployFailure::new(
            ErrorKind::Unknown,
            format!("retry session {} did not finish", session.session_id),
        )),
    }
}
