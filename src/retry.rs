use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{DeployFailure, DeployReceipt, ExecutionOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Upper bound of the uniform random delay added to every backoff.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-indexed), before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let backoff = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = backoff.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        self.backoff_delay(attempt) + Duration::from_millis(jitter)
    }

    fn normalized(mut self) -> Self {
        if self.max_attempts == 0 {
            self.max_attempts = 1;
        }
        if self.multiplier <= 0.0 || !self.multiplier.is_finite() {
            self.multiplier = 2.0;
        }
        if self.max_delay_ms < self.base_delay_ms {
            self.max_delay_ms = self.base_delay_ms;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RetryStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub error: Option<DeployFailure>,
    /// Backoff waited after this attempt; 0 when no further attempt followed.
    pub delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySession {
    pub session_id: String,
    pub label: String,
    pub attempts: Vec<RetryAttempt>,
    pub status: RetryStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub receipt: Option<DeployReceipt>,
}

impl RetrySession {
    fn new(session_id: String, label: String) -> Self {
        Self {
            session_id,
            label,
            attempts: Vec::new(),
            status: RetryStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            receipt: None,
        }
    }

    pub fn last_error(&self) -> Option<&DeployFailure> {
        self.attempts.iter().rev().find_map(|a| a.error.as_ref())
    }
}

/// Parameters of one retry-wrapped operation.
#[derive(Debug, Clone, Default)]
pub struct RetryRequest {
    pub session_id: Option<String>,
    pub label: String,
    /// Firing this token ends the session as cancelled.
    pub cancellation: Option<CancellationToken>,
}

impl RetryRequest {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

pub type StatusListener = Arc<dyn Fn(&RetrySession) + Send + Sync>;

struct SessionEntry {
    session: RetrySession,
    token: CancellationToken,
    /// Identifies the `deploy` call that owns the entry when an id is reused.
    generation: u64,
}

#[derive(Default)]
struct SessionStore {
    sessions: HashMap<String, SessionEntry>,
    order: Vec<String>,
    next_generation: u64,
}

impl SessionStore {
    fn owned(&mut self, session_id: &str, generation: u64) -> Option<&mut SessionEntry> {
        self.sessions
            .get_mut(session_id)
            .filter(|entry| entry.generation == generation)
    }
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    listeners: Vec<(u64, StatusListener)>,
}

/// Unsubscribes its listener when dropped.
#[must_use = "dropping the guard unsubscribes the listener"]
pub struct ListenerGuard {
    id: u64,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl ListenerGuard {
    pub fn dispose(self) {}
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Runs single operations under a backoff policy and keeps the history of
/// every session it ran for its own lifetime.
pub struct RetryCoordinator {
    policy: RetryPolicy,
    store: Mutex<SessionStore>,
    listeners: Arc<Mutex<ListenerRegistry>>,
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: policy.normalized(),
            store: Mutex::new(SessionStore::default()),
            listeners: Arc::new(Mutex::new(ListenerRegistry::default())),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails permanently, runs out of
    /// attempts or is cancelled. The attempt number passed in is 1-indexed.
    ///
    /// Cancellation never interrupts an attempt in flight; it stops further
    /// attempts and cuts the backoff wait short.
    ///
    /// A `session_id` that is still running is refused: the returned session
    /// is `failed` without any attempt and is not kept in the history.
    pub async fn deploy<F, Fut>(&self, request: RetryRequest, mut operation: F) -> RetrySession
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ExecutionOutcome>,
    {
        let session_id = request
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let token = match &request.cancellation {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        let session = RetrySession::new(session_id.clone(), request.label);
        let Some(generation) = self.register(session.clone(), token.clone()) else {
            warn!(session_id = %session_id, "session id already running, refusing");
            let mut refused = session;
            refused.status = RetryStatus::Failed;
            refused.completed_at = Some(Utc::now());
            return refused;
        };
        debug!(session_id = %session_id, label = %session.label, "retry session started");
        self.emit(&session);

        let mut last_seen = session;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if token.is_cancelled() {
                return self.finish(&session_id, generation, RetryStatus::Cancelled, None, last_seen);
            }

            let started = self.record(&session_id, generation, |session| {
                session.attempts.push(RetryAttempt {
                    number: attempt,
                    started_at: Utc::now(),
                    error: None,
                    delay_ms: 0,
                });
            });
            match started {
                Some(snapshot) => last_seen = snapshot,
                // cancelled between the check above and the attempt
                None => return self.settle(&session_id, generation, last_seen),
            }

            let outcome = operation(attempt).await;

            match outcome {
                Ok(receipt) => {
                    info!(session_id = %session_id, attempt, "deployment succeeded");
                    return self.finish(
                        &session_id,
                        generation,
                        RetryStatus::Succeeded,
                        Some(receipt),
                        last_seen,
                    );
                }
                Err(failure) => {
                    let retry = failure.is_transient() && attempt < self.policy.max_attempts;
                    let delay = if retry {
                        self.policy.delay_with_jitter(attempt)
                    } else {
                        Duration::ZERO
                    };

                    let recorded = self.record(&session_id, generation, |session| {
                        if let Some(last) = session.attempts.last_mut() {
                            last.error = Some(failure.clone());
                            last.delay_ms = delay.as_millis() as u64;
                        }
                    });
                    match recorded {
                        Some(snapshot) => last_seen = snapshot,
                        None => return self.settle(&session_id, generation, last_seen),
                    }

                    if !retry {
                        warn!(
                            session_id = %session_id,
                            attempt,
                            kind = ?failure.kind,
                            error = %failure.message,
                            "deployment failed"
                        );
                        return self.finish(&session_id, generation, RetryStatus::Failed, None, last_seen);
                    }

                    debug!(
                        session_id = %session_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.message,
                        "transient failure, backing off"
                    );

                    tokio::select! {
                        _ = token.cancelled() => {
                            return self.finish(
                                &session_id,
                                generation,
                                RetryStatus::Cancelled,
                                None,
                                last_seen,
                            );
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Cancels a running session. Returns `false` when the id is unknown or
    /// the session already reached a terminal status.
    pub fn cancel(&self, session_id: &str) -> bool {
        let snapshot = {
            let mut store = self.store.lock();
            let Some(entry) = store.sessions.get_mut(session_id) else {
                return false;
            };
            if entry.session.status.is_terminal() {
                return false;
            }
            entry.session.status = RetryStatus::Cancelled;
            entry.session.completed_at = Some(Utc::now());
            entry.token.cancel();
            entry.session.clone()
        };
        warn!(session_id = %session_id, "retry session cancelled");
        self.emit(&snapshot);
        true
    }

    /// All sessions in creation order.
    pub fn history(&self) -> Vec<RetrySession> {
        let store = self.store.lock();
        store
            .order
            .iter()
            .filter_map(|id| store.sessions.get(id))
            .map(|entry| entry.session.clone())
            .collect()
    }

    pub fn session(&self, session_id: &str) -> Option<RetrySession> {
        self.store
            .lock()
            .sessions
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    /// Forgets terminal sessions; running ones stay cancellable.
    pub fn clear_history(&self) {
        let mut store = self.store.lock();
        store.sessions.retain(|_, entry| !entry.session.status.is_terminal());
        let SessionStore { sessions, order, .. } = &mut *store;
        order.retain(|id| sessions.contains_key(id));
    }

    pub fn on_status_change<L>(&self, listener: L) -> ListenerGuard
    where
        L: Fn(&RetrySession) + Send + Sync + 'static,
    {
        let mut registry = self.listeners.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.push((id, Arc::new(listener)));
        ListenerGuard {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Stores a new session and returns its generation, or `None` when a
    /// running session already holds the id.
    fn register(&self, session: RetrySession, token: CancellationToken) -> Option<u64> {
        let mut store = self.store.lock();
        let id = session.session_id.clone();
        if store
            .sessions
            .get(&id)
            .is_some_and(|entry| !entry.session.status.is_terminal())
        {
            return None;
        }
        // a reused id replaces the earlier, finished session
        store.next_generation += 1;
        let generation = store.next_generation;
        store.order.retain(|existing| *existing != id);
        store.order.push(id.clone());
        store.sessions.insert(
            id,
            SessionEntry {
                session,
                token,
                generation,
            },
        );
        Some(generation)
    }

    /// Applies `update` to this call's running session and notifies listeners.
    fn record(
        &self,
        session_id: &str,
        generation: u64,
        update: impl FnOnce(&mut RetrySession),
    ) -> Option<RetrySession> {
        let snapshot = {
            let mut store = self.store.lock();
            let entry = store.owned(session_id, generation)?;
            if entry.session.status.is_terminal() {
                return None;
            }
            update(&mut entry.session);
            entry.session.clone()
        };
        self.emit(&snapshot);
        Some(snapshot)
    }

    /// Moves this call's session to `status`. A session that already ended
    /// (cancelled from outside) keeps its status.
    fn finish(
        &self,
        session_id: &str,
        generation: u64,
        status: RetryStatus,
        receipt: Option<DeployReceipt>,
        last_seen: RetrySession,
    ) -> RetrySession {
        let updated = {
            let mut store = self.store.lock();
            match store.owned(session_id, generation) {
                Some(entry) if !entry.session.status.is_terminal() => {
                    entry.session.status = status;
                    entry.session.completed_at = Some(Utc::now());
                    entry.session.receipt = receipt;
                    Some(entry.session.clone())
                }
                _ => None,
            }
        };
        match updated {
            Some(snapshot) => {
                self.emit(&snapshot);
                snapshot
            }
            None => self.settle(session_id, generation, last_seen),
        }
    }

    /// Final state of a session that ended from outside. Once its entry is
    /// gone (cleared or taken over by a reused id) the last snapshot this
    /// call saw is returned as cancelled, since only `cancel` ends a session
    /// early.
    fn settle(&self, session_id: &str, generation: u64, mut last_seen: RetrySession) -> RetrySession {
        let stored = self
            .store
            .lock()
            .owned(session_id, generation)
            .map(|entry| entry.session.clone());
        if let Some(session) = stored {
            return session;
        }
        last_seen.status = RetryStatus::Cancelled;
        last_seen.completed_at.get_or_insert_with(Utc::now);
        last_seen
    }

    fn emit(&self, session: &RetrySession) {
        let listeners: Vec<StatusListener> = self
            .listeners
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeployFailure, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_ms: 0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_delay_ms: 5_000,
            ..policy()
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(5_000));
        assert_eq!(policy.backoff_delay(200), Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter_ms: 100,
            ..policy()
        };
        for _ in 0..50 {
            let delay = policy.delay_with_jitter(1);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(1_100));
        }
    }

    #[test]
    fn policy_is_normalized() {
        let coordinator = RetryCoordinator::new(RetryPolicy {
            max_attempts: 0,
            multiplier: -1.0,
            base_delay_ms: 500,
            max_delay_ms: 10,
            jitter_ms: 0,
        });
        assert_eq!(coordinator.policy().max_attempts, 1);
        assert_eq!(coordinator.policy().multiplier, 2.0);
        assert_eq!(coordinator.policy().max_delay_ms, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_then_success() {
        let coordinator = RetryCoordinator::new(policy());
        let calls = AtomicU32::new(0);

        let session = coordinator
            .deploy(RetryRequest::new("token"), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(DeployFailure::network("connection reset"))
                    } else {
                        Ok(DeployReceipt::new("CTOKEN", "0xfeed"))
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(session.status, RetryStatus::Succeeded);
        assert_eq!(session.attempts.len(), 3);
        assert_eq!(session.attempts[0].delay_ms, 1_000);
        assert_eq!(session.attempts[1].delay_ms, 2_000);
        assert_eq!(session.attempts[2].delay_ms, 0);
        assert!(session.attempts[2].error.is_none());
        assert_eq!(session.receipt.unwrap().contract_id.as_deref(), Some("CTOKEN"));
        assert!(session.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_single_attempt() {
        let coordinator = RetryCoordinator::new(policy());
        let session = coordinator
            .deploy(RetryRequest::new("nft"), |_| async {
                Err::<DeployReceipt, _>(DeployFailure::validation("wasm not found"))
            })
            .await;

        assert_eq!(session.status, RetryStatus::Failed);
        assert_eq!(session.attempts.len(), 1);
        assert_eq!(session.last_error().map(|e| e.kind), Some(ErrorKind::Validation));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_keeps_last_error() {
        let coordinator = RetryCoordinator::new(policy());
        let session = coordinator
            .deploy(RetryRequest::new("staking"), |attempt| async move {
                Err::<DeployReceipt, _>(DeployFailure::new(ErrorKind::Timeout, format!("timeout #{attempt}")))
            })
            .await;

        assert_eq!(session.status, RetryStatus::Failed);
        assert_eq!(session.attempts.len(), 3);
        assert_eq!(session.last_error().unwrap().message, "timeout #3");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff() {
        let coordinator = Arc::new(RetryCoordinator::new(RetryPolicy {
            base_delay_ms: 10_000,
            ..policy()
        }));

        let runner = Arc::clone(&coordinator);
        let handle = tokio::spawn(async move {
            runner
                .deploy(RetryRequest::new("escrow").with_session_id("s1"), |_| async {
                    Err::<DeployReceipt, _>(DeployFailure::new(ErrorKind::RateLimited, "429"))
                })
                .await
        });

        sleep(Duration::from_millis(10)).await;
        assert!(coordinator.cancel("s1"));
        assert!(!coordinator.cancel("s1"));
        assert!(!coordinator.cancel("missing"));

        let session = handle.await.unwrap();
        assert_eq!(session.status, RetryStatus::Cancelled);
        assert_eq!(session.attempts.len(), 1);
        assert_eq!(coordinator.session("s1").unwrap().status, RetryStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn running_session_id_is_not_reused() {
        let coordinator = Arc::new(RetryCoordinator::new(RetryPolicy {
            base_delay_ms: 10_000,
            ..policy()
        }));

        let runner = Arc::clone(&coordinator);
        let first = tokio::spawn(async move {
            runner
                .deploy(RetryRequest::new("first").with_session_id("s1"), |_| async {
                    Err::<DeployReceipt, _>(DeployFailure::network("connection reset"))
                })
                .await
        });
        sleep(Duration::from_millis(10)).await;

        let second = coordinator
            .deploy(RetryRequest::new("second").with_session_id("s1"), |_| async {
                Ok::<_, DeployFailure>(DeployReceipt::new("C2", "0x2"))
            })
            .await;
        assert_eq!(second.status, RetryStatus::Failed);
        assert!(second.attempts.is_empty());
        assert!(second.receipt.is_none());
        assert_eq!(coordinator.session("s1").unwrap().label, "first");

        assert!(coordinator.cancel("s1"));
        let first = first.await.unwrap();
        assert_eq!(first.label, "first");
        assert_eq!(first.status, RetryStatus::Cancelled);
        assert_eq!(first.attempts.len(), 1);
        assert!(first.receipt.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_session_id_can_be_reused() {
        let coordinator = Arc::new(RetryCoordinator::new(policy()));

        let runner = Arc::clone(&coordinator);
        let first = tokio::spawn(async move {
            runner
                .deploy(RetryRequest::new("first").with_session_id("s1"), |_| async {
                    sleep(Duration::from_secs(1)).await;
                    Ok::<_, DeployFailure>(DeployReceipt::new("C1", "0x1"))
                })
                .await
        });
        sleep(Duration::from_millis(10)).await;
        assert!(coordinator.cancel("s1"));

        let second = coordinator
            .deploy(RetryRequest::new("second").with_session_id("s1"), |_| async {
                Ok::<_, DeployFailure>(DeployReceipt::new("C2", "0x2"))
            })
            .await;
        assert_eq!(second.status, RetryStatus::Succeeded);

        // the first attempt finishes after its id was taken over
        let first = first.await.unwrap();
        assert_eq!(first.label, "first");
        assert_eq!(first.status, RetryStatus::Cancelled);
        assert!(first.receipt.is_none());

        let history = coordinator.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].label, "second");
        assert_eq!(history[0].status, RetryStatus::Succeeded);
    }

    #[tokio::test]
    async fn fired_token_cancels_before_first_attempt() {
        let coordinator = RetryCoordinator::new(policy());
        let token = CancellationToken::new();
        token.cancel();

        let session = coordinator
            .deploy(RetryRequest::new("auction").with_cancellation(token), |_| async {
                Ok::<_, DeployFailure>(DeployReceipt::default())
            })
            .await;

        assert_eq!(session.status, RetryStatus::Cancelled);
        assert!(session.attempts.is_empty());
        assert!(!coordinator.cancel(&session.session_id));
    }

    #[tokio::test]
    async fn listeners_see_every_transition() {
        let coordinator = RetryCoordinator::new(policy());
        let seen: Arc<Mutex<Vec<(RetryStatus, usize)>>> = Arc::default();

        let sink = Arc::clone(&seen);
        let guard = coordinator.on_status_change(move |session| {
            sink.lock().push((session.status, session.attempts.len()));
        });

        coordinator
            .deploy(RetryRequest::new("voting"), |_| async {
                Err::<DeployReceipt, _>(DeployFailure::execution("unauthorized"))
            })
            .await;

        assert_eq!(
            *seen.lock(),
            vec![
                (RetryStatus::Running, 0),
                (RetryStatus::Running, 1),
                (RetryStatus::Running, 1),
                (RetryStatus::Failed, 1),
            ]
        );

        guard.dispose();
        coordinator
            .deploy(RetryRequest::new("voting"), |_| async {
                Ok::<_, DeployFailure>(DeployReceipt::default())
            })
            .await;
        assert_eq!(seen.lock().len(), 4);
    }

    #[tokio::test]
    async fn history_in_creation_order_and_clearable() {
        let coordinator = RetryCoordinator::new(policy());
        for label in ["a", "b", "c"] {
            coordinator
                .deploy(RetryRequest::new(label), |_| async {
                    Ok::<_, DeployFailure>(DeployReceipt::default())
                })
                .await;
        }

        let labels: Vec<String> = coordinator.history().into_iter().map(|s| s.label).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);

        coordinator.clear_history();
        assert!(coordinator.history().is_empty());
    }
}
