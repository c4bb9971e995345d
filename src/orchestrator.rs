use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    ArtifactDescriptor, BatchRequest, BatchRunResult, BatchScheduler, BoxExecutor, DependencyGraph,
    DependencyGraphResolver, DeployError, ItemResult, OrchestratorConfig, RetryCoordinator,
    RetryingExecutor,
};

/// Resolves a workspace of contracts and deploys it in dependency order.
pub struct DeploymentOrchestrator {
    executor: BoxExecutor,
    config: OrchestratorConfig,
    coordinator: Arc<RetryCoordinator>,
    progress: Option<mpsc::UnboundedSender<ItemResult>>,
}

impl DeploymentOrchestrator {
    pub fn new(executor: BoxExecutor, config: OrchestratorConfig) -> Self {
        let coordinator = Arc::new(RetryCoordinator::new(config.retry.clone()));
        Self {
            executor,
            config,
            coordinator,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<ItemResult>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Retry sessions of every deployment this orchestrator ran.
    pub fn coordinator(&self) -> &Arc<RetryCoordinator> {
        &self.coordinator
    }

    pub fn plan(&self, artifacts: &[ArtifactDescriptor]) -> DependencyGraph {
        DependencyGraphResolver::new()
            .include_dev_dependencies(self.config.include_dev_dependencies)
            .resolve(artifacts)
    }

    /// Deploys `artifacts`. A graph with circular dependencies is refused
    /// before anything runs.
    pub async fn deploy(
        &self,
        batch_id: &str,
        artifacts: &[ArtifactDescriptor],
        cancellation: Option<CancellationToken>,
    ) -> Result<BatchRunResult, DeployError> {
        let graph = self.plan(artifacts);
        if let Some(report) = graph.cycle_report() {
            warn!(batch_id, "{report}");
        }
        let items = graph.to_batch_items(artifacts)?;
        info!(batch_id, items = items.len(), waves = graph.levels.len(), "deploy plan ready");

        let executor: BoxExecutor = if self.config.use_retry {
            let mut retrying =
                RetryingExecutor::new(Arc::clone(&self.executor), Arc::clone(&self.coordinator));
            // a cancelled batch also stops retries of the items in flight
            if let Some(token) = &cancellation {
                retrying = retrying.with_cancellation(token.clone());
            }
            Arc::new(retrying)
        } else {
            Arc::clone(&self.executor)
        };

        let mut scheduler = BatchScheduler::new(executor);
        if let Some(progress) = &self.progress {
            scheduler = scheduler.with_progress(progress.clone());
        }

        let mut request = BatchRequest::new(batch_id, self.config.mode, items);
        request.concurrency = self.config.concurrency;
        request.cancellation = cancellation;

        Ok(scheduler.run_batch(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BatchItem, DependencySpec, DeployFailure, DeployReceipt, ExecutionMode, ItemStatus,
        RetryPolicy, RetryStatus,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn artifacts() -> Vec<ArtifactDescriptor> {
        vec![
            ArtifactDescriptor::new("token", "contracts/token"),
            ArtifactDescriptor::new("nft", "contracts/nft")
                .with_dependency(DependencySpec::path("token", "../token")),
        ]
    }

    fn config(use_retry: bool) -> OrchestratorConfig {
        OrchestratorConfig {
            mode: ExecutionMode::Parallel,
            use_retry,
            retry: RetryPolicy {
                jitter_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn refuses_cyclic_workspaces() {
        let executor: BoxExecutor =
            Arc::new(|_: BatchItem| async { Ok::<_, DeployFailure>(DeployReceipt::default()) });
        let orchestrator = DeploymentOrchestrator::new(executor, config(false));
        let cyclic = vec![
            ArtifactDescriptor::new("a", "contracts/a").with_dependency(DependencySpec::workspace("b")),
            ArtifactDescriptor::new("b", "contracts/b").with_dependency(DependencySpec::workspace("a")),
        ];

        let err = orchestrator.deploy("batch", &cyclic, None).await.unwrap_err();
        assert!(matches!(err, DeployError::CircularDependency { ref cycles } if cycles.len() == 1));
        assert!(err.to_string().contains("contracts/a/Cargo.toml -> contracts/b/Cargo.toml"));
    }

    #[tokio::test]
    async fn without_retry_failures_are_single_shot() {
        let executor: BoxExecutor = Arc::new(|item: BatchItem| async move {
            if item.name == "token" {
                Err(DeployFailure::network("timeout talking to rpc"))
            } else {
                Ok::<_, DeployFailure>(DeployReceipt::default())
            }
        });
        let orchestrator = DeploymentOrchestrator::new(executor, config(false));

        let result = orchestrator.deploy("batch", &artifacts(), None).await.unwrap();
        assert_eq!(result.count(ItemStatus::Failed), 1);
        assert_eq!(result.count(ItemStatus::Skipped), 1);
        assert!(orchestrator.coordinator().history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_every_item_gets_a_session() {
        let executor: BoxExecutor = Arc::new(|item: BatchItem| async move {
            Ok::<_, DeployFailure>(DeployReceipt::new(item.name, "0x0"))
        });
        let orchestrator = DeploymentOrchestrator::new(executor, config(true));

        let result = orchestrator.deploy("batch", &artifacts(), None).await.unwrap();
        assert!(result.all_succeeded());

        let labels: Vec<String> = orchestrator
            .coordinator()
            .history()
            .into_iter()
            .map(|s| s.label)
            .collect();
        assert_eq!(labels, vec!["contracts/token/Cargo.toml", "contracts/nft/Cargo.toml"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_batch_stops_retries_in_flight() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let fire = token.clone();
        let counter = Arc::clone(&calls);
        let executor: BoxExecutor = Arc::new(move |_: BatchItem| {
            counter.fetch_add(1, Ordering::SeqCst);
            let fire = fire.clone();
            async move {
                fire.cancel();
                Err::<DeployReceipt, _>(DeployFailure::network("rpc unreachable"))
            }
        });
        let orchestrator = DeploymentOrchestrator::new(executor, config(true));

        let started = tokio::time::Instant::now();
        let result = orchestrator
            .deploy("batch", &artifacts(), Some(token))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(1_000));
        assert!(result.cancelled);
        assert_eq!(
            result.result("contracts/token/Cargo.toml").map(|r| r.status),
            Some(ItemStatus::Failed)
        );
        assert_eq!(
            result.result("contracts/nft/Cargo.toml").map(|r| r.status),
            Some(ItemStatus::Cancelled)
        );

        let history = orchestrator.coordinator().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RetryStatus::Cancelled);
        assert_eq!(history[0].attempts.len(), 1);
    }
}
