pub mod artifact;
pub mod config;
pub mod cycle_check;
pub mod graph;
pub mod item;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;

pub use artifact::{ArtifactDescriptor, DependencySource, DependencySpec};
pub use config::OrchestratorConfig;
pub use cycle_check::{find_cycles, has_cycle};
pub use graph::{DependencyEdge, DependencyGraph, DependencyGraphResolver, EdgeReason};
pub use item::{
    BatchItem, DeployFailure, DeployReceipt, ErrorKind, ExecutionOutcome, ItemExecutor, ItemResult,
    ItemStatus,
};
pub use orchestrator::DeploymentOrchestrator;
pub use retry::{
    ListenerGuard, RetryAttempt, RetryCoordinator, RetryPolicy, RetryRequest, RetrySession,
    RetryStatus,
};
pub use scheduler::{BatchRequest, BatchRunResult, BatchScheduler, ExecutionMode, RetryingExecutor};

use std::sync::Arc;
use thiserror::Error;

pub type BoxExecutor = Arc<dyn ItemExecutor>;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Circular dependency detected: {}", format_cycles(.cycles))]
    CircularDependency { cycles: Vec<Vec<String>> },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| cycle.join(" -> "))
        .collect::<Vec<_>>()
        .join("; ")
}
