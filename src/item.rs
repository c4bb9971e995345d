use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// A unit of work handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub name: String,
    pub contract_dir: String,
    /// Ids of other items in the same batch that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl BatchItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, contract_dir: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            contract_dir: contract_dir.into(),
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// Failure category reported by the executor. The coordinator only reads it
/// to decide whether another attempt is worth making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimited,
    /// Malformed input, missing artifact.
    Validation,
    /// Authorization failure, invalid binary, rejected transaction.
    Execution,
    Unknown,
}

impl ErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct DeployFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl DeployFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// What a successful deployment hands back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReceipt {
    pub contract_id: Option<String>,
    pub transaction_hash: Option<String>,
}

impl DeployReceipt {
    pub fn new(contract_id: impl Into<String>, transaction_hash: impl Into<String>) -> Self {
        Self {
            contract_id: Some(contract_id.into()),
            transaction_hash: Some(transaction_hash.into()),
        }
    }
}

pub type ExecutionOutcome = Result<DeployReceipt, DeployFailure>;

/// The build/deploy operation for a single item, supplied by the caller.
#[async_trait]
pub trait ItemExecutor: Send + Sync {
    async fn execute(&self, item: &BatchItem) -> ExecutionOutcome;
}

#[async_trait]
impl<F, Fut> ItemExecutor for F
where
    F: Fn(BatchItem) -> Fut + Send + Sync,
    Fut: Future<Output = ExecutionOutcome> + Send + 'static,
{
    async fn execute(&self, item: &BatchItem) -> ExecutionOutcome {
        (self)(item.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether a dependent may treat this status as a blocked dependency.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, Self::Failed | Self::Skipped | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: String,
    pub status: ItemStatus,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub contract_id: Option<String>,
    pub transaction_hash: Option<String>,
}

impl ItemResult {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ItemStatus::Pending,
            error: None,
            error_kind: None,
            contract_id: None,
            transaction_hash: None,
        }
    }

    /// Moves to `next` if the lifecycle allows it. Terminal states never change.
    pub fn transition(&mut self, next: ItemStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Records an executor outcome on a running item.
    pub fn complete(&mut self, outcome: ExecutionOutcome) -> bool {
        match outcome {
            Ok(receipt) => {
                if !self.transition(ItemStatus::Succeeded) {
                    return false;
                }
                self.contract_id = receipt.contract_id;
                self.transaction_hash = receipt.transaction_hash;
            }
            Err(failure) => {
                if !self.transition(ItemStatus::Failed) {
                    return false;
                }
                self.error = Some(failure.message);
                self.error_kind = Some(failure.kind);
            }
        }
        true
    }
}
