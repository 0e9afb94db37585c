//! Batch application of node and relationship specs.
//!
//! Nodes in a batch are applied before any relationship, so relationships may
//! reference nodes created earlier in the same batch. Item failures are
//! recorded and never abort the rest of the batch.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use patientmap_core::{BuildConfig, NodeKey, NodeSpec, RelationshipKey, RelationshipSpec};
use patientmap_graph::{GraphError, GraphWriter, UpsertOutcome};

use crate::error::ItemError;

/// Bounds applied to every individual store call.
#[derive(Debug, Clone)]
pub struct OperationPolicy {
    pub timeout: Duration,
    /// Retries after the first attempt, for transient errors only.
    pub max_retries: u32,
    /// Linear backoff step: the n-th retry waits `n * backoff`.
    pub backoff: Duration,
}

impl OperationPolicy {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.op_timeout_ms),
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl Default for OperationPolicy {
    fn default() -> Self {
        Self::from_config(&BuildConfig::default())
    }
}

/// The item an outcome refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ItemRef {
    Node(NodeKey),
    Relationship(RelationshipKey),
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(key) => write!(f, "{key}"),
            Self::Relationship(key) => write!(f, "{key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    Created,
    Updated,
    Failed,
}

impl From<UpsertOutcome> for ItemOutcome {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Created => Self::Created,
            UpsertOutcome::Updated => Self::Updated,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemStatus {
    pub item: ItemRef,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub item: ItemRef,
    pub error: ItemError,
}

/// Per-item outcome of one [`BulkMutationEngine::apply_batch`] call.
///
/// `statuses` is in application order (all nodes, then all relationships).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    pub statuses: Vec<ItemStatus>,
    pub failures: Vec<BatchFailure>,
}

impl BatchResult {
    fn count(&self, outcome: ItemOutcome) -> usize {
        self.statuses.iter().filter(|s| s.outcome == outcome).count()
    }

    pub fn created(&self) -> usize {
        self.count(ItemOutcome::Created)
    }

    pub fn updated(&self) -> usize {
        self.count(ItemOutcome::Updated)
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures caused by a missing relationship endpoint.
    pub fn dangling(&self) -> impl Iterator<Item = &BatchFailure> {
        self.failures.iter().filter(|f| f.error.is_dangling())
    }

    fn record(&mut self, item: ItemRef, result: Result<UpsertOutcome, ItemError>) {
        match result {
            Ok(outcome) => self.statuses.push(ItemStatus {
                item,
                outcome: outcome.into(),
            }),
            Err(error) => {
                if error.is_dangling() {
                    tracing::warn!(item = %item, %error, "Dropped relationship with dangling reference");
                } else {
                    tracing::warn!(item = %item, %error, "Batch item failed");
                }
                self.statuses.push(ItemStatus {
                    item: item.clone(),
                    outcome: ItemOutcome::Failed,
                });
                self.failures.push(BatchFailure { item, error });
            }
        }
    }
}

/// Applies batches to a [`GraphWriter`] with merge semantics.
pub struct BulkMutationEngine<S: ?Sized> {
    store: Arc<S>,
    policy: OperationPolicy,
}

impl<S: GraphWriter + ?Sized> BulkMutationEngine<S> {
    pub fn new(store: Arc<S>, policy: OperationPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &OperationPolicy {
        &self.policy
    }

    /// Apply every node, then every relationship. Best-effort: failures are
    /// reported per item and the remaining items are still applied.
    pub async fn apply_batch(
        &self,
        nodes: &[NodeSpec],
        relationships: &[RelationshipSpec],
    ) -> BatchResult {
        let mut result = BatchResult::default();

        for spec in nodes {
            let outcome = self.bounded(|| self.store.upsert_node(spec)).await;
            result.record(ItemRef::Node(spec.key()), outcome);
        }

        for spec in relationships {
            let outcome = self.bounded(|| self.store.upsert_relationship(spec)).await;
            result.record(ItemRef::Relationship(spec.key()), outcome);
        }

        tracing::debug!(
            nodes = nodes.len(),
            relationships = relationships.len(),
            created = result.created(),
            updated = result.updated(),
            failed = result.failed(),
            "Applied batch"
        );
        result
    }

    /// Run one store call under the timeout, retrying transient errors.
    async fn bounded<F, Fut>(&self, mut op: F) -> Result<UpsertOutcome, ItemError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<UpsertOutcome, GraphError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(self.policy.timeout, op()).await {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(err)) if err.is_transient() && attempt <= self.policy.max_retries => {
                    tracing::debug!(attempt, error = %err, "Transient store error, retrying");
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                }
                Ok(Err(err)) => return Err(ItemError::from_graph(err, attempt)),
                Err(_) => {
                    return Err(ItemError::Timeout {
                        timeout_ms: self.policy.timeout.as_millis() as u64,
                    })
                }
            }
        }
    }
}
