//! The bounded build/validate loop.
//!
//! Each iteration plans a batch, submits it through the
//! [`BulkMutationEngine`], then asks the [`ValidationChecker`] what is still
//! missing. Items deferred by the batch size and items whose write failed
//! transiently stay pending alongside the validation gaps. The loop ends when
//! the graph is complete and nothing is pending (`Done`), when progress
//! stalls or the iteration ceiling is reached (`Exhausted`), or when an abort
//! is requested between iterations (`Aborted`). Committed graph state is
//! never rolled back.
//!
//! Progress is judged by this loop's own work: an iteration progresses when
//! its batch created a node or edge, or when its pending work shrank. Writes
//! by other loops sharing the store never count.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use patientmap_core::{BuildConfig, NodeKey, NodeSpec, RelationshipKey, RelationshipSpec};
use patientmap_graph::{GraphReader, GraphSummary, GraphWriter, ReadOnlyGraph};

use crate::bulk::{BatchResult, BulkMutationEngine, ItemRef, OperationPolicy};
use crate::checker::{Expectations, Gap, Validation, ValidationChecker};
use crate::error::{BuildError, ItemError};
use crate::input::BuildInput;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Planning,
    Submitting,
    AwaitingValidation,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    /// `iterations` consecutive iterations changed no node or edge count.
    Stalled { iterations: u32 },
    CeilingReached { max_iterations: u32 },
}

/// How a run ended. `Exhausted` is a partial success, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Done,
    Exhausted(ExhaustReason),
    Aborted,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => f.write_str("done"),
            Self::Exhausted(ExhaustReason::Stalled { .. }) => f.write_str("exhausted (stalled)"),
            Self::Exhausted(ExhaustReason::CeilingReached { .. }) => {
                f.write_str("exhausted (iteration ceiling)")
            }
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Requests that a running loop stop before its next iteration.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u32,
    pub batch: BatchResult,
    /// This batch created something, or the loop's pending work shrank.
    pub progressed: bool,
    pub validation: Validation,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub run_id: Uuid,
    pub patient_id: String,
    pub termination: Termination,
    pub iterations: Vec<IterationReport>,
    /// Gaps named by the last validation. Empty when `Done`.
    pub remaining: Vec<Gap>,
    /// Input items not yet applied when the loop ended: deferred by the batch
    /// size, or failed and awaiting retry. Empty when `Done`.
    pub unapplied: Vec<ItemRef>,
    /// Relationships dropped because an endpoint did not exist.
    pub warnings: Vec<String>,
    pub summary: Option<GraphSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BuildOutcome {
    pub fn is_done(&self) -> bool {
        self.termination == Termination::Done
    }

    /// The loop-level condition behind an `Exhausted` termination.
    pub fn exhaustion_error(&self) -> Option<BuildError> {
        match self.termination {
            Termination::Exhausted(ExhaustReason::Stalled { iterations }) => {
                Some(BuildError::Stalled { iterations })
            }
            Termination::Exhausted(ExhaustReason::CeilingReached { max_iterations }) => {
                Some(BuildError::CeilingReached { max_iterations })
            }
            _ => None,
        }
    }
}

/// Input items still to be submitted.
#[derive(Debug, Clone, Default)]
struct Pending {
    patient: bool,
    nodes: Vec<NodeSpec>,
    relationships: Vec<RelationshipSpec>,
}

impl Pending {
    fn everything(input: &BuildInput) -> Self {
        Self {
            patient: true,
            nodes: input.nodes.clone(),
            relationships: input.relationships.clone(),
        }
    }

    /// Work for the next iteration: what this batch deferred, what failed
    /// in a way worth retrying, and what the validation named as missing.
    /// An inconclusive validation resubmits everything; merges make that safe.
    fn after(
        input: &BuildInput,
        deferred: Pending,
        batch: &BatchResult,
        validation: &Validation,
    ) -> Self {
        if !validation.is_conclusive() {
            return Self::everything(input);
        }

        let patient_key = input.patient.key();
        let mut patient = deferred.patient;
        let mut nodes: HashSet<NodeKey> = deferred.nodes.iter().map(NodeSpec::key).collect();
        let mut relationships: HashSet<RelationshipKey> =
            deferred.relationships.iter().map(RelationshipSpec::key).collect();

        for failure in batch.failures.iter().filter(|f| f.error.is_retryable()) {
            match &failure.item {
                ItemRef::Node(key) if *key == patient_key => patient = true,
                ItemRef::Node(key) => {
                    nodes.insert(key.clone());
                }
                ItemRef::Relationship(key) => {
                    relationships.insert(key.clone());
                }
            }
        }

        for gap in &validation.reasons {
            match gap {
                Gap::MissingPatient { .. } => patient = true,
                Gap::MissingNode { key } => {
                    nodes.insert(key.clone());
                }
                Gap::MissingRelationship { key } => {
                    relationships.insert(key.clone());
                }
                Gap::ValidationUnavailable { .. } => {}
            }
        }

        Self {
            patient,
            nodes: input
                .nodes
                .iter()
                .filter(|s| nodes.contains(&s.key()))
                .cloned()
                .collect(),
            relationships: input
                .relationships
                .iter()
                .filter(|s| relationships.contains(&s.key()))
                .cloned()
                .collect(),
        }
    }

    fn len(&self) -> usize {
        usize::from(self.patient) + self.nodes.len() + self.relationships.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn items(&self, input: &BuildInput) -> Vec<ItemRef> {
        let patient = self.patient.then(|| ItemRef::Node(input.patient.key()));
        patient
            .into_iter()
            .chain(self.nodes.iter().map(|s| ItemRef::Node(s.key())))
            .chain(self.relationships.iter().map(|s| ItemRef::Relationship(s.key())))
            .collect()
    }
}

/// Drives the mutate/validate cycle for one patient.
pub struct BuilderLoop<S: ?Sized> {
    engine: BulkMutationEngine<S>,
    checker: ValidationChecker<S>,
    reader: ReadOnlyGraph<S>,
    input: BuildInput,
    config: BuildConfig,
    abort: AbortHandle,
    phase: LoopPhase,
}

impl<S: GraphWriter + ?Sized> BuilderLoop<S> {
    pub fn new(store: Arc<S>, input: BuildInput, config: BuildConfig) -> Self {
        let policy = OperationPolicy::from_config(&config);
        let reader = ReadOnlyGraph::new(Arc::clone(&store));
        let checker = ValidationChecker::new(
            reader.clone(),
            Expectations::from_input(&input),
            policy.timeout,
        );
        Self {
            engine: BulkMutationEngine::new(store, policy),
            checker,
            reader,
            input,
            config,
            abort: AbortHandle::default(),
            phase: LoopPhase::Planning,
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Run until `Done`, `Exhausted` or `Aborted`.
    pub async fn run(&mut self) -> BuildOutcome {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let patient_id = self.input.patient_id().to_string();
        let max_iterations = self.config.max_iterations;

        tracing::info!(
            %run_id,
            %patient_id,
            nodes = self.input.nodes.len(),
            relationships = self.input.relationships.len(),
            max_iterations,
            batch_size = self.config.batch_size,
            "Starting build loop"
        );

        let mut pending = Pending::everything(&self.input);
        let mut iterations: Vec<IterationReport> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut stalled_for: u32 = 0;
        let mut termination = None;

        for iteration in 1..=max_iterations {
            if self.abort.is_aborted() {
                tracing::warn!(%run_id, iteration, "Build loop aborted");
                termination = Some(Termination::Aborted);
                break;
            }

            self.phase = LoopPhase::Planning;
            let submitted = pending.len();
            let Plan {
                nodes,
                relationships,
                deferred,
            } = plan(std::mem::take(&mut pending), &self.input, self.config.batch_size);

            self.phase = LoopPhase::Submitting;
            let batch = self.engine.apply_batch(&nodes, &relationships).await;

            for failure in batch.dangling() {
                if let (ItemRef::Relationship(key), ItemError::DanglingReference { missing, .. }) =
                    (&failure.item, &failure.error)
                {
                    let warning = format!("{key} dropped: {missing} does not exist");
                    if !warnings.contains(&warning) {
                        warnings.push(warning);
                    }
                }
            }

            self.phase = LoopPhase::AwaitingValidation;
            let validation = self.checker.evaluate(&patient_id).await;

            pending = Pending::after(&self.input, deferred, &batch, &validation);
            let progressed = batch.created() > 0 || pending.len() < submitted;
            let complete = validation.complete && pending.is_empty();

            tracing::info!(
                %run_id,
                iteration,
                planned_nodes = nodes.len(),
                planned_relationships = relationships.len(),
                created = batch.created(),
                updated = batch.updated(),
                failed = batch.failed(),
                pending = pending.len(),
                progressed,
                gaps = validation.reasons.len(),
                "Build iteration finished"
            );

            iterations.push(IterationReport {
                iteration,
                batch,
                progressed,
                validation,
            });

            if complete {
                termination = Some(Termination::Done);
                break;
            }

            stalled_for = if progressed { 0 } else { stalled_for + 1 };
            if stalled_for >= self.config.stall_threshold {
                tracing::warn!(%run_id, iteration, stalled_for, "Build loop stalled");
                termination = Some(Termination::Exhausted(ExhaustReason::Stalled {
                    iterations: stalled_for,
                }));
                break;
            }
        }

        let termination = termination.unwrap_or(Termination::Exhausted(
            ExhaustReason::CeilingReached { max_iterations },
        ));
        self.phase = LoopPhase::Terminal;

        let remaining = match (termination, iterations.last()) {
            (Termination::Done, _) | (_, None) => Vec::new(),
            (_, Some(last)) => last.validation.reasons.clone(),
        };
        let unapplied = match termination {
            Termination::Done => Vec::new(),
            _ => pending.items(&self.input),
        };
        let summary = self.summary().await;

        tracing::info!(
            %run_id,
            %patient_id,
            %termination,
            iterations = iterations.len(),
            remaining = remaining.len(),
            warnings = warnings.len(),
            "Build loop finished"
        );

        BuildOutcome {
            run_id,
            patient_id,
            termination,
            iterations,
            remaining,
            unapplied,
            warnings,
            summary,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn summary(&self) -> Option<GraphSummary> {
        let timeout = self.engine.policy().timeout;
        match tokio::time::timeout(timeout, self.reader.export_summary()).await {
            Ok(Ok(summary)) => Some(summary),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "Failed to read graph summary");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_ms = timeout_ms(timeout), "Graph summary read timed out");
                None
            }
        }
    }
}

fn timeout_ms(timeout: Duration) -> u64 {
    timeout.as_millis() as u64
}

/// One iteration's batch and the pending items left for later iterations.
struct Plan {
    nodes: Vec<NodeSpec>,
    relationships: Vec<RelationshipSpec>,
    deferred: Pending,
}

/// Choose this iteration's batch.
///
/// Up to `batch_size` pending node specs in input order, plus the patient
/// anchor when it is missing. A relationship joins once none of its
/// endpoints is a pending node left out of this batch.
fn plan(pending: Pending, input: &BuildInput, batch_size: usize) -> Plan {
    let batch_size = batch_size.max(1);
    let mut nodes: Vec<NodeSpec> = Vec::with_capacity(batch_size + 1);
    if pending.patient {
        nodes.push(input.patient.clone());
    }

    let mut pending_nodes = pending.nodes;
    let split = batch_size.min(pending_nodes.len());
    let deferred_nodes = pending_nodes.split_off(split);
    nodes.extend(pending_nodes);

    let in_batch: HashSet<NodeKey> = nodes.iter().map(NodeSpec::key).collect();
    let blocked: HashSet<NodeKey> = deferred_nodes
        .iter()
        .map(NodeSpec::key)
        .filter(|key| !in_batch.contains(key))
        .collect();

    let (relationships, deferred_relationships): (Vec<_>, Vec<_>) =
        pending.relationships.into_iter().partition(|spec| {
            let key = spec.key();
            !blocked.contains(&key.from_key()) && !blocked.contains(&key.to_key())
        });

    Plan {
        nodes,
        relationships,
        deferred: Pending {
            patient: false,
            nodes: deferred_nodes,
            relationships: deferred_relationships,
        },
    }
}
