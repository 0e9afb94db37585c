//! End-to-end tests for the build/validate loop over the in-memory store.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use patientmap_core::{
    BuildConfig, Condition, Medication, NodeKey, NodeKind, NodeSpec, Patient, RelationshipKey,
    RelationshipKind, RelationshipSpec, Relevance, ResearchArticle, StudiesLink,
};
use patientmap_graph::{
    EdgeRecord, EntityOverview, GraphError, GraphReader, GraphSummary, GraphWriter,
    InMemoryGraphStore, NodeRecord, PatientListing, ReadOnlyGraph, RelatedArticle, Subgraph,
    UpsertOutcome,
};

use patientmap_build::{
    AbortHandle, BuildError, BuildInput, BuildOutcome, BuilderLoop, BulkMutationEngine, ConnectivityAnalyzer,
    ExhaustReason, Expectations, Gap, ItemError, ItemOutcome, ItemRef, OperationPolicy, Termination,
    ValidationChecker,
};

// ── Fixtures ─────────────────────────────────────────────────────

fn config(max_iterations: u32, batch_size: usize) -> BuildConfig {
    BuildConfig {
        max_iterations,
        batch_size,
        op_timeout_ms: 1_000,
        retry_backoff_ms: 1,
        ..BuildConfig::default()
    }
}

fn scenario_input() -> BuildInput {
    BuildInput::new(Patient {
        id: "p1".to_string(),
        name: Some("Ada Lovelace".to_string()),
    })
    .node(Condition {
        id: "cond_diabetes".to_string(),
        label: Some("Type 2 Diabetes".to_string()),
        icd_code: Some("E11".to_string()),
        symptoms: Some(vec!["thirst".to_string(), "fatigue".to_string()]),
    })
    .node(Medication {
        id: "med_metformin".to_string(),
        label: Some("Metformin".to_string()),
        dosage: Some("500mg".to_string()),
        frequency: Some("twice daily".to_string()),
        ..Default::default()
    })
    .relationship(RelationshipSpec::has_condition("p1", "cond_diabetes"))
    .relationship(RelationshipSpec::takes_medication("p1", "med_metformin"))
}

fn article_input(confidence: f64) -> BuildInput {
    BuildInput::enrichment(
        "p1",
        vec![ResearchArticle {
            id: "art_001".to_string(),
            title: Some("Metformin in early type 2 diabetes".to_string()),
            authors: Some(vec!["Smith J".to_string()]),
            url: Some("https://example.org/art_001".to_string()),
            ..Default::default()
        }
        .into()],
        vec![StudiesLink {
            article_id: "art_001".to_string(),
            condition_id: "cond_diabetes".to_string(),
            relevance: Some(Relevance::Treatment),
            confidence: Some(confidence),
        }
        .into()],
    )
}

fn consume(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// A patient whose medication is never supplied, so one edge always dangles.
fn stalling_input(patient: &str) -> BuildInput {
    let condition = format!("{patient}_c1");
    BuildInput::new(NodeSpec::new(NodeKind::Patient, patient))
        .node(NodeSpec::new(NodeKind::Condition, &condition))
        .relationship(RelationshipSpec::has_condition(patient, &condition))
        .relationship(RelationshipSpec::takes_medication(patient, "med_never_supplied"))
}

fn progress(outcome: &BuildOutcome) -> Vec<bool> {
    outcome.iterations.iter().map(|i| i.progressed).collect()
}

/// Wraps the in-memory store to inject latency, transient failures and aborts.
#[derive(Default)]
struct Instrumented {
    inner: InMemoryGraphStore,
    write_delay: Option<Duration>,
    transient_failures: AtomicU32,
    /// Transient failures injected into relationship writes only.
    relationship_failures: AtomicU32,
    fail_reads: AtomicBool,
    abort_on_write: Mutex<Option<AbortHandle>>,
}

impl Instrumented {
    async fn before_write(&self) -> Result<(), GraphError> {
        let handle = self.abort_on_write.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        if consume(&self.transient_failures) {
            return Err(GraphError::Connection("connection reset".to_string()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), GraphError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(GraphError::Connection("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphReader for Instrumented {
    async fn get_node(&self, kind: NodeKind, id: &str) -> Result<Option<NodeRecord>, GraphError> {
        self.check_read()?;
        self.inner.get_node(kind, id).await
    }

    async fn get_relationship(
        &self,
        key: &RelationshipKey,
    ) -> Result<Option<EdgeRecord>, GraphError> {
        self.check_read()?;
        self.inner.get_relationship(key).await
    }

    async fn get_entity_overview(&self, patient_id: &str) -> Result<EntityOverview, GraphError> {
        self.inner.get_entity_overview(patient_id).await
    }

    async fn export_summary(&self) -> Result<GraphSummary, GraphError> {
        self.inner.export_summary().await
    }

    async fn patient_subgraph(&self, patient_id: &str) -> Result<Subgraph, GraphError> {
        self.inner.patient_subgraph(patient_id).await
    }

    async fn find_orphans(&self) -> Result<Vec<NodeKey>, GraphError> {
        self.inner.find_orphans().await
    }

    async fn list_patients(&self) -> Result<Vec<PatientListing>, GraphError> {
        self.inner.list_patients().await
    }

    async fn find_related_research(
        &self,
        condition_id: &str,
        limit: usize,
    ) -> Result<Vec<RelatedArticle>, GraphError> {
        self.inner.find_related_research(condition_id, limit).await
    }
}

#[async_trait]
impl GraphWriter for Instrumented {
    async fn upsert_node(&self, spec: &NodeSpec) -> Result<UpsertOutcome, GraphError> {
        self.before_write().await?;
        self.inner.upsert_node(spec).await
    }

    async fn upsert_relationship(
        &self,
        spec: &RelationshipSpec,
    ) -> Result<UpsertOutcome, GraphError> {
        self.before_write().await?;
        if consume(&self.relationship_failures) {
            return Err(GraphError::Connection("connection reset".to_string()));
        }
        self.inner.upsert_relationship(spec).await
    }

    async fn delete_node(&self, kind: NodeKind, id: &str) -> Result<bool, GraphError> {
        self.inner.delete_node(kind, id).await
    }
}

// ── BulkMutationEngine ───────────────────────────────────────────

#[tokio::test]
async fn test_apply_batch_is_idempotent() {
    let store = Arc::new(InMemoryGraphStore::new());
    let engine = BulkMutationEngine::new(Arc::clone(&store), OperationPolicy::default());
    let input = scenario_input();
    let mut nodes = vec![input.patient.clone()];
    nodes.extend(input.nodes.iter().cloned());

    let first = engine.apply_batch(&nodes, &input.relationships).await;
    let summary_after_first = store.export_summary().await.unwrap();
    let second = engine.apply_batch(&nodes, &input.relationships).await;

    assert_eq!(first.created(), 5);
    assert_eq!(second.created(), 0);
    assert_eq!(second.updated(), 5);
    assert!(second.is_clean());
    assert_eq!(store.export_summary().await.unwrap(), summary_after_first);

    let items = |r: &patientmap_build::BatchResult| {
        r.statuses.iter().map(|s| s.item.clone()).collect::<Vec<_>>()
    };
    assert_eq!(items(&first), items(&second));
}

#[tokio::test]
async fn test_dangling_relationship_rejected_without_placeholder() {
    let store = Arc::new(InMemoryGraphStore::new());
    let engine = BulkMutationEngine::new(Arc::clone(&store), OperationPolicy::default());

    let result = engine
        .apply_batch(
            &[NodeSpec::new(NodeKind::Patient, "p1")],
            &[RelationshipSpec::has_condition("p1", "cond_unknown")],
        )
        .await;

    assert_eq!(result.failed(), 1);
    match &result.failures[0].error {
        ItemError::DanglingReference { missing, .. } => {
            assert_eq!(missing, &NodeKey::new(NodeKind::Condition, "cond_unknown"));
        }
        other => panic!("expected dangling reference, got {other:?}"),
    }
    let summary = store.export_summary().await.unwrap();
    assert_eq!(summary.total_nodes(), 1);
    assert_eq!(summary.total_edges(), 0);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let store = Arc::new(Instrumented {
        transient_failures: AtomicU32::new(2),
        ..Instrumented::default()
    });
    let policy = OperationPolicy {
        max_retries: 2,
        backoff: Duration::from_millis(1),
        ..OperationPolicy::default()
    };
    let engine = BulkMutationEngine::new(Arc::clone(&store), policy);

    let result = engine
        .apply_batch(&[NodeSpec::new(NodeKind::Patient, "p1")], &[])
        .await;
    assert!(result.is_clean());
    assert_eq!(result.statuses[0].outcome, ItemOutcome::Created);
}

#[tokio::test]
async fn test_exhausted_retries_become_item_failures() {
    let store = Arc::new(Instrumented {
        transient_failures: AtomicU32::new(10),
        ..Instrumented::default()
    });
    let policy = OperationPolicy {
        max_retries: 2,
        backoff: Duration::from_millis(1),
        ..OperationPolicy::default()
    };
    let engine = BulkMutationEngine::new(Arc::clone(&store), policy);

    let result = engine
        .apply_batch(
            &[
                NodeSpec::new(NodeKind::Patient, "p1"),
                NodeSpec::new(NodeKind::Condition, "c1"),
            ],
            &[],
        )
        .await;

    assert_eq!(result.failed(), 2);
    assert!(matches!(
        result.failures[0].error,
        ItemError::Store { attempts: 3, .. }
    ));
}

#[tokio::test]
async fn test_slow_store_calls_time_out() {
    let store = Arc::new(Instrumented {
        write_delay: Some(Duration::from_millis(500)),
        ..Instrumented::default()
    });
    let policy = OperationPolicy {
        timeout: Duration::from_millis(20),
        ..OperationPolicy::default()
    };
    let engine = BulkMutationEngine::new(Arc::clone(&store), policy);

    let result = engine
        .apply_batch(&[NodeSpec::new(NodeKind::Patient, "p1")], &[])
        .await;
    assert_eq!(
        result.failures[0].error,
        ItemError::Timeout { timeout_ms: 20 }
    );
}

#[tokio::test]
async fn test_read_only_handle_refuses_writes() {
    let store = Arc::new(InMemoryGraphStore::new());
    let read_only = Arc::new(ReadOnlyGraph::new(Arc::clone(&store)));
    let engine = BulkMutationEngine::new(read_only, OperationPolicy::default());

    let result = engine
        .apply_batch(&[NodeSpec::new(NodeKind::Patient, "p1")], &[])
        .await;
    assert!(matches!(
        result.failures[0].error,
        ItemError::CapabilityViolation { operation: "upsert_node" }
    ));
    assert_eq!(store.export_summary().await.unwrap().total_nodes(), 0);
}

#[tokio::test]
async fn test_second_patient_cannot_claim_owned_condition() {
    let store = Arc::new(InMemoryGraphStore::new());
    let engine = BulkMutationEngine::new(Arc::clone(&store), OperationPolicy::default());

    let result = engine
        .apply_batch(
            &[
                NodeSpec::new(NodeKind::Patient, "p1"),
                NodeSpec::new(NodeKind::Patient, "p2"),
                NodeSpec::new(NodeKind::Condition, "c1"),
            ],
            &[
                RelationshipSpec::has_condition("p1", "c1"),
                RelationshipSpec::has_condition("p2", "c1"),
            ],
        )
        .await;

    assert_eq!(result.failed(), 1);
    assert!(matches!(
        result.failures[0].error,
        ItemError::OwnershipConflict { ref owner, .. } if owner == "p1"
    ));
}

// ── ValidationChecker ────────────────────────────────────────────

#[tokio::test]
async fn test_failed_reads_make_validation_unavailable() {
    let store = Arc::new(Instrumented::default());
    store.fail_reads.store(true, Ordering::SeqCst);

    let checker = ValidationChecker::new(
        ReadOnlyGraph::new(Arc::clone(&store)),
        Expectations::from_input(&scenario_input()),
        Duration::from_millis(100),
    );
    let validation = checker.evaluate("p1").await;

    assert!(!validation.complete);
    assert!(!validation.is_conclusive());
    assert!(matches!(
        validation.reasons.last(),
        Some(Gap::ValidationUnavailable { .. })
    ));
}

// ── BuilderLoop ──────────────────────────────────────────────────

#[tokio::test]
async fn test_scenario_builds_and_resubmission_changes_nothing() {
    let store = Arc::new(InMemoryGraphStore::new());

    let outcome = BuilderLoop::new(Arc::clone(&store), scenario_input(), config(3, 100))
        .run()
        .await;
    assert_eq!(outcome.termination, Termination::Done);
    assert_eq!(outcome.iterations.len(), 1);
    assert!(outcome.remaining.is_empty());

    let summary = outcome.summary.clone().unwrap();
    assert_eq!(summary.nodes(NodeKind::Patient), 1);
    assert_eq!(summary.nodes(NodeKind::Condition), 1);
    assert_eq!(summary.nodes(NodeKind::Medication), 1);
    assert_eq!(summary.edges(RelationshipKind::HasCondition), 1);
    assert_eq!(summary.edges(RelationshipKind::TakesMedication), 1);

    let again = BuilderLoop::new(Arc::clone(&store), scenario_input(), config(3, 100))
        .run()
        .await;
    assert!(again.is_done());
    assert_eq!(again.summary.unwrap(), summary);
    assert_eq!(again.iterations[0].batch.created(), 0);
    assert_ne!(again.run_id, outcome.run_id);
}

#[tokio::test]
async fn test_resubmitted_entity_merges_attributes() {
    let store = Arc::new(InMemoryGraphStore::new());
    let input = BuildInput::new(NodeSpec::new(NodeKind::Patient, "p1"))
        .node(NodeSpec::new(NodeKind::Condition, "cond_diabetes").with("label", "Type 2 Diabetes"))
        .node(NodeSpec::new(NodeKind::Condition, "cond_diabetes").with("icd_code", "E11"))
        .relationship(RelationshipSpec::has_condition("p1", "cond_diabetes"))
        .relationship(RelationshipSpec::has_condition("p1", "cond_diabetes"));

    let outcome = BuilderLoop::new(Arc::clone(&store), input, config(3, 100))
        .run()
        .await;
    assert!(outcome.is_done());

    let record = store
        .get_node(NodeKind::Condition, "cond_diabetes")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.text("label"), Some("Type 2 Diabetes"));
    assert_eq!(record.text("icd_code"), Some("E11"));
    assert_eq!(
        store
            .export_summary()
            .await
            .unwrap()
            .edges(RelationshipKind::HasCondition),
        1
    );
}

#[tokio::test]
async fn test_research_relink_updates_confidence() {
    let store = Arc::new(InMemoryGraphStore::new());
    BuilderLoop::new(Arc::clone(&store), scenario_input(), config(3, 100))
        .run()
        .await;

    let first = BuilderLoop::new(Arc::clone(&store), article_input(0.8), config(3, 100))
        .run()
        .await;
    assert!(first.is_done());
    let second = BuilderLoop::new(Arc::clone(&store), article_input(0.95), config(3, 100))
        .run()
        .await;
    assert!(second.is_done());

    let summary = store.export_summary().await.unwrap();
    assert_eq!(summary.edges(RelationshipKind::Studies), 1);
    let edge = store
        .get_relationship(&RelationshipKey::new(
            RelationshipKind::Studies,
            "art_001",
            "cond_diabetes",
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(edge.attributes["confidence"], 0.95);
    assert_eq!(edge.attributes["relevance"], "treatment");

    // The enrichment anchor leaves patient data alone.
    let patient = store.get_node(NodeKind::Patient, "p1").await.unwrap().unwrap();
    assert_eq!(patient.text("name"), Some("Ada Lovelace"));

    let overview = store.get_entity_overview("p1").await.unwrap();
    assert_eq!(overview.research_article_count, 1);
}

#[tokio::test]
async fn test_converges_within_iteration_bound() {
    let store = Arc::new(InMemoryGraphStore::new());
    let mut input = BuildInput::new(NodeSpec::new(NodeKind::Patient, "p1"));
    for i in 0..10 {
        let id = format!("cond_{i}");
        input = input
            .node(NodeSpec::new(NodeKind::Condition, &id).with("label", format!("Condition {i}")))
            .relationship(RelationshipSpec::has_condition("p1", &id));
    }
    let batch_size = 4;
    let bound = (input.nodes.len() + input.relationships.len()).div_ceil(batch_size);
    let node_batches = input.nodes.len().div_ceil(batch_size);

    let outcome = BuilderLoop::new(Arc::clone(&store), input, config(10, batch_size))
        .run()
        .await;

    assert_eq!(outcome.termination, Termination::Done);
    assert_eq!(outcome.iterations.len(), node_batches);
    assert_eq!(node_batches, 3);
    assert!(outcome.iterations.len() <= bound);
    assert!(outcome.iterations.iter().all(|i| i.batch.is_clean()));
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.nodes(NodeKind::Condition), 10);
    assert_eq!(summary.edges(RelationshipKind::HasCondition), 10);
}

#[tokio::test]
async fn test_stalls_after_two_no_progress_iterations() {
    let store = Arc::new(InMemoryGraphStore::new());
    let input = BuildInput::new(NodeSpec::new(NodeKind::Patient, "p1"))
        .node(NodeSpec::new(NodeKind::Condition, "c1"))
        .relationship(RelationshipSpec::has_condition("p1", "c1"))
        .relationship(RelationshipSpec::takes_medication("p1", "med_never_supplied"));

    let outcome = BuilderLoop::new(Arc::clone(&store), input, config(10, 100))
        .run()
        .await;

    assert_eq!(
        outcome.termination,
        Termination::Exhausted(ExhaustReason::Stalled { iterations: 2 })
    );
    assert_eq!(outcome.iterations.len(), 3);
    assert!(outcome.iterations[0].progressed);
    assert!(!outcome.iterations[1].progressed);
    assert!(!outcome.iterations[2].progressed);
    assert!(matches!(
        outcome.exhaustion_error(),
        Some(BuildError::Stalled { iterations: 2 })
    ));

    // The dangling edge is reported, everything else is kept.
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("med_never_supplied"));
    assert_eq!(
        outcome.remaining,
        vec![Gap::MissingRelationship {
            key: RelationshipKey::new(RelationshipKind::TakesMedication, "p1", "med_never_supplied")
        }]
    );
    assert_eq!(outcome.summary.unwrap().total_nodes(), 2);
}

#[tokio::test]
async fn test_iteration_ceiling_leaves_partial_graph() {
    let store = Arc::new(InMemoryGraphStore::new());
    let input = BuildInput::new(NodeSpec::new(NodeKind::Patient, "p1"))
        .node(NodeSpec::new(NodeKind::Condition, "c1"))
        .node(NodeSpec::new(NodeKind::Condition, "c2"))
        .node(NodeSpec::new(NodeKind::Condition, "c3"));

    let outcome = BuilderLoop::new(Arc::clone(&store), input, config(2, 1))
        .run()
        .await;

    assert_eq!(
        outcome.termination,
        Termination::Exhausted(ExhaustReason::CeilingReached { max_iterations: 2 })
    );
    assert_eq!(
        outcome.remaining,
        vec![Gap::MissingNode {
            key: NodeKey::new(NodeKind::Condition, "c3")
        }]
    );
    assert_eq!(outcome.summary.unwrap().total_nodes(), 3);
}

#[tokio::test]
async fn test_malformed_items_do_not_block_the_rest() {
    let store = Arc::new(InMemoryGraphStore::new());
    let input = BuildInput::new(NodeSpec::new(NodeKind::Patient, "p1"))
        .node(NodeSpec::new(NodeKind::Condition, "c1").with("label", "Asthma"))
        .node(NodeSpec::new(NodeKind::Medication, "m1").with("dose_mg", 500));

    let outcome = BuilderLoop::new(Arc::clone(&store), input, config(5, 100))
        .run()
        .await;

    assert!(matches!(
        outcome.termination,
        Termination::Exhausted(ExhaustReason::Stalled { .. })
    ));
    assert!(matches!(
        outcome.iterations[0].batch.failures[0].error,
        ItemError::Malformed(_)
    ));
    assert!(store.get_node(NodeKind::Condition, "c1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_abort_is_honoured_between_iterations() {
    let store = Arc::new(Instrumented::default());
    let input = BuildInput::new(NodeSpec::new(NodeKind::Patient, "p1"))
        .node(NodeSpec::new(NodeKind::Condition, "c1"))
        .node(NodeSpec::new(NodeKind::Condition, "c2"))
        .relationship(RelationshipSpec::has_condition("p1", "c1"))
        .relationship(RelationshipSpec::has_condition("p1", "c2"));

    let mut builder = BuilderLoop::new(Arc::clone(&store), input, config(5, 1));
    *store.abort_on_write.lock().unwrap() = Some(builder.abort_handle());

    let outcome = builder.run().await;

    assert_eq!(outcome.termination, Termination::Aborted);
    // The abort fired mid-batch; that batch still completed.
    assert_eq!(outcome.iterations.len(), 1);
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.total_nodes(), 2);
    assert_eq!(summary.edges(RelationshipKind::HasCondition), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loops_for_different_patients() {
    let store = Arc::new(Instrumented {
        write_delay: Some(Duration::from_millis(2)),
        ..Instrumented::default()
    });

    let mut converging = Vec::new();
    for patient in ["p1", "p2"] {
        let store = Arc::clone(&store);
        converging.push(tokio::spawn(async move {
            let mut input = BuildInput::new(NodeSpec::new(NodeKind::Patient, patient));
            for i in 0..20 {
                let id = format!("{patient}_cond_{i}");
                input = input
                    .node(NodeSpec::new(NodeKind::Condition, &id))
                    .relationship(RelationshipSpec::has_condition(patient, &id));
            }
            BuilderLoop::new(store, input, config(10, 5)).run().await
        }));
    }
    let stalling = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            BuilderLoop::new(store, stalling_input("p3"), config(10, 5))
                .run()
                .await
        })
    };

    for handle in converging {
        let outcome = handle.await.unwrap();
        assert!(outcome.is_done(), "{} ended {}", outcome.patient_id, outcome.termination);
        // 20 conditions in batches of 5.
        assert_eq!(outcome.iterations.len(), 4, "{}", outcome.patient_id);
        assert!(outcome.iterations.iter().all(|i| i.progressed));
    }

    let stalled = stalling.await.unwrap();
    assert_eq!(
        stalled.termination,
        Termination::Exhausted(ExhaustReason::Stalled { iterations: 2 })
    );
    assert_eq!(progress(&stalled), vec![true, false, false]);

    let summary = store.export_summary().await.unwrap();
    assert_eq!(summary.nodes(NodeKind::Patient), 3);
    assert_eq!(summary.nodes(NodeKind::Condition), 41);
    assert_eq!(summary.edges(RelationshipKind::HasCondition), 41);
    assert_eq!(summary.edges(RelationshipKind::TakesMedication), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stall_ignores_other_writers_on_shared_store() {
    let store = Arc::new(Instrumented {
        write_delay: Some(Duration::from_millis(20)),
        ..Instrumented::default()
    });
    let stop = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut written = 0u32;
            while !stop.load(Ordering::SeqCst) {
                let spec = NodeSpec::new(NodeKind::Patient, format!("other_{written}"));
                store.inner.upsert_node(&spec).await.unwrap();
                written += 1;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            written
        })
    };

    let outcome = BuilderLoop::new(Arc::clone(&store), stalling_input("p1"), config(8, 100))
        .run()
        .await;
    stop.store(true, Ordering::SeqCst);
    let written = writer.await.unwrap();

    assert!(written > 0);
    assert_eq!(
        outcome.termination,
        Termination::Exhausted(ExhaustReason::Stalled { iterations: 2 })
    );
    assert_eq!(outcome.iterations.len(), 3);
    assert_eq!(progress(&outcome), vec![true, false, false]);
}

#[tokio::test]
async fn test_failed_relink_is_retried_before_done() {
    let store = Arc::new(Instrumented::default());
    BuilderLoop::new(Arc::clone(&store), scenario_input(), config(3, 100))
        .run()
        .await;
    BuilderLoop::new(Arc::clone(&store), article_input(0.9), config(3, 100))
        .run()
        .await;

    // One call plus two retries, all refused.
    store.relationship_failures.store(3, Ordering::SeqCst);
    let outcome = BuilderLoop::new(Arc::clone(&store), article_input(0.95), config(3, 100))
        .run()
        .await;

    assert_eq!(outcome.termination, Termination::Done);
    assert_eq!(outcome.iterations.len(), 2);
    let first = &outcome.iterations[0];
    assert!(first.validation.complete);
    assert!(matches!(
        first.batch.failures[0].error,
        ItemError::Store { attempts: 3, .. }
    ));
    let second = &outcome.iterations[1];
    assert!(second.batch.is_clean());
    assert_eq!(second.batch.statuses.len(), 1);
    assert!(outcome.unapplied.is_empty());

    let edge = store
        .get_relationship(&RelationshipKey::new(
            RelationshipKind::Studies,
            "art_001",
            "cond_diabetes",
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(edge.attributes["confidence"], 0.95);
}

#[tokio::test]
async fn test_relink_that_keeps_failing_ends_exhausted() {
    let store = Arc::new(Instrumented::default());
    BuilderLoop::new(Arc::clone(&store), scenario_input(), config(3, 100))
        .run()
        .await;
    BuilderLoop::new(Arc::clone(&store), article_input(0.9), config(3, 100))
        .run()
        .await;

    store.relationship_failures.store(u32::MAX, Ordering::SeqCst);
    let outcome = BuilderLoop::new(Arc::clone(&store), article_input(0.95), config(5, 100))
        .run()
        .await;

    assert_eq!(
        outcome.termination,
        Termination::Exhausted(ExhaustReason::Stalled { iterations: 2 })
    );
    assert!(outcome.remaining.is_empty());
    let studies = RelationshipKey::new(RelationshipKind::Studies, "art_001", "cond_diabetes");
    assert_eq!(outcome.unapplied, vec![ItemRef::Relationship(studies.clone())]);

    let edge = store.get_relationship(&studies).await.unwrap().unwrap();
    assert_eq!(edge.attributes["confidence"], 0.9);
}

#[tokio::test]
async fn test_deferred_updates_are_applied_before_done() {
    let store = Arc::new(InMemoryGraphStore::new());
    BuilderLoop::new(Arc::clone(&store), scenario_input(), config(3, 100))
        .run()
        .await;

    // Every entity already exists, so validation is complete after the
    // first batch even though the medication update has not been sent.
    let input = BuildInput::new(NodeSpec::new(NodeKind::Patient, "p1"))
        .node(NodeSpec::new(NodeKind::Condition, "cond_diabetes").with("icd_code", "E11.9"))
        .node(NodeSpec::new(NodeKind::Medication, "med_metformin").with("dosage", "850mg"))
        .relationship(RelationshipSpec::has_condition("p1", "cond_diabetes"))
        .relationship(RelationshipSpec::takes_medication("p1", "med_metformin"));

    let outcome = BuilderLoop::new(Arc::clone(&store), input, config(5, 1))
        .run()
        .await;

    assert_eq!(outcome.termination, Termination::Done);
    assert_eq!(outcome.iterations.len(), 2);
    assert!(outcome.iterations[0].validation.complete);
    assert_eq!(progress(&outcome), vec![true, true]);

    let medication = store
        .get_node(NodeKind::Medication, "med_metformin")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(medication.text("dosage"), Some("850mg"));
    assert_eq!(medication.text("label"), Some("Metformin"));
    let condition = store
        .get_node(NodeKind::Condition, "cond_diabetes")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(condition.text("icd_code"), Some("E11.9"));
}

// ── ConnectivityAnalyzer ─────────────────────────────────────────

#[tokio::test]
async fn test_connectivity_after_enrichment() {
    let store = Arc::new(InMemoryGraphStore::new());
    BuilderLoop::new(Arc::clone(&store), scenario_input(), config(3, 100))
        .run()
        .await;

    let analyzer = ConnectivityAnalyzer::new(
        ReadOnlyGraph::new(Arc::clone(&store)),
        3,
        Duration::from_secs(1),
    );
    let before = analyzer.analyze("p1").await.unwrap();
    assert!(before
        .insights
        .iter()
        .any(|i| i == "Patient has conditions but no related research linked"));

    BuilderLoop::new(Arc::clone(&store), article_input(0.9), config(3, 100))
        .run()
        .await;
    let after = analyzer.analyze("p1").await.unwrap();

    assert_eq!(after.reachable_nodes, 3);
    assert_eq!(after.max_path_depth, 2);
    assert_eq!(after.orphaned_node_count, 0);
    assert!(after.insights.is_empty());

    let json = serde_json::to_value(&after).unwrap();
    assert_eq!(json["reachable_by_kind"]["ResearchArticle"], 1);
}
