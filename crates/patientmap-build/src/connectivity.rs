//! Connectivity metrics for a patient's subgraph.
//!
//! BFS from the patient over the undirected subgraph, bounded by
//! `max_depth` hops. Orphans are counted store-wide and never removed.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use patientmap_core::NodeKind;
use patientmap_graph::{GraphError, GraphReader, ReadOnlyGraph};

use crate::error::{BuildError, Result};
use crate::graph::PatientGraph;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectivityReport {
    pub patient_id: String,
    /// Mean hop distance from the patient over reachable non-patient nodes.
    pub avg_path_depth: f64,
    pub max_path_depth: usize,
    pub orphaned_node_count: usize,
    pub reachable_nodes: usize,
    pub reachable_by_kind: BTreeMap<NodeKind, usize>,
    pub insights: Vec<String>,
}

/// Hop distances from `start` to every node within `max_depth`, excluding `start`.
pub fn depths_from(graph: &PatientGraph, start: usize, max_depth: usize) -> Vec<(usize, usize)> {
    let mut visited = vec![false; graph.node_count()];
    visited[start] = true;

    let mut reached = Vec::new();
    let mut queue: VecDeque<(usize, usize)> = VecDeque::new();
    queue.push_back((start, 0));

    while let Some((node, hops)) = queue.pop_front() {
        if hops > 0 {
            reached.push((node, hops));
        }
        if hops >= max_depth {
            continue;
        }
        for &next in &graph.adjacency[node] {
            if !visited[next] {
                visited[next] = true;
                queue.push_back((next, hops + 1));
            }
        }
    }

    reached
}

/// Build the report from a traversal. Pure: no store access.
pub fn summarize(
    patient_id: &str,
    graph: &PatientGraph,
    max_depth: usize,
    orphaned_node_count: usize,
) -> ConnectivityReport {
    let reached = match graph.index_of(NodeKind::Patient, patient_id) {
        Some(start) => depths_from(graph, start, max_depth),
        None => Vec::new(),
    };

    let mut reachable_by_kind: BTreeMap<NodeKind, usize> = BTreeMap::new();
    for (index, _) in &reached {
        *reachable_by_kind
            .entry(graph.nodes[*index].key.kind)
            .or_insert(0) += 1;
    }

    let max_path_depth = reached.iter().map(|(_, d)| *d).max().unwrap_or(0);
    let avg_path_depth = if reached.is_empty() {
        0.0
    } else {
        reached.iter().map(|(_, d)| *d as f64).sum::<f64>() / reached.len() as f64
    };

    let conditions = reachable_by_kind.get(&NodeKind::Condition).copied().unwrap_or(0);
    let articles = reachable_by_kind
        .get(&NodeKind::ResearchArticle)
        .copied()
        .unwrap_or(0);

    let mut insights = Vec::new();
    if conditions == 0 {
        insights.push("No medical conditions linked to patient yet".to_string());
    }
    if articles == 0 {
        insights.push("No research articles linked to patient yet".to_string());
    }
    if conditions > 0 && articles == 0 {
        insights.push("Patient has conditions but no related research linked".to_string());
    }

    ConnectivityReport {
        patient_id: patient_id.to_string(),
        avg_path_depth,
        max_path_depth,
        orphaned_node_count,
        reachable_nodes: reached.len(),
        reachable_by_kind,
        insights,
    }
}

/// Computes [`ConnectivityReport`]s from current store state.
pub struct ConnectivityAnalyzer<S: ?Sized> {
    graph: ReadOnlyGraph<S>,
    max_depth: usize,
    timeout: Duration,
}

impl<S: GraphReader + ?Sized> ConnectivityAnalyzer<S> {
    pub fn new(graph: ReadOnlyGraph<S>, max_depth: usize, timeout: Duration) -> Self {
        Self {
            graph,
            max_depth,
            timeout,
        }
    }

    pub async fn analyze(&self, patient_id: &str) -> Result<ConnectivityReport> {
        let subgraph = self.read(self.graph.patient_subgraph(patient_id)).await?;
        let orphans = self.read(self.graph.find_orphans()).await?;

        let graph = PatientGraph::from_subgraph(&subgraph);
        let report = summarize(patient_id, &graph, self.max_depth, orphans.len());

        tracing::info!(
            patient_id,
            reachable = report.reachable_nodes,
            avg_depth = report.avg_path_depth,
            max_depth = report.max_path_depth,
            orphans = report.orphaned_node_count,
            "Analyzed graph connectivity"
        );
        Ok(report)
    }

    async fn read<T>(&self, fut: impl Future<Output = std::result::Result<T, GraphError>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BuildError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}
