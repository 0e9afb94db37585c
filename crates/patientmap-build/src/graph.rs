//! In-memory adjacency view of a patient subgraph for traversal.
//!
//! Edges are stored in both directions: connectivity is measured as
//! undirected hop distance.

use std::collections::HashMap;

use patientmap_core::{NodeKey, NodeKind};
use patientmap_graph::Subgraph;

/// Compact node metadata.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Dense index (0..N-1).
    pub index: usize,
    pub key: NodeKey,
}

pub struct PatientGraph {
    pub nodes: Vec<GraphNode>,
    /// `adjacency[i]` = neighbour indices of node `i`.
    pub adjacency: Vec<Vec<usize>>,
    pub node_index: HashMap<NodeKey, usize>,
}

impl PatientGraph {
    pub fn from_subgraph(subgraph: &Subgraph) -> Self {
        let mut node_index = HashMap::with_capacity(subgraph.nodes.len());
        let mut nodes = Vec::with_capacity(subgraph.nodes.len());

        for record in &subgraph.nodes {
            let key = record.key();
            if node_index.contains_key(&key) {
                continue;
            }
            let index = nodes.len();
            node_index.insert(key.clone(), index);
            nodes.push(GraphNode { index, key });
        }

        let mut adjacency = vec![Vec::new(); nodes.len()];
        for edge in &subgraph.edges {
            let key = edge.key();
            if let (Some(&a), Some(&b)) = (
                node_index.get(&key.from_key()),
                node_index.get(&key.to_key()),
            ) {
                adjacency[a].push(b);
                adjacency[b].push(a);
            }
        }

        Self {
            nodes,
            adjacency,
            node_index,
        }
    }

    pub fn index_of(&self, kind: NodeKind, id: &str) -> Option<usize> {
        self.node_index.get(&NodeKey::new(kind, id)).copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of undirected edges.
    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum::<usize>() / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use patientmap_core::{Attributes, RelationshipKind};
    use patientmap_graph::{EdgeRecord, NodeRecord};

    fn node(kind: NodeKind, id: &str) -> NodeRecord {
        NodeRecord {
            kind,
            id: id.to_string(),
            attributes: Attributes::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn edge(kind: RelationshipKind, from: &str, to: &str) -> EdgeRecord {
        EdgeRecord {
            kind,
            from_id: from.to_string(),
            to_id: to.to_string(),
            attributes: Attributes::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn builds_undirected_adjacency() {
        let subgraph = Subgraph {
            nodes: vec![
                node(NodeKind::Patient, "p1"),
                node(NodeKind::Condition, "c1"),
                node(NodeKind::ResearchArticle, "a1"),
            ],
            edges: vec![
                edge(RelationshipKind::HasCondition, "p1", "c1"),
                edge(RelationshipKind::Studies, "a1", "c1"),
                // Endpoint outside the subgraph is ignored.
                edge(RelationshipKind::Studies, "a1", "c_other"),
            ],
        };
        let graph = PatientGraph::from_subgraph(&subgraph);

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        let c1 = graph.index_of(NodeKind::Condition, "c1").unwrap();
        assert_eq!(graph.adjacency[c1].len(), 2);
    }
}
