//! Neo4j constraints and indexes required by the store.

use neo4rs::query;

use patientmap_core::NodeKind;

use crate::client::{GraphClient, GraphError};

/// Cypher statements that install the uniqueness constraints and lookup indexes.
pub fn schema_statements() -> Vec<String> {
    let mut statements: Vec<String> = NodeKind::ALL
        .iter()
        .map(|kind| {
            format!(
                "CREATE CONSTRAINT {name}_id_unique IF NOT EXISTS
                 FOR (n:{label}) REQUIRE n.id IS UNIQUE",
                name = kind.label().to_lowercase(),
                label = kind.label()
            )
        })
        .collect();

    statements.push(
        "CREATE INDEX patient_name IF NOT EXISTS FOR (n:Patient) ON (n.name)".to_string(),
    );
    statements.push(
        "CREATE INDEX condition_label IF NOT EXISTS FOR (n:Condition) ON (n.label)".to_string(),
    );
    statements
}

/// Install constraints and indexes. Idempotent.
pub async fn initialize_schema(client: &GraphClient) -> Result<(), GraphError> {
    let statements = schema_statements();
    for statement in &statements {
        client.run(query(statement)).await?;
    }
    tracing::info!(statements = statements.len(), "Initialized graph schema");
    Ok(())
}
