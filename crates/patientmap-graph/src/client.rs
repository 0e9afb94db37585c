//! Neo4j connection management and the shared graph error type.

use neo4rs::{ConfigBuilder, Graph, Query};

use patientmap_core::{Neo4jSettings, NodeKey, NodeKind, RelationshipKey, SchemaError};

/// Failures surfaced by either store backend.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Neo4j connection error: {0}")]
    Connection(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("Node not found: {kind} with id {id}")]
    NotFound { kind: NodeKind, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Dangling reference: {relationship} points at missing {missing}")]
    DanglingReference {
        relationship: RelationshipKey,
        missing: NodeKey,
    },

    #[error("Malformed item: {0}")]
    Malformed(#[from] SchemaError),

    #[error("Condition {condition_id} is already owned by patient {owner}")]
    OwnershipConflict { condition_id: String, owner: String },

    #[error("Write '{operation}' refused through a read-only graph handle")]
    CapabilityViolation { operation: &'static str },
}

impl GraphError {
    /// Errors worth retrying: the store may answer differently next time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Query(_))
    }
}

/// Bolt connection settings, usually built from [`Neo4jSettings`].
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
    pub fetch_size: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Neo4jSettings::default().into()
    }
}

impl From<Neo4jSettings> for GraphConfig {
    fn from(settings: Neo4jSettings) -> Self {
        Self {
            uri: settings.uri,
            user: settings.user,
            password: settings.password,
            database: settings.database,
            max_connections: settings.max_connections,
            fetch_size: settings.fetch_size,
        }
    }
}

/// Pooled Neo4j handle backing the persistent store.
///
/// Cloning shares the pool.
#[derive(Clone)]
pub struct GraphClient {
    graph: Graph,
}

impl GraphClient {
    /// Open the pool and select the configured database.
    pub async fn connect(config: &GraphConfig) -> Result<Self, GraphError> {
        let neo_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .db(config.database.as_str())
            .max_connections(config.max_connections as usize)
            .fetch_size(config.fetch_size)
            .build()
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        let graph = Graph::connect(neo_config)
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        tracing::info!(uri = %config.uri, database = %config.database, "Connected to Neo4j");
        Ok(Self { graph })
    }

    /// Run a statement whose result rows are not needed.
    pub async fn run(&self, query: Query) -> Result<(), GraphError> {
        self.graph.run(query).await?;
        Ok(())
    }

    /// Collect every row a query yields.
    pub async fn query_rows(&self, query: Query) -> Result<Vec<neo4rs::Row>, GraphError> {
        let mut stream = self.graph.execute(query).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// First row of a query, if any.
    pub async fn query_one(&self, query: Query) -> Result<Option<neo4rs::Row>, GraphError> {
        let mut stream = self.graph.execute(query).await?;
        Ok(stream.next().await?)
    }
}
