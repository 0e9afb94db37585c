//! PatientMap Build: the bounded mutate/validate loop.
//!
//! - [`BulkMutationEngine`] applies batches of node and relationship specs
//!   with merge semantics and per-item outcomes
//! - [`ValidationChecker`] inspects the graph through a read-only handle and
//!   names what is still missing
//! - [`BuilderLoop`] drives both until the graph is complete, the iteration
//!   ceiling is hit, or progress stalls
//! - [`ConnectivityAnalyzer`] reports how well a patient's subgraph hangs
//!   together

pub mod builder;
pub mod bulk;
pub mod checker;
pub mod connectivity;
pub mod error;
pub mod graph;
pub mod input;

pub use builder::{
    AbortHandle, BuildOutcome, BuilderLoop, ExhaustReason, IterationReport, LoopPhase, Termination,
};
pub use bulk::{BatchFailure, BatchResult, BulkMutationEngine, ItemOutcome, ItemRef, ItemStatus, OperationPolicy};
pub use checker::{Expectations, Gap, Validation, ValidationChecker};
pub use connectivity::{ConnectivityAnalyzer, ConnectivityReport};
pub use error::{BuildError, ItemError};
pub use input::BuildInput;
