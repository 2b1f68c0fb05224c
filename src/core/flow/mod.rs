//! Flow graph interpretation: schema, run state, placeholder resolution and the walker.

pub mod code;
pub mod condition;
pub mod executor;
pub mod piece;
pub mod resolver;
pub mod run_store;
pub mod schema;
pub mod state;

pub use condition::{BranchCondition, BranchOperator, BranchSettings};
pub use executor::{FlowRunner, RunFailure, RunHandle, RunOptions, RunResult, RuntimeServices};
pub use piece::{
    ActionContext, FileWriter, InMemoryStore, KeyValueStore, LocalFileWriter, PieceAction,
    PieceKey, PieceRegistry, PieceRegistryBuilder, RunFiles, ScopedStore,
};
pub use resolver::{resolve, resolve_str, PlaceholderError};
pub use schema::{load_flow, parse_flow, FlowDescriptor, FlowVersion, StepKind, StepNode};
pub use state::{ExecutionState, StepError, StepRecord, StepStatus};
