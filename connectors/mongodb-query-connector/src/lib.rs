//! MongoDB lowering and execution for the abstract query builder.
//!
//! The `query-builder` crate records intent as an operation log; this crate
//! turns a finished log into an aggregation pipeline and runs it. The main
//! pieces:
//!
//! - [`compiler::compile`] — bucketing plus the match/projection/group
//!   folders and the group-identifier rename pass.
//! - [`plan::Pipeline`] — the compiled stage list handed to a driver.
//! - [`context`] — the ambient, task-local transaction context.
//! - [`driver`] — the driver trait, the MongoDB implementation, and the
//!   transaction finalization handle.
//! - [`sync`] — the adapter translating cross-document sync instructions
//!   into backend writes.

pub mod compiler;
pub mod context;
pub mod driver;
pub mod error;
pub mod execute;
pub mod migration;
pub mod plan;
pub mod sync;
mod value;

pub use compiler::compile;
pub use context::ContextData;
pub use driver::{
    Driver, MongoDbDriver, OperationOptions, RecordedCall, RecordingDriver, SessionHandle,
    Transaction,
};
pub use error::{CompilationError, Error, Result};
pub use plan::{Pipeline, PlanStage};
pub use sync::{execute_sync, SyncInstruction};
