//! Backend-agnostic query composition.
//!
//! This crate records a caller's intent as an ordered operation log behind a
//! fluent builder. It knows nothing about any concrete database: values are
//! plain JSON, filter callbacks capture independent sub-logs, and scopes
//! splice reusable operation sequences around the user's own. A connector
//! crate lowers a finished log into its backend's execution plan.

pub mod builder;
pub mod ops;
pub mod scope;

pub use builder::QueryBuilder;
pub use ops::{
    Aggregate, Boolean, CaseBranch, Condition, DatePart, FilterOp, GroupOp, GroupSpec, JoinKind,
    LookupOp, Operation, OperationKind, ProjectOp, ProjectionMutator, SelectValue, SortOp,
    SortOrder, Stage,
};
pub use scope::{DisabledScopes, GlobalScope, ScopeCallback, ScopeTiming};
