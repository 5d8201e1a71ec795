//! The operation log data model.
//!
//! Every fluent call on a [`QueryBuilder`](crate::QueryBuilder) appends one
//! [`Operation`] to the builder's log. Operations are backend-agnostic: they
//! carry plain [`serde_json::Value`] payloads and a lowering-bucket hint, and
//! a connector turns a finished log into its native execution plan.

use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// The lowering bucket an operation belongs to. Each stage corresponds to
/// one kind of step in the compiled backend plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Match,
    Project,
    Sort,
    Group,
    Lookup,
    Limit,
    Skip,
    Window,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Match => "match",
            Stage::Project => "project",
            Stage::Sort => "sort",
            Stage::Group => "group",
            Stage::Lookup => "lookup",
            Stage::Limit => "limit",
            Stage::Skip => "skip",
            Stage::Window => "window",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry in the operation log.
///
/// `stage` and `mergeable` are derived from the kind at construction time
/// and stored explicitly: the compiler's bucketing loop reads them without
/// re-inspecting the payload.
#[derive(Clone, Debug)]
pub struct Operation {
    pub stage: Stage,
    pub mergeable: bool,
    pub kind: OperationKind,
}

impl Operation {
    pub fn new(kind: OperationKind) -> Self {
        let (stage, mergeable) = kind.stage_and_mergeability();

        Operation {
            stage,
            mergeable,
            kind,
        }
    }
}

/// The closed operation taxonomy.
///
/// Filter kinds are factored as a boolean connective times a condition, so
/// the `or_*` surface does not double the variant count; the folders stay
/// exhaustive over `Condition` and `ProjectOp` instead of one giant match.
#[derive(Clone, Debug)]
pub enum OperationKind {
    Filter(FilterOp),
    Project(ProjectOp),
    Sort(SortOp),
    Group(GroupOp),
    Lookup(LookupOp),
    Limit(u64),
    Skip(u64),
    /// Random sample of the given size, lowered by the window bucket.
    Sample(u64),
}

impl OperationKind {
    fn stage_and_mergeability(&self) -> (Stage, bool) {
        match self {
            OperationKind::Filter(_) => (Stage::Match, true),
            OperationKind::Project(_) => (Stage::Project, true),
            OperationKind::Sort(_) => (Stage::Sort, true),
            OperationKind::Group(_) => (Stage::Group, true),
            OperationKind::Lookup(_) => (Stage::Lookup, false),
            OperationKind::Limit(_) => (Stage::Limit, false),
            OperationKind::Skip(_) => (Stage::Skip, false),
            OperationKind::Sample(_) => (Stage::Window, false),
        }
    }
}

/// The boolean connective a filter joins the surrounding clauses with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Boolean {
    And,
    Or,
}

#[derive(Clone, Debug)]
pub struct FilterOp {
    pub boolean: Boolean,
    pub condition: Condition,
}

impl FilterOp {
    pub fn new(boolean: Boolean, condition: Condition) -> Self {
        FilterOp { boolean, condition }
    }

    pub fn is_or(&self) -> bool {
        self.boolean == Boolean::Or
    }
}

/// A single filter condition.
///
/// Callback-style conditions (`Group`, `Not`, `Subquery`) carry the captured
/// operation log of the sub-builder the user's closure ran against; the
/// match folder folds that log recursively.
#[derive(Clone, Debug)]
pub enum Condition {
    /// `field = value`
    Eq { field: String, value: Value },
    /// `field <op> value` with a textual comparison operator.
    Cmp {
        field: String,
        op: String,
        value: Value,
    },
    /// A whole object treated as one conjunction of equality leaves.
    Map(IndexMap<String, Value>),
    In {
        field: String,
        values: Vec<Value>,
        negated: bool,
    },
    Null { field: String, negated: bool },
    Between {
        field: String,
        low: Value,
        high: Value,
        negated: bool,
    },
    /// Case-insensitive pattern match; `%` and `_` are wildcards.
    Like {
        field: String,
        pattern: String,
        negated: bool,
    },
    StartsWith { field: String, prefix: String },
    EndsWith { field: String, suffix: String },
    FieldExists { field: String, exists: bool },
    /// Array length compared with a textual operator.
    Size {
        field: String,
        op: String,
        value: u64,
    },
    /// Full-text search over the collection's text index.
    Text { query: String },
    /// A date component of `field` compared against a value.
    DatePart {
        part: DatePart,
        field: String,
        op: String,
        value: Value,
    },
    DateBefore { field: String, value: Value },
    DateAfter { field: String, value: Value },
    DateBetween {
        field: String,
        start: Value,
        end: Value,
    },
    /// Field-to-field comparison on the same document.
    Column {
        field: String,
        op: String,
        other: String,
    },
    JsonContains { path: String, value: Value },
    JsonLength {
        path: String,
        op: String,
        value: u64,
    },
    JsonType { path: String, expected: String },
    /// Opaque backend fragment; `?` placeholders are substituted with the
    /// JSON-encoded bindings at compile time.
    Raw { expr: String, bindings: Vec<Value> },
    /// Captured callback sub-log, folded into a single predicate node.
    Group(Vec<Operation>),
    /// Captured callback sub-log, folded and negated.
    Not(Vec<Operation>),
    /// Captured callback sub-log spliced inline (positive) or negated.
    Subquery {
        operations: Vec<Operation>,
        negated: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatePart {
    Day,
    Month,
    Year,
    Time,
    Date,
}

/// Mutator queued by `select_driver_projection`. Runs after every other
/// projection operation in the buffer, over the final projection map.
pub type ProjectionMutator = Arc<dyn Fn(&mut serde_json::Map<String, Value>) + Send + Sync>;

#[derive(Clone)]
pub enum ProjectOp {
    /// Plain field inclusion.
    Include(Vec<String>),
    /// Mapped selection: include/exclude flags or alias targets per field.
    Mapped(IndexMap<String, SelectValue>),
    Exclude(Vec<String>),
    /// Include without clearing earlier inclusions.
    Add(Vec<String>),
    Raw { field: String, expr: Value },
    /// Nested projection built from a sub-builder's project operations.
    Sub {
        field: String,
        operations: Vec<Operation>,
    },
    Aggregate {
        field: String,
        op: String,
        alias: String,
    },
    Exists { field: String, alias: String },
    Count { field: String, alias: String },
    Case {
        alias: String,
        branches: Vec<CaseBranch>,
        default: Value,
    },
    When {
        alias: String,
        cond: Value,
        then: Value,
        otherwise: Value,
    },
    Json { alias: String, path: String },
    JsonRaw { alias: String, expr: Value },
    /// Concatenation of resolved references; string parts resolve as field
    /// references, everything else is passed through literally.
    Concat { alias: String, parts: Vec<Value> },
    Coalesce { alias: String, fields: Vec<String> },
    DriverMutator(ProjectionMutator),
}

impl fmt::Debug for ProjectOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectOp::Include(fields) => f.debug_tuple("Include").field(fields).finish(),
            ProjectOp::Mapped(map) => f.debug_tuple("Mapped").field(map).finish(),
            ProjectOp::Exclude(fields) => f.debug_tuple("Exclude").field(fields).finish(),
            ProjectOp::Add(fields) => f.debug_tuple("Add").field(fields).finish(),
            ProjectOp::Raw { field, expr } => f
                .debug_struct("Raw")
                .field("field", field)
                .field("expr", expr)
                .finish(),
            ProjectOp::Sub { field, operations } => f
                .debug_struct("Sub")
                .field("field", field)
                .field("operations", operations)
                .finish(),
            ProjectOp::Aggregate { field, op, alias } => f
                .debug_struct("Aggregate")
                .field("field", field)
                .field("op", op)
                .field("alias", alias)
                .finish(),
            ProjectOp::Exists { field, alias } => f
                .debug_struct("Exists")
                .field("field", field)
                .field("alias", alias)
                .finish(),
            ProjectOp::Count { field, alias } => f
                .debug_struct("Count")
                .field("field", field)
                .field("alias", alias)
                .finish(),
            ProjectOp::Case { alias, branches, default } => f
                .debug_struct("Case")
                .field("alias", alias)
                .field("branches", branches)
                .field("default", default)
                .finish(),
            ProjectOp::When { alias, cond, then, otherwise } => f
                .debug_struct("When")
                .field("alias", alias)
                .field("cond", cond)
                .field("then", then)
                .field("otherwise", otherwise)
                .finish(),
            ProjectOp::Json { alias, path } => f
                .debug_struct("Json")
                .field("alias", alias)
                .field("path", path)
                .finish(),
            ProjectOp::JsonRaw { alias, expr } => f
                .debug_struct("JsonRaw")
                .field("alias", alias)
                .field("expr", expr)
                .finish(),
            ProjectOp::Concat { alias, parts } => f
                .debug_struct("Concat")
                .field("alias", alias)
                .field("parts", parts)
                .finish(),
            ProjectOp::Coalesce { alias, fields } => f
                .debug_struct("Coalesce")
                .field("alias", alias)
                .field("fields", fields)
                .finish(),
            ProjectOp::DriverMutator(_) => f.write_str("DriverMutator(..)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaseBranch {
    pub when: Value,
    pub then: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Clone, Debug)]
pub enum SortOp {
    By { field: String, order: SortOrder },
    Raw(Value),
}

#[derive(Clone, Debug)]
pub enum SelectValue {
    Include,
    Exclude,
    Alias(String),
}

/// Shape of a grouping specification.
#[derive(Clone, Debug)]
pub enum GroupSpec {
    /// Group by a single named field.
    Field(String),
    /// Group by several named fields.
    Fields(Vec<String>),
    /// Explicit identifier mapping, used verbatim.
    Mapping(IndexMap<String, Value>),
}

impl GroupSpec {
    /// The named fields a rename projection must rebind, if any.
    pub fn named_fields(&self) -> Option<Vec<&str>> {
        match self {
            GroupSpec::Field(f) => Some(vec![f.as_str()]),
            GroupSpec::Fields(fs) => Some(fs.iter().map(String::as_str).collect()),
            GroupSpec::Mapping(_) => None,
        }
    }
}

/// Abstract aggregate descriptor attached to a grouping.
#[derive(Clone, Debug)]
pub enum Aggregate {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    First(String),
    Last(String),
    Distinct(String),
    Floor(String),
    /// Backend-native accumulator document, passed through unchanged.
    Raw(Value),
}

#[derive(Clone, Debug)]
pub enum GroupOp {
    By {
        spec: GroupSpec,
        aggregates: IndexMap<String, Aggregate>,
    },
    Raw(Value),
    Having {
        field: String,
        op: String,
        value: Value,
    },
    HavingRaw(Value),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Inner,
    Right,
    Full,
    Cross,
}

#[derive(Clone, Debug)]
pub enum LookupOp {
    Join {
        table: String,
        local_field: String,
        foreign_field: String,
        alias: String,
        kind: JoinKind,
    },
    Raw(Value),
}
