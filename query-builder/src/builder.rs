//! The fluent builder surface.
//!
//! Every mutating method appends one or more operations to the log and
//! returns `&mut Self` for chaining. The builder never talks to a backend;
//! compilation and execution belong to a connector.

use crate::ops::{
    Aggregate, Boolean, CaseBranch, Condition, DatePart, FilterOp, GroupOp, GroupSpec, JoinKind,
    LookupOp, Operation, OperationKind, ProjectOp, ProjectionMutator, SelectValue, SortOp,
    SortOrder, Stage,
};
use crate::scope::{DisabledScopes, GlobalScope, ScopeCallback, ScopeTiming};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

/// A backend-agnostic query under construction.
///
/// Cloning deep-copies the operation log and the scope state; scope
/// callbacks are shared `Arc`s, so a clone reapplies the same closures
/// against itself independently of the original.
#[derive(Clone)]
pub struct QueryBuilder {
    table: String,
    operations: Vec<Operation>,
    global_scopes: IndexMap<String, GlobalScope>,
    local_scopes: IndexMap<String, ScopeCallback>,
    disabled_scopes: DisabledScopes,
    scopes_applied: bool,
}

impl QueryBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        QueryBuilder {
            table: table.into(),
            operations: Vec::new(),
            global_scopes: IndexMap::new(),
            local_scopes: IndexMap::new(),
            disabled_scopes: DisabledScopes::default(),
            scopes_applied: false,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Consume the builder, returning its raw log. Used when capturing a
    /// callback's sub-builder into an operation payload.
    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    /// A fresh builder over the same table, used for callback capture.
    /// Carries no scope state so nested callbacks cannot re-trigger scope
    /// application.
    fn sub_builder(&self) -> QueryBuilder {
        QueryBuilder::new(self.table.clone())
    }

    fn capture(&self, callback: impl FnOnce(&mut QueryBuilder)) -> Vec<Operation> {
        let mut sub = self.sub_builder();
        callback(&mut sub);
        sub.into_operations()
    }

    fn push(&mut self, kind: OperationKind) -> &mut Self {
        self.operations.push(Operation::new(kind));
        self
    }

    fn filter(&mut self, boolean: Boolean, condition: Condition) -> &mut Self {
        self.push(OperationKind::Filter(FilterOp::new(boolean, condition)))
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    pub fn where_eq(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Eq {
                field: field.into(),
                value: value.into(),
            },
        )
    }

    pub fn or_where_eq(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Eq {
                field: field.into(),
                value: value.into(),
            },
        )
    }

    /// Comparison with a textual operator (`=`, `!=`, `<>`, `>`, `>=`, `<`,
    /// `<=`, `like`, `not like`, `in`, `not in`). Unknown operators are a
    /// compilation error, raised when the log is lowered.
    pub fn where_op(
        &mut self,
        field: impl Into<String>,
        op: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Cmp {
                field: field.into(),
                op: op.into(),
                value: value.into(),
            },
        )
    }

    pub fn or_where_op(
        &mut self,
        field: impl Into<String>,
        op: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Cmp {
                field: field.into(),
                op: op.into(),
                value: value.into(),
            },
        )
    }

    /// A whole object of `field => value` pairs, treated as one conjunction.
    pub fn where_map(&mut self, map: IndexMap<String, Value>) -> &mut Self {
        self.filter(Boolean::And, Condition::Map(map))
    }

    pub fn or_where_map(&mut self, map: IndexMap<String, Value>) -> &mut Self {
        self.filter(Boolean::Or, Condition::Map(map))
    }

    pub fn where_in(
        &mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::In {
                field: field.into(),
                values: values.into_iter().map(Into::into).collect(),
                negated: false,
            },
        )
    }

    pub fn where_not_in(
        &mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::In {
                field: field.into(),
                values: values.into_iter().map(Into::into).collect(),
                negated: true,
            },
        )
    }

    pub fn or_where_in(
        &mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::In {
                field: field.into(),
                values: values.into_iter().map(Into::into).collect(),
                negated: false,
            },
        )
    }

    pub fn or_where_not_in(
        &mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::In {
                field: field.into(),
                values: values.into_iter().map(Into::into).collect(),
                negated: true,
            },
        )
    }

    pub fn where_null(&mut self, field: impl Into<String>) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Null {
                field: field.into(),
                negated: false,
            },
        )
    }

    pub fn where_not_null(&mut self, field: impl Into<String>) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Null {
                field: field.into(),
                negated: true,
            },
        )
    }

    pub fn or_where_null(&mut self, field: impl Into<String>) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Null {
                field: field.into(),
                negated: false,
            },
        )
    }

    pub fn or_where_not_null(&mut self, field: impl Into<String>) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Null {
                field: field.into(),
                negated: true,
            },
        )
    }

    pub fn where_between(
        &mut self,
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Between {
                field: field.into(),
                low: low.into(),
                high: high.into(),
                negated: false,
            },
        )
    }

    pub fn where_not_between(
        &mut self,
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Between {
                field: field.into(),
                low: low.into(),
                high: high.into(),
                negated: true,
            },
        )
    }

    pub fn or_where_between(
        &mut self,
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Between {
                field: field.into(),
                low: low.into(),
                high: high.into(),
                negated: false,
            },
        )
    }

    pub fn or_where_not_between(
        &mut self,
        field: impl Into<String>,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Between {
                field: field.into(),
                low: low.into(),
                high: high.into(),
                negated: true,
            },
        )
    }

    pub fn where_like(&mut self, field: impl Into<String>, pattern: impl Into<String>) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Like {
                field: field.into(),
                pattern: pattern.into(),
                negated: false,
            },
        )
    }

    pub fn where_not_like(
        &mut self,
        field: impl Into<String>,
        pattern: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Like {
                field: field.into(),
                pattern: pattern.into(),
                negated: true,
            },
        )
    }

    pub fn or_where_like(
        &mut self,
        field: impl Into<String>,
        pattern: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Like {
                field: field.into(),
                pattern: pattern.into(),
                negated: false,
            },
        )
    }

    pub fn or_where_not_like(
        &mut self,
        field: impl Into<String>,
        pattern: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Like {
                field: field.into(),
                pattern: pattern.into(),
                negated: true,
            },
        )
    }

    pub fn where_starts_with(
        &mut self,
        field: impl Into<String>,
        prefix: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::StartsWith {
                field: field.into(),
                prefix: prefix.into(),
            },
        )
    }

    pub fn where_ends_with(
        &mut self,
        field: impl Into<String>,
        suffix: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::EndsWith {
                field: field.into(),
                suffix: suffix.into(),
            },
        )
    }

    pub fn or_where_starts_with(
        &mut self,
        field: impl Into<String>,
        prefix: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::StartsWith {
                field: field.into(),
                prefix: prefix.into(),
            },
        )
    }

    pub fn or_where_ends_with(
        &mut self,
        field: impl Into<String>,
        suffix: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::EndsWith {
                field: field.into(),
                suffix: suffix.into(),
            },
        )
    }

    pub fn where_field_exists(&mut self, field: impl Into<String>, exists: bool) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::FieldExists {
                field: field.into(),
                exists,
            },
        )
    }

    pub fn or_where_field_exists(&mut self, field: impl Into<String>, exists: bool) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::FieldExists {
                field: field.into(),
                exists,
            },
        )
    }

    pub fn where_size(
        &mut self,
        field: impl Into<String>,
        op: impl Into<String>,
        value: u64,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Size {
                field: field.into(),
                op: op.into(),
                value,
            },
        )
    }

    pub fn or_where_size(
        &mut self,
        field: impl Into<String>,
        op: impl Into<String>,
        value: u64,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Size {
                field: field.into(),
                op: op.into(),
                value,
            },
        )
    }

    pub fn where_text(&mut self, query: impl Into<String>) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Text {
                query: query.into(),
            },
        )
    }

    pub fn or_where_text(&mut self, query: impl Into<String>) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Text {
                query: query.into(),
            },
        )
    }

    pub fn where_date_part(
        &mut self,
        part: DatePart,
        field: impl Into<String>,
        op: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::DatePart {
                part,
                field: field.into(),
                op: op.into(),
                value: value.into(),
            },
        )
    }

    pub fn or_where_date_part(
        &mut self,
        part: DatePart,
        field: impl Into<String>,
        op: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::DatePart {
                part,
                field: field.into(),
                op: op.into(),
                value: value.into(),
            },
        )
    }

    pub fn where_date_before(
        &mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::DateBefore {
                field: field.into(),
                value: value.into(),
            },
        )
    }

    pub fn where_date_after(
        &mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::DateAfter {
                field: field.into(),
                value: value.into(),
            },
        )
    }

    pub fn where_date_between(
        &mut self,
        field: impl Into<String>,
        start: impl Into<Value>,
        end: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::DateBetween {
                field: field.into(),
                start: start.into(),
                end: end.into(),
            },
        )
    }

    pub fn or_where_date_before(
        &mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::DateBefore {
                field: field.into(),
                value: value.into(),
            },
        )
    }

    pub fn or_where_date_after(
        &mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::DateAfter {
                field: field.into(),
                value: value.into(),
            },
        )
    }

    pub fn or_where_date_between(
        &mut self,
        field: impl Into<String>,
        start: impl Into<Value>,
        end: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::DateBetween {
                field: field.into(),
                start: start.into(),
                end: end.into(),
            },
        )
    }

    pub fn where_column(
        &mut self,
        field: impl Into<String>,
        op: impl Into<String>,
        other: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Column {
                field: field.into(),
                op: op.into(),
                other: other.into(),
            },
        )
    }

    pub fn or_where_column(
        &mut self,
        field: impl Into<String>,
        op: impl Into<String>,
        other: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Column {
                field: field.into(),
                op: op.into(),
                other: other.into(),
            },
        )
    }

    pub fn where_json_contains(
        &mut self,
        path: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::JsonContains {
                path: path.into(),
                value: value.into(),
            },
        )
    }

    pub fn where_json_length(
        &mut self,
        path: impl Into<String>,
        op: impl Into<String>,
        value: u64,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::JsonLength {
                path: path.into(),
                op: op.into(),
                value,
            },
        )
    }

    pub fn where_json_type(
        &mut self,
        path: impl Into<String>,
        expected: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::JsonType {
                path: path.into(),
                expected: expected.into(),
            },
        )
    }

    pub fn or_where_json_contains(
        &mut self,
        path: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::JsonContains {
                path: path.into(),
                value: value.into(),
            },
        )
    }

    pub fn or_where_json_length(
        &mut self,
        path: impl Into<String>,
        op: impl Into<String>,
        value: u64,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::JsonLength {
                path: path.into(),
                op: op.into(),
                value,
            },
        )
    }

    pub fn or_where_json_type(
        &mut self,
        path: impl Into<String>,
        expected: impl Into<String>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::JsonType {
                path: path.into(),
                expected: expected.into(),
            },
        )
    }

    pub fn where_raw(
        &mut self,
        expr: impl Into<String>,
        bindings: impl IntoIterator<Item = impl Into<Value>>,
    ) -> &mut Self {
        self.filter(
            Boolean::And,
            Condition::Raw {
                expr: expr.into(),
                bindings: bindings.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn or_where_raw(
        &mut self,
        expr: impl Into<String>,
        bindings: impl IntoIterator<Item = impl Into<Value>>,
    ) -> &mut Self {
        self.filter(
            Boolean::Or,
            Condition::Raw {
                expr: expr.into(),
                bindings: bindings.into_iter().map(Into::into).collect(),
            },
        )
    }

    // ------------------------------------------------------------------
    // Callback filters
    // ------------------------------------------------------------------

    /// Group the callback's clauses into a single predicate node.
    pub fn where_callback(&mut self, callback: impl FnOnce(&mut QueryBuilder)) -> &mut Self {
        let operations = self.capture(callback);
        self.filter(Boolean::And, Condition::Group(operations))
    }

    pub fn or_where_callback(&mut self, callback: impl FnOnce(&mut QueryBuilder)) -> &mut Self {
        let operations = self.capture(callback);
        self.filter(Boolean::Or, Condition::Group(operations))
    }

    /// Negate the callback's folded clauses.
    pub fn where_not(&mut self, callback: impl FnOnce(&mut QueryBuilder)) -> &mut Self {
        let operations = self.capture(callback);
        self.filter(Boolean::And, Condition::Not(operations))
    }

    pub fn or_where_not(&mut self, callback: impl FnOnce(&mut QueryBuilder)) -> &mut Self {
        let operations = self.capture(callback);
        self.filter(Boolean::Or, Condition::Not(operations))
    }

    /// Splice the callback's clauses inline, as if written directly.
    pub fn where_exists(&mut self, callback: impl FnOnce(&mut QueryBuilder)) -> &mut Self {
        let operations = self.capture(callback);
        self.filter(
            Boolean::And,
            Condition::Subquery {
                operations,
                negated: false,
            },
        )
    }

    pub fn where_not_exists(&mut self, callback: impl FnOnce(&mut QueryBuilder)) -> &mut Self {
        let operations = self.capture(callback);
        self.filter(
            Boolean::And,
            Condition::Subquery {
                operations,
                negated: true,
            },
        )
    }

    // ------------------------------------------------------------------
    // Projections
    // ------------------------------------------------------------------

    pub fn select(&mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Include(
            fields.into_iter().map(Into::into).collect(),
        )))
    }

    /// Mapped selection: `true`/`1` include, `false`/`0` exclude, a string
    /// aliases the named source field.
    pub fn select_map(&mut self, map: IndexMap<String, SelectValue>) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Mapped(map)))
    }

    pub fn deselect(&mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Exclude(
            fields.into_iter().map(Into::into).collect(),
        )))
    }

    pub fn add_select(&mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Add(
            fields.into_iter().map(Into::into).collect(),
        )))
    }

    pub fn select_raw(&mut self, field: impl Into<String>, expr: impl Into<Value>) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Raw {
            field: field.into(),
            expr: expr.into(),
        }))
    }

    /// Nested projection built from the callback's own `select` calls.
    pub fn select_sub(
        &mut self,
        field: impl Into<String>,
        callback: impl FnOnce(&mut QueryBuilder),
    ) -> &mut Self {
        let operations = self.capture(callback);
        self.push(OperationKind::Project(ProjectOp::Sub {
            field: field.into(),
            operations,
        }))
    }

    pub fn select_aggregate(
        &mut self,
        field: impl Into<String>,
        op: impl Into<String>,
        alias: impl Into<String>,
    ) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Aggregate {
            field: field.into(),
            op: op.into(),
            alias: alias.into(),
        }))
    }

    pub fn select_exists(
        &mut self,
        field: impl Into<String>,
        alias: impl Into<String>,
    ) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Exists {
            field: field.into(),
            alias: alias.into(),
        }))
    }

    pub fn select_count(
        &mut self,
        field: impl Into<String>,
        alias: impl Into<String>,
    ) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Count {
            field: field.into(),
            alias: alias.into(),
        }))
    }

    pub fn select_case(
        &mut self,
        alias: impl Into<String>,
        branches: Vec<CaseBranch>,
        default: impl Into<Value>,
    ) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Case {
            alias: alias.into(),
            branches,
            default: default.into(),
        }))
    }

    pub fn select_when(
        &mut self,
        alias: impl Into<String>,
        cond: impl Into<Value>,
        then: impl Into<Value>,
        otherwise: impl Into<Value>,
    ) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::When {
            alias: alias.into(),
            cond: cond.into(),
            then: then.into(),
            otherwise: otherwise.into(),
        }))
    }

    pub fn select_json(&mut self, alias: impl Into<String>, path: impl Into<String>) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Json {
            alias: alias.into(),
            path: path.into(),
        }))
    }

    pub fn select_json_raw(
        &mut self,
        alias: impl Into<String>,
        expr: impl Into<Value>,
    ) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::JsonRaw {
            alias: alias.into(),
            expr: expr.into(),
        }))
    }

    pub fn select_concat(
        &mut self,
        alias: impl Into<String>,
        parts: impl IntoIterator<Item = impl Into<Value>>,
    ) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Concat {
            alias: alias.into(),
            parts: parts.into_iter().map(Into::into).collect(),
        }))
    }

    pub fn select_coalesce(
        &mut self,
        alias: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> &mut Self {
        self.push(OperationKind::Project(ProjectOp::Coalesce {
            alias: alias.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }))
    }

    /// Queue a mutator that receives the final projection map after all
    /// other projection operations have been applied.
    pub fn select_driver_projection(
        &mut self,
        mutator: impl Fn(&mut serde_json::Map<String, Value>) + Send + Sync + 'static,
    ) -> &mut Self {
        let mutator: ProjectionMutator = Arc::new(mutator);
        self.push(OperationKind::Project(ProjectOp::DriverMutator(mutator)))
    }

    /// Remove every projection operation from the log.
    pub fn clear_select(&mut self) -> &mut Self {
        self.operations.retain(|op| op.stage != Stage::Project);
        self
    }

    /// Alias of [`clear_select`](Self::clear_select): an unrestricted
    /// selection is the absence of a project stage.
    pub fn select_all(&mut self) -> &mut Self {
        self.clear_select()
    }

    // ------------------------------------------------------------------
    // Sort and paging
    // ------------------------------------------------------------------

    pub fn order_by(&mut self, field: impl Into<String>, order: SortOrder) -> &mut Self {
        self.push(OperationKind::Sort(SortOp::By {
            field: field.into(),
            order,
        }))
    }

    pub fn order_by_asc(&mut self, field: impl Into<String>) -> &mut Self {
        self.order_by(field, SortOrder::Asc)
    }

    pub fn order_by_desc(&mut self, field: impl Into<String>) -> &mut Self {
        self.order_by(field, SortOrder::Desc)
    }

    pub fn order_by_raw(&mut self, expr: impl Into<Value>) -> &mut Self {
        self.push(OperationKind::Sort(SortOp::Raw(expr.into())))
    }

    /// Random ordering, lowered to a server-side sample of the given size.
    pub fn order_by_random(&mut self, sample_size: u64) -> &mut Self {
        self.push(OperationKind::Sample(sample_size))
    }

    pub fn limit(&mut self, n: u64) -> &mut Self {
        self.push(OperationKind::Limit(n))
    }

    pub fn skip(&mut self, n: u64) -> &mut Self {
        self.push(OperationKind::Skip(n))
    }

    /// Paging sugar: `skip((page - 1) * per_page)` + `limit(per_page)`.
    /// Pages are 1-based.
    pub fn for_page(&mut self, page: u64, per_page: u64) -> &mut Self {
        self.skip(page.saturating_sub(1) * per_page).limit(per_page)
    }

    pub fn latest(&mut self, field: impl Into<String>) -> &mut Self {
        self.order_by_desc(field)
    }

    pub fn oldest(&mut self, field: impl Into<String>) -> &mut Self {
        self.order_by_asc(field)
    }

    /// Apply the callback only when `condition` holds.
    pub fn when(
        &mut self,
        condition: bool,
        callback: impl FnOnce(&mut QueryBuilder),
    ) -> &mut Self {
        if condition {
            callback(self);
        }
        self
    }

    // ------------------------------------------------------------------
    // Grouping
    // ------------------------------------------------------------------

    pub fn group_by(&mut self, spec: GroupSpec) -> &mut Self {
        self.push(OperationKind::Group(GroupOp::By {
            spec,
            aggregates: IndexMap::new(),
        }))
    }

    pub fn group_by_with(
        &mut self,
        spec: GroupSpec,
        aggregates: IndexMap<String, Aggregate>,
    ) -> &mut Self {
        self.push(OperationKind::Group(GroupOp::By { spec, aggregates }))
    }

    pub fn group_by_raw(&mut self, expr: impl Into<Value>) -> &mut Self {
        self.push(OperationKind::Group(GroupOp::Raw(expr.into())))
    }

    pub fn having(
        &mut self,
        field: impl Into<String>,
        op: impl Into<String>,
        value: impl Into<Value>,
    ) -> &mut Self {
        self.push(OperationKind::Group(GroupOp::Having {
            field: field.into(),
            op: op.into(),
            value: value.into(),
        }))
    }

    pub fn having_raw(&mut self, expr: impl Into<Value>) -> &mut Self {
        self.push(OperationKind::Group(GroupOp::HavingRaw(expr.into())))
    }

    /// Distinct values of one field, lowered as a grouping keyed by it.
    pub fn distinct(&mut self, field: impl Into<String>) -> &mut Self {
        self.group_by(GroupSpec::Field(field.into()))
    }

    // ------------------------------------------------------------------
    // Joins
    // ------------------------------------------------------------------

    fn join_kind(
        &mut self,
        kind: JoinKind,
        table: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        alias: impl Into<String>,
    ) -> &mut Self {
        self.push(OperationKind::Lookup(LookupOp::Join {
            table: table.into(),
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
            alias: alias.into(),
            kind,
        }))
    }

    pub fn join(
        &mut self,
        table: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        alias: impl Into<String>,
    ) -> &mut Self {
        self.join_kind(JoinKind::Left, table, local_field, foreign_field, alias)
    }

    pub fn left_join(
        &mut self,
        table: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        alias: impl Into<String>,
    ) -> &mut Self {
        self.join_kind(JoinKind::Left, table, local_field, foreign_field, alias)
    }

    pub fn inner_join(
        &mut self,
        table: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        alias: impl Into<String>,
    ) -> &mut Self {
        self.join_kind(JoinKind::Inner, table, local_field, foreign_field, alias)
    }

    pub fn right_join(
        &mut self,
        table: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        alias: impl Into<String>,
    ) -> &mut Self {
        self.join_kind(JoinKind::Right, table, local_field, foreign_field, alias)
    }

    pub fn full_join(
        &mut self,
        table: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
        alias: impl Into<String>,
    ) -> &mut Self {
        self.join_kind(JoinKind::Full, table, local_field, foreign_field, alias)
    }

    pub fn cross_join(&mut self, table: impl Into<String>, alias: impl Into<String>) -> &mut Self {
        self.join_kind(JoinKind::Cross, table, "", "", alias)
    }

    pub fn join_raw(&mut self, expr: impl Into<Value>) -> &mut Self {
        self.push(OperationKind::Lookup(LookupOp::Raw(expr.into())))
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    pub fn register_global_scope(
        &mut self,
        name: impl Into<String>,
        timing: ScopeTiming,
        callback: impl Fn(&mut QueryBuilder) + Send + Sync + 'static,
    ) -> &mut Self {
        self.global_scopes.insert(
            name.into(),
            GlobalScope {
                callback: Arc::new(callback),
                timing,
            },
        );
        self
    }

    pub fn register_local_scope(
        &mut self,
        name: impl Into<String>,
        callback: impl Fn(&mut QueryBuilder) + Send + Sync + 'static,
    ) -> &mut Self {
        self.local_scopes.insert(name.into(), Arc::new(callback));
        self
    }

    pub fn without_global_scope(&mut self, name: &str) -> &mut Self {
        self.disabled_scopes.disable(name);
        self
    }

    pub fn without_global_scopes(&mut self) -> &mut Self {
        self.disabled_scopes.disable_all();
        self
    }

    /// Apply a registered local scope immediately. An unknown name is a
    /// warned no-op.
    pub fn scope(&mut self, name: &str) -> &mut Self {
        match self.local_scopes.get(name).cloned() {
            Some(callback) => callback(self),
            None => tracing::warn!(scope = name, "unknown local scope, ignoring"),
        }
        self
    }

    /// Run the pending global scopes and splice their operations around the
    /// user's log. Idempotent: only the first call has an effect.
    pub fn apply_global_scopes(&mut self) {
        if self.scopes_applied {
            return;
        }
        self.scopes_applied = true;

        let scopes: Vec<(String, GlobalScope)> = self
            .global_scopes
            .iter()
            .map(|(name, scope)| (name.clone(), scope.clone()))
            .collect();

        let mut before = Vec::new();
        let mut after = Vec::new();

        for (name, scope) in scopes {
            if self.disabled_scopes.is_disabled(&name) {
                continue;
            }

            let mut sub = self.sub_builder();
            (scope.callback)(&mut sub);

            match scope.timing {
                ScopeTiming::Before => before.extend(sub.into_operations()),
                ScopeTiming::After => after.extend(sub.into_operations()),
            }
        }

        let user = std::mem::take(&mut self.operations);
        before.extend(user);
        before.extend(after);
        self.operations = before;
    }

    pub fn scopes_applied(&self) -> bool {
        self.scopes_applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn filters_append_in_order() {
        let mut qb = QueryBuilder::new("users");
        qb.where_eq("a", 1).or_where_eq("b", 2).where_op("c", ">", 3);

        assert_eq!(qb.operations().len(), 3);
        assert!(qb.operations().iter().all(|op| op.stage == Stage::Match));
        assert!(qb.operations().iter().all(|op| op.mergeable));

        let booleans: Vec<Boolean> = qb
            .operations()
            .iter()
            .map(|op| match &op.kind {
                OperationKind::Filter(f) => f.boolean,
                other => panic!("unexpected kind: {other:?}"),
            })
            .collect();
        assert_eq!(booleans, vec![Boolean::And, Boolean::Or, Boolean::And]);
    }

    #[test]
    fn callback_captures_an_independent_sub_log() {
        let mut qb = QueryBuilder::new("users");
        qb.where_callback(|sub| {
            sub.where_eq("x", 1).or_where_eq("y", 2);
        });

        assert_eq!(qb.operations().len(), 1);
        match &qb.operations()[0].kind {
            OperationKind::Filter(FilterOp {
                condition: Condition::Group(operations),
                ..
            }) => assert_eq!(operations.len(), 2),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn limit_and_skip_are_not_mergeable() {
        let mut qb = QueryBuilder::new("users");
        qb.limit(10).skip(5);

        assert!(qb.operations().iter().all(|op| !op.mergeable));
    }

    #[test]
    fn clone_is_independent_of_the_original() {
        let mut qb = QueryBuilder::new("users");
        qb.where_eq("a", 1);

        let mut clone = qb.clone();
        clone.where_eq("b", 2);

        assert_eq!(qb.operations().len(), 1);
        assert_eq!(clone.operations().len(), 2);
    }

    #[test]
    fn clear_select_removes_only_projection_operations() {
        let mut qb = QueryBuilder::new("users");
        qb.select(["a", "b"]).where_eq("x", 1).add_select(["c"]);
        qb.clear_select();

        assert_eq!(qb.operations().len(), 1);
        assert_eq!(qb.operations()[0].stage, Stage::Match);
    }

    #[test]
    fn global_scopes_apply_once_in_timing_order() {
        let mut qb = QueryBuilder::new("users");
        qb.register_global_scope("tenant", ScopeTiming::Before, |q| {
            q.where_eq("tenant_id", 7);
        });
        qb.register_global_scope("trim", ScopeTiming::After, |q| {
            q.limit(100);
        });
        qb.where_eq("name", "ada");

        qb.apply_global_scopes();
        qb.apply_global_scopes();

        let stages: Vec<Stage> = qb.operations().iter().map(|op| op.stage).collect();
        assert_eq!(stages, vec![Stage::Match, Stage::Match, Stage::Limit]);

        match &qb.operations()[0].kind {
            OperationKind::Filter(FilterOp {
                condition: Condition::Eq { field, .. },
                ..
            }) => assert_eq!(field, "tenant_id"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn disabled_global_scopes_are_skipped() {
        let mut qb = QueryBuilder::new("users");
        qb.register_global_scope("tenant", ScopeTiming::Before, |q| {
            q.where_eq("tenant_id", 7);
        });
        qb.without_global_scope("tenant");
        qb.where_eq("name", "ada");

        qb.apply_global_scopes();
        assert_eq!(qb.operations().len(), 1);
    }

    #[test]
    fn local_scope_applies_immediately() {
        let mut qb = QueryBuilder::new("users");
        qb.register_local_scope("active", |q| {
            q.where_eq("status", "active");
        });

        qb.scope("active").scope("missing");
        assert_eq!(qb.operations().len(), 1);
    }

    #[test]
    fn for_page_lowers_to_skip_and_limit() {
        let mut qb = QueryBuilder::new("users");
        qb.for_page(3, 25);

        let kinds: Vec<_> = qb
            .operations()
            .iter()
            .map(|op| match op.kind {
                OperationKind::Skip(n) => ("skip", n),
                OperationKind::Limit(n) => ("limit", n),
                ref other => panic!("unexpected kind: {other:?}"),
            })
            .collect();
        assert_eq!(kinds, vec![("skip", 50), ("limit", 25)]);
    }

    #[test]
    fn when_applies_conditionally() {
        let mut qb = QueryBuilder::new("users");
        qb.when(false, |q| {
            q.where_eq("never", 1);
        })
        .when(true, |q| {
            q.where_eq("always", json!(2));
        });

        assert_eq!(qb.operations().len(), 1);
    }
}
