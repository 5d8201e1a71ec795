//! Translation of an operation log into an aggregation pipeline.
//!
//! Compilation is a single ordered walk: consecutive mergeable operations
//! of one stage buffer into a run, each run flushes through its stage's
//! folder, and non-mergeable operations emit their own stages. Global
//! scopes are applied to the builder first (once); shadowed paging
//! operations are dropped before bucketing.

mod group_folder;
mod lookup;
pub(crate) mod match_folder;
mod project_folder;
mod sort;

use crate::error::Result;
use crate::plan::{Pipeline, PlanStage};
use crate::value::int_bson;
use bson::doc;
use itertools::Itertools;
use query_builder::{Operation, OperationKind, QueryBuilder, Stage};

/// Compile the builder's log into a pipeline. Deterministic for a given
/// log; the first call applies pending global scopes to the builder.
#[tracing::instrument(skip_all, fields(table = builder.table()))]
pub fn compile(builder: &mut QueryBuilder) -> Result<Pipeline> {
    builder.apply_global_scopes();

    let operations = shadow_paging(builder.operations());
    let mut plan = Pipeline::new();

    let mut run_stage: Option<Stage> = None;
    let mut run: Vec<&Operation> = Vec::new();

    for operation in operations {
        if operation.mergeable && run_stage == Some(operation.stage) {
            run.push(operation);
            continue;
        }

        if let Some(stage) = run_stage.take() {
            flush_run(stage, &run, &mut plan)?;
            run.clear();
        }

        if operation.mergeable {
            run_stage = Some(operation.stage);
            run.push(operation);
        } else {
            emit_single(operation, &mut plan)?;
        }
    }

    if let Some(stage) = run_stage {
        flush_run(stage, &run, &mut plan)?;
    }

    tracing::debug!(
        stages = %plan.stages().iter().map(|stage| stage.name).join(" "),
        degradations = plan.degradations().len(),
        "compiled pipeline"
    );
    Ok(plan)
}

/// Drop every `limit`/`skip` operation shadowed by a later one of the same
/// kind: only the last of each reaches the plan.
fn shadow_paging(operations: &[Operation]) -> Vec<&Operation> {
    let last_limit = operations
        .iter()
        .rposition(|op| matches!(op.kind, OperationKind::Limit(_)));
    let last_skip = operations
        .iter()
        .rposition(|op| matches!(op.kind, OperationKind::Skip(_)));

    operations
        .iter()
        .enumerate()
        .filter(|(index, operation)| match operation.kind {
            OperationKind::Limit(_) => Some(*index) == last_limit,
            OperationKind::Skip(_) => Some(*index) == last_skip,
            _ => true,
        })
        .map(|(_, operation)| operation)
        .collect()
}

fn flush_run(stage: Stage, run: &[&Operation], plan: &mut Pipeline) -> Result<()> {
    match stage {
        Stage::Match => {
            if let Some(filter) = match_folder::fold_match_operations(run)? {
                plan.push(PlanStage::new("$match", filter));
            }
        }
        Stage::Project => {
            if let Some(projection) = project_folder::fold_project_operations(run)? {
                plan.push(PlanStage::new("$project", projection));
            }
        }
        Stage::Sort => {
            if let Some(sort) = sort::fold_sort_operations(run)? {
                plan.push(PlanStage::new("$sort", sort));
            }
        }
        Stage::Group => {
            for stage in group_folder::fold_group_operations(run)? {
                plan.push(stage);
            }
        }
        // Non-mergeable stages never form runs.
        Stage::Lookup | Stage::Limit | Stage::Skip | Stage::Window => {
            debug_assert!(false, "non-mergeable stage {stage} buffered as a run");
        }
    }

    Ok(())
}

fn emit_single(operation: &Operation, plan: &mut Pipeline) -> Result<()> {
    match &operation.kind {
        OperationKind::Limit(n) => plan.push(PlanStage::new("$limit", int_bson(*n))),
        OperationKind::Skip(n) => plan.push(PlanStage::new("$skip", int_bson(*n))),
        OperationKind::Sample(n) => {
            plan.push(PlanStage::new("$sample", doc! { "size": int_bson(*n) }));
        }
        OperationKind::Lookup(lookup) => lookup::lower_lookup(lookup, plan)?,
        other => debug_assert!(false, "mergeable operation emitted singly: {other:?}"),
    }

    Ok(())
}
