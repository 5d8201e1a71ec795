//! Lowering of join operations to `$lookup` stages.
//!
//! The backend only has a native left-outer lookup. Inner joins add a match
//! filtering empty join arrays; right and full joins degrade to left with a
//! recorded note; cross joins use a pipeline lookup with an always-true
//! match.

use crate::error::Result;
use crate::plan::{Pipeline, PlanStage};
use crate::value::json_to_bson;
use bson::doc;
use query_builder::{JoinKind, LookupOp};

pub(crate) fn lower_lookup(lookup: &LookupOp, plan: &mut Pipeline) -> Result<()> {
    match lookup {
        LookupOp::Join {
            table,
            local_field,
            foreign_field,
            alias,
            kind,
        } => {
            match kind {
                JoinKind::Left => {
                    plan.push(left_lookup(table, local_field, foreign_field, alias));
                }
                JoinKind::Inner => {
                    plan.push(left_lookup(table, local_field, foreign_field, alias));
                    plan.push(PlanStage::new("$match", doc! { alias: { "$ne": [] } }));
                }
                JoinKind::Right | JoinKind::Full => {
                    let requested = match kind {
                        JoinKind::Right => "right",
                        _ => "full",
                    };
                    tracing::warn!(
                        table = table.as_str(),
                        join = requested,
                        "outer join degraded to a left lookup"
                    );
                    plan.record_degradation(format!(
                        "{requested} join on `{table}` degraded to a left lookup"
                    ));
                    plan.push(left_lookup(table, local_field, foreign_field, alias));
                }
                JoinKind::Cross => {
                    plan.push(PlanStage::new(
                        "$lookup",
                        doc! {
                            "from": table.as_str(),
                            "pipeline": [{ "$match": {} }],
                            "as": alias.as_str(),
                        },
                    ));
                }
            }
        }
        LookupOp::Raw(expr) => {
            plan.push(PlanStage::new("$lookup", json_to_bson(expr)?));
        }
    }

    Ok(())
}

fn left_lookup(table: &str, local_field: &str, foreign_field: &str, alias: &str) -> PlanStage {
    PlanStage::new(
        "$lookup",
        doc! {
            "from": table,
            "localField": local_field,
            "foreignField": foreign_field,
            "as": alias,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lower(lookup: LookupOp) -> Pipeline {
        let mut plan = Pipeline::new();
        lower_lookup(&lookup, &mut plan).unwrap();
        plan
    }

    fn join(kind: JoinKind) -> LookupOp {
        LookupOp::Join {
            table: "posts".to_owned(),
            local_field: "_id".to_owned(),
            foreign_field: "user_id".to_owned(),
            alias: "posts".to_owned(),
            kind,
        }
    }

    #[test]
    fn inner_join_filters_empty_arrays() {
        let plan = lower(join(JoinKind::Inner));

        assert_eq!(plan.stages().len(), 2);
        assert_eq!(
            plan.stages()[1],
            PlanStage::new("$match", doc! { "posts": { "$ne": [] } })
        );
    }

    #[test]
    fn right_join_degrades_with_a_note() {
        let plan = lower(join(JoinKind::Right));

        assert_eq!(plan.stages().len(), 1);
        assert_eq!(plan.degradations().len(), 1);
        assert!(plan.degradations()[0].contains("right join"));
    }

    #[test]
    fn cross_join_synthesizes_an_always_true_match() {
        let plan = lower(LookupOp::Join {
            table: "tags".to_owned(),
            local_field: String::new(),
            foreign_field: String::new(),
            alias: "tags".to_owned(),
            kind: JoinKind::Cross,
        });

        assert_eq!(
            plan.stages()[0],
            PlanStage::new(
                "$lookup",
                doc! { "from": "tags", "pipeline": [{ "$match": {} }], "as": "tags" }
            )
        );
    }
}
