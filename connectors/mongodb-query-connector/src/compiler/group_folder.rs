//! Lowering of group-stage runs.
//!
//! A grouping becomes a `$group` keyed by a synthetic identifier derived
//! from the spec. When the spec names fields, a rename projection follows
//! immediately: callers see results keyed by their original field names,
//! with the synthetic identifier dropped.

use crate::compiler::match_folder::comparison_document;
use crate::error::{CompilationError, Result};
use crate::plan::PlanStage;
use crate::value::{field_ref, json_to_bson};
use bson::{doc, Bson, Document};
use indexmap::IndexMap;
use query_builder::{Aggregate, GroupOp, GroupSpec, Operation, OperationKind};

/// Lower the group operations of one run, in order. Each `group_by`
/// produces its own `$group` (plus rename `$project` where applicable);
/// `having` clauses become `$match` stages over the grouped output.
pub(crate) fn fold_group_operations(operations: &[&Operation]) -> Result<Vec<PlanStage>> {
    let mut stages = Vec::new();

    for operation in operations {
        let OperationKind::Group(group) = &operation.kind else {
            continue;
        };

        match group {
            GroupOp::By { spec, aggregates } => {
                let identifier = group_identifier(spec)?;
                let lowered = lowered_aggregates(aggregates)?;

                let mut body = doc! { "_id": identifier };
                for (name, accumulator) in &lowered {
                    body.insert(name.clone(), accumulator.clone());
                }
                stages.push(PlanStage::new("$group", body));

                if let Some(fields) = spec.named_fields() {
                    stages.push(PlanStage::new(
                        "$project",
                        rename_projection(&fields, &lowered),
                    ));
                }
            }
            GroupOp::Raw(expr) => {
                stages.push(PlanStage::new("$group", doc! { "_id": json_to_bson(expr)? }));
            }
            GroupOp::Having { field, op, value } => {
                stages.push(PlanStage::new(
                    "$match",
                    comparison_document(field, op, value)?,
                ));
            }
            GroupOp::HavingRaw(expr) => {
                stages.push(PlanStage::new(
                    "$match",
                    crate::value::json_to_document(expr)?,
                ));
            }
        }
    }

    Ok(stages)
}

fn group_identifier(spec: &GroupSpec) -> Result<Bson> {
    Ok(match spec {
        GroupSpec::Field(field) => field_ref(field),
        GroupSpec::Fields(fields) => {
            let mut mapping = Document::new();
            for field in fields {
                mapping.insert(field.clone(), field_ref(field));
            }
            Bson::Document(mapping)
        }
        GroupSpec::Mapping(mapping) => {
            let mut out = Document::new();
            for (key, value) in mapping {
                out.insert(key.clone(), json_to_bson(value)?);
            }
            Bson::Document(out)
        }
    })
}

fn lowered_aggregates(
    aggregates: &IndexMap<String, Aggregate>,
) -> Result<Vec<(String, Bson)>> {
    aggregates
        .iter()
        .map(|(name, aggregate)| Ok((name.clone(), lower_aggregate(aggregate)?)))
        .collect()
}

fn lower_aggregate(aggregate: &Aggregate) -> Result<Bson> {
    fn reduction(op: &'static str, descriptor: &'static str, field: &str) -> Result<Bson> {
        if field.is_empty() {
            return Err(CompilationError::MissingAggregateField { descriptor }.into());
        }
        Ok(Bson::Document(doc! { op: field_ref(field) }))
    }

    match aggregate {
        Aggregate::Count => Ok(Bson::Document(doc! { "$sum": 1 })),
        Aggregate::Sum(field) => reduction("$sum", "sum", field),
        Aggregate::Avg(field) => reduction("$avg", "avg", field),
        Aggregate::Min(field) => reduction("$min", "min", field),
        Aggregate::Max(field) => reduction("$max", "max", field),
        Aggregate::First(field) => reduction("$first", "first", field),
        Aggregate::Last(field) => reduction("$last", "last", field),
        Aggregate::Distinct(field) => reduction("$addToSet", "distinct", field),
        Aggregate::Floor(field) => {
            if field.is_empty() {
                return Err(CompilationError::MissingAggregateField { descriptor: "floor" }.into());
            }
            // $floor is not an accumulator; sample one representative value.
            Ok(Bson::Document(
                doc! { "$first": { "$floor": field_ref(field) } },
            ))
        }
        Aggregate::Raw(expr) => json_to_bson(expr),
    }
}

/// The projection that rebinds named grouping fields from the synthetic
/// identifier, re-exposes each aggregate, and drops `_id`.
fn rename_projection(fields: &[&str], aggregates: &[(String, Bson)]) -> Document {
    let mut projection = Document::new();

    if let [single] = fields {
        projection.insert((*single).to_owned(), "$_id");
    } else {
        for field in fields {
            projection.insert((*field).to_owned(), format!("$_id.{field}"));
        }
    }

    for (name, _) in aggregates {
        projection.insert(name.clone(), Bson::Int32(1));
    }

    projection.insert("_id", Bson::Int32(0));
    projection
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use query_builder::QueryBuilder;

    fn fold(build: impl FnOnce(&mut QueryBuilder)) -> Vec<PlanStage> {
        let mut qb = QueryBuilder::new("t");
        build(&mut qb);
        let refs: Vec<&Operation> = qb.operations().iter().collect();
        fold_group_operations(&refs).unwrap()
    }

    #[test]
    fn named_field_grouping_is_followed_by_a_rename() {
        let mut aggregates = IndexMap::new();
        aggregates.insert("total".to_owned(), Aggregate::Sum("duration".to_owned()));

        let stages = fold(|qb| {
            qb.group_by_with(GroupSpec::Field("type".to_owned()), aggregates);
        });

        assert_eq!(
            stages,
            vec![
                PlanStage::new("$group", doc! { "_id": "$type", "total": { "$sum": "$duration" } }),
                PlanStage::new("$project", doc! { "type": "$_id", "total": 1, "_id": 0 }),
            ]
        );
    }

    #[test]
    fn multi_field_grouping_rebinds_each_component() {
        let stages = fold(|qb| {
            qb.group_by(GroupSpec::Fields(vec!["a".to_owned(), "b".to_owned()]));
        });

        assert_eq!(
            stages,
            vec![
                PlanStage::new("$group", doc! { "_id": { "a": "$a", "b": "$b" } }),
                PlanStage::new("$project", doc! { "a": "$_id.a", "b": "$_id.b", "_id": 0 }),
            ]
        );
    }

    #[test]
    fn mapping_spec_is_used_verbatim_without_a_rename() {
        let mut mapping = IndexMap::new();
        mapping.insert("bucket".to_owned(), serde_json::json!({ "$floor": "$price" }));

        let stages = fold(|qb| {
            qb.group_by(GroupSpec::Mapping(mapping));
        });

        assert_eq!(
            stages,
            vec![PlanStage::new(
                "$group",
                doc! { "_id": { "bucket": { "$floor": "$price" } } }
            )]
        );
    }

    #[test]
    fn count_lowers_to_a_unit_sum() {
        let mut aggregates = IndexMap::new();
        aggregates.insert("n".to_owned(), Aggregate::Count);

        let stages = fold(|qb| {
            qb.group_by_with(GroupSpec::Field("kind".to_owned()), aggregates);
        });

        assert_eq!(
            stages[0],
            PlanStage::new("$group", doc! { "_id": "$kind", "n": { "$sum": 1 } })
        );
    }

    #[test]
    fn distinct_uses_an_accumulating_set() {
        let mut aggregates = IndexMap::new();
        aggregates.insert("authors".to_owned(), Aggregate::Distinct("author".to_owned()));

        let stages = fold(|qb| {
            qb.group_by_with(GroupSpec::Field("kind".to_owned()), aggregates);
        });

        assert_eq!(
            stages[0],
            PlanStage::new(
                "$group",
                doc! { "_id": "$kind", "authors": { "$addToSet": "$author" } }
            )
        );
    }

    #[test]
    fn having_becomes_a_match_over_grouped_output() {
        let stages = fold(|qb| {
            qb.group_by(GroupSpec::Field("type".to_owned()))
                .having("total", ">", 10);
        });

        assert_eq!(stages.len(), 3);
        assert_eq!(
            stages[2],
            PlanStage::new("$match", doc! { "total": { "$gt": 10 } })
        );
    }

    #[test]
    fn missing_aggregate_field_is_a_compilation_error() {
        let mut aggregates = IndexMap::new();
        aggregates.insert("total".to_owned(), Aggregate::Sum(String::new()));

        let mut qb = QueryBuilder::new("t");
        qb.group_by_with(GroupSpec::Field("type".to_owned()), aggregates);
        let refs: Vec<&Operation> = qb.operations().iter().collect();

        let err = fold_group_operations(&refs).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Compilation(CompilationError::MissingAggregateField { .. })
        ));
    }
}
