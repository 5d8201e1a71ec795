//! Folding of a project-stage run into a single projection document.
//!
//! The walk is positional: later operations override earlier ones for the
//! same field. Computed fields lower to aggregation expressions in JSON
//! space; driver-projection mutators queue during the walk and run last,
//! over the finished map.

use crate::error::{CompilationError, Result};
use crate::value::json_to_bson;
use bson::Document;
use query_builder::{Operation, OperationKind, ProjectOp, ProjectionMutator, SelectValue};
use serde_json::{json, Map, Value};

/// Fold the projection operations of one project run. `None` means the map
/// ended up empty and no stage should be emitted.
pub(crate) fn fold_project_operations(operations: &[&Operation]) -> Result<Option<Document>> {
    let ops: Vec<&ProjectOp> = operations
        .iter()
        .filter_map(|op| match &op.kind {
            OperationKind::Project(project) => Some(project),
            _ => None,
        })
        .collect();

    let map = fold_into_map(&ops)?;
    if map.is_empty() {
        return Ok(None);
    }

    let mut document = Document::new();
    for (field, value) in &map {
        document.insert(field.clone(), json_to_bson(value)?);
    }

    Ok(Some(document))
}

fn fold_into_map(ops: &[&ProjectOp]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    let mut mutators: Vec<ProjectionMutator> = Vec::new();

    for op in ops {
        match op {
            ProjectOp::Include(fields) | ProjectOp::Add(fields) => {
                for field in fields {
                    map.insert(field.clone(), json!(1));
                }
            }
            ProjectOp::Exclude(fields) => {
                for field in fields {
                    map.insert(field.clone(), json!(0));
                }
            }
            ProjectOp::Mapped(entries) => {
                for (field, select) in entries {
                    let value = match select {
                        SelectValue::Include => json!(1),
                        SelectValue::Exclude => json!(0),
                        SelectValue::Alias(source) => json!(format!("${source}")),
                    };
                    map.insert(field.clone(), value);
                }
            }
            ProjectOp::Raw { field, expr } => {
                map.insert(field.clone(), expr.clone());
            }
            ProjectOp::Sub { field, operations } => {
                let nested_ops: Vec<&ProjectOp> = operations
                    .iter()
                    .filter_map(|op| match &op.kind {
                        OperationKind::Project(project) => Some(project),
                        _ => None,
                    })
                    .collect();
                let nested = fold_into_map(&nested_ops)?;
                map.insert(field.clone(), Value::Object(nested));
            }
            ProjectOp::Aggregate { field, op, alias } => {
                map.insert(alias.clone(), aggregate_expression(field, op)?);
            }
            ProjectOp::Count { field, alias } => {
                map.insert(alias.clone(), aggregate_expression(field, "count")?);
            }
            ProjectOp::Exists { field, alias } => {
                map.insert(
                    alias.clone(),
                    json!({ "$ne": [{ "$type": format!("${field}") }, "missing"] }),
                );
            }
            ProjectOp::Case {
                alias,
                branches,
                default,
            } => {
                let branches: Vec<Value> = branches
                    .iter()
                    .map(|branch| json!({ "case": branch.when, "then": branch.then }))
                    .collect();
                map.insert(
                    alias.clone(),
                    json!({ "$switch": { "branches": branches, "default": default } }),
                );
            }
            ProjectOp::When {
                alias,
                cond,
                then,
                otherwise,
            } => {
                map.insert(
                    alias.clone(),
                    json!({ "$cond": { "if": cond, "then": then, "else": otherwise } }),
                );
            }
            ProjectOp::Json { alias, path } => {
                map.insert(
                    alias.clone(),
                    json!(format!("${}", crate::value::normalize_json_path(path))),
                );
            }
            ProjectOp::JsonRaw { alias, expr } => {
                map.insert(alias.clone(), expr.clone());
            }
            ProjectOp::Concat { alias, parts } => {
                let resolved: Vec<Value> = parts.iter().map(resolve_reference).collect();
                map.insert(alias.clone(), json!({ "$concat": resolved }));
            }
            ProjectOp::Coalesce { alias, fields } => {
                map.insert(alias.clone(), coalesce_chain(fields));
            }
            ProjectOp::DriverMutator(mutator) => {
                mutators.push(mutator.clone());
            }
        }
    }

    for mutator in mutators {
        mutator(&mut map);
    }

    Ok(map)
}

fn aggregate_expression(field: &str, op: &str) -> Result<Value> {
    if field.is_empty() {
        return Err(CompilationError::MissingAggregateField {
            descriptor: "projection aggregate",
        }
        .into());
    }

    let reference = format!("${field}");

    Ok(match op.trim().to_ascii_lowercase().as_str() {
        "count" => json!({ "$size": { "$ifNull": [reference, []] } }),
        "sum" => json!({ "$sum": reference }),
        "avg" => json!({ "$avg": reference }),
        "min" => json!({ "$min": reference }),
        "max" => json!({ "$max": reference }),
        "first" => json!({ "$first": reference }),
        "last" => json!({ "$last": reference }),
        other => {
            return Err(CompilationError::UnknownProjectionAggregate {
                op: other.to_owned(),
            }
            .into());
        }
    })
}

/// String parts resolve as field references; anything else passes through
/// literally. A part that already carries a `$` prefix stays untouched.
fn resolve_reference(part: &Value) -> Value {
    match part.as_str() {
        Some(text) if text.starts_with('$') => part.clone(),
        Some(text) => json!(format!("${text}")),
        None => part.clone(),
    }
}

/// Right-associated `$ifNull` chain over field references.
fn coalesce_chain(fields: &[String]) -> Value {
    let mut iter = fields.iter().rev();
    let Some(last) = iter.next() else {
        return Value::Null;
    };

    let mut chain = json!(format!("${last}"));
    for field in iter {
        chain = json!({ "$ifNull": [format!("${field}"), chain] });
    }
    chain
}
