//! Folding of a match-stage run into a single filter document.
//!
//! The folder is not positional: clauses are classified into an AND bucket
//! (keyed by field, insertion-ordered) and a top-level OR list. The first
//! or-connected clause latches or-mode, at which point everything pending
//! migrates into the OR list and later clauses join it too.

use crate::error::{CompilationError, Result};
use crate::value::{field_ref, int_bson, json_to_bson, normalize_json_path, substitute_raw};
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use query_builder::{Condition, DatePart, FilterOp, Operation, OperationKind};
use serde_json::Value;

/// Fold the filter operations of one match run. `None` means the run folded
/// to an empty predicate and no stage should be emitted.
pub(crate) fn fold_match_operations(operations: &[&Operation]) -> Result<Option<Document>> {
    let filters: Vec<&FilterOp> = operations
        .iter()
        .filter_map(|op| match &op.kind {
            OperationKind::Filter(filter) => Some(filter),
            _ => None,
        })
        .collect();

    let mut folder = MatchFolder::default();
    folder.process(&filters)?;
    folder.finish()
}

#[derive(Default)]
struct MatchFolder {
    and_map: IndexMap<String, Bson>,
    or_list: Vec<Document>,
    pending: Vec<Document>,
    or_mode: bool,
}

impl MatchFolder {
    fn process(&mut self, filters: &[&FilterOp]) -> Result<()> {
        for filter in filters {
            let is_or = filter.is_or();

            match &filter.condition {
                Condition::Group(operations) => {
                    let Some(folded) = fold_sub_log(operations)? else {
                        continue;
                    };

                    if is_or {
                        self.latch();
                        match pure_or_children(&folded) {
                            Some(children) => self.or_list.extend(children),
                            None => self.or_list.push(folded),
                        }
                    } else if self.or_mode {
                        self.or_list.push(folded);
                    } else {
                        // A grouped `$or` still merges as one node into the
                        // AND bucket.
                        self.pending.push(folded);
                    }
                }
                Condition::Not(operations)
                | Condition::Subquery {
                    operations,
                    negated: true,
                } => {
                    let Some(folded) = fold_sub_log(operations)? else {
                        continue;
                    };
                    let wrapped = doc! { "$nor": [folded] };

                    if is_or {
                        self.latch();
                        self.or_list.push(wrapped);
                    } else {
                        self.pending.push(wrapped);
                    }
                }
                Condition::Subquery {
                    operations,
                    negated: false,
                } => {
                    let Some(folded) = fold_sub_log(operations)? else {
                        continue;
                    };

                    if is_or {
                        self.latch();
                        self.or_list.push(folded);
                    } else {
                        // Splice: each clause lands as if written inline.
                        for (key, value) in folded {
                            self.pending.push(doc! { key: value });
                        }
                    }
                }
                simple => {
                    let leaf = lower_condition(simple)?;
                    if leaf.is_empty() {
                        continue;
                    }

                    if is_or {
                        self.latch();
                        self.or_list.push(leaf);
                    } else {
                        self.pending.push(leaf);
                    }
                }
            }
        }

        Ok(())
    }

    /// Enter or-mode and move everything pending into the OR list.
    fn latch(&mut self) {
        self.or_mode = true;
        self.or_list.append(&mut self.pending);
    }

    fn finish(mut self) -> Result<Option<Document>> {
        if self.or_mode {
            self.or_list.append(&mut self.pending);
        } else {
            let pending = std::mem::take(&mut self.pending);
            for document in pending {
                self.merge_into_and(document);
            }
        }

        let mut out = Document::new();
        for (key, value) in self.and_map {
            out.insert(key, value);
        }
        if !self.or_list.is_empty() {
            out.insert(
                "$or",
                Bson::Array(self.or_list.into_iter().map(Bson::Document).collect()),
            );
        }

        Ok(if out.is_empty() { None } else { Some(out) })
    }

    /// Merge one conjunction document into the AND bucket. Two operator
    /// bags targeting the same field union key-by-key with the later
    /// operation winning per operator; any other collision replaces.
    fn merge_into_and(&mut self, document: Document) {
        for (key, value) in document {
            match self.and_map.get_mut(&key) {
                Some(existing) => {
                    let unioned = match (&mut *existing, &value) {
                        (Bson::Document(current), Bson::Document(incoming))
                            if is_operator_bag(current) && is_operator_bag(incoming) =>
                        {
                            for (op, op_value) in incoming {
                                current.insert(op.clone(), op_value.clone());
                            }
                            true
                        }
                        _ => false,
                    };

                    if !unioned {
                        *existing = value;
                    }
                }
                None => {
                    self.and_map.insert(key, value);
                }
            }
        }
    }
}

fn is_operator_bag(document: &Document) -> bool {
    !document.is_empty() && document.keys().all(|key| key.starts_with('$'))
}

/// `Some(children)` when the document is exactly a top-level `$or` whose
/// elements are all documents.
fn pure_or_children(document: &Document) -> Option<Vec<Document>> {
    if document.len() != 1 {
        return None;
    }

    let Ok(children) = document.get_array("$or") else {
        return None;
    };

    children
        .iter()
        .map(|child| match child {
            Bson::Document(doc) => Some(doc.clone()),
            _ => None,
        })
        .collect()
}

/// Fold a captured sub-builder log into one predicate node.
///
/// If the sub-log contains any or-connected filter the whole sub-builder
/// short-circuits into a pure `$or` over its clauses; otherwise it folds to
/// an AND bag. This keeps OR/AND grouping predictable inside callbacks.
pub(crate) fn fold_sub_log(operations: &[Operation]) -> Result<Option<Document>> {
    let filters: Vec<&FilterOp> = operations
        .iter()
        .filter_map(|op| match &op.kind {
            OperationKind::Filter(filter) => Some(filter),
            _ => None,
        })
        .collect();

    if filters.iter().any(|filter| filter.is_or()) {
        let mut children = Vec::with_capacity(filters.len());

        for filter in &filters {
            if let Some(node) = single_node(&filter.condition)? {
                children.push(Bson::Document(node));
            }
        }

        return Ok(match children.len() {
            0 => None,
            _ => Some(doc! { "$or": children }),
        });
    }

    let mut folder = MatchFolder::default();
    folder.process(&filters)?;
    folder.finish()
}

/// Lower one condition to a standalone predicate node, used by the pure-or
/// short circuit where no bucketing applies.
fn single_node(condition: &Condition) -> Result<Option<Document>> {
    match condition {
        Condition::Group(operations) | Condition::Subquery {
            operations,
            negated: false,
        } => fold_sub_log(operations),
        Condition::Not(operations)
        | Condition::Subquery {
            operations,
            negated: true,
        } => Ok(fold_sub_log(operations)?.map(|folded| doc! { "$nor": [folded] })),
        simple => {
            let leaf = lower_condition(simple)?;
            Ok(if leaf.is_empty() { None } else { Some(leaf) })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    NotLike,
    In,
    Nin,
}

pub(crate) fn parse_operator(op: &str) -> Result<Comparison> {
    Ok(match op.trim().to_ascii_lowercase().as_str() {
        "=" | "==" => Comparison::Eq,
        "!=" | "<>" => Comparison::Ne,
        ">" => Comparison::Gt,
        ">=" => Comparison::Gte,
        "<" => Comparison::Lt,
        "<=" => Comparison::Lte,
        "like" => Comparison::Like,
        "not like" => Comparison::NotLike,
        "in" => Comparison::In,
        "not in" | "nin" => Comparison::Nin,
        _ => {
            return Err(CompilationError::UnknownOperator { op: op.to_owned() }.into());
        }
    })
}

/// The `$`-operator for comparisons legal inside aggregation expressions.
fn expression_operator(op: &str, comparison: Comparison) -> Result<&'static str> {
    Ok(match comparison {
        Comparison::Eq => "$eq",
        Comparison::Ne => "$ne",
        Comparison::Gt => "$gt",
        Comparison::Gte => "$gte",
        Comparison::Lt => "$lt",
        Comparison::Lte => "$lte",
        _ => {
            return Err(CompilationError::UnknownOperator { op: op.to_owned() }.into());
        }
    })
}

/// `field <op> value` as a query document.
pub(crate) fn comparison_document(field: &str, op: &str, value: &Value) -> Result<Document> {
    let bson = json_to_bson(value)?;

    Ok(match parse_operator(op)? {
        Comparison::Eq => doc! { field: bson },
        Comparison::Ne => doc! { field: { "$ne": bson } },
        Comparison::Gt => doc! { field: { "$gt": bson } },
        Comparison::Gte => doc! { field: { "$gte": bson } },
        Comparison::Lt => doc! { field: { "$lt": bson } },
        Comparison::Lte => doc! { field: { "$lte": bson } },
        Comparison::Like => like_document(field, expect_string(op, value)?, false),
        Comparison::NotLike => like_document(field, expect_string(op, value)?, true),
        Comparison::In => doc! { field: { "$in": expect_array(op, bson)? } },
        Comparison::Nin => doc! { field: { "$nin": expect_array(op, bson)? } },
    })
}

fn expect_string<'a>(op: &str, value: &'a Value) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        CompilationError::UnrepresentableValue {
            detail: format!("operator `{op}` expects a string pattern"),
        }
        .into()
    })
}

fn expect_array(op: &str, value: Bson) -> Result<Vec<Bson>> {
    match value {
        Bson::Array(items) => Ok(items),
        _ => Err(CompilationError::ExpectedValueList { op: op.to_owned() }.into()),
    }
}

/// Translate a `%`/`_` wildcard pattern into an anchored regular
/// expression, escaping everything else.
fn like_pattern(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

fn like_document(field: &str, pattern: &str, negated: bool) -> Document {
    let expression = like_pattern(pattern);

    if negated {
        doc! {
            field: {
                "$not": Bson::RegularExpression(bson::Regex {
                    pattern: expression,
                    options: "i".to_owned(),
                })
            }
        }
    } else {
        doc! { field: { "$regex": expression, "$options": "i" } }
    }
}

fn anchored_regex(field: &str, fragment: String) -> Document {
    doc! { field: { "$regex": fragment, "$options": "i" } }
}

fn date_bson(value: &Value) -> Result<Bson> {
    if let Some(text) = value.as_str() {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
            let utc: DateTime<Utc> = parsed.with_timezone(&Utc);
            return Ok(Bson::DateTime(bson::DateTime::from_chrono(utc)));
        }
    }

    json_to_bson(value)
}

fn date_part_expression(part: DatePart, field: &str) -> Bson {
    let reference = field_ref(field);

    match part {
        DatePart::Day => Bson::Document(doc! { "$dayOfMonth": reference }),
        DatePart::Month => Bson::Document(doc! { "$month": reference }),
        DatePart::Year => Bson::Document(doc! { "$year": reference }),
        DatePart::Time => Bson::Document(doc! {
            "$dateToString": { "format": "%H:%M:%S", "date": reference }
        }),
        DatePart::Date => Bson::Document(doc! {
            "$dateToString": { "format": "%Y-%m-%d", "date": reference }
        }),
    }
}

fn size_expression(reference: Bson) -> Bson {
    Bson::Document(doc! { "$size": { "$ifNull": [reference, []] } })
}

/// Lower a non-callback condition to its leaf document.
pub(crate) fn lower_condition(condition: &Condition) -> Result<Document> {
    Ok(match condition {
        Condition::Eq { field, value } => doc! { field: json_to_bson(value)? },
        Condition::Cmp { field, op, value } => comparison_document(field, op, value)?,
        Condition::Map(entries) => {
            let mut out = Document::new();
            for (field, value) in entries {
                out.insert(field.clone(), json_to_bson(value)?);
            }
            out
        }
        Condition::In {
            field,
            values,
            negated,
        } => {
            let items = values
                .iter()
                .map(json_to_bson)
                .collect::<Result<Vec<Bson>>>()?;
            let operator = if *negated { "$nin" } else { "$in" };
            doc! { field: { operator: items } }
        }
        Condition::Null { field, negated } => {
            if *negated {
                doc! { field: { "$ne": Bson::Null } }
            } else {
                doc! { field: Bson::Null }
            }
        }
        Condition::Between {
            field,
            low,
            high,
            negated,
        } => {
            let range = doc! { "$gte": json_to_bson(low)?, "$lte": json_to_bson(high)? };
            if *negated {
                doc! { field: { "$not": range } }
            } else {
                doc! { field: range }
            }
        }
        Condition::Like {
            field,
            pattern,
            negated,
        } => like_document(field, pattern, *negated),
        Condition::StartsWith { field, prefix } => {
            anchored_regex(field, format!("^{}", regex::escape(prefix)))
        }
        Condition::EndsWith { field, suffix } => {
            anchored_regex(field, format!("{}$", regex::escape(suffix)))
        }
        Condition::FieldExists { field, exists } => doc! { field: { "$exists": *exists } },
        Condition::Size { field, op, value } => match parse_operator(op)? {
            Comparison::Eq => doc! { field: { "$size": int_bson(*value) } },
            comparison => {
                let operator = expression_operator(op, comparison)?;
                doc! {
                    "$expr": {
                        operator: [size_expression(field_ref(field)), int_bson(*value)]
                    }
                }
            }
        },
        Condition::Text { query } => doc! { "$text": { "$search": query.as_str() } },
        Condition::DatePart {
            part,
            field,
            op,
            value,
        } => {
            let operator = expression_operator(op, parse_operator(op)?)?;
            doc! {
                "$expr": {
                    operator: [date_part_expression(*part, field), json_to_bson(value)?]
                }
            }
        }
        Condition::DateBefore { field, value } => doc! { field: { "$lt": date_bson(value)? } },
        Condition::DateAfter { field, value } => doc! { field: { "$gt": date_bson(value)? } },
        Condition::DateBetween { field, start, end } => doc! {
            field: { "$gte": date_bson(start)?, "$lte": date_bson(end)? }
        },
        Condition::Column { field, op, other } => {
            let operator = expression_operator(op, parse_operator(op)?)?;
            doc! { "$expr": { operator: [field_ref(field), field_ref(other)] } }
        }
        Condition::JsonContains { path, value } => {
            doc! { normalize_json_path(path): json_to_bson(value)? }
        }
        Condition::JsonLength { path, op, value } => {
            let operator = expression_operator(op, parse_operator(op)?)?;
            doc! {
                "$expr": {
                    operator: [
                        size_expression(field_ref(&normalize_json_path(path))),
                        int_bson(*value)
                    ]
                }
            }
        }
        Condition::JsonType { path, expected } => {
            doc! { normalize_json_path(path): { "$type": expected.as_str() } }
        }
        Condition::Raw { expr, bindings } => substitute_raw(expr, bindings)?,
        Condition::Group(_) | Condition::Not(_) | Condition::Subquery { .. } => {
            // Callback conditions are handled by the folder before leaves
            // are lowered.
            unreachable!("callback condition reached leaf lowering")
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use query_builder::QueryBuilder;
    use serde_json::json;

    fn fold(build: impl FnOnce(&mut QueryBuilder)) -> Option<Document> {
        let mut qb = QueryBuilder::new("t");
        build(&mut qb);
        let refs: Vec<&Operation> = qb.operations().iter().collect();
        fold_match_operations(&refs).unwrap()
    }

    #[test]
    fn and_clauses_fold_into_one_bag() {
        let folded = fold(|qb| {
            qb.where_eq("a", 1).where_op("b", ">", 2);
        });

        assert_eq!(folded, Some(doc! { "a": 1, "b": { "$gt": 2 } }));
    }

    #[test]
    fn or_latch_pulls_trailing_clauses_into_the_or_list() {
        let folded = fold(|qb| {
            qb.where_eq("a", 1).or_where_eq("b", 2).where_eq("c", 3);
        });

        assert_eq!(
            folded,
            Some(doc! { "$or": [{ "a": 1 }, { "b": 2 }, { "c": 3 }] })
        );
    }

    #[test]
    fn callback_with_or_merges_as_one_node_in_and_mode() {
        let folded = fold(|qb| {
            qb.where_eq("status", "active").where_callback(|sub| {
                sub.where_eq("x", 1).or_where_eq("y", 2);
            });
        });

        assert_eq!(
            folded,
            Some(doc! { "status": "active", "$or": [{ "x": 1 }, { "y": 2 }] })
        );
    }

    #[test]
    fn or_callback_flattens_a_pure_or_result() {
        let folded = fold(|qb| {
            qb.where_eq("a", 1).or_where_callback(|sub| {
                sub.where_eq("x", 1).or_where_eq("y", 2);
            });
        });

        assert_eq!(
            folded,
            Some(doc! { "$or": [{ "a": 1 }, { "x": 1 }, { "y": 2 }] })
        );
    }

    #[test]
    fn sub_builder_without_or_folds_to_an_and_bag() {
        let folded = fold(|qb| {
            qb.where_callback(|sub| {
                sub.where_eq("x", 1).where_op("y", "<", 4);
            });
        });

        assert_eq!(folded, Some(doc! { "x": 1, "y": { "$lt": 4 } }));
    }

    #[test]
    fn negation_wraps_in_a_single_child_nor() {
        let folded = fold(|qb| {
            qb.where_not(|sub| {
                sub.where_eq("x", 1).where_eq("y", 2);
            });
        });

        assert_eq!(folded, Some(doc! { "$nor": [{ "x": 1, "y": 2 }] }));
    }

    #[test]
    fn positive_exists_splices_inline() {
        let folded = fold(|qb| {
            qb.where_eq("a", 1).where_exists(|sub| {
                sub.where_eq("x", 1).where_op("a", ">", 0);
            });
        });

        // The spliced `a` clause collides with the equality leaf; the later
        // operator bag replaces it.
        assert_eq!(folded, Some(doc! { "a": { "$gt": 0 }, "x": 1 }));
    }

    #[test]
    fn operator_bags_union_per_operator() {
        let folded = fold(|qb| {
            qb.where_op("a", ">", 1).where_op("a", "<", 5).where_op("a", ">", 2);
        });

        assert_eq!(folded, Some(doc! { "a": { "$gt": 2, "$lt": 5 } }));
    }

    #[test]
    fn later_equality_replaces_earlier_for_the_same_field() {
        let folded = fold(|qb| {
            qb.where_eq("a", 1).where_eq("a", 2);
        });

        assert_eq!(folded, Some(doc! { "a": 2 }));
    }

    #[test]
    fn empty_callbacks_are_elided() {
        let folded = fold(|qb| {
            qb.where_callback(|_| {}).where_not(|_| {});
        });

        assert_eq!(folded, None);
    }

    #[test]
    fn map_clause_equals_separate_eq_clauses() {
        let via_map = fold(|qb| {
            let mut map = indexmap::IndexMap::new();
            map.insert("a".to_owned(), json!(1));
            map.insert("b".to_owned(), json!(2));
            qb.where_map(map);
        });
        let via_eq = fold(|qb| {
            qb.where_eq("a", 1).where_eq("b", 2);
        });

        assert_eq!(via_map, via_eq);
    }

    #[test]
    fn raw_expression_substitutes_bindings() {
        let folded = fold(|qb| {
            qb.where_raw(r#"{"a": {"$gt": ?}}"#, [json!(10)]);
        });

        assert_eq!(folded, Some(doc! { "a": { "$gt": 10 } }));
    }

    #[test]
    fn like_translates_wildcards_case_insensitively() {
        let folded = fold(|qb| {
            qb.where_like("name", "jo%n_");
        });

        assert_eq!(
            folded,
            Some(doc! { "name": { "$regex": "^jo.*n.$", "$options": "i" } })
        );
    }

    #[test]
    fn between_and_null_lower_to_query_operators() {
        let folded = fold(|qb| {
            qb.where_between("age", 18, 65).where_not_null("email");
        });

        assert_eq!(
            folded,
            Some(doc! {
                "age": { "$gte": 18, "$lte": 65 },
                "email": { "$ne": Bson::Null }
            })
        );
    }

    #[test]
    fn size_with_relational_operator_uses_an_expression() {
        let folded = fold(|qb| {
            qb.where_size("tags", ">", 2);
        });

        assert_eq!(
            folded,
            Some(doc! {
                "$expr": { "$gt": [{ "$size": { "$ifNull": ["$tags", []] } }, 2] }
            })
        );
    }

    #[test]
    fn column_comparison_lowers_to_expr() {
        let folded = fold(|qb| {
            qb.where_column("spent", ">", "budget");
        });

        assert_eq!(
            folded,
            Some(doc! { "$expr": { "$gt": ["$spent", "$budget"] } })
        );
    }

    #[test]
    fn date_part_filters_compare_extracted_components() {
        let folded = fold(|qb| {
            qb.where_date_part(DatePart::Year, "created_at", "=", 2024);
        });

        assert_eq!(
            folded,
            Some(doc! { "$expr": { "$eq": [{ "$year": "$created_at" }, 2024] } })
        );
    }

    #[test]
    fn rfc3339_strings_become_native_dates() {
        let folded = fold(|qb| {
            qb.where_date_before("created_at", "2024-05-01T00:00:00Z");
        })
        .unwrap();

        let clause = folded.get_document("created_at").unwrap();
        assert!(matches!(clause.get("$lt"), Some(Bson::DateTime(_))));
    }

    #[test]
    fn json_paths_normalize_arrows() {
        let folded = fold(|qb| {
            qb.where_json_contains("meta->labels", "beta");
        });

        assert_eq!(folded, Some(doc! { "meta.labels": "beta" }));
    }

    #[test]
    fn unknown_operator_is_a_compilation_error() {
        let mut qb = QueryBuilder::new("t");
        qb.where_op("a", "~~", 1);
        let refs: Vec<&Operation> = qb.operations().iter().collect();

        let err = fold_match_operations(&refs).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Compilation(CompilationError::UnknownOperator { .. })
        ));
    }

    #[test]
    fn sub_log_with_any_or_short_circuits_to_pure_or() {
        let mut qb = QueryBuilder::new("t");
        qb.where_eq("a", 1)
            .or_where_eq("b", 2)
            .where_op("c", ">", 3);
        let folded = fold_sub_log(qb.operations()).unwrap().unwrap();

        assert_eq!(folded.len(), 1);
        assert_eq!(folded.get_array("$or").unwrap().len(), 3);
    }
}
