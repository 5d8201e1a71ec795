//! Folding of sort runs. Earlier keys take precedence; later duplicates are
//! ignored.

use crate::error::{CompilationError, Result};
use crate::value::json_to_bson;
use bson::{Bson, Document};
use query_builder::{Operation, OperationKind, SortOp, SortOrder};

pub(crate) fn fold_sort_operations(operations: &[&Operation]) -> Result<Option<Document>> {
    let mut sort = Document::new();

    for operation in operations {
        let OperationKind::Sort(op) = &operation.kind else {
            continue;
        };

        match op {
            SortOp::By { field, order } => {
                if !sort.contains_key(field) {
                    let direction = match order {
                        SortOrder::Asc => 1,
                        SortOrder::Desc => -1,
                    };
                    sort.insert(field.clone(), Bson::Int32(direction));
                }
            }
            SortOp::Raw(expr) => {
                let Some(entries) = expr.as_object() else {
                    return Err(CompilationError::MalformedRawExpression {
                        detail: format!("sort expression must be a document, got {expr}"),
                    }
                    .into());
                };
                for (field, value) in entries {
                    if !sort.contains_key(field) {
                        sort.insert(field.clone(), json_to_bson(value)?);
                    }
                }
            }
        }
    }

    Ok(if sort.is_empty() { None } else { Some(sort) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;
    use query_builder::QueryBuilder;

    #[test]
    fn earlier_sort_keys_take_precedence() {
        let mut qb = QueryBuilder::new("t");
        qb.order_by_asc("a").order_by_desc("b").order_by_desc("a");
        let refs: Vec<&Operation> = qb.operations().iter().collect();

        let folded = fold_sort_operations(&refs).unwrap();
        assert_eq!(folded, Some(doc! { "a": 1, "b": -1 }));
    }

    #[test]
    fn raw_sort_merges_without_clobbering() {
        let mut qb = QueryBuilder::new("t");
        qb.order_by_asc("a")
            .order_by_raw(serde_json::json!({ "a": -1, "score": { "$meta": "textScore" } }));
        let refs: Vec<&Operation> = qb.operations().iter().collect();

        let folded = fold_sort_operations(&refs).unwrap();
        assert_eq!(
            folded,
            Some(doc! { "a": 1, "score": { "$meta": "textScore" } })
        );
    }
}
