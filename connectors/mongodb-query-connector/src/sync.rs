//! The sync adapter: cross-document writes targeting whole documents or one
//! element inside an embedded array.
//!
//! Array updates pick between two strategies. When the document filter
//! already pins the element (a `<array>.<identifier>` key), the positional
//! operator resolves against it and the update runs unchanged. Otherwise
//! every positional path is rewritten to a filtered-element path, the
//! element filter rides along as an array filter, and the document filter
//! is widened to documents that actually carry the array.

use crate::driver::{Driver, OperationOptions};
use crate::error::{Error, Result};
use bson::{doc, Bson, Document};

/// One sync instruction. `array_field`, `identifier_field` and
/// `identifier_value` are required when `is_array_update` is set.
#[derive(Clone, Debug)]
pub struct SyncInstruction {
    pub target_table: String,
    pub filter: Document,
    pub update: Document,
    pub array_field: Option<String>,
    pub identifier_field: Option<String>,
    pub identifier_value: Option<Bson>,
    pub is_array_update: bool,
}

impl SyncInstruction {
    pub fn document_update(
        target_table: impl Into<String>,
        filter: Document,
        update: Document,
    ) -> Self {
        SyncInstruction {
            target_table: target_table.into(),
            filter,
            update,
            array_field: None,
            identifier_field: None,
            identifier_value: None,
            is_array_update: false,
        }
    }

    pub fn array_update(
        target_table: impl Into<String>,
        filter: Document,
        update: Document,
        array_field: impl Into<String>,
        identifier_field: impl Into<String>,
        identifier_value: impl Into<Bson>,
    ) -> Self {
        SyncInstruction {
            target_table: target_table.into(),
            filter,
            update,
            array_field: Some(array_field.into()),
            identifier_field: Some(identifier_field.into()),
            identifier_value: Some(identifier_value.into()),
            is_array_update: true,
        }
    }
}

/// Execute a batch of sync instructions, returning the summed modified
/// count.
pub async fn execute_sync(driver: &dyn Driver, batch: Vec<SyncInstruction>) -> Result<u64> {
    let mut total = 0;

    for instruction in batch {
        total += execute_one(driver, instruction).await?;
    }

    Ok(total)
}

async fn execute_one(driver: &dyn Driver, instruction: SyncInstruction) -> Result<u64> {
    if !instruction.is_array_update {
        return driver
            .update_many(
                &instruction.target_table,
                instruction.filter,
                instruction.update,
                OperationOptions::default(),
            )
            .await;
    }

    let array_field = instruction
        .array_field
        .as_deref()
        .ok_or_else(|| Error::invalid_argument("array update without array_field"))?;
    let identifier_field = instruction
        .identifier_field
        .as_deref()
        .ok_or_else(|| Error::invalid_argument("array update without identifier_field"))?;

    let positional_key = format!("{array_field}.{identifier_field}");

    if instruction.filter.contains_key(&positional_key) {
        // The filter pins the element; the positional operator resolves it.
        return driver
            .update_many(
                &instruction.target_table,
                instruction.filter,
                instruction.update,
                OperationOptions::default(),
            )
            .await;
    }

    let identifier_value = instruction
        .identifier_value
        .clone()
        .ok_or_else(|| Error::invalid_argument("array update without identifier_value"))?;

    let update = rewrite_positional_paths(&instruction.update, array_field);
    let element_filter = doc! { format!("elem.{identifier_field}"): identifier_value };
    let filter = widen_array_filter(instruction.filter, array_field);

    driver
        .update_many(
            &instruction.target_table,
            filter,
            update,
            OperationOptions::with_array_filters(vec![element_filter]),
        )
        .await
}

/// Rewrite every `<array>.$...` path in the update body to the
/// filtered-element form `<array>.$[elem]...`.
fn rewrite_positional_paths(update: &Document, array_field: &str) -> Document {
    let positional_prefix = format!("{array_field}.$");

    let mut rewritten = Document::new();
    for (operator, body) in update {
        match body {
            Bson::Document(paths) => {
                let mut out = Document::new();
                for (path, value) in paths {
                    out.insert(rewrite_path(path, &positional_prefix), value.clone());
                }
                rewritten.insert(operator.clone(), out);
            }
            other => {
                rewritten.insert(operator.clone(), other.clone());
            }
        }
    }
    rewritten
}

fn rewrite_path(path: &str, positional_prefix: &str) -> String {
    match path.strip_prefix(positional_prefix) {
        // `comments.$.text` and a bare `comments.$` both rewrite; a longer
        // field like `comments.$extra` must not.
        Some(rest) if rest.is_empty() || rest.starts_with('.') => {
            format!("{}[elem]{rest}", positional_prefix)
        }
        _ => path.to_owned(),
    }
}

/// Constrain the document filter to documents whose array exists and is
/// non-empty, unless it already constrains the array. Without the guard a
/// filtered-element update scans the whole collection.
fn widen_array_filter(mut filter: Document, array_field: &str) -> Document {
    let already_constrained = filter
        .keys()
        .any(|key| key == array_field || key.starts_with(&format!("{array_field}.")));

    if !already_constrained {
        filter.insert(array_field, doc! { "$exists": true, "$ne": [] });
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RecordingDriver;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn simple_instruction_issues_one_multi_document_update() {
        let driver = RecordingDriver::new();
        let batch = vec![SyncInstruction::document_update(
            "users",
            doc! { "team": "red" },
            doc! { "$set": { "active": false } },
        )];

        let modified = execute_sync(&driver, batch).await.unwrap();
        assert_eq!(modified, 1);

        let calls = driver.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "update_many");
        assert_eq!(calls[0].array_filters, None);
    }

    #[tokio::test]
    async fn array_update_rewrites_to_filtered_element_paths() {
        let driver = RecordingDriver::new();
        let batch = vec![SyncInstruction::array_update(
            "posts",
            doc! { "_id": "P1" },
            doc! { "$set": { "comments.$.text": "hi" } },
            "comments",
            "cid",
            "C7",
        )];

        execute_sync(&driver, batch).await.unwrap();

        let call = &driver.calls()[0];
        assert_eq!(
            call.update,
            Some(doc! { "$set": { "comments.$[elem].text": "hi" } })
        );
        assert_eq!(call.array_filters, Some(vec![doc! { "elem.cid": "C7" }]));
        assert_eq!(
            call.filter,
            Some(doc! { "_id": "P1", "comments": { "$exists": true, "$ne": [] } })
        );
    }

    #[tokio::test]
    async fn positional_strategy_is_used_when_the_filter_pins_the_element() {
        let driver = RecordingDriver::new();
        let batch = vec![SyncInstruction::array_update(
            "posts",
            doc! { "_id": "P1", "comments.cid": "C7" },
            doc! { "$set": { "comments.$.text": "hi" } },
            "comments",
            "cid",
            "C7",
        )];

        execute_sync(&driver, batch).await.unwrap();

        let call = &driver.calls()[0];
        assert_eq!(call.update, Some(doc! { "$set": { "comments.$.text": "hi" } }));
        assert_eq!(call.array_filters, None);
        assert_eq!(
            call.filter,
            Some(doc! { "_id": "P1", "comments.cid": "C7" })
        );
    }

    #[tokio::test]
    async fn constrained_array_filters_are_not_widened_twice() {
        let driver = RecordingDriver::new();
        let batch = vec![SyncInstruction::array_update(
            "posts",
            doc! { "comments": { "$exists": true } },
            doc! { "$set": { "comments.$.text": "hi" } },
            "comments",
            "cid",
            "C7",
        )];

        execute_sync(&driver, batch).await.unwrap();

        assert_eq!(
            driver.calls()[0].filter,
            Some(doc! { "comments": { "$exists": true } })
        );
    }

    #[tokio::test]
    async fn counts_sum_across_the_batch() {
        let driver = RecordingDriver::with_modified_count(3);
        let batch = vec![
            SyncInstruction::document_update("a", doc! {}, doc! { "$set": { "x": 1 } }),
            SyncInstruction::document_update("b", doc! {}, doc! { "$set": { "y": 2 } }),
        ];

        let modified = execute_sync(&driver, batch).await.unwrap();
        assert_eq!(modified, 6);
    }

    #[tokio::test]
    async fn array_update_without_required_fields_is_invalid() {
        let driver = RecordingDriver::new();
        let mut instruction = SyncInstruction::document_update(
            "posts",
            doc! {},
            doc! { "$set": { "x": 1 } },
        );
        instruction.is_array_update = true;

        let err = execute_sync(&driver, vec![instruction]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(driver.calls().is_empty());
    }
}
