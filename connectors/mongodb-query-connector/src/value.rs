//! JSON-to-BSON conversion and small expression helpers shared by the
//! folders.
//!
//! The operation log carries `serde_json::Value` payloads; lowering converts
//! them here rather than through the driver's extended-JSON parser, which
//! would reinterpret `$`-prefixed keys.

use crate::error::{CompilationError, Result};
use bson::{Bson, Document};
use serde_json::Value;

/// Convert a JSON value to BSON. Integers that fit stay 32-bit, matching
/// what the `doc!` literal macro produces.
pub(crate) fn json_to_bson(value: &Value) -> Result<Bson> {
    Ok(match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    Bson::Int32(small)
                } else {
                    Bson::Int64(i)
                }
            } else if let Some(f) = n.as_f64() {
                Bson::Double(f)
            } else {
                return Err(CompilationError::UnrepresentableValue {
                    detail: format!("number out of range: {n}"),
                }
                .into());
            }
        }
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(
            items
                .iter()
                .map(json_to_bson)
                .collect::<Result<Vec<Bson>>>()?,
        ),
        Value::Object(map) => {
            let mut doc = Document::new();
            for (key, item) in map {
                doc.insert(key.clone(), json_to_bson(item)?);
            }
            Bson::Document(doc)
        }
    })
}

/// Convert a JSON value that must lower to a document.
pub(crate) fn json_to_document(value: &Value) -> Result<Document> {
    match json_to_bson(value)? {
        Bson::Document(doc) => Ok(doc),
        other => Err(CompilationError::MalformedRawExpression {
            detail: format!("expected a document, got {other}"),
        }
        .into()),
    }
}

/// `"$field"` reference for an aggregation expression.
pub(crate) fn field_ref(field: &str) -> Bson {
    Bson::String(format!("${field}"))
}

/// An unsigned count as BSON, 32-bit where it fits.
pub(crate) fn int_bson(value: u64) -> Bson {
    match i32::try_from(value) {
        Ok(small) => Bson::Int32(small),
        Err(_) => Bson::Int64(value as i64),
    }
}

/// Normalize an arrow-style JSON path (`meta->labels->0`) to the dotted
/// form the backend expects.
pub(crate) fn normalize_json_path(path: &str) -> String {
    path.replace("->", ".")
}

/// Substitute each `?` placeholder with the JSON encoding of the matching
/// binding, then parse the result as a document.
pub(crate) fn substitute_raw(expr: &str, bindings: &[Value]) -> Result<Document> {
    let mut rendered = expr.to_owned();

    for binding in bindings {
        let encoded = serde_json::to_string(binding).map_err(|err| {
            CompilationError::MalformedRawExpression {
                detail: err.to_string(),
            }
        })?;
        rendered = rendered.replacen('?', &encoded, 1);
    }

    let parsed: Value =
        serde_json::from_str(&rendered).map_err(|err| CompilationError::MalformedRawExpression {
            detail: format!("{err} in `{rendered}`"),
        })?;

    json_to_document(&parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn small_integers_stay_32_bit() {
        assert_eq!(json_to_bson(&json!(7)).unwrap(), Bson::Int32(7));
        assert_eq!(
            json_to_bson(&json!(i64::MAX)).unwrap(),
            Bson::Int64(i64::MAX)
        );
    }

    #[test]
    fn dollar_keys_are_not_reinterpreted() {
        let bson = json_to_bson(&json!({"$gt": 5})).unwrap();
        assert_eq!(bson, Bson::Document(doc! { "$gt": 5 }));
    }

    #[test]
    fn raw_substitution_is_positional() {
        let doc = substitute_raw(r#"{"a": ?, "b": ?}"#, &[json!(1), json!("x")]).unwrap();
        assert_eq!(doc, doc! { "a": 1, "b": "x" });
    }

    #[test]
    fn malformed_raw_is_a_compilation_error() {
        let err = substitute_raw("{not json", &[]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Compilation(CompilationError::MalformedRawExpression { .. })
        ));
    }

    #[test]
    fn arrow_paths_normalize_to_dots() {
        assert_eq!(normalize_json_path("meta->labels->0"), "meta.labels.0");
    }
}
