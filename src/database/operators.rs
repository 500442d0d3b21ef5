//! Write-payload plumbing: key validation, field-type inference from
//! payloads, and extraction of relation operators.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{StoreError, StoreResult};
use crate::schema::defaults::INTERNAL_QUERY_KEYS;
use crate::schema::types::FieldType;
use crate::types::value::{ObjectMap, Value};

static WRITE_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.]*$").expect("write key regex"));

/// Update operators whose applied result is echoed back to the caller.
const RETURNED_OPS: &[&str] = &["Increment", "Add", "AddUnique", "Remove"];

/// A relation edge mutation lifted out of a write payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationOp {
    pub field_name: String,
    pub related_ids: Vec<String>,
    pub add: bool,
}

/// Validates the keys of a write payload.
///
/// Top-level keys follow field-name syntax (dotted paths address the inside
/// of object columns); keys nested inside values must not smuggle operators
/// or paths past the top level.
pub fn validate_object_keys(object: &ObjectMap) -> StoreResult<()> {
    for (key, value) in object {
        if !WRITE_KEY_RE.is_match(key) && !INTERNAL_QUERY_KEYS.contains(&key.as_str()) {
            return Err(StoreError::InvalidKeyName(format!(
                "invalid key name: {}",
                key
            )));
        }
        validate_nested_keys(value)?;
    }
    Ok(())
}

fn validate_nested_keys(value: &Value) -> StoreResult<()> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if key != "__op" && (key.contains('$') || key.contains('.')) {
                    return Err(StoreError::InvalidNestedKey(format!(
                        "nested keys should not contain the '$' or '.' characters: {}",
                        key
                    )));
                }
                validate_nested_keys(nested)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                validate_nested_keys(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// The column type a payload value implies, `None` when the value cannot
/// seed a column (null, or a `Delete` operator).
pub fn infer_field_type(field_name: &str, value: &Value) -> StoreResult<Option<FieldType>> {
    if let Some((op, args)) = value.as_operator() {
        return match op {
            "Increment" => Ok(Some(FieldType::Number)),
            "Add" | "AddUnique" | "Remove" => Ok(Some(FieldType::Array)),
            "AddRelation" | "RemoveRelation" => {
                let target_class = args
                    .get("objects")
                    .and_then(Value::as_array)
                    .and_then(|objects| objects.first())
                    .and_then(Value::as_pointer)
                    .map(|(class_name, _)| class_name.to_string())
                    .ok_or_else(|| {
                        StoreError::InvalidJson(format!(
                            "{} on {} needs an array of pointers",
                            op, field_name
                        ))
                    })?;
                Ok(Some(FieldType::Relation { target_class }))
            }
            "Batch" => match args.get("ops").and_then(Value::as_array) {
                Some(ops) if !ops.is_empty() => infer_field_type(field_name, &ops[0]),
                _ => Err(StoreError::InvalidJson(format!(
                    "Batch on {} needs a non-empty ops array",
                    field_name
                ))),
            },
            "Delete" => Ok(None),
            other => Err(StoreError::CommandUnavailable(format!(
                "unknown operator {} on {}",
                other, field_name
            ))),
        };
    }
    Ok(match value {
        Value::Null => None,
        Value::Bool(_) => Some(FieldType::Boolean),
        Value::Number(_) => Some(FieldType::Number),
        Value::String(_) => Some(FieldType::String),
        Value::Array(_) => Some(FieldType::Array),
        Value::Object(_) => Some(FieldType::Object),
        Value::Date(_) => Some(FieldType::Date),
        Value::Bytes(_) => Some(FieldType::Bytes),
        Value::GeoPoint { .. } => Some(FieldType::GeoPoint),
        Value::Polygon(_) => Some(FieldType::Polygon),
        Value::Pointer { class_name, .. } => Some(FieldType::Pointer {
            target_class: class_name.clone(),
        }),
        Value::Relation { target_class } => Some(FieldType::Relation {
            target_class: target_class.clone(),
        }),
    })
}

/// Lifts `AddRelation`/`RemoveRelation` operators (and `Batch` combinations
/// of the two) out of a write payload. Relation edges live in join tables,
/// so the lifted keys are removed from the payload entirely.
pub fn collect_relation_updates(update: &mut ObjectMap) -> StoreResult<Vec<RelationOp>> {
    let mut ops = Vec::new();
    let keys: Vec<String> = update.keys().cloned().collect();
    for key in keys {
        let op_name = match update.get(&key).and_then(Value::as_operator) {
            Some((op, _)) => op.to_string(),
            None => continue,
        };
        match op_name.as_str() {
            "AddRelation" | "RemoveRelation" => {
                let value = update.remove(&key).expect("key just enumerated");
                let (_, args) = value.as_operator().expect("operator just matched");
                ops.push(relation_op(&key, op_name == "AddRelation", args)?);
            }
            "Batch" => {
                let value = update.remove(&key).expect("key just enumerated");
                let (_, args) = value.as_operator().expect("operator just matched");
                let batch = args.get("ops").and_then(Value::as_array).ok_or_else(|| {
                    StoreError::InvalidJson(format!("Batch on {} needs an ops array", key))
                })?;
                for entry in batch {
                    let (op, args) = entry.as_operator().ok_or_else(|| {
                        StoreError::InvalidJson(format!(
                            "Batch on {} may only hold operators",
                            key
                        ))
                    })?;
                    match op {
                        "AddRelation" => ops.push(relation_op(&key, true, args)?),
                        "RemoveRelation" => ops.push(relation_op(&key, false, args)?),
                        other => {
                            return Err(StoreError::InvalidJson(format!(
                                "Batch on {} may only combine relation operators, got {}",
                                key, other
                            )))
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(ops)
}

fn relation_op(field_name: &str, add: bool, args: &ObjectMap) -> StoreResult<RelationOp> {
    let objects = args.get("objects").and_then(Value::as_array).ok_or_else(|| {
        StoreError::InvalidJson(format!(
            "relation operator on {} needs an objects array",
            field_name
        ))
    })?;
    let related_ids = objects
        .iter()
        .map(|object| {
            object
                .as_pointer()
                .map(|(_, object_id)| object_id.to_string())
                .ok_or_else(|| {
                    StoreError::InvalidJson(format!(
                        "relation operator on {} may only reference pointers",
                        field_name
                    ))
                })
        })
        .collect::<StoreResult<Vec<String>>>()?;
    Ok(RelationOp {
        field_name: field_name.to_string(),
        related_ids,
        add,
    })
}

/// Projects an update result down to what the caller is told: only the
/// applied values of echoing operators.
pub fn sanitize_database_result(original: &ObjectMap, result: &ObjectMap) -> ObjectMap {
    let mut response = ObjectMap::new();
    for (key, value) in original {
        if let Some((op, _)) = value.as_operator() {
            if RETURNED_OPS.contains(&op) {
                if let Some(updated) = result.get(key) {
                    response.insert(key.clone(), updated.clone());
                }
            }
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(json: serde_json::Value) -> ObjectMap {
        Value::object_from_json(json).unwrap()
    }

    #[test]
    fn nested_keys_cannot_smuggle_operators() {
        validate_object_keys(&object(json!({
            "profile.bio": "x",
            "settings": {"theme": "dark"},
        })))
        .unwrap();

        let err = validate_object_keys(&object(json!({
            "settings": {"$gt": 1},
        })))
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidNestedKey(_)));

        let err = validate_object_keys(&object(json!({"bad name": 1}))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKeyName(_)));
    }

    #[test]
    fn field_types_follow_payload_values() {
        let cases = [
            (json!("x"), Some(FieldType::String)),
            (json!(1.5), Some(FieldType::Number)),
            (json!(null), None),
            (json!({"__op": "Increment", "amount": 1}), Some(FieldType::Number)),
            (json!({"__op": "Add", "objects": []}), Some(FieldType::Array)),
            (json!({"__op": "Delete"}), None),
        ];
        for (payload, expected) in cases {
            let value = Value::from_json(payload).unwrap();
            assert_eq!(infer_field_type("f", &value).unwrap(), expected);
        }

        let relation = Value::from_json(json!({
            "__op": "AddRelation",
            "objects": [{"__type": "Pointer", "className": "_User", "objectId": "u1"}],
        }))
        .unwrap();
        assert_eq!(
            infer_field_type("likes", &relation).unwrap(),
            Some(FieldType::Relation {
                target_class: "_User".to_string()
            })
        );
    }

    #[test]
    fn relation_operators_are_lifted_out_of_the_payload() {
        let mut update = object(json!({
            "title": "x",
            "likes": {"__op": "AddRelation", "objects": [
                {"__type": "Pointer", "className": "_User", "objectId": "u1"},
                {"__type": "Pointer", "className": "_User", "objectId": "u2"},
            ]},
            "tags": {"__op": "Batch", "ops": [
                {"__op": "AddRelation", "objects": [
                    {"__type": "Pointer", "className": "Tag", "objectId": "t1"},
                ]},
                {"__op": "RemoveRelation", "objects": [
                    {"__type": "Pointer", "className": "Tag", "objectId": "t2"},
                ]},
            ]},
        }));
        let ops = collect_relation_updates(&mut update).unwrap();
        assert_eq!(update.keys().collect::<Vec<_>>(), vec!["title"]);
        assert_eq!(
            ops,
            vec![
                RelationOp {
                    field_name: "likes".to_string(),
                    related_ids: vec!["u1".to_string(), "u2".to_string()],
                    add: true,
                },
                RelationOp {
                    field_name: "tags".to_string(),
                    related_ids: vec!["t1".to_string()],
                    add: true,
                },
                RelationOp {
                    field_name: "tags".to_string(),
                    related_ids: vec!["t2".to_string()],
                    add: false,
                },
            ]
        );
    }

    #[test]
    fn batch_rejects_non_relation_operators() {
        let mut update = object(json!({
            "tags": {"__op": "Batch", "ops": [{"__op": "Increment", "amount": 1}]},
        }));
        let err = collect_relation_updates(&mut update).unwrap_err();
        assert!(matches!(err, StoreError::InvalidJson(_)));
    }

    #[test]
    fn update_responses_echo_operator_results_only() {
        let original = object(json!({
            "title": "x",
            "views": {"__op": "Increment", "amount": 1},
            "tags": {"__op": "Add", "objects": ["a"]},
        }));
        let result = object(json!({
            "objectId": "o1",
            "title": "x",
            "views": 6,
            "tags": ["a"],
        }));
        let response = sanitize_database_result(&original, &result);
        assert_eq!(
            crate::types::value::Value::Object(response).to_json(),
            json!({"views": 6, "tags": ["a"]})
        );
    }
}
