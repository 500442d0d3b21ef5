//! Query shape validation.
//!
//! Runs before any desugaring so that malformed queries fail loudly instead
//! of silently matching nothing.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{StoreError, StoreResult};
use crate::schema::defaults::INTERNAL_QUERY_KEYS;
use crate::types::value::{ObjectMap, Value};

static FIELD_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.]*$").expect("query key regex"));
static REGEX_OPTIONS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[imxs]+$").expect("regex options regex"));

const COMPOUND_KEYS: &[&str] = &["$or", "$and", "$nor"];

/// Query operator keys accepted at the top level of a field constraint.
const QUERY_KEYS: &[&str] = &["$relatedTo"];

/// Validates every key of a query map, recursing through compound clauses.
///
/// `ACL` is never queryable; it only exists as the `_rperm`/`_wperm` columns,
/// which are legal internal keys.
pub fn validate_query(query: &ObjectMap) -> StoreResult<()> {
    for (key, value) in query {
        if COMPOUND_KEYS.contains(&key.as_str()) {
            let Value::Array(branches) = value else {
                return Err(StoreError::InvalidQuery(format!(
                    "bad query: {} must hold an array of subqueries",
                    key
                )));
            };
            for branch in branches {
                let Value::Object(branch) = branch else {
                    return Err(StoreError::InvalidQuery(format!(
                        "bad query: every {} branch must be an object",
                        key
                    )));
                };
                validate_query(branch)?;
            }
            continue;
        }
        if key == "ACL" {
            return Err(StoreError::InvalidQuery(
                "Cannot query on ACL".to_string(),
            ));
        }
        if QUERY_KEYS.contains(&key.as_str()) || INTERNAL_QUERY_KEYS.contains(&key.as_str()) {
            validate_constraint(key, value)?;
            continue;
        }
        if !FIELD_KEY_RE.is_match(key) {
            return Err(StoreError::InvalidKeyName(format!(
                "invalid key name: {}",
                key
            )));
        }
        validate_constraint(key, value)?;
    }
    Ok(())
}

fn validate_constraint(key: &str, value: &Value) -> StoreResult<()> {
    let Some(map) = value.as_object() else {
        return Ok(());
    };
    if map.contains_key("$options") {
        let valid = match (map.get("$regex"), map.get("$options")) {
            (Some(Value::String(_)), Some(Value::String(options))) => {
                REGEX_OPTIONS_RE.is_match(options)
            }
            _ => false,
        };
        if !valid {
            return Err(StoreError::InvalidQuery(format!(
                "bad $options value for query on {}: only imxs are supported",
                key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(json: serde_json::Value) -> ObjectMap {
        Value::object_from_json(json).unwrap()
    }

    #[test]
    fn plain_and_dotted_keys_pass() {
        validate_query(&query(json!({
            "title": "hello",
            "author.name": {"$exists": true},
            "_rperm": {"$in": [null, "*"]},
        })))
        .unwrap();
    }

    #[test]
    fn acl_is_not_queryable() {
        let err = validate_query(&query(json!({"ACL": {"$exists": true}}))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
    }

    #[test]
    fn compound_clauses_must_hold_object_arrays() {
        let err = validate_query(&query(json!({"$or": {"a": 1}}))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));

        let err = validate_query(&query(json!({"$or": [{"ACL": 1}]}))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));

        validate_query(&query(json!({"$or": [{"a": 1}, {"b": 2}]}))).unwrap();
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for key in ["$where", "a$b", " title", "1st"] {
            let err = validate_query(&query(json!({key: 1}))).unwrap_err();
            assert!(
                matches!(err, StoreError::InvalidKeyName(_)),
                "expected rejection of {}",
                key
            );
        }
    }

    #[test]
    fn regex_options_are_restricted() {
        validate_query(&query(json!({
            "name": {"$regex": "^a", "$options": "imx"},
        })))
        .unwrap();
        let err = validate_query(&query(json!({
            "name": {"$regex": "^a", "$options": "g"},
        })))
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
        let err = validate_query(&query(json!({"name": {"$options": "i"}}))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
    }
}
