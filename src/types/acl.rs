//! Object ACL boundary transforms.
//!
//! On the wire an ACL is a map of maps: `{"u1": {"read": true, "write":
//! true}, "*": {"read": true}}`. In storage it is two parallel arrays,
//! `_rperm` and `_wperm`, holding the identifiers permitted to read or write.
//! An object with no ACL at all is implicitly public, represented by the
//! absence of both columns.

use crate::error::{StoreError, StoreResult};
use crate::types::value::{ObjectMap, Value};

/// Storage column holding read-permitted identifiers.
pub const READ_PERMISSIONS_KEY: &str = "_rperm";
/// Storage column holding write-permitted identifiers.
pub const WRITE_PERMISSIONS_KEY: &str = "_wperm";
/// ACL entity granting access to everyone.
pub const PUBLIC_MARKER: &str = "*";

/// Replaces a REST `ACL` entry with `_rperm`/`_wperm` arrays, in place.
///
/// Objects without an `ACL` key are left untouched.
pub fn transform_object_acl(object: &mut ObjectMap) -> StoreResult<()> {
    let Some(acl) = object.remove("ACL") else {
        return Ok(());
    };
    let entries = acl
        .as_object()
        .ok_or_else(|| StoreError::InvalidJson("ACL must be a map of entities".to_string()))?;

    let mut rperm = Vec::new();
    let mut wperm = Vec::new();
    for (entity, perms) in entries {
        let perms = perms.as_object().ok_or_else(|| {
            StoreError::InvalidJson(format!("ACL entry for '{}' must be a map", entity))
        })?;
        for (flag, value) in perms {
            let enabled = value.as_bool().ok_or_else(|| {
                StoreError::InvalidJson(format!("ACL flag '{}' must be a boolean", flag))
            })?;
            match flag.as_str() {
                "read" => {
                    if enabled {
                        rperm.push(Value::String(entity.clone()));
                    }
                }
                "write" => {
                    if enabled {
                        wperm.push(Value::String(entity.clone()));
                    }
                }
                other => {
                    return Err(StoreError::InvalidJson(format!(
                        "unknown ACL flag '{}' for '{}'",
                        other, entity
                    )))
                }
            }
        }
    }
    object.insert(READ_PERMISSIONS_KEY.to_string(), Value::Array(rperm));
    object.insert(WRITE_PERMISSIONS_KEY.to_string(), Value::Array(wperm));
    Ok(())
}

/// Rebuilds the REST `ACL` map from `_rperm`/`_wperm` columns, in place.
///
/// The storage columns are removed; when neither is present the object is
/// returned unchanged (implicitly public).
pub fn untransform_object_acl(object: &mut ObjectMap) {
    let rperm = object.remove(READ_PERMISSIONS_KEY);
    let wperm = object.remove(WRITE_PERMISSIONS_KEY);
    if rperm.is_none() && wperm.is_none() {
        return;
    }

    let mut acl = ObjectMap::new();
    let mut grant = |ids: Option<Value>, flag: &str| {
        let Some(Value::Array(ids)) = ids else { return };
        for id in ids {
            let Value::String(entity) = id else { continue };
            let entry = acl
                .entry(entity)
                .or_insert_with(|| Value::Object(ObjectMap::new()));
            if let Some(map) = entry.as_object_mut() {
                map.insert(flag.to_string(), Value::Bool(true));
            }
        }
    };
    grant(rperm, "read");
    grant(wperm, "write");
    object.insert("ACL".to_string(), Value::Object(acl));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn acl_object(acl: serde_json::Value) -> ObjectMap {
        Value::object_from_json(json!({ "ACL": acl })).unwrap()
    }

    #[test]
    fn transform_splits_read_and_write() {
        let mut object = acl_object(json!({
            "u1": {"read": true, "write": true},
            "*": {"read": true},
        }));
        transform_object_acl(&mut object).unwrap();
        assert!(object.get("ACL").is_none());
        assert_eq!(
            object[READ_PERMISSIONS_KEY],
            Value::Array(vec![Value::from("*"), Value::from("u1")])
        );
        assert_eq!(
            object[WRITE_PERMISSIONS_KEY],
            Value::Array(vec![Value::from("u1")])
        );
    }

    #[test]
    fn read_only_acl_roundtrips() {
        let original = json!({"role:mod": {"read": true}});
        let mut object = acl_object(original.clone());
        transform_object_acl(&mut object).unwrap();
        untransform_object_acl(&mut object);
        assert_eq!(object["ACL"].to_json(), original);
    }

    #[test]
    fn write_only_acl_roundtrips() {
        let original = json!({"u2": {"write": true}});
        let mut object = acl_object(original.clone());
        transform_object_acl(&mut object).unwrap();
        untransform_object_acl(&mut object);
        assert_eq!(object["ACL"].to_json(), original);
    }

    #[test]
    fn missing_acl_is_left_alone() {
        let mut object = Value::object_from_json(json!({"title": "x"})).unwrap();
        transform_object_acl(&mut object).unwrap();
        assert!(object.get(READ_PERMISSIONS_KEY).is_none());
        untransform_object_acl(&mut object);
        assert!(object.get("ACL").is_none());
    }

    #[test]
    fn non_boolean_flag_is_rejected() {
        let mut object = acl_object(json!({"u1": {"read": "yes"}}));
        assert!(matches!(
            transform_object_acl(&mut object),
            Err(StoreError::InvalidJson(_))
        ));
    }
}
