//! Query-level enforcement of pointer permissions and protected fields.
//!
//! The class-level check in the schema controller decides whether an
//! operation is granted, denied or restricted to owned objects; this module
//! turns a restricted grant into an actual query constraint and computes
//! which fields to strip from read results.

use crate::schema::defaults::USER_SENSITIVE_COLUMNS;
use crate::schema::types::{ClassSchema, FieldType, Operation};
use crate::types::identity::AclGroup;
use crate::types::value::{ObjectMap, Value};

/// Restricts `query` to objects owned by the caller through one of the
/// class's pointer-permission fields.
///
/// Ownership needs a single unambiguous user id; a caller without one (the
/// public, or a group with several candidate ids) gets `None`, meaning no
/// object can possibly match.
pub fn add_pointer_permissions(
    schema: &ClassSchema,
    op: Operation,
    query: &ObjectMap,
    acl_group: &AclGroup,
) -> Option<ObjectMap> {
    let user_id = acl_group.sole_user_id()?;
    let fields = schema.class_level_permissions.pointer_fields(op);
    if fields.is_empty() {
        return None;
    }
    let pointer = Value::pointer("_User", user_id);
    let mut branches: Vec<ObjectMap> = Vec::new();
    for field in &fields {
        let constraint = match schema.field_type(field) {
            Some(FieldType::Array) => {
                let mut all = ObjectMap::new();
                all.insert("$all".to_string(), Value::Array(vec![pointer.clone()]));
                Value::Object(all)
            }
            _ => pointer.clone(),
        };
        // A caller constraint on the same field must still hold, so both
        // are kept under $and instead of overwriting.
        let branch = if query.contains_key(field) {
            let mut ownership = ObjectMap::new();
            ownership.insert(field.clone(), constraint);
            let mut and = ObjectMap::new();
            and.insert(
                "$and".to_string(),
                Value::Array(vec![
                    Value::Object(query.clone()),
                    Value::Object(ownership),
                ]),
            );
            and
        } else {
            let mut branch = query.clone();
            branch.insert(field.clone(), constraint);
            branch
        };
        branches.push(branch);
    }
    if branches.len() == 1 {
        return branches.pop();
    }
    let mut or = ObjectMap::new();
    or.insert(
        "$or".to_string(),
        Value::Array(branches.into_iter().map(Value::Object).collect()),
    );
    Some(or)
}

/// Protected-field rules applicable to one read, partially evaluated.
///
/// A field is protected only when every applicable rule protects it, so the
/// rules fold by intersection. Rules keyed `userField:<column>` depend on
/// each fetched object and stay deferred; their columns must be part of the
/// projection even when the caller did not ask for them.
#[derive(Debug, Default)]
pub struct ProtectedFieldsState {
    immediate: Option<Vec<String>>,
    deferred: Vec<(String, Vec<String>)>,
}

impl ProtectedFieldsState {
    /// Pointer columns the projection must include for deferred rules.
    pub fn aux_keys(&self) -> Vec<String> {
        self.deferred.iter().map(|(field, _)| field.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.immediate.is_none() && self.deferred.is_empty()
    }

    /// The fields to strip from one object. A `_User` reading their own
    /// record is exempt.
    pub fn resolve(
        &self,
        class_name: &str,
        object: &ObjectMap,
        acl_group: &AclGroup,
    ) -> Vec<String> {
        if class_name == "_User" {
            if let Some(object_id) = object.get("objectId").and_then(Value::as_str) {
                if acl_group.contains(object_id) {
                    return Vec::new();
                }
            }
        }
        let mut protected = self.immediate.clone();
        for (field, rule) in &self.deferred {
            if object
                .get(field)
                .map(|value| points_at_caller(value, acl_group))
                .unwrap_or(false)
            {
                intersect_into(&mut protected, rule);
            }
        }
        protected.unwrap_or_default()
    }
}

fn points_at_caller(value: &Value, acl_group: &AclGroup) -> bool {
    match value {
        Value::Pointer { object_id, .. } => acl_group.contains(object_id),
        Value::Array(items) => items.iter().any(|item| points_at_caller(item, acl_group)),
        _ => false,
    }
}

fn intersect_into(current: &mut Option<Vec<String>>, rule: &[String]) {
    match current {
        None => *current = Some(rule.to_vec()),
        Some(fields) => fields.retain(|field| rule.iter().any(|r| r == field)),
    }
}

/// Evaluates which protected-field rules apply to `acl_group` up front.
pub fn compute_protected_fields(
    schema: &ClassSchema,
    acl_group: &AclGroup,
) -> ProtectedFieldsState {
    let mut state = ProtectedFieldsState::default();
    for (entity, fields) in &schema.class_level_permissions.protected_fields {
        if let Some(column) = entity.strip_prefix("userField:") {
            state.deferred.push((column.to_string(), fields.clone()));
            continue;
        }
        let applies = entity == "*"
            || (entity == "authenticated" && acl_group.is_authenticated())
            || acl_group.contains(entity);
        if applies {
            intersect_into(&mut state.immediate, fields);
        }
    }
    state
}

/// Strips the protected fields and, for `_User` rows, the credential and
/// session columns an untrusted caller must never see.
pub fn filter_sensitive_data(
    class_name: &str,
    is_master: bool,
    acl_group: &AclGroup,
    object: &mut ObjectMap,
    protected: &[String],
) {
    for field in protected {
        object.remove(field);
    }
    if class_name != "_User" {
        return;
    }

    // The stored hash surfaces under the schema's column name.
    if let Some(hash) = object.remove("_hashed_password") {
        object.insert("password".to_string(), hash);
    }
    for column in USER_SENSITIVE_COLUMNS {
        if *column != "_hashed_password" {
            object.remove(*column);
        }
    }
    object.remove("sessionToken");
    if is_master {
        return;
    }
    object.remove("password");

    let own_record = object
        .get("objectId")
        .and_then(Value::as_str)
        .map(|id| acl_group.contains(id))
        .unwrap_or(false);
    if !own_record {
        object.remove("authData");
    } else if let Some(auth_data) = object.get_mut("authData").and_then(Value::as_object_mut) {
        // Unlinked providers are stored as null entries.
        auth_data.retain(|_, value| !value.is_null());
    }
}
