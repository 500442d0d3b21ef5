//! Schema and class-level-permission validation.
//!
//! Every schema mutation funnels through [`validate_schema_data`] before the
//! adapter is touched; failures are typed and returned synchronously, never
//! coerced.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{StoreError, StoreResult};
use crate::schema::defaults::{
    default_columns, is_system_class, is_volatile_class, UNIVERSAL_COLUMNS,
};
use crate::schema::types::{
    ClassLevelPermissions, FieldSpec, FieldType, Operation, PermissionValue,
};
use crate::types::value::Value;

static CLASS_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("class name regex"));
static FIELD_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*$").expect("field name regex"));

/// Default pattern a literal user-id CLP entity must match.
pub static DEFAULT_USER_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]+$").expect("user id regex"));

pub fn class_name_is_valid(class_name: &str) -> bool {
    is_system_class(class_name)
        || is_volatile_class(class_name)
        || CLASS_NAME_RE.is_match(class_name)
}

pub fn field_name_is_valid(field_name: &str) -> bool {
    FIELD_NAME_RE.is_match(field_name)
}

/// Shape check for a declared field type: pointer and relation targets must
/// be valid class names, and the `ACL` marker type is reserved.
pub fn validate_field_type(field_name: &str, field_type: &FieldType) -> StoreResult<()> {
    match field_type {
        FieldType::Pointer { target_class } | FieldType::Relation { target_class } => {
            if !class_name_is_valid(target_class) {
                return Err(StoreError::InvalidClassName(format!(
                    "invalid target class '{}' for field {}",
                    target_class, field_name
                )));
            }
        }
        FieldType::Acl => {
            return Err(StoreError::IncorrectType(format!(
                "field {} cannot be declared with the reserved ACL type",
                field_name
            )));
        }
        _ => {}
    }
    Ok(())
}

/// The declared type a default value would satisfy, `None` when the value
/// cannot seed any column.
fn default_value_matches(declared: &FieldType, value: &Value) -> bool {
    match (declared, value) {
        (FieldType::String, Value::String(_))
        | (FieldType::Number, Value::Number(_))
        | (FieldType::Boolean, Value::Bool(_))
        | (FieldType::Date, Value::Date(_))
        | (FieldType::Object, Value::Object(_))
        | (FieldType::Array, Value::Array(_))
        | (FieldType::GeoPoint, Value::GeoPoint { .. })
        | (FieldType::Bytes, Value::Bytes(_))
        | (FieldType::Polygon, Value::Polygon(_)) => true,
        (FieldType::Pointer { target_class }, Value::Pointer { class_name, .. }) => {
            target_class == class_name
        }
        _ => false,
    }
}

/// Validates the fields and permissions of a new or updated class.
///
/// Only fields absent from `existing_field_names` are checked: already
/// reconciled columns were validated when they were added.
pub fn validate_schema_data(
    class_name: &str,
    fields: &BTreeMap<String, FieldSpec>,
    clp: &ClassLevelPermissions,
    existing_field_names: &[String],
    user_id_pattern: &Regex,
) -> StoreResult<()> {
    let built_ins = default_columns(class_name);
    for (field_name, spec) in fields {
        if existing_field_names.iter().any(|n| n == field_name) {
            continue;
        }
        if !field_name_is_valid(field_name) {
            return Err(StoreError::InvalidKeyName(format!(
                "invalid field name: {}",
                field_name
            )));
        }
        if built_ins.contains_key(field_name) {
            return Err(StoreError::InvalidKeyName(format!(
                "field {} cannot be added, it is a reserved column of {}",
                field_name, class_name
            )));
        }
        validate_field_type(field_name, &spec.field_type)?;
        if spec.field_type.is_relation() {
            if spec.default_value.is_some() {
                return Err(StoreError::InvalidJson(format!(
                    "relation field {} cannot have a default value",
                    field_name
                )));
            }
            if spec.required {
                return Err(StoreError::InvalidJson(format!(
                    "relation field {} cannot be required",
                    field_name
                )));
            }
        }
        if let Some(default_value) = &spec.default_value {
            if !default_value_matches(&spec.field_type, default_value) {
                return Err(StoreError::IncorrectType(format!(
                    "schema mismatch for default value of {}.{}",
                    class_name, field_name
                )));
            }
        }
    }

    let geo_fields: Vec<&String> = fields
        .iter()
        .filter(|(_, spec)| spec.field_type == FieldType::GeoPoint)
        .map(|(name, _)| name)
        .collect();
    if geo_fields.len() > 1 {
        return Err(StoreError::IncorrectType(format!(
            "only one GeoPoint field may exist in a class; found {} and {}",
            geo_fields[0], geo_fields[1]
        )));
    }

    let mut merged = built_ins;
    for (name, spec) in fields {
        merged.insert(name.clone(), spec.clone());
    }
    validate_clp(clp, &merged, user_id_pattern)
}

/// Validates a class-level-permission object against the class's fields.
pub fn validate_clp(
    clp: &ClassLevelPermissions,
    fields: &BTreeMap<String, FieldSpec>,
    user_id_pattern: &Regex,
) -> StoreResult<()> {
    for field_name in clp.read_user_fields.iter().chain(&clp.write_user_fields) {
        validate_pointer_permission(fields, field_name, "userFields")?;
    }

    for (entity, hidden) in &clp.protected_fields {
        validate_protected_entity(fields, entity, user_id_pattern)?;
        for field_name in hidden {
            if UNIVERSAL_COLUMNS.contains(&field_name.as_str()) {
                return Err(StoreError::InvalidJson(format!(
                    "default field '{}' cannot be protected",
                    field_name
                )));
            }
            if !fields.contains_key(field_name) {
                return Err(StoreError::InvalidJson(format!(
                    "field '{}' in protectedFields:{} does not exist",
                    field_name, entity
                )));
            }
        }
    }

    for op in [
        Operation::Get,
        Operation::Find,
        Operation::Count,
        Operation::Create,
        Operation::Update,
        Operation::Delete,
        Operation::AddField,
    ] {
        for (entity, value) in clp.operation(op).into_iter().flatten() {
            if entity == "pointerFields" {
                match value {
                    PermissionValue::Fields(names) => {
                        for name in names {
                            validate_pointer_permission(fields, name, op.as_str())?;
                        }
                    }
                    PermissionValue::Flag(_) => {
                        return Err(StoreError::InvalidJson(format!(
                            "'pointerFields' of {} must be an array of field names",
                            op.as_str()
                        )));
                    }
                }
                continue;
            }
            if !entity_is_valid(entity, user_id_pattern) {
                return Err(StoreError::InvalidJson(format!(
                    "'{}' is not a valid key for class level permissions {}",
                    entity,
                    op.as_str()
                )));
            }
            if value != &PermissionValue::Flag(true) {
                return Err(StoreError::InvalidJson(format!(
                    "permission value for {}:{} must be true",
                    op.as_str(),
                    entity
                )));
            }
        }
    }
    Ok(())
}

fn entity_is_valid(entity: &str, user_id_pattern: &Regex) -> bool {
    entity == "*"
        || entity == "requiresAuthentication"
        || entity
            .strip_prefix("role:")
            .map(|name| !name.is_empty())
            .unwrap_or(false)
        || user_id_pattern.is_match(entity)
}

fn validate_protected_entity(
    fields: &BTreeMap<String, FieldSpec>,
    entity: &str,
    user_id_pattern: &Regex,
) -> StoreResult<()> {
    if let Some(field_name) = entity.strip_prefix("userField:") {
        return validate_pointer_permission(fields, field_name, "protectedFields");
    }
    let valid = entity == "*"
        || entity == "authenticated"
        || entity
            .strip_prefix("role:")
            .map(|name| !name.is_empty())
            .unwrap_or(false)
        || user_id_pattern.is_match(entity);
    if !valid {
        return Err(StoreError::InvalidJson(format!(
            "'{}' is not a valid entity for protectedFields",
            entity
        )));
    }
    Ok(())
}

/// A pointer-permission field must be a `Pointer<_User>` or an `Array`.
pub fn validate_pointer_permission(
    fields: &BTreeMap<String, FieldSpec>,
    field_name: &str,
    operation: &str,
) -> StoreResult<()> {
    let valid = matches!(
        fields.get(field_name).map(|spec| &spec.field_type),
        Some(FieldType::Pointer { target_class }) if target_class == "_User"
    ) || matches!(
        fields.get(field_name).map(|spec| &spec.field_type),
        Some(FieldType::Array)
    );
    if !valid {
        return Err(StoreError::InvalidJson(format!(
            "'{}' is not a valid column for class level pointer permissions {}",
            field_name, operation
        )));
    }
    Ok(())
}
