//! Built-in columns, system classes and volatile classes.

use std::collections::BTreeMap;

use crate::schema::types::{ClassSchema, FieldSpec, FieldType};

/// Classes with reserved names that carry extra built-in columns.
pub const SYSTEM_CLASSES: &[&str] = &["_User", "_Role", "_Session"];

/// In-memory classes served from a synthesized schema entry; they are never
/// persisted by the adapter but must always resolve for trusted internals.
pub const VOLATILE_CLASSES: &[&str] = &[
    "_JobStatus",
    "_PushStatus",
    "_Hooks",
    "_GlobalConfig",
    "_Audience",
    "_Idempotency",
];

/// Columns present on every class. Callers can neither redefine nor delete
/// them.
pub const UNIVERSAL_COLUMNS: &[&str] = &["objectId", "createdAt", "updatedAt", "ACL"];

/// `_User` columns that never leave the system for untrusted callers.
pub const USER_SENSITIVE_COLUMNS: &[&str] = &[
    "_hashed_password",
    "_email_verify_token",
    "_email_verify_token_expires_at",
    "_account_lockout_expires_at",
    "_failed_login_count",
    "_perishable_token",
    "_perishable_token_expires_at",
    "_password_changed_at",
    "_password_history",
];

/// Internal storage keys that are legal in queries despite failing the
/// regular field-name syntax.
pub const INTERNAL_QUERY_KEYS: &[&str] = &[
    "_id",
    "_rperm",
    "_wperm",
    "_hashed_password",
    "_email_verify_token",
    "_email_verify_token_expires_at",
    "_account_lockout_expires_at",
    "_failed_login_count",
    "_perishable_token",
    "_perishable_token_expires_at",
    "_password_changed_at",
];

pub fn is_system_class(class_name: &str) -> bool {
    SYSTEM_CLASSES.contains(&class_name)
}

pub fn is_volatile_class(class_name: &str) -> bool {
    VOLATILE_CLASSES.contains(&class_name)
}

/// The built-in columns of `class_name`: the universal four plus any
/// class-specific system columns.
pub fn default_columns(class_name: &str) -> BTreeMap<String, FieldSpec> {
    let mut fields = BTreeMap::new();
    fields.insert("objectId".to_string(), FieldSpec::of(FieldType::String));
    fields.insert("createdAt".to_string(), FieldSpec::of(FieldType::Date));
    fields.insert("updatedAt".to_string(), FieldSpec::of(FieldType::Date));
    fields.insert("ACL".to_string(), FieldSpec::of(FieldType::Acl));

    match class_name {
        "_User" => {
            fields.insert("username".to_string(), FieldSpec::of(FieldType::String));
            fields.insert("password".to_string(), FieldSpec::of(FieldType::String));
            fields.insert("email".to_string(), FieldSpec::of(FieldType::String));
            fields.insert(
                "emailVerified".to_string(),
                FieldSpec::of(FieldType::Boolean),
            );
            fields.insert("authData".to_string(), FieldSpec::of(FieldType::Object));
        }
        "_Role" => {
            fields.insert("name".to_string(), FieldSpec::of(FieldType::String));
            fields.insert(
                "users".to_string(),
                FieldSpec::of(FieldType::Relation {
                    target_class: "_User".to_string(),
                }),
            );
            fields.insert(
                "roles".to_string(),
                FieldSpec::of(FieldType::Relation {
                    target_class: "_Role".to_string(),
                }),
            );
        }
        "_Session" => {
            fields.insert(
                "user".to_string(),
                FieldSpec::of(FieldType::Pointer {
                    target_class: "_User".to_string(),
                }),
            );
            fields.insert(
                "sessionToken".to_string(),
                FieldSpec::of(FieldType::String),
            );
            fields.insert("expiresAt".to_string(), FieldSpec::of(FieldType::Date));
            fields.insert("createdWith".to_string(), FieldSpec::of(FieldType::Object));
        }
        _ => {}
    }
    fields
}

/// Synthesized schema for a volatile class: built-in columns, open CLP.
pub fn volatile_schema(class_name: &str) -> ClassSchema {
    let mut schema = ClassSchema::empty(class_name);
    schema.fields = default_columns(class_name);
    schema
}

/// Merges the built-in columns into `schema` without overriding stored
/// declarations.
pub fn inject_default_columns(schema: &mut ClassSchema) {
    for (name, spec) in default_columns(&schema.class_name) {
        schema.fields.entry(name).or_insert(spec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_class_gets_the_universal_columns() {
        let fields = default_columns("Post");
        for column in UNIVERSAL_COLUMNS {
            assert!(fields.contains_key(*column), "missing {}", column);
        }
    }

    #[test]
    fn role_relations_target_system_classes() {
        let fields = default_columns("_Role");
        assert_eq!(
            fields["users"].field_type.target_class(),
            Some("_User")
        );
        assert_eq!(
            fields["roles"].field_type.target_class(),
            Some("_Role")
        );
    }

    #[test]
    fn inject_does_not_clobber_stored_fields() {
        let mut schema = ClassSchema::empty("Post");
        schema.fields.insert(
            "objectId".to_string(),
            FieldSpec::of(FieldType::String),
        );
        schema
            .fields
            .insert("title".to_string(), FieldSpec::of(FieldType::String));
        inject_default_columns(&mut schema);
        assert!(schema.fields.contains_key("createdAt"));
        assert_eq!(schema.fields["title"].field_type, FieldType::String);
    }
}
