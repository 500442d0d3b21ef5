//! Class schema, field-type and class-level-permission types.
//!
//! These structures (de)serialize to the exact REST wire shape so that a
//! schema fetched from the adapter or submitted by a caller needs no separate
//! translation layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::value::Value;

/// Declared type of a class field, tagged as `{"type": ...}` on the wire.
///
/// `Acl` exists only for the built-in `ACL` column and is never accepted from
/// callers (validation rejects redefinition of built-in columns).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Object,
    Array,
    GeoPoint,
    File,
    Bytes,
    Polygon,
    #[serde(rename = "ACL")]
    Acl,
    Pointer {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
    Relation {
        #[serde(rename = "targetClass")]
        target_class: String,
    },
}

impl FieldType {
    pub fn is_relation(&self) -> bool {
        matches!(self, FieldType::Relation { .. })
    }

    /// Target class of a `Pointer` or `Relation`.
    pub fn target_class(&self) -> Option<&str> {
        match self {
            FieldType::Pointer { target_class } | FieldType::Relation { target_class } => {
                Some(target_class)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Pointer { target_class } => write!(f, "Pointer<{}>", target_class),
            FieldType::Relation { target_class } => write!(f, "Relation<{}>", target_class),
            FieldType::Acl => write!(f, "ACL"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A field declaration: its type plus the optional `required`/`defaultValue`
/// attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(flatten)]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    #[serde(
        default,
        rename = "defaultValue",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_value: Option<Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl FieldSpec {
    pub fn of(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            default_value: None,
        }
    }
}

/// Index definitions keyed by index name; each maps field names to a
/// direction flag, mirroring the wire format.
pub type IndexMap = BTreeMap<String, BTreeMap<String, i32>>;

/// Immutable snapshot of one class definition.
///
/// Snapshots are replaced wholesale on reload and never mutated in place, so
/// a reader can never observe a half-updated schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSchema {
    #[serde(rename = "className")]
    pub class_name: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default, rename = "classLevelPermissions")]
    pub class_level_permissions: ClassLevelPermissions,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub indexes: IndexMap,
}

impl ClassSchema {
    /// A schema with no fields, used when a read path targets a class the
    /// adapter has never seen.
    pub fn empty(class_name: &str) -> Self {
        Self {
            class_name: class_name.to_string(),
            fields: BTreeMap::new(),
            class_level_permissions: ClassLevelPermissions::default(),
            indexes: IndexMap::new(),
        }
    }

    pub fn field_type(&self, field_name: &str) -> Option<&FieldType> {
        self.fields.get(field_name).map(|spec| &spec.field_type)
    }
}

/// Operations governed by class-level permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Find,
    Count,
    Create,
    Update,
    Delete,
    AddField,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Find => "find",
            Operation::Count => "count",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::AddField => "addField",
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Operation::Get | Operation::Find | Operation::Count)
    }
}

/// Value of one CLP entity entry: either the literal `true` or, under the
/// `pointerFields` key, a list of field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionValue {
    Flag(bool),
    Fields(Vec<String>),
}

/// Entity → grant map for a single operation.
pub type PermissionMap = BTreeMap<String, PermissionValue>;

/// Class-level permissions: one entity map per operation plus the grouped
/// pointer-permission field lists and the protected-field rules.
///
/// An absent operation map leaves the operation open; a present map, even an
/// empty `{}`, must grant the caller explicitly. Unknown operation keys fail
/// deserialization; entity-level validation lives in
/// [`crate::schema::validation::validate_clp`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassLevelPermissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<PermissionMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find: Option<PermissionMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<PermissionMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<PermissionMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<PermissionMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<PermissionMap>,
    #[serde(default, rename = "addField", skip_serializing_if = "Option::is_none")]
    pub add_field: Option<PermissionMap>,
    #[serde(
        default,
        rename = "readUserFields",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub read_user_fields: Vec<String>,
    #[serde(
        default,
        rename = "writeUserFields",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub write_user_fields: Vec<String>,
    #[serde(
        default,
        rename = "protectedFields",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub protected_fields: BTreeMap<String, Vec<String>>,
}

impl ClassLevelPermissions {
    /// Grants every operation to the public. Applied when a class is created
    /// without explicit permissions.
    pub fn default_public() -> Self {
        let mut clp = Self::default();
        for op in [
            Operation::Get,
            Operation::Find,
            Operation::Count,
            Operation::Create,
            Operation::Update,
            Operation::Delete,
            Operation::AddField,
        ] {
            clp.operation_mut(op)
                .insert("*".to_string(), PermissionValue::Flag(true));
        }
        clp
    }

    /// True when no rule of any kind is present; an absent CLP means the
    /// class is open.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// The configured entity map of `op`; `None` when no rule is configured
    /// and the operation is open.
    pub fn operation(&self, op: Operation) -> Option<&PermissionMap> {
        match op {
            Operation::Get => self.get.as_ref(),
            Operation::Find => self.find.as_ref(),
            Operation::Count => self.count.as_ref(),
            Operation::Create => self.create.as_ref(),
            Operation::Update => self.update.as_ref(),
            Operation::Delete => self.delete.as_ref(),
            Operation::AddField => self.add_field.as_ref(),
        }
    }

    pub fn operation_mut(&mut self, op: Operation) -> &mut PermissionMap {
        let slot = match op {
            Operation::Get => &mut self.get,
            Operation::Find => &mut self.find,
            Operation::Count => &mut self.count,
            Operation::Create => &mut self.create,
            Operation::Update => &mut self.update,
            Operation::Delete => &mut self.delete,
            Operation::AddField => &mut self.add_field,
        };
        slot.get_or_insert_with(PermissionMap::new)
    }

    /// Pointer-permission field names implicated by `op`: the operation's own
    /// `pointerFields` entry plus the grouped read/write user-field list.
    pub fn pointer_fields(&self, op: Operation) -> Vec<String> {
        let mut fields: Vec<String> = match self.operation(op).and_then(|m| m.get("pointerFields")) {
            Some(PermissionValue::Fields(names)) => names.clone(),
            _ => Vec::new(),
        };
        let grouped = if op.is_read() {
            &self.read_user_fields
        } else {
            &self.write_user_fields
        };
        for name in grouped {
            if !fields.contains(name) {
                fields.push(name.clone());
            }
        }
        fields
    }
}
