//! Class schemas: types, validation, defaults and the cached controller.

pub mod controller;
pub mod defaults;
pub mod types;
pub mod validation;

pub use controller::{PermissionScope, SchemaController, SchemaOptions, SchemaSnapshot};
pub use types::{
    ClassLevelPermissions, ClassSchema, FieldSpec, FieldType, IndexMap, Operation, PermissionMap,
    PermissionValue,
};
