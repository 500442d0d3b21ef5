//! Multi-tenant object store core: schema management, class-level and
//! object-level authorization, and relation-aware queries over a pluggable
//! storage adapter.
//!
//! The two entry points are [`SchemaController`], which owns the cached
//! class definitions and the permission checks, and [`DatabaseController`],
//! which runs the read and write pipelines on top of it. Storage is
//! abstracted behind [`storage::StorageAdapter`]; [`storage::MemoryAdapter`]
//! is the bundled in-process implementation.

pub mod database;
pub mod error;
pub mod query;
pub mod schema;
pub mod storage;
pub mod types;

pub use database::{DatabaseController, FindOptions, UpdateOptions};
pub use error::{StoreError, StoreResult};
pub use schema::{
    ClassLevelPermissions, ClassSchema, FieldSpec, FieldType, Operation, SchemaController,
    SchemaOptions,
};
pub use storage::{MemoryAdapter, QueryOptions, SortOrder, StorageAdapter, TransactionId};
pub use types::{Caller, ObjectMap, Value};
