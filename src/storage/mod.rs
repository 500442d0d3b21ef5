//! Storage adapter contract.
//!
//! The core never talks to a concrete store directly; everything goes through
//! [`StorageAdapter`]. Adapters own persistence and indexing mechanics, and
//! may impose their own timeouts. An adapter that cannot run an operation
//! returns [`StoreError::CommandUnavailable`].

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::schema::types::{ClassSchema, FieldType, IndexMap};
use crate::types::value::{ObjectMap, Value};

pub use memory::MemoryAdapter;

/// Opaque handle to an adapter-side transactional session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort direction for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Projection, ordering and paging options for read operations.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Fields to return; `None` returns everything. `objectId`, the
    /// timestamps and the permission columns are always included.
    pub keys: Option<Vec<String>>,
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
}

/// Contract between the core and a concrete store.
///
/// Query maps handed to adapters are fully desugared: no `$relatedTo`, no
/// relation-typed constraints, ACL requirements already merged in as
/// `_rperm`/`_wperm` constraints.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    // Schema operations.
    async fn get_all_classes(&self) -> StoreResult<Vec<ClassSchema>>;
    async fn create_class(&self, schema: &ClassSchema) -> StoreResult<ClassSchema>;
    async fn delete_class(&self, class_name: &str) -> StoreResult<()>;
    async fn class_exists(&self, class_name: &str) -> StoreResult<bool>;
    async fn update_schema_with_indexes(&self, schema: &ClassSchema) -> StoreResult<()>;
    async fn set_indexes_with_schema_format(
        &self,
        class_name: &str,
        indexes: &IndexMap,
    ) -> StoreResult<()>;
    async fn set_class_permissions(
        &self,
        class_name: &str,
        permissions: &crate::schema::types::ClassLevelPermissions,
    ) -> StoreResult<()>;
    async fn add_field_if_not_exists(
        &self,
        class_name: &str,
        field_name: &str,
        field_type: &FieldType,
    ) -> StoreResult<()>;
    async fn delete_fields(&self, class_name: &str, field_names: &[String]) -> StoreResult<()>;
    async fn ensure_uniqueness(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        field_names: &[String],
    ) -> StoreResult<()>;
    async fn ensure_index(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        field_names: &[String],
    ) -> StoreResult<()>;

    // Read operations.
    async fn find(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        query: &ObjectMap,
        options: &QueryOptions,
    ) -> StoreResult<Vec<ObjectMap>>;
    async fn count(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        query: &ObjectMap,
    ) -> StoreResult<u64>;
    async fn distinct(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        query: &ObjectMap,
        field_name: &str,
    ) -> StoreResult<Vec<Value>>;
    async fn aggregate(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        pipeline: &[Value],
    ) -> StoreResult<Vec<ObjectMap>>;

    // Write operations, optionally inside a transactional session.
    async fn create_object(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        object: &ObjectMap,
        session: Option<&TransactionId>,
    ) -> StoreResult<ObjectMap>;
    async fn update_objects_by_query(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        query: &ObjectMap,
        update: &ObjectMap,
        session: Option<&TransactionId>,
    ) -> StoreResult<u64>;
    async fn find_one_and_update(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        query: &ObjectMap,
        update: &ObjectMap,
        session: Option<&TransactionId>,
    ) -> StoreResult<Option<ObjectMap>>;
    async fn upsert_one_object(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        query: &ObjectMap,
        update: &ObjectMap,
        session: Option<&TransactionId>,
    ) -> StoreResult<()>;
    async fn delete_objects_by_query(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        query: &ObjectMap,
        session: Option<&TransactionId>,
    ) -> StoreResult<u64>;

    // Transactional sessions.
    async fn create_transactional_session(&self) -> StoreResult<TransactionId>;
    async fn commit_transactional_session(&self, session: TransactionId) -> StoreResult<()>;
    async fn abort_transactional_session(&self, session: TransactionId) -> StoreResult<()>;
}
