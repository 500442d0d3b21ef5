//! Common test utilities and fixtures shared by the integration tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use docstore::schema::{ClassLevelPermissions, FieldSpec};
use docstore::{
    Caller, DatabaseController, MemoryAdapter, ObjectMap, SchemaOptions, StorageAdapter,
    StoreResult, Value,
};

/// Common test fixture: a database controller wired to a fresh in-memory
/// adapter, with the adapter handle kept around for direct inspection.
pub struct CommonTestFixture {
    pub db: DatabaseController,
    pub adapter: Arc<MemoryAdapter>,
}

#[allow(dead_code)]
impl CommonTestFixture {
    pub async fn new() -> StoreResult<Self> {
        Self::with_options(SchemaOptions::bare()).await
    }

    pub async fn with_options(options: SchemaOptions) -> StoreResult<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let adapter = Arc::new(MemoryAdapter::new());
        let db =
            DatabaseController::load(Arc::clone(&adapter) as Arc<dyn StorageAdapter>, options)
                .await?;
        Ok(Self { db, adapter })
    }

    /// Registers a `Post` class with the columns the tests exercise. `null`
    /// permissions leave the class public.
    pub async fn seed_post_class(&self, permissions: serde_json::Value) -> StoreResult<()> {
        let fields = Self::fields(json!({
            "title": {"type": "String"},
            "views": {"type": "Number"},
            "secret": {"type": "String"},
            "owner": {"type": "Pointer", "targetClass": "_User"},
            "editors": {"type": "Array"},
            "likes": {"type": "Relation", "targetClass": "_User"},
        }));
        let permissions = if permissions.is_null() {
            None
        } else {
            Some(Self::clp(permissions))
        };
        self.db
            .schema()
            .add_class_if_not_exists("Post", fields, permissions, BTreeMap::new())
            .await?;
        Ok(())
    }

    pub fn fields(json: serde_json::Value) -> BTreeMap<String, FieldSpec> {
        serde_json::from_value(json).expect("valid field map")
    }

    pub fn clp(json: serde_json::Value) -> ClassLevelPermissions {
        serde_json::from_value(json).expect("valid class level permissions")
    }

    pub fn object(json: serde_json::Value) -> ObjectMap {
        Value::object_from_json(json).expect("valid object")
    }

    /// An authenticated caller holding only their user id.
    pub fn user(id: &str) -> Caller {
        Caller::client(["*", id])
    }

    pub fn user_with_roles(id: &str, roles: &[&str]) -> Caller {
        let mut ids = vec!["*".to_string(), id.to_string()];
        ids.extend(roles.iter().map(|role| format!("role:{}", role)));
        Caller::client(ids)
    }

    pub fn pointer(class_name: &str, object_id: &str) -> serde_json::Value {
        json!({"__type": "Pointer", "className": class_name, "objectId": object_id})
    }
}
