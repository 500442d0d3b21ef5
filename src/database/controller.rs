//! The database controller: the single entry point for object reads and
//! writes.
//!
//! Every operation runs the same pipeline: validate the incoming shapes,
//! check class-level permissions, desugar relation constraints, fold the
//! caller's ACL into the query, hand the result to the adapter, and strip
//! whatever the caller is not allowed to see on the way out.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use rand::Rng;
use tokio::sync::Mutex;

use crate::database::operators::{
    collect_relation_updates, infer_field_type, sanitize_database_result, validate_object_keys,
    RelationOp,
};
use crate::database::permissions::{
    add_pointer_permissions, compute_protected_fields, filter_sensitive_data,
    ProtectedFieldsState,
};
use crate::error::{StoreError, StoreResult};
use crate::query::relations::{
    add_relation_row, join_table_name, reduce_in_relation, reduce_related_to, remove_relation_row,
};
use crate::query::validate_query;
use crate::schema::controller::PermissionScope;
use crate::schema::defaults::{default_columns, INTERNAL_QUERY_KEYS};
use crate::schema::types::{ClassSchema, FieldType, Operation};
use crate::schema::validation::class_name_is_valid;
use crate::schema::{SchemaController, SchemaOptions};
use crate::storage::{QueryOptions, SortOrder, StorageAdapter, TransactionId};
use crate::types::identity::{AclGroup, Caller};
use crate::types::value::{ObjectMap, Value};
use crate::types::{transform_object_acl, untransform_object_acl};

const OBJECT_ID_LENGTH: usize = 10;
const OBJECT_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Read options beyond the query itself.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub keys: Option<Vec<String>>,
    pub sort: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    /// Overrides the get/find inference, e.g. for internal lookups that must
    /// be checked as `get`.
    pub op: Option<Operation>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Update every matching object instead of the first.
    pub many: bool,
    /// Insert a fresh object when nothing matches.
    pub upsert: bool,
}

pub struct DatabaseController {
    adapter: Arc<dyn StorageAdapter>,
    schema: Arc<SchemaController>,
    transaction: Mutex<Option<TransactionId>>,
}

impl DatabaseController {
    pub fn new(adapter: Arc<dyn StorageAdapter>, schema: Arc<SchemaController>) -> Self {
        Self {
            adapter,
            schema,
            transaction: Mutex::new(None),
        }
    }

    /// Convenience constructor wiring up the schema controller.
    pub async fn load(
        adapter: Arc<dyn StorageAdapter>,
        options: SchemaOptions,
    ) -> StoreResult<Self> {
        let schema = SchemaController::load(Arc::clone(&adapter), options).await?;
        Ok(Self::new(adapter, schema))
    }

    pub fn schema(&self) -> &Arc<SchemaController> {
        &self.schema
    }

    /// Runs a query and returns the objects the caller may see, protected
    /// fields already stripped and ACLs in their caller-facing shape.
    pub async fn find(
        &self,
        class_name: &str,
        mut query: ObjectMap,
        options: FindOptions,
        caller: &Caller,
    ) -> StoreResult<Vec<ObjectMap>> {
        validate_query(&query)?;
        let op = options.op.unwrap_or_else(|| read_op(&query));
        let schema = self.schema_or_empty(class_name).await?;

        let mut scope = PermissionScope::Granted;
        let mut protected = ProtectedFieldsState::default();
        if let Some(group) = caller.acl_group() {
            scope = self.schema.validate_permission(class_name, group, op).await?;
            protected = compute_protected_fields(&schema, group);
        }

        reduce_related_to(self.adapter.as_ref(), &mut query).await?;
        reduce_in_relation(self.adapter.as_ref(), class_name, &schema, &mut query).await?;

        if let Some(group) = caller.acl_group() {
            if scope == PermissionScope::Restricted {
                query = match add_pointer_permissions(&schema, op, &query, group) {
                    Some(query) => query,
                    None => return Ok(Vec::new()),
                };
            }
            add_read_acl(&mut query, group);
        }

        // Deferred protected-field rules need their pointer columns fetched
        // even when the caller's projection leaves them out.
        let requested = options.keys.clone();
        let mut query_options = QueryOptions {
            keys: options.keys,
            sort: options.sort,
            limit: options.limit,
            skip: options.skip,
        };
        let aux_keys = protected.aux_keys();
        if let Some(keys) = &mut query_options.keys {
            for key in &aux_keys {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }

        let results = self
            .adapter
            .find(class_name, &schema, &query, &query_options)
            .await?;

        let public = AclGroup::public_group();
        let group = caller.acl_group().unwrap_or(&public);
        let mut output = Vec::with_capacity(results.len());
        for mut object in results {
            untransform_object_acl(&mut object);
            let hidden = if caller.is_master() {
                Vec::new()
            } else {
                protected.resolve(class_name, &object, group)
            };
            filter_sensitive_data(class_name, caller.is_master(), group, &mut object, &hidden);
            if let Some(requested) = &requested {
                for key in &aux_keys {
                    if !requested.contains(key) {
                        object.remove(key);
                    }
                }
            }
            output.push(object);
        }
        Ok(output)
    }

    pub async fn count(
        &self,
        class_name: &str,
        mut query: ObjectMap,
        caller: &Caller,
    ) -> StoreResult<u64> {
        validate_query(&query)?;
        let schema = self.schema_or_empty(class_name).await?;
        let mut scope = PermissionScope::Granted;
        if let Some(group) = caller.acl_group() {
            scope = self
                .schema
                .validate_permission(class_name, group, Operation::Count)
                .await?;
        }
        reduce_related_to(self.adapter.as_ref(), &mut query).await?;
        reduce_in_relation(self.adapter.as_ref(), class_name, &schema, &mut query).await?;
        if let Some(group) = caller.acl_group() {
            if scope == PermissionScope::Restricted {
                query = match add_pointer_permissions(&schema, Operation::Count, &query, group) {
                    Some(query) => query,
                    None => return Ok(0),
                };
            }
            add_read_acl(&mut query, group);
        }
        self.adapter.count(class_name, &schema, &query).await
    }

    pub async fn distinct(
        &self,
        class_name: &str,
        mut query: ObjectMap,
        field_name: &str,
        caller: &Caller,
    ) -> StoreResult<Vec<Value>> {
        validate_query(&query)?;
        let schema = self.schema_or_empty(class_name).await?;
        let mut scope = PermissionScope::Granted;
        if let Some(group) = caller.acl_group() {
            scope = self
                .schema
                .validate_permission(class_name, group, Operation::Find)
                .await?;
        }
        reduce_related_to(self.adapter.as_ref(), &mut query).await?;
        reduce_in_relation(self.adapter.as_ref(), class_name, &schema, &mut query).await?;
        if let Some(group) = caller.acl_group() {
            if scope == PermissionScope::Restricted {
                query = match add_pointer_permissions(&schema, Operation::Find, &query, group) {
                    Some(query) => query,
                    None => return Ok(Vec::new()),
                };
            }
            add_read_acl(&mut query, group);
        }
        self.adapter
            .distinct(class_name, &schema, &query, field_name)
            .await
    }

    /// Passes an aggregation pipeline straight to the adapter. Pipelines
    /// bypass ACLs entirely, so an untrusted caller needs a direct `find`
    /// grant; ownership rules cannot scope a pipeline and do not apply.
    pub async fn aggregate(
        &self,
        class_name: &str,
        pipeline: &[Value],
        caller: &Caller,
    ) -> StoreResult<Vec<ObjectMap>> {
        if let Some(group) = caller.acl_group() {
            let granted = self
                .schema
                .test_permissions_for_class_name(class_name, group, Operation::Find)
                .await;
            if !granted {
                return Err(StoreError::OperationForbidden(format!(
                    "aggregate on class {} requires a direct permission grant",
                    class_name
                )));
            }
        }
        let schema = self.schema_or_empty(class_name).await?;
        self.adapter.aggregate(class_name, &schema, pipeline).await
    }

    /// Creates one object. The stored record gets a generated `objectId`
    /// (when the caller supplied none) and both timestamps; relation
    /// operators in the payload become join-table rows after the object is
    /// stored.
    pub async fn create(
        &self,
        class_name: &str,
        mut object: ObjectMap,
        caller: &Caller,
    ) -> StoreResult<ObjectMap> {
        if !class_name_is_valid(class_name) {
            return Err(StoreError::InvalidClassName(format!(
                "invalid class name: {}",
                class_name
            )));
        }
        if let Some(group) = caller.acl_group() {
            self.schema
                .validate_permission(class_name, group, Operation::Create)
                .await?;
        }
        validate_object_keys(&object)?;
        transform_object_acl(&mut object)?;

        self.schema.enforce_class_exists(class_name).await?;
        self.reconcile_fields(class_name, &object, caller).await?;
        let relation_ops = collect_relation_updates(&mut object)?;
        let schema = self.schema.get_one_schema(class_name, true).await?;

        let object_id = match object.get("objectId").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = new_object_id();
                object.insert("objectId".to_string(), Value::String(id.clone()));
                id
            }
        };
        let now = Value::Date(Utc::now());
        object.insert("createdAt".to_string(), now.clone());
        object.insert("updatedAt".to_string(), now);

        let session = self.transaction.lock().await.clone();
        let mut created = self
            .adapter
            .create_object(class_name, &schema, &object, session.as_ref())
            .await?;
        debug!("created {}:{}", class_name, object_id);

        self.apply_relation_ops(class_name, &object_id, &relation_ops)
            .await?;
        untransform_object_acl(&mut created);
        Ok(created)
    }

    /// Updates matching objects and returns the applied values of echoing
    /// operators (`Increment`, `Add`, `AddUnique`, `Remove`); plain sets are
    /// not echoed back.
    pub async fn update(
        &self,
        class_name: &str,
        mut query: ObjectMap,
        mut update: ObjectMap,
        options: UpdateOptions,
        caller: &Caller,
    ) -> StoreResult<ObjectMap> {
        let original = update.clone();
        validate_query(&query)?;
        validate_object_keys(&update)?;

        let mut scope = PermissionScope::Granted;
        if let Some(group) = caller.acl_group() {
            scope = self
                .schema
                .validate_permission(class_name, group, Operation::Update)
                .await?;
        }
        transform_object_acl(&mut update)?;
        if self.schema.get_one_schema(class_name, true).await.is_ok() {
            self.reconcile_fields(class_name, &update, caller).await?;
        }
        let relation_ops = collect_relation_updates(&mut update)?;
        let schema = self.schema_or_empty(class_name).await?;

        reduce_related_to(self.adapter.as_ref(), &mut query).await?;
        reduce_in_relation(self.adapter.as_ref(), class_name, &schema, &mut query).await?;
        if let Some(group) = caller.acl_group() {
            if scope == PermissionScope::Restricted {
                query = match add_pointer_permissions(&schema, Operation::Update, &query, group) {
                    Some(query) => query,
                    None => {
                        return Err(StoreError::ObjectNotFound(
                            "object not found for update".to_string(),
                        ))
                    }
                };
            }
            add_write_acl(&mut query, group);
        }
        update.insert("updatedAt".to_string(), Value::Date(Utc::now()));

        let session = self.transaction.lock().await.clone();
        let result = if options.many {
            let updated = self
                .adapter
                .update_objects_by_query(class_name, &schema, &query, &update, session.as_ref())
                .await?;
            if updated == 0 {
                None
            } else {
                Some(ObjectMap::new())
            }
        } else if options.upsert {
            self.adapter
                .upsert_one_object(class_name, &schema, &query, &update, session.as_ref())
                .await?;
            Some(ObjectMap::new())
        } else {
            self.adapter
                .find_one_and_update(class_name, &schema, &query, &update, session.as_ref())
                .await?
        };
        let result = result.ok_or_else(|| {
            StoreError::ObjectNotFound("object not found for update".to_string())
        })?;

        if !relation_ops.is_empty() {
            let owning_id = result
                .get("objectId")
                .and_then(Value::as_str)
                .or_else(|| query.get("objectId").and_then(Value::as_str))
                .map(str::to_string)
                .ok_or_else(|| {
                    StoreError::InvalidJson(
                        "relation operators need an objectId to attach to".to_string(),
                    )
                })?;
            self.apply_relation_ops(class_name, &owning_id, &relation_ops)
                .await?;
        }
        Ok(sanitize_database_result(&original, &result))
    }

    /// Deletes every matching object. Deleting nothing is an error so that a
    /// caller without write access cannot tell a hidden object from a
    /// missing one.
    pub async fn destroy(
        &self,
        class_name: &str,
        mut query: ObjectMap,
        caller: &Caller,
    ) -> StoreResult<u64> {
        validate_query(&query)?;
        let schema = self.schema_or_empty(class_name).await?;
        let mut scope = PermissionScope::Granted;
        if let Some(group) = caller.acl_group() {
            scope = self
                .schema
                .validate_permission(class_name, group, Operation::Delete)
                .await?;
        }
        reduce_related_to(self.adapter.as_ref(), &mut query).await?;
        reduce_in_relation(self.adapter.as_ref(), class_name, &schema, &mut query).await?;
        if let Some(group) = caller.acl_group() {
            if scope == PermissionScope::Restricted {
                query = match add_pointer_permissions(&schema, Operation::Delete, &query, group) {
                    Some(query) => query,
                    None => {
                        return Err(StoreError::ObjectNotFound(
                            "object not found for destroy".to_string(),
                        ))
                    }
                };
            }
            add_write_acl(&mut query, group);
        }

        let session = self.transaction.lock().await.clone();
        let deleted = self
            .adapter
            .delete_objects_by_query(class_name, &schema, &query, session.as_ref())
            .await?;
        // Expired sessions are reaped opportunistically; a miss is normal.
        if deleted == 0 && class_name != "_Session" {
            return Err(StoreError::ObjectNotFound(
                "object not found for destroy".to_string(),
            ));
        }
        Ok(deleted)
    }

    /// Removes an empty class and its relation join tables.
    pub async fn delete_schema(&self, class_name: &str) -> StoreResult<()> {
        let schema = self.schema.get_one_schema(class_name, false).await?;
        let count = self
            .adapter
            .count(class_name, &schema, &ObjectMap::new())
            .await?;
        if count > 0 {
            return Err(StoreError::OperationForbidden(format!(
                "class {} is not empty, contains {} objects",
                class_name, count
            )));
        }
        for (field_name, spec) in &schema.fields {
            if spec.field_type.is_relation() {
                let join_table = join_table_name(class_name, field_name);
                match self.adapter.delete_class(&join_table).await {
                    Ok(()) => {}
                    Err(err) if err.is_missing_class() => {}
                    Err(err) => return Err(err),
                }
            }
        }
        self.schema.drop_class(class_name).await?;
        info!("deleted schema {}", class_name);
        Ok(())
    }

    /// Opens an adapter-side transaction; subsequent writes join it until
    /// commit or abort.
    pub async fn create_transactional_session(&self) -> StoreResult<()> {
        let session = self.adapter.create_transactional_session().await?;
        let mut slot = self.transaction.lock().await;
        if slot.is_some() {
            return Err(StoreError::InternalServerError(
                "a transactional session is already in progress".to_string(),
            ));
        }
        *slot = Some(session);
        Ok(())
    }

    pub async fn commit_transactional_session(&self) -> StoreResult<()> {
        let session = self.transaction.lock().await.take().ok_or_else(|| {
            StoreError::InternalServerError(
                "there is no transactional session to commit".to_string(),
            )
        })?;
        self.adapter.commit_transactional_session(session).await
    }

    pub async fn abort_transactional_session(&self) -> StoreResult<()> {
        let session = self.transaction.lock().await.take().ok_or_else(|| {
            StoreError::InternalServerError(
                "there is no transactional session to abort".to_string(),
            )
        })?;
        self.adapter.abort_transactional_session(session).await
    }

    async fn schema_or_empty(&self, class_name: &str) -> StoreResult<Arc<ClassSchema>> {
        match self.schema.get_one_schema(class_name, true).await {
            Ok(schema) => Ok(schema),
            Err(err) if err.is_missing_class() => Ok(Arc::new(ClassSchema::empty(class_name))),
            Err(err) => Err(err),
        }
    }

    /// Reconciles the payload's columns with the schema: new columns need
    /// the `addField` permission and are added with their inferred type,
    /// existing columns must agree on the type.
    async fn reconcile_fields(
        &self,
        class_name: &str,
        payload: &ObjectMap,
        caller: &Caller,
    ) -> StoreResult<()> {
        let schema = self.schema.get_one_schema(class_name, true).await?;
        let built_ins = default_columns(class_name);
        let mut pending: Vec<(String, FieldType)> = Vec::new();
        let mut adds_fields = false;
        for (key, value) in payload {
            if key == "ACL" || INTERNAL_QUERY_KEYS.contains(&key.as_str()) {
                continue;
            }
            let Some(field_type) = infer_field_type(key, value)? else {
                continue;
            };
            let column = key.split('.').next().expect("non-empty key");
            if !schema.fields.contains_key(column) && !built_ins.contains_key(column) {
                adds_fields = true;
            }
            pending.push((key.clone(), field_type));
        }
        if adds_fields {
            if let Some(group) = caller.acl_group() {
                // Restricted means a pointer rule grants addField; by then
                // the write itself is already pinned to owned objects.
                self.schema
                    .validate_permission(class_name, group, Operation::AddField)
                    .await?;
            }
        }
        for (key, field_type) in pending {
            self.schema
                .enforce_field_exists(class_name, &key, &field_type)
                .await?;
        }
        Ok(())
    }

    async fn apply_relation_ops(
        &self,
        class_name: &str,
        owning_id: &str,
        ops: &[RelationOp],
    ) -> StoreResult<()> {
        for op in ops {
            for related_id in &op.related_ids {
                if op.add {
                    add_relation_row(
                        self.adapter.as_ref(),
                        class_name,
                        &op.field_name,
                        owning_id,
                        related_id,
                    )
                    .await?;
                } else {
                    remove_relation_row(
                        self.adapter.as_ref(),
                        class_name,
                        &op.field_name,
                        owning_id,
                        related_id,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}

fn read_op(query: &ObjectMap) -> Operation {
    if query.len() == 1 && matches!(query.get("objectId"), Some(Value::String(_))) {
        Operation::Get
    } else {
        Operation::Find
    }
}

/// Restricts `query` to rows the caller may read: legacy rows without the
/// column, public rows, and rows naming one of the caller's identifiers.
fn add_read_acl(query: &mut ObjectMap, acl_group: &AclGroup) {
    insert_acl_constraint(query, "_rperm", true, acl_group);
}

/// Restricts `query` to rows the caller may write. The public marker never
/// grants writes.
fn add_write_acl(query: &mut ObjectMap, acl_group: &AclGroup) {
    insert_acl_constraint(query, "_wperm", false, acl_group);
}

fn insert_acl_constraint(
    query: &mut ObjectMap,
    column: &str,
    public: bool,
    acl_group: &AclGroup,
) {
    let mut allowed: Vec<Value> = vec![Value::Null];
    if public {
        allowed.push(Value::String("*".to_string()));
    }
    for id in acl_group.ids() {
        if id != "*" {
            allowed.push(Value::String(id.clone()));
        }
    }
    let mut constraint = ObjectMap::new();
    constraint.insert("$in".to_string(), Value::Array(allowed));
    query.insert(column.to_string(), Value::Object(constraint));
}

fn new_object_id() -> String {
    let mut rng = rand::thread_rng();
    (0..OBJECT_ID_LENGTH)
        .map(|_| OBJECT_ID_ALPHABET[rng.gen_range(0..OBJECT_ID_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(json: serde_json::Value) -> ObjectMap {
        Value::object_from_json(json).unwrap()
    }

    #[test]
    fn object_id_queries_are_checked_as_get() {
        assert_eq!(read_op(&object(json!({"objectId": "x"}))), Operation::Get);
        assert_eq!(
            read_op(&object(json!({"objectId": "x", "title": "y"}))),
            Operation::Find
        );
        assert_eq!(
            read_op(&object(json!({"objectId": {"$in": ["x"]}}))),
            Operation::Find
        );
    }

    #[test]
    fn read_constraints_admit_legacy_and_public_rows() {
        // The public marker is added even when the group was built without it.
        let mut query = ObjectMap::new();
        add_read_acl(&mut query, &AclGroup::new(vec!["u1".to_string()]));
        assert_eq!(
            Value::Object(query).to_json(),
            json!({"_rperm": {"$in": [null, "*", "u1"]}})
        );
    }

    #[test]
    fn write_constraints_never_carry_the_public_marker() {
        let mut query = ObjectMap::new();
        add_write_acl(
            &mut query,
            &AclGroup::new(vec!["*".to_string(), "u1".to_string()]),
        );
        assert_eq!(
            Value::Object(query).to_json(),
            json!({"_wperm": {"$in": [null, "u1"]}})
        );
    }

    #[test]
    fn generated_object_ids_are_alphanumeric() {
        let id = new_object_id();
        assert_eq!(id.len(), OBJECT_ID_LENGTH);
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
    }
}
