//! Schema controller: the cached, authoritative view of every class.
//!
//! The controller owns one snapshot of all class definitions. The snapshot is
//! replaced wholesale on reload; concurrent callers during a reload share the
//! same in-flight future, so the adapter is enumerated once per reload no
//! matter how many requests are waiting.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info};
use regex::Regex;

use crate::error::{StoreError, StoreResult};
use crate::query::relations::join_table_name;
use crate::schema::defaults::{
    default_columns, inject_default_columns, is_volatile_class, volatile_schema,
};
use crate::schema::types::{
    ClassLevelPermissions, ClassSchema, FieldSpec, FieldType, IndexMap, Operation, PermissionMap,
    PermissionValue,
};
use crate::schema::validation::{
    class_name_is_valid, field_name_is_valid, validate_clp, validate_field_type,
    validate_schema_data, DEFAULT_USER_ID_PATTERN,
};
use crate::types::identity::AclGroup;
use crate::types::value::ObjectMap;

/// Class name → schema, the unit the cache swaps atomically.
pub type SchemaSnapshot = BTreeMap<String, Arc<ClassSchema>>;

type ReloadFuture = Shared<BoxFuture<'static, StoreResult<Arc<SchemaSnapshot>>>>;

/// Outcome of the class-level permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionScope {
    /// The operation is allowed outright.
    Granted,
    /// Only objects owned through a pointer-permission field are reachable;
    /// the caller must restrict the query with
    /// [`crate::database::permissions::add_pointer_permissions`].
    Restricted,
}

/// Configuration of the schema controller.
#[derive(Clone)]
pub struct SchemaOptions {
    /// Per-class protected-field overrides folded into every reload,
    /// set-unioned per entity key with the stored rules.
    pub protected_fields: HashMap<String, BTreeMap<String, Vec<String>>>,
    /// Pattern a literal user-id CLP entity must match; defaults to
    /// alphanumeric ids.
    pub user_id_pattern: Option<Regex>,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        // The user's email is hidden from everyone but the user themselves
        // unless a deployment opts out.
        let mut protected_fields = HashMap::new();
        let mut user_rules = BTreeMap::new();
        user_rules.insert("*".to_string(), vec!["email".to_string()]);
        protected_fields.insert("_User".to_string(), user_rules);
        Self {
            protected_fields,
            user_id_pattern: None,
        }
    }
}

impl SchemaOptions {
    /// Options with no protected-field overrides, used by tests that need
    /// full visibility into `_User` rows.
    pub fn bare() -> Self {
        Self {
            protected_fields: HashMap::new(),
            user_id_pattern: None,
        }
    }
}

pub struct SchemaController {
    adapter: Arc<dyn crate::storage::StorageAdapter>,
    options: SchemaOptions,
    cache: Arc<Mutex<Option<Arc<SchemaSnapshot>>>>,
    inflight: Arc<Mutex<Option<(u64, ReloadFuture)>>>,
    generation: AtomicU64,
}

impl SchemaController {
    /// Builds a controller and performs the initial reload; fails when the
    /// adapter cannot enumerate classes.
    pub async fn load(
        adapter: Arc<dyn crate::storage::StorageAdapter>,
        options: SchemaOptions,
    ) -> StoreResult<Arc<SchemaController>> {
        let controller = Arc::new(SchemaController {
            adapter,
            options,
            cache: Arc::new(Mutex::new(None)),
            inflight: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        });
        controller.reload_data(false).await?;
        Ok(controller)
    }

    pub fn user_id_pattern(&self) -> &Regex {
        self.options
            .user_id_pattern
            .as_ref()
            .unwrap_or(&DEFAULT_USER_ID_PATTERN)
    }

    /// Fetches all class definitions and swaps the cached snapshot.
    ///
    /// While a reload is in flight, concurrent callers share its result;
    /// `clear_cache` discards both the snapshot and any in-flight fetch and
    /// forces a fresh one.
    pub async fn reload_data(&self, clear_cache: bool) -> StoreResult<Arc<SchemaSnapshot>> {
        if clear_cache {
            *self.cache.lock().expect("schema cache lock") = None;
        }
        let future = {
            let mut slot = self.inflight.lock().expect("schema inflight lock");
            let reusable = if clear_cache {
                None
            } else {
                slot.as_ref().map(|(_, future)| future.clone())
            };
            match reusable {
                Some(future) => future,
                None => {
                    let (generation, future) = self.spawn_reload();
                    *slot = Some((generation, future.clone()));
                    future
                }
            }
        };
        future.await
    }

    fn spawn_reload(&self) -> (u64, ReloadFuture) {
        let generation = self.generation.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let adapter = Arc::clone(&self.adapter);
        let options = self.options.clone();
        let cache = Arc::clone(&self.cache);
        let inflight = Arc::clone(&self.inflight);
        let future = async move {
            let result = build_snapshot(adapter, options).await;
            if let Ok(snapshot) = &result {
                *cache.lock().expect("schema cache lock") = Some(Arc::clone(snapshot));
            }
            let mut slot = inflight.lock().expect("schema inflight lock");
            // A newer reload may already be registered; only clear our own.
            if matches!(&*slot, Some((current, _)) if *current == generation) {
                *slot = None;
            }
            result
        }
        .boxed()
        .shared();
        (generation, future)
    }

    async fn snapshot(&self) -> StoreResult<Arc<SchemaSnapshot>> {
        let cached = self.cache.lock().expect("schema cache lock").clone();
        match cached {
            Some(snapshot) => Ok(snapshot),
            None => self.reload_data(false).await,
        }
    }

    /// Returns the cached schema of `class_name`.
    ///
    /// Volatile system classes are served from a synthesized entry when
    /// `allow_volatile` is set; anything else unknown is a missing class.
    pub async fn get_one_schema(
        &self,
        class_name: &str,
        allow_volatile: bool,
    ) -> StoreResult<Arc<ClassSchema>> {
        let snapshot = self.snapshot().await?;
        if let Some(schema) = snapshot.get(class_name) {
            return Ok(Arc::clone(schema));
        }
        if allow_volatile && is_volatile_class(class_name) {
            return Ok(Arc::new(volatile_schema(class_name)));
        }
        Err(StoreError::missing_class(class_name))
    }

    /// Validates a class definition that does not exist yet.
    pub async fn validate_new_class(
        &self,
        class_name: &str,
        fields: &BTreeMap<String, FieldSpec>,
        permissions: &ClassLevelPermissions,
    ) -> StoreResult<()> {
        if !class_name_is_valid(class_name) {
            return Err(StoreError::InvalidClassName(format!(
                "invalid class name: {}",
                class_name
            )));
        }
        if self.snapshot().await?.contains_key(class_name) {
            return Err(StoreError::InvalidClassName(format!(
                "class {} already exists",
                class_name
            )));
        }
        validate_schema_data(class_name, fields, permissions, &[], self.user_id_pattern())
    }

    /// Creates a class definition; a class created without permissions is
    /// open to the public.
    pub async fn add_class_if_not_exists(
        &self,
        class_name: &str,
        fields: BTreeMap<String, FieldSpec>,
        permissions: Option<ClassLevelPermissions>,
        indexes: IndexMap,
    ) -> StoreResult<Arc<ClassSchema>> {
        let permissions = permissions.unwrap_or_else(ClassLevelPermissions::default_public);
        self.validate_new_class(class_name, &fields, &permissions)
            .await?;
        let schema = ClassSchema {
            class_name: class_name.to_string(),
            fields,
            class_level_permissions: permissions,
            indexes,
        };
        self.adapter.create_class(&schema).await?;
        self.reload_data(true).await?;
        self.get_one_schema(class_name, false).await
    }

    /// Applies a field diff to an existing class: `{"__op": "Delete"}`
    /// entries remove columns, everything else adds them. A submitted field
    /// that already exists, or a deletion of one that doesn't, is an error.
    /// Deletions run before additions; permissions and indexes are re-derived
    /// afterwards.
    pub async fn update_class(
        &self,
        class_name: &str,
        submitted_fields: ObjectMap,
        permissions: Option<ClassLevelPermissions>,
        indexes: Option<IndexMap>,
    ) -> StoreResult<Arc<ClassSchema>> {
        let existing = self.get_one_schema(class_name, false).await?;

        let mut deletions: Vec<String> = Vec::new();
        let mut additions: BTreeMap<String, FieldSpec> = BTreeMap::new();
        for (name, value) in &submitted_fields {
            let is_delete = value
                .as_operator()
                .map(|(op, _)| op == "Delete")
                .unwrap_or(false);
            if is_delete {
                if !existing.fields.contains_key(name) {
                    return Err(StoreError::InvalidKeyName(format!(
                        "field {} does not exist, cannot delete",
                        name
                    )));
                }
                deletions.push(name.clone());
            } else {
                if existing.fields.contains_key(name) {
                    return Err(StoreError::InvalidKeyName(format!(
                        "field {} exists, cannot update",
                        name
                    )));
                }
                additions.insert(name.clone(), serde_json::from_value(value.to_json())?);
            }
        }

        let mut merged = additions.clone();
        let mut kept_names: Vec<String> = Vec::new();
        for (name, spec) in &existing.fields {
            if !deletions.contains(name) {
                merged.insert(name.clone(), spec.clone());
                kept_names.push(name.clone());
            }
        }
        let effective_clp = permissions
            .clone()
            .unwrap_or_else(|| existing.class_level_permissions.clone());
        validate_schema_data(
            class_name,
            &merged,
            &effective_clp,
            &kept_names,
            self.user_id_pattern(),
        )?;

        if !deletions.is_empty() {
            self.delete_fields_on_adapter(class_name, &existing, &deletions)
                .await?;
        }
        for (name, spec) in &additions {
            self.adapter
                .add_field_if_not_exists(class_name, name, &spec.field_type)
                .await?;
        }
        if let Some(permissions) = &permissions {
            self.adapter
                .set_class_permissions(class_name, permissions)
                .await?;
        }
        if let Some(indexes) = &indexes {
            self.adapter
                .set_indexes_with_schema_format(class_name, indexes)
                .await?;
        }
        self.reload_data(true).await?;
        self.get_one_schema(class_name, false).await
    }

    /// Replaces the class-level permissions of an existing class.
    pub async fn set_permissions(
        &self,
        class_name: &str,
        permissions: ClassLevelPermissions,
    ) -> StoreResult<()> {
        let schema = self.get_one_schema(class_name, false).await?;
        validate_clp(&permissions, &schema.fields, self.user_id_pattern())?;
        self.adapter
            .set_class_permissions(class_name, &permissions)
            .await?;
        self.reload_data(true).await?;
        Ok(())
    }

    /// Removes caller-defined columns. Built-in columns are protected;
    /// relation columns drop their join table.
    pub async fn delete_fields(
        &self,
        class_name: &str,
        field_names: &[String],
    ) -> StoreResult<()> {
        let schema = self.get_one_schema(class_name, false).await?;
        let built_ins = default_columns(class_name);
        for name in field_names {
            if !field_name_is_valid(name) {
                return Err(StoreError::InvalidKeyName(format!(
                    "invalid field name: {}",
                    name
                )));
            }
            if built_ins.contains_key(name) {
                return Err(StoreError::InvalidKeyName(format!(
                    "field {} cannot be deleted, it is a built-in column",
                    name
                )));
            }
            if !schema.fields.contains_key(name) {
                return Err(StoreError::InvalidKeyName(format!(
                    "field {} does not exist, cannot delete",
                    name
                )));
            }
        }
        self.delete_fields_on_adapter(class_name, &schema, field_names)
            .await?;
        self.reload_data(true).await?;
        Ok(())
    }

    async fn delete_fields_on_adapter(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        field_names: &[String],
    ) -> StoreResult<()> {
        for name in field_names {
            if matches!(schema.field_type(name), Some(FieldType::Relation { .. })) {
                let join_table = join_table_name(class_name, name);
                match self.adapter.delete_class(&join_table).await {
                    Ok(()) => debug!("dropped join table {}", join_table),
                    // Never written to, so never created.
                    Err(err) if err.is_missing_class() || err.is_object_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
        }
        self.adapter
            .delete_fields(class_name, field_names)
            .await
    }

    /// Makes sure the class exists, creating an open, empty definition when
    /// it doesn't. A racing creation by another writer is tolerated.
    pub async fn enforce_class_exists(&self, class_name: &str) -> StoreResult<()> {
        if !class_name_is_valid(class_name) {
            return Err(StoreError::InvalidClassName(format!(
                "invalid class name: {}",
                class_name
            )));
        }
        if self.get_one_schema(class_name, true).await.is_ok() {
            return Ok(());
        }
        let schema = ClassSchema {
            class_name: class_name.to_string(),
            fields: BTreeMap::new(),
            class_level_permissions: ClassLevelPermissions::default_public(),
            indexes: IndexMap::new(),
        };
        if let Err(err) = self.adapter.create_class(&schema).await {
            debug!("create_class race on {}: {}", class_name, err);
        }
        self.reload_data(true).await?;
        self.get_one_schema(class_name, true).await.map(|_| ())
    }

    /// Reconciles one column with the declared type.
    ///
    /// Returns `false` when an equal type is already on record (no change).
    /// A failed adapter add is re-checked against a fresh schema: when
    /// another writer added the same column concurrently the race is benign
    /// and swallowed; only a type mismatch is fatal.
    pub async fn enforce_field_exists(
        &self,
        class_name: &str,
        field_name: &str,
        field_type: &FieldType,
    ) -> StoreResult<bool> {
        let (field_name, field_type) = if field_name.contains('.') {
            // Dotted updates address the inside of an object column.
            (
                field_name.split('.').next().expect("non-empty key"),
                &FieldType::Object,
            )
        } else {
            (field_name, field_type)
        };
        if !field_name_is_valid(field_name) {
            return Err(StoreError::InvalidKeyName(format!(
                "invalid field name: {}",
                field_name
            )));
        }
        if default_columns(class_name).contains_key(field_name) {
            return Ok(false);
        }

        let schema = self.get_one_schema(class_name, true).await?;
        if let Some(existing) = schema.field_type(field_name) {
            if existing == field_type {
                return Ok(false);
            }
            return Err(StoreError::IncorrectType(format!(
                "schema mismatch for {}.{}; expected {} but got {}",
                class_name, field_name, existing, field_type
            )));
        }
        validate_field_type(field_name, field_type)?;

        if let Err(err) = self
            .adapter
            .add_field_if_not_exists(class_name, field_name, field_type)
            .await
        {
            self.reload_data(true).await?;
            let schema = self.get_one_schema(class_name, true).await?;
            return match schema.field_type(field_name) {
                Some(existing) if existing == field_type => Ok(false),
                Some(existing) => Err(StoreError::IncorrectType(format!(
                    "schema mismatch for {}.{}; expected {} but got {}",
                    class_name, field_name, existing, field_type
                ))),
                None => Err(err),
            };
        }
        self.reload_data(true).await?;
        Ok(true)
    }

    /// Class-level permission check for an untrusted caller.
    pub async fn validate_permission(
        &self,
        class_name: &str,
        acl_group: &AclGroup,
        op: Operation,
    ) -> StoreResult<PermissionScope> {
        let schema = match self.get_one_schema(class_name, true).await {
            Ok(schema) => schema,
            // Unknown classes carry no permissions and are open.
            Err(err) if err.is_missing_class() => return Ok(PermissionScope::Granted),
            Err(err) => return Err(err),
        };
        validate_permission_on(&schema, acl_group, op)
    }

    /// Boolean form of the direct-grant test, for callers that only need a
    /// yes/no without the pointer-permission deferral semantics.
    pub async fn test_permissions_for_class_name(
        &self,
        class_name: &str,
        acl_group: &AclGroup,
        op: Operation,
    ) -> bool {
        match self.get_one_schema(class_name, true).await {
            Ok(schema) => {
                test_permissions(schema.class_level_permissions.operation(op), acl_group)
            }
            Err(_) => true,
        }
    }

    /// Removes a class definition from the adapter and refreshes the cache.
    pub(crate) async fn drop_class(&self, class_name: &str) -> StoreResult<()> {
        self.adapter.delete_class(class_name).await?;
        self.reload_data(true).await.map(|_| ())
    }
}

/// True when the entity map grants the operation outright: no map configured,
/// a public grant, or an explicit `true` for any identifier the caller holds.
/// A present map without a matching entry denies, so `{"find": {}}` locks
/// `find` down instead of falling open.
pub fn test_permissions(perms: Option<&PermissionMap>, acl_group: &AclGroup) -> bool {
    let Some(perms) = perms else {
        return true;
    };
    if perms.get("*") == Some(&PermissionValue::Flag(true)) {
        return true;
    }
    acl_group
        .ids()
        .iter()
        .any(|id| perms.get(id) == Some(&PermissionValue::Flag(true)))
}

/// The shared permission state machine of the read and write pipelines.
///
/// Deny-by-not-found applies to `requiresAuthentication` failures so a denied
/// caller cannot probe for class existence; structurally impossible writes
/// (a create gated only by ownership rules) are forbidden outright since
/// there is no object to leak.
pub fn validate_permission_on(
    schema: &ClassSchema,
    acl_group: &AclGroup,
    op: Operation,
) -> StoreResult<PermissionScope> {
    let clp = &schema.class_level_permissions;
    if test_permissions(clp.operation(op), acl_group) {
        return Ok(PermissionScope::Granted);
    }
    if clp
        .operation(op)
        .map_or(false, |perms| perms.contains_key("requiresAuthentication"))
    {
        if acl_group.is_authenticated() {
            return Ok(PermissionScope::Granted);
        }
        return Err(StoreError::ObjectNotFound(
            "object not found".to_string(),
        ));
    }
    let pointer_fields = clp.pointer_fields(op);
    if !pointer_fields.is_empty() {
        if op == Operation::Create {
            return Err(StoreError::OperationForbidden(format!(
                "permission denied for action create on class {}: ownership rules cannot grant creation",
                schema.class_name
            )));
        }
        return Ok(PermissionScope::Restricted);
    }
    Err(StoreError::OperationForbidden(format!(
        "permission denied for action {} on class {}",
        op.as_str(),
        schema.class_name
    )))
}

async fn build_snapshot(
    adapter: Arc<dyn crate::storage::StorageAdapter>,
    options: SchemaOptions,
) -> StoreResult<Arc<SchemaSnapshot>> {
    let classes = adapter.get_all_classes().await?;
    let mut snapshot = SchemaSnapshot::new();
    for mut schema in classes {
        inject_default_columns(&mut schema);
        if let Some(overrides) = options.protected_fields.get(&schema.class_name) {
            for (entity, fields) in overrides {
                let rule = schema
                    .class_level_permissions
                    .protected_fields
                    .entry(entity.clone())
                    .or_default();
                for field in fields {
                    if !rule.contains(field) {
                        rule.push(field.clone());
                    }
                }
            }
        }
        snapshot.insert(schema.class_name.clone(), Arc::new(schema));
    }
    info!("schema cache reloaded: {} classes", snapshot.len());
    Ok(Arc::new(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group(ids: &[&str]) -> AclGroup {
        AclGroup::new(ids.iter().map(|s| s.to_string()).collect())
    }

    fn schema_with_clp(clp: serde_json::Value) -> ClassSchema {
        let mut schema = ClassSchema::empty("Post");
        schema.fields.insert(
            "owner".to_string(),
            FieldSpec::of(FieldType::Pointer {
                target_class: "_User".to_string(),
            }),
        );
        schema.class_level_permissions = serde_json::from_value(clp).unwrap();
        schema
    }

    #[test]
    fn empty_clp_grants_everything() {
        let schema = ClassSchema::empty("Post");
        assert_eq!(
            validate_permission_on(&schema, &group(&["*"]), Operation::Find).unwrap(),
            PermissionScope::Granted
        );
    }

    #[test]
    fn explicit_grants_match_group_ids() {
        let schema = schema_with_clp(json!({"find": {"role:mod": true}}));
        assert_eq!(
            validate_permission_on(&schema, &group(&["*", "u1", "role:mod"]), Operation::Find)
                .unwrap(),
            PermissionScope::Granted
        );
        assert!(matches!(
            validate_permission_on(&schema, &group(&["*", "u1"]), Operation::Find),
            Err(StoreError::OperationForbidden(_))
        ));
    }

    #[test]
    fn requires_authentication_hides_existence() {
        let schema = schema_with_clp(json!({"get": {"requiresAuthentication": true}}));
        assert_eq!(
            validate_permission_on(&schema, &group(&["*", "u1"]), Operation::Get).unwrap(),
            PermissionScope::Granted
        );
        assert!(matches!(
            validate_permission_on(&schema, &group(&["*"]), Operation::Get),
            Err(StoreError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn emptied_operation_maps_deny_everyone() {
        let schema = schema_with_clp(json!({"find": {}}));
        assert!(matches!(
            validate_permission_on(&schema, &group(&["*", "u1"]), Operation::Find),
            Err(StoreError::OperationForbidden(_))
        ));
        // Only `find` was locked down; `get` carries no rule and stays open.
        assert_eq!(
            validate_permission_on(&schema, &group(&["*"]), Operation::Get).unwrap(),
            PermissionScope::Granted
        );
    }

    #[test]
    fn pointer_rules_defer_except_for_create() {
        let schema = schema_with_clp(json!({
            "create": {},
            "update": {"pointerFields": ["owner"]},
            "writeUserFields": ["owner"],
        }));
        assert_eq!(
            validate_permission_on(&schema, &group(&["u1"]), Operation::Update).unwrap(),
            PermissionScope::Restricted
        );
        assert!(matches!(
            validate_permission_on(&schema, &group(&["u1"]), Operation::Create),
            Err(StoreError::OperationForbidden(_))
        ));
    }

    #[test]
    fn denial_without_any_rule_is_forbidden() {
        let schema = schema_with_clp(json!({"delete": {"u2": true}}));
        assert!(matches!(
            validate_permission_on(&schema, &group(&["*", "u1"]), Operation::Delete),
            Err(StoreError::OperationForbidden(_))
        ));
    }
}
