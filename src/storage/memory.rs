//! In-memory reference implementation of the storage adapter.
//!
//! Backs the test suites and doubles as executable documentation of the
//! adapter contract: Mongo-style query matching, REST update operators, and
//! undo-log transactional sessions. `aggregate` is not supported here.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::{Mutex, RwLock};

use crate::error::{StoreError, StoreResult};
use crate::schema::types::{ClassLevelPermissions, ClassSchema, FieldType, IndexMap};
use crate::storage::{QueryOptions, SortOrder, StorageAdapter, TransactionId};
use crate::types::value::{ObjectMap, Value};

#[derive(Debug)]
struct StoredClass {
    schema: ClassSchema,
    objects: BTreeMap<String, ObjectMap>,
}

#[derive(Debug, Default)]
struct Store {
    classes: BTreeMap<String, StoredClass>,
}

#[derive(Debug)]
enum UndoOp {
    Created { class_name: String, object_id: String },
    Updated { class_name: String, object_id: String, previous: ObjectMap },
    Deleted { class_name: String, previous: ObjectMap },
}

/// Adapter holding every class in process memory.
#[derive(Default)]
pub struct MemoryAdapter {
    store: RwLock<Store>,
    sessions: Mutex<HashMap<TransactionId, Vec<UndoOp>>>,
    enumerations: AtomicU64,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_all_classes` calls served; used to observe schema-cache
    /// reload deduplication.
    pub fn enumerations(&self) -> u64 {
        self.enumerations.load(AtomicOrdering::SeqCst)
    }

    async fn record_undo(&self, session: Option<&TransactionId>, op: UndoOp) -> StoreResult<()> {
        let Some(session) = session else {
            return Ok(());
        };
        let mut sessions = self.sessions.lock().await;
        let log = sessions.get_mut(session).ok_or_else(|| {
            StoreError::InternalServerError("unknown transactional session".to_string())
        })?;
        log.push(op);
        Ok(())
    }
}

fn object_id_of(object: &ObjectMap) -> StoreResult<String> {
    object
        .get("objectId")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| StoreError::InternalServerError("object is missing objectId".to_string()))
}

/// Resolves a possibly dotted path inside an object.
fn lookup<'a>(object: &'a ObjectMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = object.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Writes a value at a possibly dotted path, creating intermediate maps.
fn set_path(object: &mut ObjectMap, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().expect("path has at least one segment");
    let mut current = object;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(ObjectMap::new()));
        if entry.as_object().is_none() {
            *entry = Value::Object(ObjectMap::new());
        }
        current = entry.as_object_mut().expect("just ensured object");
    }
    current.insert(last.to_string(), value);
}

fn remove_path(object: &mut ObjectMap, path: &str) {
    match path.split_once('.') {
        None => {
            object.remove(path);
        }
        Some((head, rest)) => {
            if let Some(nested) = object.get_mut(head).and_then(Value::as_object_mut) {
                remove_path(nested, rest);
            }
        }
    }
}

/// Equality with Mongo array semantics: a scalar matches an array field by
/// membership.
fn equals_or_contains(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        Some(Value::Array(items)) if !matches!(expected, Value::Array(_)) => {
            items.contains(expected)
        }
        Some(value) => value == expected,
        None => expected.is_null(),
    }
}

fn compile_regex(pattern: &str, options: Option<&Value>) -> StoreResult<Regex> {
    let mut flags = String::new();
    if let Some(options) = options {
        let options = options
            .as_str()
            .ok_or_else(|| StoreError::InvalidQuery("$options must be a string".to_string()))?;
        if !options.chars().all(|c| "imxs".contains(c)) || options.is_empty() {
            return Err(StoreError::InvalidQuery(format!(
                "bad $options value: {}",
                options
            )));
        }
        flags = format!("(?{})", options);
    }
    Regex::new(&format!("{}{}", flags, pattern))
        .map_err(|e| StoreError::InvalidQuery(format!("bad $regex value: {}", e)))
}

fn constraint_matches(actual: Option<&Value>, ops: &ObjectMap) -> StoreResult<bool> {
    for (op, operand) in ops {
        let holds = match op.as_str() {
            "$eq" => equals_or_contains(actual, operand),
            "$ne" => !equals_or_contains(actual, operand),
            "$in" => {
                let candidates = operand.as_array().ok_or_else(|| {
                    StoreError::InvalidQuery("$in requires an array".to_string())
                })?;
                candidates.iter().any(|candidate| {
                    (candidate.is_null() && actual.is_none())
                        || equals_or_contains(actual, candidate)
                })
            }
            "$nin" => {
                let candidates = operand.as_array().ok_or_else(|| {
                    StoreError::InvalidQuery("$nin requires an array".to_string())
                })?;
                !candidates.iter().any(|candidate| {
                    (candidate.is_null() && actual.is_none())
                        || equals_or_contains(actual, candidate)
                })
            }
            "$all" => {
                let required = operand.as_array().ok_or_else(|| {
                    StoreError::InvalidQuery("$all requires an array".to_string())
                })?;
                match actual {
                    Some(Value::Array(items)) => {
                        required.iter().all(|needed| items.contains(needed))
                    }
                    _ => false,
                }
            }
            "$exists" => {
                let expected = operand.as_bool().ok_or_else(|| {
                    StoreError::InvalidQuery("$exists requires a boolean".to_string())
                })?;
                actual.is_some() == expected
            }
            "$lt" | "$lte" | "$gt" | "$gte" => match actual.and_then(|a| a.compare(operand)) {
                Some(ordering) => match op.as_str() {
                    "$lt" => ordering == std::cmp::Ordering::Less,
                    "$lte" => ordering != std::cmp::Ordering::Greater,
                    "$gt" => ordering == std::cmp::Ordering::Greater,
                    _ => ordering != std::cmp::Ordering::Less,
                },
                None => false,
            },
            "$regex" => {
                let pattern = operand.as_str().ok_or_else(|| {
                    StoreError::InvalidQuery("$regex requires a string".to_string())
                })?;
                let regex = compile_regex(pattern, ops.get("$options"))?;
                match actual {
                    Some(Value::String(s)) => regex.is_match(s),
                    _ => false,
                }
            }
            "$options" => true, // consumed by $regex
            other => {
                return Err(StoreError::InvalidQuery(format!(
                    "unsupported constraint: {}",
                    other
                )))
            }
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn branch_queries(value: &Value, op: &str) -> StoreResult<Vec<ObjectMap>> {
    let branches = value
        .as_array()
        .ok_or_else(|| StoreError::InvalidQuery(format!("bad {} format - use an array", op)))?;
    branches
        .iter()
        .map(|branch| {
            branch
                .as_object()
                .cloned()
                .ok_or_else(|| StoreError::InvalidQuery(format!("{} branch must be an object", op)))
        })
        .collect()
}

fn query_matches(object: &ObjectMap, query: &ObjectMap) -> StoreResult<bool> {
    for (key, constraint) in query {
        let holds = match key.as_str() {
            "$or" => {
                let mut any = false;
                for branch in branch_queries(constraint, "$or")? {
                    if query_matches(object, &branch)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$and" => {
                let mut all = true;
                for branch in branch_queries(constraint, "$and")? {
                    if !query_matches(object, &branch)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$nor" => {
                let mut none = true;
                for branch in branch_queries(constraint, "$nor")? {
                    if query_matches(object, &branch)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            _ => {
                let actual = lookup(object, key);
                match constraint {
                    Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                        constraint_matches(actual, ops)?
                    }
                    expected => equals_or_contains(actual, expected),
                }
            }
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn apply_update(object: &mut ObjectMap, update: &ObjectMap) -> StoreResult<()> {
    for (key, value) in update {
        match value.as_operator() {
            Some(("Increment", payload)) => {
                let amount = payload
                    .get("amount")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        StoreError::InvalidJson("Increment amount must be a number".to_string())
                    })?;
                let current = lookup(object, key).and_then(Value::as_f64).unwrap_or(0.0);
                set_path(object, key, Value::Number(current + amount));
            }
            Some(("Add", payload)) | Some(("AddUnique", payload)) => {
                let unique = value.as_operator().map(|(op, _)| op) == Some("AddUnique");
                let additions = payload
                    .get("objects")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        StoreError::InvalidJson("Add operator requires 'objects'".to_string())
                    })?
                    .to_vec();
                let mut items = match lookup(object, key) {
                    Some(Value::Array(existing)) => existing.clone(),
                    _ => Vec::new(),
                };
                for addition in additions {
                    if !unique || !items.contains(&addition) {
                        items.push(addition);
                    }
                }
                set_path(object, key, Value::Array(items));
            }
            Some(("Remove", payload)) => {
                let removals = payload
                    .get("objects")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        StoreError::InvalidJson("Remove operator requires 'objects'".to_string())
                    })?;
                if let Some(Value::Array(existing)) = lookup(object, key) {
                    let remaining: Vec<Value> = existing
                        .iter()
                        .filter(|item| !removals.contains(item))
                        .cloned()
                        .collect();
                    set_path(object, key, Value::Array(remaining));
                }
            }
            Some(("Delete", _)) => remove_path(object, key),
            Some((other, _)) => {
                return Err(StoreError::CommandUnavailable(format!(
                    "update operator {} must be desugared before storage",
                    other
                )))
            }
            None => set_path(object, key, value.clone()),
        }
    }
    Ok(())
}

fn sort_objects(objects: &mut [ObjectMap], sort: &[(String, SortOrder)]) {
    objects.sort_by(|a, b| {
        for (field, order) in sort {
            let ordering = match (lookup(a, field), lookup(b, field)) {
                (Some(x), Some(y)) => x.compare(y).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            let ordering = match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

const ALWAYS_PROJECTED: &[&str] = &["objectId", "createdAt", "updatedAt", "_rperm", "_wperm"];

fn project(object: &ObjectMap, keys: &Option<Vec<String>>) -> ObjectMap {
    let Some(keys) = keys else {
        return object.clone();
    };
    object
        .iter()
        .filter(|(name, _)| {
            ALWAYS_PROJECTED.contains(&name.as_str())
                || keys
                    .iter()
                    .any(|k| k == *name || k.split('.').next() == Some(name))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn get_all_classes(&self) -> StoreResult<Vec<ClassSchema>> {
        self.enumerations.fetch_add(1, AtomicOrdering::SeqCst);
        let store = self.store.read().await;
        Ok(store
            .classes
            .iter()
            .filter(|(name, _)| !name.starts_with("_Join:"))
            .map(|(_, class)| class.schema.clone())
            .collect())
    }

    async fn create_class(&self, schema: &ClassSchema) -> StoreResult<ClassSchema> {
        let mut store = self.store.write().await;
        if store.classes.contains_key(&schema.class_name) {
            return Err(StoreError::InvalidClassName(format!(
                "class {} already exists",
                schema.class_name
            )));
        }
        store.classes.insert(
            schema.class_name.clone(),
            StoredClass {
                schema: schema.clone(),
                objects: BTreeMap::new(),
            },
        );
        Ok(schema.clone())
    }

    async fn delete_class(&self, class_name: &str) -> StoreResult<()> {
        let mut store = self.store.write().await;
        store
            .classes
            .remove(class_name)
            .map(|_| ())
            .ok_or_else(|| StoreError::missing_class(class_name))
    }

    async fn class_exists(&self, class_name: &str) -> StoreResult<bool> {
        Ok(self.store.read().await.classes.contains_key(class_name))
    }

    async fn update_schema_with_indexes(&self, schema: &ClassSchema) -> StoreResult<()> {
        let mut store = self.store.write().await;
        match store.classes.get_mut(&schema.class_name) {
            Some(class) => class.schema = schema.clone(),
            None => {
                store.classes.insert(
                    schema.class_name.clone(),
                    StoredClass {
                        schema: schema.clone(),
                        objects: BTreeMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn set_indexes_with_schema_format(
        &self,
        class_name: &str,
        indexes: &IndexMap,
    ) -> StoreResult<()> {
        let mut store = self.store.write().await;
        let class = store
            .classes
            .get_mut(class_name)
            .ok_or_else(|| StoreError::missing_class(class_name))?;
        class.schema.indexes = indexes.clone();
        Ok(())
    }

    async fn set_class_permissions(
        &self,
        class_name: &str,
        permissions: &ClassLevelPermissions,
    ) -> StoreResult<()> {
        let mut store = self.store.write().await;
        let class = store
            .classes
            .get_mut(class_name)
            .ok_or_else(|| StoreError::missing_class(class_name))?;
        class.schema.class_level_permissions = permissions.clone();
        Ok(())
    }

    async fn add_field_if_not_exists(
        &self,
        class_name: &str,
        field_name: &str,
        field_type: &FieldType,
    ) -> StoreResult<()> {
        let mut store = self.store.write().await;
        let class = store
            .classes
            .entry(class_name.to_string())
            .or_insert_with(|| StoredClass {
                schema: ClassSchema::empty(class_name),
                objects: BTreeMap::new(),
            });
        if let Some(existing) = class.schema.field_type(field_name) {
            if existing != field_type {
                return Err(StoreError::IncorrectType(format!(
                    "field {} already exists with a different type",
                    field_name
                )));
            }
            return Ok(());
        }
        class.schema.fields.insert(
            field_name.to_string(),
            crate::schema::types::FieldSpec::of(field_type.clone()),
        );
        Ok(())
    }

    async fn delete_fields(&self, class_name: &str, field_names: &[String]) -> StoreResult<()> {
        let mut store = self.store.write().await;
        let class = store
            .classes
            .get_mut(class_name)
            .ok_or_else(|| StoreError::missing_class(class_name))?;
        for name in field_names {
            class.schema.fields.remove(name);
            for object in class.objects.values_mut() {
                object.remove(name);
            }
        }
        Ok(())
    }

    async fn ensure_uniqueness(
        &self,
        _class_name: &str,
        _schema: &ClassSchema,
        _field_names: &[String],
    ) -> StoreResult<()> {
        Ok(())
    }

    async fn ensure_index(
        &self,
        _class_name: &str,
        _schema: &ClassSchema,
        _field_names: &[String],
    ) -> StoreResult<()> {
        Ok(())
    }

    async fn find(
        &self,
        class_name: &str,
        _schema: &ClassSchema,
        query: &ObjectMap,
        options: &QueryOptions,
    ) -> StoreResult<Vec<ObjectMap>> {
        let store = self.store.read().await;
        let Some(class) = store.classes.get(class_name) else {
            return Ok(Vec::new());
        };
        let mut results = Vec::new();
        for object in class.objects.values() {
            if query_matches(object, query)? {
                results.push(object.clone());
            }
        }
        sort_objects(&mut results, &options.sort);
        let skip = options.skip.unwrap_or(0);
        let results: Vec<ObjectMap> = results
            .into_iter()
            .skip(skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|object| project(&object, &options.keys))
            .collect();
        Ok(results)
    }

    async fn count(
        &self,
        class_name: &str,
        _schema: &ClassSchema,
        query: &ObjectMap,
    ) -> StoreResult<u64> {
        let store = self.store.read().await;
        let Some(class) = store.classes.get(class_name) else {
            return Ok(0);
        };
        let mut count = 0;
        for object in class.objects.values() {
            if query_matches(object, query)? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn distinct(
        &self,
        class_name: &str,
        _schema: &ClassSchema,
        query: &ObjectMap,
        field_name: &str,
    ) -> StoreResult<Vec<Value>> {
        let store = self.store.read().await;
        let Some(class) = store.classes.get(class_name) else {
            return Ok(Vec::new());
        };
        let mut values: Vec<Value> = Vec::new();
        for object in class.objects.values() {
            if !query_matches(object, query)? {
                continue;
            }
            match lookup(object, field_name) {
                Some(Value::Array(items)) => {
                    for item in items {
                        if !values.contains(item) {
                            values.push(item.clone());
                        }
                    }
                }
                Some(value) => {
                    if !values.contains(value) {
                        values.push(value.clone());
                    }
                }
                None => {}
            }
        }
        Ok(values)
    }

    async fn aggregate(
        &self,
        _class_name: &str,
        _schema: &ClassSchema,
        _pipeline: &[Value],
    ) -> StoreResult<Vec<ObjectMap>> {
        Err(StoreError::CommandUnavailable(
            "aggregate is not supported by the in-memory adapter".to_string(),
        ))
    }

    async fn create_object(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        object: &ObjectMap,
        session: Option<&TransactionId>,
    ) -> StoreResult<ObjectMap> {
        let object_id = object_id_of(object)?;
        {
            let mut store = self.store.write().await;
            let class = store
                .classes
                .entry(class_name.to_string())
                .or_insert_with(|| StoredClass {
                    schema: schema.clone(),
                    objects: BTreeMap::new(),
                });
            if class.objects.contains_key(&object_id) {
                return Err(StoreError::InternalServerError(format!(
                    "duplicate value for objectId {}",
                    object_id
                )));
            }
            class.objects.insert(object_id.clone(), object.clone());
        }
        self.record_undo(
            session,
            UndoOp::Created {
                class_name: class_name.to_string(),
                object_id,
            },
        )
        .await?;
        Ok(object.clone())
    }

    async fn update_objects_by_query(
        &self,
        class_name: &str,
        _schema: &ClassSchema,
        query: &ObjectMap,
        update: &ObjectMap,
        session: Option<&TransactionId>,
    ) -> StoreResult<u64> {
        let mut undo = Vec::new();
        let updated = {
            let mut store = self.store.write().await;
            let Some(class) = store.classes.get_mut(class_name) else {
                return Ok(0);
            };
            let mut updated = 0;
            for (object_id, object) in class.objects.iter_mut() {
                if query_matches(object, query)? {
                    undo.push(UndoOp::Updated {
                        class_name: class_name.to_string(),
                        object_id: object_id.clone(),
                        previous: object.clone(),
                    });
                    apply_update(object, update)?;
                    updated += 1;
                }
            }
            updated
        };
        for op in undo {
            self.record_undo(session, op).await?;
        }
        Ok(updated)
    }

    async fn find_one_and_update(
        &self,
        class_name: &str,
        _schema: &ClassSchema,
        query: &ObjectMap,
        update: &ObjectMap,
        session: Option<&TransactionId>,
    ) -> StoreResult<Option<ObjectMap>> {
        let mut undo = None;
        let result = {
            let mut store = self.store.write().await;
            let Some(class) = store.classes.get_mut(class_name) else {
                return Ok(None);
            };
            let mut result = None;
            for (object_id, object) in class.objects.iter_mut() {
                if query_matches(object, query)? {
                    undo = Some(UndoOp::Updated {
                        class_name: class_name.to_string(),
                        object_id: object_id.clone(),
                        previous: object.clone(),
                    });
                    apply_update(object, update)?;
                    result = Some(object.clone());
                    break;
                }
            }
            result
        };
        if let Some(op) = undo {
            self.record_undo(session, op).await?;
        }
        Ok(result)
    }

    async fn upsert_one_object(
        &self,
        class_name: &str,
        schema: &ClassSchema,
        query: &ObjectMap,
        update: &ObjectMap,
        session: Option<&TransactionId>,
    ) -> StoreResult<()> {
        if self
            .find_one_and_update(class_name, schema, query, update, session)
            .await?
            .is_some()
        {
            return Ok(());
        }
        // Seed a fresh object from the query's literal constraints.
        let mut object = ObjectMap::new();
        for (key, value) in query {
            if !key.starts_with('$') && value.as_operator().is_none() && value.as_object().is_none()
            {
                object.insert(key.clone(), value.clone());
            }
        }
        apply_update(&mut object, update)?;
        if !object.contains_key("objectId") {
            object.insert(
                "objectId".to_string(),
                Value::String(uuid::Uuid::new_v4().simple().to_string()),
            );
        }
        self.create_object(class_name, schema, &object, session)
            .await?;
        Ok(())
    }

    async fn delete_objects_by_query(
        &self,
        class_name: &str,
        _schema: &ClassSchema,
        query: &ObjectMap,
        session: Option<&TransactionId>,
    ) -> StoreResult<u64> {
        let mut undo = Vec::new();
        let deleted = {
            let mut store = self.store.write().await;
            let Some(class) = store.classes.get_mut(class_name) else {
                return Ok(0);
            };
            let mut doomed = Vec::new();
            for (object_id, object) in class.objects.iter() {
                if query_matches(object, query)? {
                    doomed.push(object_id.clone());
                }
            }
            for object_id in &doomed {
                if let Some(previous) = class.objects.remove(object_id) {
                    undo.push(UndoOp::Deleted {
                        class_name: class_name.to_string(),
                        previous,
                    });
                }
            }
            doomed.len() as u64
        };
        for op in undo {
            self.record_undo(session, op).await?;
        }
        Ok(deleted)
    }

    async fn create_transactional_session(&self) -> StoreResult<TransactionId> {
        let session = TransactionId::new();
        self.sessions.lock().await.insert(session.clone(), Vec::new());
        Ok(session)
    }

    async fn commit_transactional_session(&self, session: TransactionId) -> StoreResult<()> {
        self.sessions.lock().await.remove(&session).ok_or_else(|| {
            StoreError::InternalServerError("unknown transactional session".to_string())
        })?;
        Ok(())
    }

    async fn abort_transactional_session(&self, session: TransactionId) -> StoreResult<()> {
        let log = self.sessions.lock().await.remove(&session).ok_or_else(|| {
            StoreError::InternalServerError("unknown transactional session".to_string())
        })?;
        let mut store = self.store.write().await;
        for op in log.into_iter().rev() {
            match op {
                UndoOp::Created {
                    class_name,
                    object_id,
                } => {
                    if let Some(class) = store.classes.get_mut(&class_name) {
                        class.objects.remove(&object_id);
                    }
                }
                UndoOp::Updated {
                    class_name,
                    object_id,
                    previous,
                } => {
                    if let Some(class) = store.classes.get_mut(&class_name) {
                        class.objects.insert(object_id, previous);
                    }
                }
                UndoOp::Deleted {
                    class_name,
                    previous,
                } => {
                    let object_id = object_id_of(&previous)?;
                    if let Some(class) = store.classes.get_mut(&class_name) {
                        class.objects.insert(object_id, previous);
                    }
                }
            }
        }
        Ok(())
    }
}
