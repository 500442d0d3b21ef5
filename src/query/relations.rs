//! Relation desugaring.
//!
//! Relations are stored in join tables named `_Join:{field}:{owningClass}`,
//! one row per edge with `owningId` and `relatedId` columns. Query
//! constraints that mention relations are rewritten here into plain
//! `objectId` constraints before the adapter ever sees them.

use std::collections::BTreeMap;
use std::collections::HashSet;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{StoreError, StoreResult};
use crate::schema::types::{ClassSchema, FieldSpec, FieldType};
use crate::storage::{QueryOptions, StorageAdapter};
use crate::types::value::{ObjectMap, Value};

/// Above this many candidate ids the linear intersection degrades and the
/// hash-set variant takes over.
const LINEAR_INTERSECT_MAX: usize = 125;

pub fn join_table_name(class_name: &str, field_name: &str) -> String {
    format!("_Join:{}:{}", field_name, class_name)
}

/// Synthesized schema of a join table.
pub fn relation_schema(join_class: &str) -> ClassSchema {
    let mut schema = ClassSchema::empty(join_class);
    schema
        .fields
        .insert("owningId".to_string(), FieldSpec::of(FieldType::String));
    schema
        .fields
        .insert("relatedId".to_string(), FieldSpec::of(FieldType::String));
    schema
}

/// Adds one relation edge; adding the same edge twice is a no-op.
pub async fn add_relation_row(
    adapter: &dyn StorageAdapter,
    class_name: &str,
    field_name: &str,
    owning_id: &str,
    related_id: &str,
) -> StoreResult<()> {
    let join_class = join_table_name(class_name, field_name);
    let mut edge = ObjectMap::new();
    edge.insert("owningId".to_string(), Value::from(owning_id));
    edge.insert("relatedId".to_string(), Value::from(related_id));
    adapter
        .upsert_one_object(&join_class, &relation_schema(&join_class), &edge, &edge, None)
        .await
}

/// Removes one relation edge; a missing edge is not an error.
pub async fn remove_relation_row(
    adapter: &dyn StorageAdapter,
    class_name: &str,
    field_name: &str,
    owning_id: &str,
    related_id: &str,
) -> StoreResult<()> {
    let join_class = join_table_name(class_name, field_name);
    let mut edge = ObjectMap::new();
    edge.insert("owningId".to_string(), Value::from(owning_id));
    edge.insert("relatedId".to_string(), Value::from(related_id));
    match adapter
        .delete_objects_by_query(&join_class, &relation_schema(&join_class), &edge, None)
        .await
    {
        Ok(_) => Ok(()),
        Err(err) if err.is_object_not_found() || err.is_missing_class() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Ids of objects related to `owning_id` through the given relation field.
pub async fn related_ids(
    adapter: &dyn StorageAdapter,
    owning_class: &str,
    field_name: &str,
    owning_id: &str,
) -> StoreResult<Vec<String>> {
    let join_class = join_table_name(owning_class, field_name);
    let mut query = ObjectMap::new();
    query.insert("owningId".to_string(), Value::from(owning_id));
    let options = QueryOptions {
        keys: Some(vec!["relatedId".to_string()]),
        ..QueryOptions::default()
    };
    let rows = adapter
        .find(&join_class, &relation_schema(&join_class), &query, &options)
        .await?;
    Ok(collect_column(&rows, "relatedId"))
}

/// Ids of objects whose relation field contains any of `related`.
pub async fn owning_ids(
    adapter: &dyn StorageAdapter,
    class_name: &str,
    field_name: &str,
    related: &[String],
) -> StoreResult<Vec<String>> {
    let join_class = join_table_name(class_name, field_name);
    let mut constraint = ObjectMap::new();
    constraint.insert(
        "$in".to_string(),
        Value::Array(related.iter().map(|id| Value::from(id.as_str())).collect()),
    );
    let mut query = ObjectMap::new();
    query.insert("relatedId".to_string(), Value::Object(constraint));
    let options = QueryOptions {
        keys: Some(vec!["owningId".to_string()]),
        ..QueryOptions::default()
    };
    let rows = adapter
        .find(&join_class, &relation_schema(&join_class), &query, &options)
        .await?;
    Ok(collect_column(&rows, "owningId"))
}

fn collect_column(rows: &[ObjectMap], column: &str) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get(column).and_then(Value::as_str))
        .map(|id| id.to_string())
        .collect()
}

/// Rewrites every `$relatedTo` clause of `query` into an `objectId`
/// constraint. Compound branches are visited first so a `$relatedTo` nested
/// under `$or` is reduced within its own branch.
pub fn reduce_related_to<'a>(
    adapter: &'a dyn StorageAdapter,
    query: &'a mut ObjectMap,
) -> BoxFuture<'a, StoreResult<()>> {
    async move {
        for compound in ["$or", "$and", "$nor"] {
            if let Some(Value::Array(branches)) = query.get_mut(compound) {
                for branch in branches {
                    if let Value::Object(branch) = branch {
                        reduce_related_to(adapter, branch).await?;
                    }
                }
            }
        }
        while let Some(constraint) = query.remove("$relatedTo") {
            let (owning_class, owning_id, field_name) = parse_related_to(&constraint)?;
            let ids = related_ids(adapter, &owning_class, &field_name, &owning_id).await?;
            add_in_object_ids(ids, query);
        }
        Ok(())
    }
    .boxed()
}

fn parse_related_to(constraint: &Value) -> StoreResult<(String, String, String)> {
    let bad = || {
        StoreError::InvalidQuery(
            "bad query: $relatedTo needs an object pointer and a key".to_string(),
        )
    };
    let map = constraint.as_object().ok_or_else(bad)?;
    let (class_name, object_id) = map
        .get("object")
        .and_then(Value::as_pointer)
        .ok_or_else(bad)?;
    let key = map.get("key").and_then(Value::as_str).ok_or_else(bad)?;
    Ok((class_name.to_string(), object_id.to_string(), key.to_string()))
}

/// Rewrites constraints on relation-typed fields of `class_name` into
/// `objectId` constraints via owning-id lookups.
pub fn reduce_in_relation<'a>(
    adapter: &'a dyn StorageAdapter,
    class_name: &'a str,
    schema: &'a ClassSchema,
    query: &'a mut ObjectMap,
) -> BoxFuture<'a, StoreResult<()>> {
    async move {
        for compound in ["$or", "$and", "$nor"] {
            if let Some(Value::Array(branches)) = query.get_mut(compound) {
                for branch in branches {
                    if let Value::Object(branch) = branch {
                        reduce_in_relation(adapter, class_name, schema, branch).await?;
                    }
                }
            }
        }

        let relation_fields: Vec<String> = query
            .keys()
            .filter(|key| {
                schema
                    .field_type(key)
                    .map(FieldType::is_relation)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for field_name in relation_fields {
            let constraint = query.remove(&field_name).expect("key just enumerated");
            for (ids, negated) in relation_constraints(&field_name, &constraint)? {
                let owning = owning_ids(adapter, class_name, &field_name, &ids).await?;
                if negated {
                    add_not_in_object_ids(owning, query);
                } else {
                    add_in_object_ids(owning, query);
                }
            }
        }
        Ok(())
    }
    .boxed()
}

/// Splits a relation-field constraint into (related ids, negated) lookups.
fn relation_constraints(
    field_name: &str,
    constraint: &Value,
) -> StoreResult<Vec<(Vec<String>, bool)>> {
    let bad = |what: &str| {
        StoreError::InvalidQuery(format!(
            "bad constraint on relation field {}: {}",
            field_name, what
        ))
    };
    match constraint {
        Value::Pointer { object_id, .. } => Ok(vec![(vec![object_id.clone()], false)]),
        Value::Object(map) => {
            let mut lookups = Vec::new();
            for (op, value) in map {
                let negated = match op.as_str() {
                    "$in" | "$eq" => false,
                    "$nin" | "$ne" => true,
                    other => return Err(bad(other)),
                };
                let ids = match value {
                    Value::Pointer { object_id, .. } => vec![object_id.clone()],
                    Value::Array(pointers) => pointers
                        .iter()
                        .map(|p| {
                            p.as_pointer()
                                .map(|(_, id)| id.to_string())
                                .ok_or_else(|| bad("expected an array of pointers"))
                        })
                        .collect::<StoreResult<Vec<String>>>()?,
                    _ => return Err(bad("expected a pointer or an array of pointers")),
                };
                lookups.push((ids, negated));
            }
            Ok(lookups)
        }
        _ => Err(bad("expected a pointer or a constraint object")),
    }
}

/// Narrows the query's `objectId` constraint to the intersection of the
/// incoming ids and any ids the query already pins (`objectId` as a literal,
/// `$eq` or `$in`). Other `objectId` sub-operators are preserved.
pub fn add_in_object_ids(ids: Vec<String>, query: &mut ObjectMap) {
    let mut sets: Vec<Vec<String>> = vec![ids];
    let mut carried = BTreeMap::new();
    match query.remove("objectId") {
        Some(Value::String(id)) => sets.push(vec![id]),
        Some(Value::Object(map)) => {
            for (op, value) in map {
                if op == "$eq" {
                    if let Value::String(id) = &value {
                        sets.push(vec![id.clone()]);
                        continue;
                    }
                } else if op == "$in" {
                    if let Value::Array(list) = &value {
                        sets.push(
                            list.iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect(),
                        );
                        continue;
                    }
                }
                carried.insert(op, value);
            }
        }
        Some(other) => sets.push(vec![other.as_str().unwrap_or_default().to_string()]),
        None => {}
    }

    let total: usize = sets.iter().map(Vec::len).sum();
    let intersection = if total <= LINEAR_INTERSECT_MAX {
        intersect_small(sets)
    } else {
        intersect_big(sets)
    };

    carried.insert(
        "$in".to_string(),
        Value::Array(intersection.into_iter().map(Value::String).collect()),
    );
    query.insert("objectId".to_string(), Value::Object(carried));
}

/// Widens the query's `objectId.$nin` list with the incoming ids. A literal
/// `objectId` is carried over as `$eq`.
pub fn add_not_in_object_ids(ids: Vec<String>, query: &mut ObjectMap) {
    let mut carried = BTreeMap::new();
    match query.remove("objectId") {
        Some(Value::String(id)) => {
            carried.insert("$eq".to_string(), Value::String(id));
        }
        Some(Value::Object(map)) => carried.extend(map),
        Some(other) => {
            carried.insert("$eq".to_string(), other);
        }
        None => {}
    }
    let mut excluded: Vec<String> = match carried.remove("$nin") {
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    for id in ids {
        if !excluded.contains(&id) {
            excluded.push(id);
        }
    }
    carried.insert(
        "$nin".to_string(),
        Value::Array(excluded.into_iter().map(Value::String).collect()),
    );
    query.insert("objectId".to_string(), Value::Object(carried));
}

fn intersect_small(mut sets: Vec<Vec<String>>) -> Vec<String> {
    let first = sets.remove(0);
    first
        .into_iter()
        .filter(|id| sets.iter().all(|set| set.contains(id)))
        .collect()
}

fn intersect_big(mut sets: Vec<Vec<String>>) -> Vec<String> {
    let first = sets.remove(0);
    let rest: Vec<HashSet<&String>> = sets.iter().map(|set| set.iter().collect()).collect();
    first
        .into_iter()
        .filter(|id| rest.iter().all(|set| set.contains(id)))
        .collect()
}
