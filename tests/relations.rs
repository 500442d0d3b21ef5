//! Relation operators and relation-aware queries.

mod common;

use serde_json::json;

use common::CommonTestFixture;
use docstore::{Caller, FindOptions, UpdateOptions, Value};

async fn seeded() -> (CommonTestFixture, String, String) {
    let fixture = CommonTestFixture::new().await.unwrap();
    fixture.seed_post_class(json!(null)).await.unwrap();
    for id in ["u1", "u2", "u3"] {
        fixture
            .db
            .create(
                "_User",
                CommonTestFixture::object(json!({"objectId": id, "username": id})),
                &Caller::master(),
            )
            .await
            .unwrap();
    }
    let p1 = create_post(&fixture, "liked").await;
    let p2 = create_post(&fixture, "ignored").await;
    fixture
        .db
        .update(
            "Post",
            CommonTestFixture::object(json!({"objectId": p1})),
            CommonTestFixture::object(json!({"likes": {
                "__op": "AddRelation",
                "objects": [
                    CommonTestFixture::pointer("_User", "u1"),
                    CommonTestFixture::pointer("_User", "u2"),
                ],
            }})),
            UpdateOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
    (fixture, p1, p2)
}

async fn create_post(fixture: &CommonTestFixture, title: &str) -> String {
    let created = fixture
        .db
        .create(
            "Post",
            CommonTestFixture::object(json!({"title": title})),
            &Caller::master(),
        )
        .await
        .unwrap();
    created
        .get("objectId")
        .and_then(Value::as_str)
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn related_to_queries_traverse_the_join_table() {
    let (fixture, p1, _) = seeded().await;
    let results = fixture
        .db
        .find(
            "_User",
            CommonTestFixture::object(json!({"$relatedTo": {
                "object": CommonTestFixture::pointer("Post", &p1),
                "key": "likes",
            }})),
            FindOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
    let mut ids: Vec<String> = results
        .iter()
        .map(|u| u.get("objectId").and_then(Value::as_str).unwrap().to_string())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["u1", "u2"]);
}

#[tokio::test]
async fn relation_constraints_rewrite_to_object_ids() {
    let (fixture, p1, p2) = seeded().await;

    let liked_by_u1 = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({"likes": CommonTestFixture::pointer("_User", "u1")})),
            FindOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
    assert_eq!(liked_by_u1.len(), 1);
    assert_eq!(
        liked_by_u1[0].get("objectId").and_then(Value::as_str),
        Some(p1.as_str())
    );

    let not_liked_by_u1 = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({"likes": {
                "$ne": CommonTestFixture::pointer("_User", "u1"),
            }})),
            FindOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
    assert_eq!(not_liked_by_u1.len(), 1);
    assert_eq!(
        not_liked_by_u1[0].get("objectId").and_then(Value::as_str),
        Some(p2.as_str())
    );

    let liked_by_any = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({"likes": {"$in": [
                CommonTestFixture::pointer("_User", "u2"),
                CommonTestFixture::pointer("_User", "u3"),
            ]}})),
            FindOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
    assert_eq!(liked_by_any.len(), 1);
}

#[tokio::test]
async fn relation_constraints_intersect_with_pinned_ids() {
    let (fixture, _, p2) = seeded().await;
    let results = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({
                "objectId": p2,
                "likes": CommonTestFixture::pointer("_User", "u1"),
            })),
            FindOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn remove_relation_deletes_edges() {
    let (fixture, p1, _) = seeded().await;
    fixture
        .db
        .update(
            "Post",
            CommonTestFixture::object(json!({"objectId": p1})),
            CommonTestFixture::object(json!({"likes": {
                "__op": "RemoveRelation",
                "objects": [CommonTestFixture::pointer("_User", "u1")],
            }})),
            UpdateOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();

    let remaining = fixture
        .db
        .find(
            "_User",
            CommonTestFixture::object(json!({"$relatedTo": {
                "object": CommonTestFixture::pointer("Post", &p1),
                "key": "likes",
            }})),
            FindOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(
        remaining[0].get("objectId").and_then(Value::as_str),
        Some("u2")
    );

    // Removing an edge that is already gone stays silent.
    fixture
        .db
        .update(
            "Post",
            CommonTestFixture::object(json!({"objectId": p1})),
            CommonTestFixture::object(json!({"likes": {
                "__op": "RemoveRelation",
                "objects": [CommonTestFixture::pointer("_User", "u1")],
            }})),
            UpdateOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn adding_the_same_edge_twice_is_idempotent() {
    let (fixture, p1, _) = seeded().await;
    fixture
        .db
        .update(
            "Post",
            CommonTestFixture::object(json!({"objectId": p1})),
            CommonTestFixture::object(json!({"likes": {
                "__op": "AddRelation",
                "objects": [CommonTestFixture::pointer("_User", "u1")],
            }})),
            UpdateOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();

    let liked = fixture
        .db
        .find(
            "_User",
            CommonTestFixture::object(json!({"$relatedTo": {
                "object": CommonTestFixture::pointer("Post", &p1),
                "key": "likes",
            }})),
            FindOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
    assert_eq!(liked.len(), 2);
}

#[tokio::test]
async fn related_to_nested_under_or_reduces_per_branch() {
    let (fixture, p1, _) = seeded().await;
    let results = fixture
        .db
        .find(
            "_User",
            CommonTestFixture::object(json!({"$or": [
                {"$relatedTo": {
                    "object": CommonTestFixture::pointer("Post", &p1),
                    "key": "likes",
                }},
                {"objectId": "u3"},
            ]})),
            FindOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
}
