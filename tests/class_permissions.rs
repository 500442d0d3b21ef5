//! Class-level permissions: entity grants, authentication gates and pointer
//! permissions.

mod common;

use serde_json::json;

use common::CommonTestFixture;
use docstore::{Caller, FindOptions, StoreError, UpdateOptions};

#[tokio::test]
async fn entity_grants_gate_each_operation() {
    let fixture = CommonTestFixture::new().await.unwrap();
    fixture
        .seed_post_class(json!({
            "get": {"*": true},
            "find": {"u1": true, "role:mod": true},
            "create": {"requiresAuthentication": true},
        }))
        .await
        .unwrap();

    let err = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({})),
            FindOptions::default(),
            &CommonTestFixture::user("u2"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::OperationForbidden(_)));

    fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({})),
            FindOptions::default(),
            &CommonTestFixture::user("u1"),
        )
        .await
        .unwrap();
    fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({})),
            FindOptions::default(),
            &CommonTestFixture::user_with_roles("u3", &["mod"]),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn emptied_permission_maps_lock_the_operation_down() {
    let fixture = CommonTestFixture::new().await.unwrap();
    fixture
        .seed_post_class(json!({"find": {}, "get": {}}))
        .await
        .unwrap();
    fixture
        .db
        .create(
            "Post",
            CommonTestFixture::object(json!({"title": "p", "secret": "s"})),
            &Caller::master(),
        )
        .await
        .unwrap();

    // An explicit `{}` is a configured rule that grants nobody, not an
    // absent one that falls open.
    let err = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({})),
            FindOptions::default(),
            &Caller::public(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::OperationForbidden(_)));

    let err = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({})),
            FindOptions::default(),
            &CommonTestFixture::user("u1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::OperationForbidden(_)));

    // Operations without a configured map stay open.
    fixture
        .db
        .count(
            "Post",
            CommonTestFixture::object(json!({})),
            &Caller::public(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn requires_authentication_denies_as_not_found() {
    let fixture = CommonTestFixture::new().await.unwrap();
    fixture
        .seed_post_class(json!({"create": {"requiresAuthentication": true}}))
        .await
        .unwrap();

    let err = fixture
        .db
        .create(
            "Post",
            CommonTestFixture::object(json!({"title": "x"})),
            &Caller::public(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ObjectNotFound(_)));

    fixture
        .db
        .create(
            "Post",
            CommonTestFixture::object(json!({"title": "x"})),
            &CommonTestFixture::user("u1"),
        )
        .await
        .unwrap();
}

async fn ownership_fixture() -> CommonTestFixture {
    let fixture = CommonTestFixture::new().await.unwrap();
    fixture
        .seed_post_class(json!({
            "find": {"role:admin": true},
            "update": {"pointerFields": ["owner"]},
            "delete": {"pointerFields": ["owner"]},
            "readUserFields": ["owner"],
        }))
        .await
        .unwrap();
    for (title, owner) in [("mine", "u1"), ("theirs", "u2")] {
        fixture
            .db
            .create(
                "Post",
                CommonTestFixture::object(json!({
                    "title": title,
                    "owner": CommonTestFixture::pointer("_User", owner),
                })),
                &Caller::master(),
            )
            .await
            .unwrap();
    }
    fixture
}

#[tokio::test]
async fn pointer_permissions_scope_reads_to_owned_objects() {
    let fixture = ownership_fixture().await;
    let results = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({})),
            FindOptions::default(),
            &CommonTestFixture::user("u1"),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get("title").unwrap().to_json(), json!("mine"));

    // No single user id to own anything: nothing matches.
    let public = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({})),
            FindOptions::default(),
            &Caller::public(),
        )
        .await
        .unwrap();
    assert!(public.is_empty());
}

#[tokio::test]
async fn pointer_permissions_scope_writes_to_owned_objects() {
    let fixture = ownership_fixture().await;

    fixture
        .db
        .update(
            "Post",
            CommonTestFixture::object(json!({"title": "mine"})),
            CommonTestFixture::object(json!({"title": "still mine"})),
            UpdateOptions::default(),
            &CommonTestFixture::user("u1"),
        )
        .await
        .unwrap();

    let err = fixture
        .db
        .update(
            "Post",
            CommonTestFixture::object(json!({"title": "theirs"})),
            CommonTestFixture::object(json!({"title": "hijacked"})),
            UpdateOptions::default(),
            &CommonTestFixture::user("u1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ObjectNotFound(_)));

    let err = fixture
        .db
        .destroy(
            "Post",
            CommonTestFixture::object(json!({"title": "theirs"})),
            &CommonTestFixture::user("u1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ObjectNotFound(_)));
}

#[tokio::test]
async fn ownership_rules_cannot_grant_creation() {
    let fixture = CommonTestFixture::new().await.unwrap();
    fixture
        .seed_post_class(json!({"create": {"pointerFields": ["owner"]}}))
        .await
        .unwrap();

    let err = fixture
        .db
        .create(
            "Post",
            CommonTestFixture::object(json!({
                "title": "x",
                "owner": CommonTestFixture::pointer("_User", "u1"),
            })),
            &CommonTestFixture::user("u1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::OperationForbidden(_)));
}

#[tokio::test]
async fn master_bypasses_class_level_permissions() {
    let fixture = CommonTestFixture::new().await.unwrap();
    fixture
        .seed_post_class(json!({"find": {"u1": true}, "create": {"u1": true}}))
        .await
        .unwrap();
    fixture
        .db
        .create(
            "Post",
            CommonTestFixture::object(json!({"title": "x"})),
            &Caller::master(),
        )
        .await
        .unwrap();
    let results = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({})),
            FindOptions::default(),
            &Caller::master(),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn array_pointer_fields_match_membership() {
    let fixture = CommonTestFixture::new().await.unwrap();
    fixture
        .seed_post_class(json!({
            "find": {"role:admin": true},
            "readUserFields": ["editors"],
        }))
        .await
        .unwrap();
    fixture
        .db
        .create(
            "Post",
            CommonTestFixture::object(json!({
                "title": "shared",
                "editors": [
                    CommonTestFixture::pointer("_User", "u1"),
                    CommonTestFixture::pointer("_User", "u2"),
                ],
            })),
            &Caller::master(),
        )
        .await
        .unwrap();

    let results = fixture
        .db
        .find(
            "Post",
            CommonTestFixture::object(json!({})),
            FindOptions::default(),
            &CommonTestFixture::user("u2"),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}
