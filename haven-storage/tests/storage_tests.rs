use haven_crypto::generate_random_key;
use haven_storage::{
    BackendKind, ErrorCode, KeyRange, OperationResult, Storage, StorageConfig, StorageOperation,
    StorageQuery, StorageSchema, StoreIndex, StoreSchema, TransactionSupport,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

const ALL_BACKENDS: [BackendKind; 3] = [
    BackendKind::ObjectStore,
    BackendKind::Relational,
    BackendKind::KeyValue,
];

fn test_schema() -> StorageSchema {
    StorageSchema::new("test", 1)
        .with_store(
            StoreSchema::new("users", "id")
                .with_index(StoreIndex::new("by_email", "email").unique())
                .with_index(StoreIndex::new("by_age", "age")),
        )
        .with_store(
            StoreSchema::new("notes", "id")
                .auto_generate()
                .with_index(StoreIndex::new("by_tag", "tags").multi_entry())
                .with_index(StoreIndex::compound("by_owner_rank", ["owner", "rank"])),
        )
}

async fn open(kind: BackendKind, encrypted: bool) -> Storage {
    let key = encrypted.then(generate_random_key);
    Storage::initialize(StorageConfig::in_memory(kind), &test_schema(), key)
        .await
        .unwrap()
}

async fn seed_ages(storage: &Storage) {
    for age in 1..=10 {
        storage
            .create(
                "users",
                json!({ "id": format!("u{age:02}"), "email": format!("u{age}@x.io"), "age": age }),
            )
            .await
            .unwrap();
    }
}

fn ages(records: &[Value]) -> Vec<i64> {
    records.iter().map(|r| r["age"].as_i64().unwrap()).collect()
}

// ── CRUD ─────────────────────────────────────────────────────────

#[tokio::test]
async fn round_trip_with_and_without_encryption() {
    for kind in ALL_BACKENDS {
        for encrypted in [false, true] {
            let storage = open(kind, encrypted).await;
            let user = json!({ "id": "u1", "email": "ada@x.io", "age": 36, "meta": { "tz": "UTC" } });

            let stored = storage.create("users", user.clone()).await.unwrap();
            assert_eq!(stored, user, "{kind} encrypted={encrypted}");
            assert_eq!(storage.read("users", "u1").await.unwrap(), Some(user));
        }
    }
}

#[tokio::test]
async fn envelope_shaped_records_round_trip() {
    let lookalike = json!({ "id": "x", "encryptedPayload": "hello", "iv": "abc" });
    for kind in ALL_BACKENDS {
        for encrypted in [false, true] {
            let storage = open(kind, encrypted).await;
            storage.create("users", lookalike.clone()).await.unwrap();

            assert_eq!(
                storage.read("users", "x").await.unwrap(),
                Some(lookalike.clone()),
                "{kind} encrypted={encrypted}"
            );
            let all = storage.query(&StorageQuery::new("users")).await.unwrap();
            assert_eq!(all, vec![lookalike.clone()], "{kind} encrypted={encrypted}");
            let backup = storage.backup("u1").await.unwrap();
            assert_eq!(backup.data["users"], vec![lookalike.clone()]);
        }
    }
}

#[tokio::test]
async fn integer_keys_beyond_f64_precision_stay_distinct() {
    let low = 9_007_199_254_740_992_i64;
    for kind in ALL_BACKENDS {
        let storage = open(kind, false).await;
        storage.create("users", json!({ "id": low, "email": "a@x.io" })).await.unwrap();
        storage
            .create("users", json!({ "id": low + 1, "email": "b@x.io" }))
            .await
            .unwrap_or_else(|e| panic!("{kind}: {e}"));

        let read = storage.read("users", low + 1).await.unwrap().unwrap();
        assert_eq!(read["email"], json!("b@x.io"), "{kind}");
        let ids: Vec<Value> = storage
            .query(&StorageQuery::new("users"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(low), json!(low + 1)], "{kind}");
    }
}

#[tokio::test]
async fn read_missing_key_is_none() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, true).await;
        assert_eq!(storage.read("users", "nobody").await.unwrap(), None);
    }
}

#[tokio::test]
async fn unknown_store_is_a_schema_error() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, false).await;
        let err = storage.read("missing", "k").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaError, "{kind}");
    }
}

#[tokio::test]
async fn duplicate_create_is_already_exists() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, true).await;
        storage.create("users", json!({ "id": "u1", "email": "a@x.io" })).await.unwrap();
        let err = storage
            .create("users", json!({ "id": "u1", "email": "b@x.io" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists, "{kind}");
    }
}

#[tokio::test]
async fn unique_index_collision_is_already_exists() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, true).await;
        storage.create("users", json!({ "id": "u1", "email": "a@x.io" })).await.unwrap();
        let err = storage
            .create("users", json!({ "id": "u2", "email": "a@x.io" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists, "{kind}");
        assert_eq!(storage.read("users", "u2").await.unwrap(), None);
    }
}

#[tokio::test]
async fn create_without_key_needs_auto_generation() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, false).await;
        let err = storage.create("users", json!({ "email": "a@x.io" })).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOperation, "{kind}");

        let note = storage.create("notes", json!({ "text": "hi" })).await.unwrap();
        let id = note["id"].as_str().unwrap().to_string();
        assert_eq!(storage.read("notes", id).await.unwrap(), Some(note));
    }
}

#[tokio::test]
async fn update_missing_key_is_not_found() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, true).await;
        let err = storage
            .update("users", "ghost", json!({ "email": "g@x.io" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound, "{kind}");
    }
}

#[tokio::test]
async fn update_replaces_record_and_index_entries() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, true).await;
        storage
            .create("users", json!({ "id": "u1", "email": "a@x.io", "age": 20, "nick": "al" }))
            .await
            .unwrap();
        let updated = storage
            .update("users", "u1", json!({ "id": "ignored", "email": "a@x.io", "age": 30 }))
            .await
            .unwrap();
        assert_eq!(updated, json!({ "id": "u1", "email": "a@x.io", "age": 30 }));
        assert_eq!(storage.read("users", "u1").await.unwrap(), Some(updated));

        let at_20 = StorageQuery::new("users").index("by_age").range(KeyRange::only(20));
        let at_30 = StorageQuery::new("users").index("by_age").range(KeyRange::only(30));
        assert!(storage.query(&at_20).await.unwrap().is_empty(), "{kind}");
        assert_eq!(storage.query(&at_30).await.unwrap().len(), 1, "{kind}");
    }
}

#[tokio::test]
async fn update_releases_the_previous_unique_key() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, true).await;
        storage.create("users", json!({ "id": "u1", "email": "old@x.io" })).await.unwrap();
        storage.create("users", json!({ "id": "u2", "email": "b@x.io" })).await.unwrap();
        storage
            .update("users", "u1", json!({ "email": "new@x.io" }))
            .await
            .unwrap();

        storage.create("users", json!({ "id": "u3", "email": "old@x.io" })).await.unwrap();
        let err = storage
            .update("users", "u2", json!({ "email": "new@x.io" }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists, "{kind}");
        // Rewriting a record with its own unique key is not a collision.
        storage
            .update("users", "u1", json!({ "email": "new@x.io", "age": 5 }))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn delete_is_idempotent() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, false).await;
        storage.create("users", json!({ "id": "u1", "email": "a@x.io" })).await.unwrap();
        storage.delete("users", "u1").await.unwrap();
        storage.delete("users", "u1").await.unwrap();
        assert_eq!(storage.read("users", "u1").await.unwrap(), None);

        // The unique key is free again.
        storage.create("users", json!({ "id": "u2", "email": "a@x.io" })).await.unwrap();
    }
}

// ── Queries ──────────────────────────────────────────────────────

#[tokio::test]
async fn index_range_ascending_and_descending() {
    for kind in ALL_BACKENDS {
        for encrypted in [false, true] {
            let storage = open(kind, encrypted).await;
            seed_ages(&storage).await;

            let query = StorageQuery::new("users").index("by_age").range(KeyRange::bound(3, 6));
            assert_eq!(ages(&storage.query(&query).await.unwrap()), vec![3, 4, 5, 6], "{kind}");
            assert_eq!(
                ages(&storage.query(&query.clone().reverse()).await.unwrap()),
                vec![6, 5, 4, 3],
                "{kind}"
            );
        }
    }
}

#[tokio::test]
async fn open_bounds_exclude_endpoints() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, false).await;
        seed_ages(&storage).await;
        let query = StorageQuery::new("users")
            .index("by_age")
            .range(KeyRange::bound(3, 6).open_lower().open_upper());
        assert_eq!(ages(&storage.query(&query).await.unwrap()), vec![4, 5], "{kind}");
    }
}

#[tokio::test]
async fn filter_runs_before_offset_and_limit() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, true).await;
        seed_ages(&storage).await;
        let query = StorageQuery::new("users")
            .index("by_age")
            .filter(|r| r["age"].as_i64().is_some_and(|a| a % 2 == 0))
            .offset(1)
            .limit(2);
        assert_eq!(ages(&storage.query(&query).await.unwrap()), vec![4, 6], "{kind}");
    }
}

#[tokio::test]
async fn paging_without_filter() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, false).await;
        seed_ages(&storage).await;
        let query = StorageQuery::new("users").index("by_age").reverse().offset(2).limit(3);
        assert_eq!(ages(&storage.query(&query).await.unwrap()), vec![8, 7, 6], "{kind}");
    }
}

#[tokio::test]
async fn primary_key_scan_without_index() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, false).await;
        seed_ages(&storage).await;
        let query = StorageQuery::new("users").range(KeyRange::bound("u02", "u04"));
        assert_eq!(ages(&storage.query(&query).await.unwrap()), vec![2, 3, 4], "{kind}");
    }
}

#[tokio::test]
async fn inverted_range_is_invalid() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, false).await;
        let query = StorageQuery::new("users").index("by_age").range(KeyRange::bound(9, 1));
        let err = storage.query(&query).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOperation, "{kind}");
    }
}

#[tokio::test]
async fn unknown_index_is_a_schema_error() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, false).await;
        let err = storage.query(&StorageQuery::new("users").index("by_shoe")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaError, "{kind}");
    }
}

#[tokio::test]
async fn multi_entry_and_compound_indexes() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, true).await;
        storage
            .create("notes", json!({ "id": "n1", "tags": ["rust", "db"], "owner": "a", "rank": 2 }))
            .await
            .unwrap();
        storage
            .create("notes", json!({ "id": "n2", "tags": ["rust"], "owner": "a", "rank": 1 }))
            .await
            .unwrap();
        storage
            .create("notes", json!({ "id": "n3", "tags": ["ui"], "owner": "b", "rank": 1 }))
            .await
            .unwrap();

        let rust = StorageQuery::new("notes").index("by_tag").range(KeyRange::only("rust"));
        let ids: Vec<Value> = storage.query(&rust).await.unwrap().iter().map(|n| n["id"].clone()).collect();
        assert_eq!(ids, vec![json!("n1"), json!("n2")], "{kind}");

        let owner_a = StorageQuery::new("notes")
            .index("by_owner_rank")
            .range(KeyRange::bound(json!(["a", 0]), json!(["a", 9])));
        let ids: Vec<Value> = storage.query(&owner_a).await.unwrap().iter().map(|n| n["id"].clone()).collect();
        assert_eq!(ids, vec![json!("n2"), json!("n1")], "{kind}");
    }
}

// ── Transactions ─────────────────────────────────────────────────

#[tokio::test]
async fn transaction_results_follow_operation_order() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, true).await;
        let results = storage
            .transaction(vec![
                StorageOperation::create("users", json!({ "id": "u1", "email": "a@x.io" })),
                StorageOperation::update("users", "u1", json!({ "email": "b@x.io" })),
                StorageOperation::read("users", "u1"),
                StorageOperation::Query(StorageQuery::new("users")),
                StorageOperation::delete("users", "u1"),
                StorageOperation::read("users", "u1"),
            ])
            .await
            .unwrap();
        let expected = json!({ "id": "u1", "email": "b@x.io" });
        assert_eq!(
            results,
            vec![
                OperationResult::Created(json!({ "id": "u1", "email": "a@x.io" })),
                OperationResult::Updated(expected.clone()),
                OperationResult::Read(Some(expected.clone())),
                OperationResult::Queried(vec![expected]),
                OperationResult::Deleted,
                OperationResult::Read(None),
            ],
            "{kind}"
        );
    }
}

#[tokio::test]
async fn relational_transaction_rolls_back() {
    let storage = open(BackendKind::Relational, true).await;
    assert_eq!(storage.transaction_support(), TransactionSupport::Atomic);
    storage.create("users", json!({ "id": "keep", "email": "k@x.io" })).await.unwrap();

    let err = storage
        .transaction_atomic(vec![
            StorageOperation::create("users", json!({ "id": "u1", "email": "a@x.io" })),
            StorageOperation::delete("users", "keep"),
            StorageOperation::create("users", json!({ "id": "u1", "email": "b@x.io" })),
        ])
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::AlreadyExists);
    assert_eq!(storage.read("users", "u1").await.unwrap(), None);
    assert!(storage.read("users", "keep").await.unwrap().is_some());
}

#[tokio::test]
async fn best_effort_transaction_keeps_prior_effects() {
    for kind in [BackendKind::ObjectStore, BackendKind::KeyValue] {
        let storage = open(kind, false).await;
        assert_eq!(storage.transaction_support(), TransactionSupport::BestEffort);

        let err = storage
            .transaction(vec![
                StorageOperation::create("users", json!({ "id": "u1", "email": "a@x.io" })),
                StorageOperation::create("users", json!({ "id": "u1", "email": "b@x.io" })),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
        assert!(storage.read("users", "u1").await.unwrap().is_some(), "{kind}");

        let refused = storage.transaction_atomic(vec![]).await.unwrap_err();
        assert_eq!(refused.code(), ErrorCode::InvalidOperation);
    }
}

// ── Clearing and metrics ─────────────────────────────────────────

#[tokio::test]
async fn clear_store_and_clear_all() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, false).await;
        seed_ages(&storage).await;
        storage.create("notes", json!({ "text": "x", "tags": ["a"] })).await.unwrap();

        storage.clear_store("users").await.unwrap();
        assert!(storage.query(&StorageQuery::new("users")).await.unwrap().is_empty());
        assert_eq!(storage.query(&StorageQuery::new("notes")).await.unwrap().len(), 1);

        // Index entries went with the records.
        storage.create("users", json!({ "id": "u1", "email": "u1@x.io" })).await.unwrap();

        storage.clear_all().await.unwrap();
        assert!(storage.query(&StorageQuery::new("users")).await.unwrap().is_empty(), "{kind}");
        assert!(storage.query(&StorageQuery::new("notes")).await.unwrap().is_empty(), "{kind}");
    }
}

#[tokio::test]
async fn metrics_are_estimated_per_store() {
    for kind in ALL_BACKENDS {
        let storage = open(kind, true).await;
        seed_ages(&storage).await;
        let metrics = storage.metrics().await.unwrap();

        let users = &metrics.per_store["users"];
        assert_eq!(users.count, 10, "{kind}");
        assert!(users.avg_item_size > 0);
        assert_eq!(users.size, users.count * users.avg_item_size);
        assert_eq!(metrics.per_store["notes"].count, 0);
        assert_eq!(metrics.total_size, users.size);
    }
}

#[tokio::test]
async fn key_value_quota_is_enforced() {
    let config = StorageConfig {
        kv_quota_bytes: Some(2_048),
        ..StorageConfig::in_memory(BackendKind::KeyValue)
    };
    let storage = Storage::initialize(config, &test_schema(), None).await.unwrap();
    let err = storage
        .create("users", json!({ "id": "big", "email": "b@x.io", "bio": "x".repeat(4_096) }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::QuotaExceeded);
    assert_eq!(storage.read("users", "big").await.unwrap(), None);
}
