use haven_crypto::{generate_random_key, KdfParams};
use haven_storage::{
    stores, BackendKind, ErrorCode, KeyRange, SealedBackup, Storage, StorageConfig, StorageQuery,
    StorageSchema, StoreIndex, StoreSchema,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

const ALL_BACKENDS: [BackendKind; 3] = [
    BackendKind::ObjectStore,
    BackendKind::Relational,
    BackendKind::KeyValue,
];

fn v1() -> StorageSchema {
    StorageSchema::new("app", 1).with_store(StoreSchema::new("contacts", "id"))
}

fn v2() -> StorageSchema {
    StorageSchema::new("app", 2)
        .with_store(
            StoreSchema::new("contacts", "id").with_index(StoreIndex::new("by_city", "address.city")),
        )
        .with_store(StoreSchema::new("groups", "id"))
}

fn db_file(dir: &tempfile::TempDir, kind: BackendKind) -> std::path::PathBuf {
    dir.path().join(format!("{kind}.db"))
}

// ── Backup / restore ─────────────────────────────────────────────

#[tokio::test]
async fn backup_restore_round_trip() {
    for kind in ALL_BACKENDS {
        let storage = Storage::initialize(
            StorageConfig::in_memory(kind),
            &stores::application_schema(),
            Some(generate_random_key()),
        )
        .await
        .unwrap();
        storage
            .create(stores::USERS, json!({ "id": "u1", "email": "ada@x.io", "name": "Ada" }))
            .await
            .unwrap();
        storage
            .create(stores::AGENTS, json!({ "id": "a1", "userId": "u1", "name": "Planner" }))
            .await
            .unwrap();

        let backup = storage.backup("u1").await.unwrap();
        assert_eq!(backup.user_id, "u1");
        assert_eq!(backup.schema_version, stores::SCHEMA_VERSION);
        // Backups are plaintext regardless of at-rest encryption.
        assert_eq!(backup.data[stores::USERS][0]["name"], json!("Ada"));
        assert_eq!(backup.record_count(), 2);

        storage.clear_all().await.unwrap();
        storage
            .create(stores::USERS, json!({ "id": "u9", "email": "stray@x.io" }))
            .await
            .unwrap();
        storage.restore(&backup).await.unwrap();

        // Restore replaces each store wholesale.
        assert_eq!(storage.read(stores::USERS, "u9").await.unwrap(), None, "{kind}");
        assert_eq!(
            storage.read(stores::USERS, "u1").await.unwrap(),
            Some(json!({ "id": "u1", "email": "ada@x.io", "name": "Ada" }))
        );
        assert!(storage.read(stores::AGENTS, "a1").await.unwrap().is_some());
    }
}

#[tokio::test]
async fn restore_with_unknown_store_touches_nothing() {
    for kind in ALL_BACKENDS {
        let storage = Storage::initialize(StorageConfig::in_memory(kind), &v1(), None)
            .await
            .unwrap();
        storage.create("contacts", json!({ "id": "c1" })).await.unwrap();

        let mut backup = storage.backup("u1").await.unwrap();
        backup.data.insert("contacts".into(), vec![]);
        backup.data.insert("strangers".into(), vec![json!({ "id": "s1" })]);

        let err = storage.restore(&backup).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaError, "{kind}");
        assert!(storage.read("contacts", "c1").await.unwrap().is_some(), "{kind}");
    }
}

#[tokio::test]
async fn backup_file_and_sealed_export() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backup.json");
    let storage = Storage::initialize(StorageConfig::in_memory(BackendKind::Relational), &v1(), None)
        .await
        .unwrap();
    storage.create("contacts", json!({ "id": "c1", "name": "Grace" })).await.unwrap();

    let written = storage.backup_to_file("u1", &path).await.unwrap();
    let on_disk: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk["userId"], json!("u1"));
    assert_eq!(on_disk["data"]["contacts"][0]["name"], json!("Grace"));

    storage.clear_all().await.unwrap();
    let restored = storage.restore_from_file(&path).await.unwrap();
    assert_eq!(restored, written);
    assert!(storage.read("contacts", "c1").await.unwrap().is_some());

    let sealed = SealedBackup::seal(&written, "hunter2", &KdfParams::low_cost()).unwrap();
    assert!(!serde_json::to_string(&sealed).unwrap().contains("Grace"));
    assert_eq!(sealed.open("hunter2").unwrap(), written);
}

// ── Schema migration ─────────────────────────────────────────────

#[tokio::test]
async fn reinitializing_same_version_is_noop() {
    for kind in ALL_BACKENDS {
        let storage = Storage::initialize(StorageConfig::in_memory(kind), &v1(), None)
            .await
            .unwrap();
        storage.create("contacts", json!({ "id": "c1" })).await.unwrap();
        storage.migrate(&v1()).await.unwrap();
        assert!(storage.read("contacts", "c1").await.unwrap().is_some(), "{kind}");
    }
}

#[tokio::test]
async fn upgrade_adds_stores_and_backfills_indexes() {
    for kind in ALL_BACKENDS {
        let storage = Storage::initialize(
            StorageConfig::in_memory(kind),
            &v1(),
            Some(generate_random_key()),
        )
        .await
        .unwrap();
        storage
            .create("contacts", json!({ "id": "c1", "address": { "city": "Oslo" } }))
            .await
            .unwrap();
        storage
            .create("contacts", json!({ "id": "c2", "address": { "city": "Lima" } }))
            .await
            .unwrap();

        storage.migrate(&v2()).await.unwrap();
        assert_eq!(storage.schema().unwrap().version, 2);

        let oslo = StorageQuery::new("contacts").index("by_city").range(KeyRange::only("Oslo"));
        let found = storage.query(&oslo).await.unwrap();
        assert_eq!(found.len(), 1, "{kind}");
        assert_eq!(found[0]["id"], json!("c1"));

        storage.create("groups", json!({ "id": "g1" })).await.unwrap();
    }
}

#[tokio::test]
async fn downgrade_is_a_schema_error() {
    for kind in ALL_BACKENDS {
        let storage = Storage::initialize(StorageConfig::in_memory(kind), &v2(), None)
            .await
            .unwrap();
        let err = storage.migrate(&v1()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaError, "{kind}");
    }
}

#[tokio::test]
async fn schema_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    for kind in ALL_BACKENDS {
        let path = db_file(&dir, kind);
        {
            let storage = Storage::initialize(StorageConfig::at_path(kind, &path), &v2(), None)
                .await
                .unwrap();
            storage
                .create("contacts", json!({ "id": "c1", "address": { "city": "Oslo" } }))
                .await
                .unwrap();
        }
        let storage = Storage::initialize(StorageConfig::at_path(kind, &path), &v2(), None)
            .await
            .unwrap();
        let oslo = StorageQuery::new("contacts").index("by_city").range(KeyRange::only("Oslo"));
        assert_eq!(storage.query(&oslo).await.unwrap().len(), 1, "{kind}");

        let err = storage.migrate(&v1()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SchemaError);
    }
}

// ── Encryption at rest ───────────────────────────────────────────

#[tokio::test]
async fn object_store_payloads_are_sealed_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sealed.duckdb");
    {
        let storage = Storage::initialize(
            StorageConfig::at_path(BackendKind::ObjectStore, &path),
            &v2(),
            Some(generate_random_key()),
        )
        .await
        .unwrap();
        storage
            .create("contacts", json!({ "id": "c1", "secret": "launch codes", "address": { "city": "Oslo" } }))
            .await
            .unwrap();
    }

    let conn = duckdb::Connection::open(&path).unwrap();
    let payload: String = conn
        .query_row("SELECT payload FROM object_records WHERE store = 'contacts'", [], |row| row.get(0))
        .unwrap();
    assert!(!payload.contains("launch codes"));
    let stored: Value = serde_json::from_str(&payload).unwrap();
    assert!(haven_crypto::is_envelope(&stored["sealed"]));
}

#[tokio::test]
async fn undecryptable_records_are_skipped_in_scans() {
    let dir = tempfile::tempdir().unwrap();
    for kind in ALL_BACKENDS {
        let path = db_file(&dir, kind);
        {
            let storage = Storage::initialize(
                StorageConfig::at_path(kind, &path),
                &v1(),
                Some(generate_random_key()),
            )
            .await
            .unwrap();
            storage.create("contacts", json!({ "id": "sealed" })).await.unwrap();
        }

        // Reopen under a different key and add a plaintext-readable record.
        let storage = Storage::initialize(
            StorageConfig::at_path(kind, &path),
            &v1(),
            Some(generate_random_key()),
        )
        .await
        .unwrap();
        storage.create("contacts", json!({ "id": "fresh" })).await.unwrap();

        let all = storage.query(&StorageQuery::new("contacts")).await.unwrap();
        assert_eq!(all, vec![json!({ "id": "fresh" })], "{kind}");

        let err = storage.read("contacts", "sealed").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOperation, "{kind}");
    }
}
