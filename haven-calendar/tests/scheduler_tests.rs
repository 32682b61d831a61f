mod common;

use chrono::Utc;
use common::*;
use haven_calendar::{ClientError, SyncConfig, SyncRequest, SyncScheduler, SyncStatus};
use haven_storage::BackendKind;
use std::future::Future;
use std::time::Duration;

fn fast_config() -> SyncConfig {
    SyncConfig {
        sync_interval_secs: 1,
        ..SyncConfig::default()
    }
}

/// Polls `check` until it holds, failing the test after five seconds.
async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn start_runs_a_cycle_immediately() {
    let (manager, client) = manager_with(BackendKind::Relational, fast_config(), &["primary"]).await;
    client
        .push_page(page(vec![remote_event("r1", "Standup", Utc::now())], "t1"))
        .await;
    let scheduler = SyncScheduler::new(manager.clone());

    scheduler.start(SyncRequest::new("u1").calendars(["primary"]));
    assert!(scheduler.is_running("u1"));

    eventually("first sync", || async {
        manager.sync_info("u1").await.unwrap().status == SyncStatus::Synced
    })
    .await;
    assert!(scheduler.stop("u1").await.unwrap());
}

#[tokio::test]
async fn cycles_repeat_on_the_interval() {
    let (manager, client) = manager_with(BackendKind::Relational, fast_config(), &["primary"]).await;
    let scheduler = SyncScheduler::new(manager);

    scheduler.start(SyncRequest::new("u1").calendars(["primary"]));
    eventually("two cycles", || async { client.fetch_count().await >= 2 }).await;
    scheduler.stop_all().await.unwrap();
    assert!(!scheduler.is_running("u1"));
}

#[tokio::test]
async fn stop_resets_status_and_halts_cycles() {
    let (manager, client) = manager_with(BackendKind::Relational, fast_config(), &["primary"]).await;
    let scheduler = SyncScheduler::new(manager.clone());
    scheduler.start(SyncRequest::new("u1").calendars(["primary"]));
    eventually("first sync", || async {
        manager.sync_info("u1").await.unwrap().status == SyncStatus::Synced
    })
    .await;

    assert!(scheduler.stop("u1").await.unwrap());
    assert!(!scheduler.is_running("u1"));
    assert_eq!(manager.sync_info("u1").await.unwrap().status, SyncStatus::NotConnected);

    let fetched = client.fetch_count().await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(client.fetch_count().await, fetched);

    // Already stopped.
    assert!(!scheduler.stop("u1").await.unwrap());
}

#[tokio::test]
async fn restarting_replaces_the_previous_loop() {
    let (manager, client) = manager_with(BackendKind::Relational, fast_config(), &["primary"]).await;
    let scheduler = SyncScheduler::new(manager);

    scheduler.start(SyncRequest::new("u1").calendars(["primary"]));
    scheduler.start(SyncRequest::new("u1").calendars(["primary"]));
    assert!(scheduler.is_running("u1"));

    eventually("a cycle", || async { client.fetch_count().await >= 1 }).await;
    assert!(scheduler.stop("u1").await.unwrap());
    assert!(!scheduler.stop("u1").await.unwrap());
}

#[tokio::test]
async fn failing_cycles_are_recorded_not_raised() {
    let (manager, client) = manager_with(BackendKind::Relational, fast_config(), &["primary"]).await;
    client.push_error(ClientError::Unauthorized).await;
    let scheduler = SyncScheduler::new(manager.clone());

    scheduler.start(SyncRequest::new("u1").calendars(["primary"]));
    eventually("error status", || async {
        manager.sync_info("u1").await.unwrap().status == SyncStatus::Error
    })
    .await;
    let info = manager.sync_info("u1").await.unwrap();
    assert!(info.error.unwrap().contains("credentials"));

    // The loop survives the failure and the next cycle succeeds.
    eventually("recovery", || async {
        manager.sync_info("u1").await.unwrap().status == SyncStatus::Synced
    })
    .await;
    scheduler.stop("u1").await.unwrap();
}

#[tokio::test]
async fn users_are_scheduled_independently() {
    let (manager, _client) = manager_with(BackendKind::Relational, fast_config(), &["primary"]).await;
    let scheduler = SyncScheduler::new(manager);

    scheduler.start(SyncRequest::new("u1").calendars(["primary"]));
    scheduler.start(SyncRequest::new("u2").calendars(["primary"]));
    assert!(scheduler.stop("u1").await.unwrap());
    assert!(!scheduler.is_running("u1"));
    assert!(scheduler.is_running("u2"));
    scheduler.stop_all().await.unwrap();
    assert!(!scheduler.is_running("u2"));
}
