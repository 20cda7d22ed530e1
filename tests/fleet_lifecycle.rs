//! Fleet sizing, respawn and idempotence against a live supervisor.

use std::sync::Arc;

use dbhttpd::coordination::ReloadEdge;
use dbhttpd::handlers::HandlerRow;
use dbhttpd::host::{ConstantExecutor, ExecutionError, Interrupt, QueryExecutor, RequestBinding};
use dbhttpd::response::ResponseParts;
use dbhttpd::supervisor::ReloadOutcome;

mod common;
use common::{client, free_port, local, quick_config, start_fleet, start_fleet_with};

/// Panics on `/crash`, otherwise evaluates like the reference executor.
struct CrashOnPath;

impl QueryExecutor for CrashOnPath {
    fn execute(
        &self,
        query: &str,
        request: &RequestBinding,
        interrupt: &Interrupt,
    ) -> Result<ResponseParts, ExecutionError> {
        if request.path == "/crash" {
            panic!("handler crashed");
        }
        ConstantExecutor.execute(query, request, interrupt)
    }
}

fn catch_all(id: i64, port: u16, body: &str) -> HandlerRow {
    HandlerRow::new(
        id,
        local(port).to_string(),
        &[],
        "/*",
        format!("SELECT 200, NULL, '{body}'"),
    )
}

async fn get(port: u16, path: &str) -> (u16, String) {
    let response = client()
        .get(format!("http://{}{path}", local(port)))
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

#[tokio::test]
async fn single_worker_serves_and_reloads() {
    let port = free_port();
    let mut fleet = start_fleet(quick_config(1)).await;
    assert_eq!(fleet.status.borrow().workers, 1);

    fleet.host.insert(catch_all(1, port, "one")).unwrap();
    fleet.wait_for_version(1).await;
    assert_eq!(get(port, "/").await, (200, "one".to_string()));

    fleet.host.update(catch_all(1, port, "two")).unwrap();
    let status = fleet.wait_for_version(2).await;
    assert_eq!(status.workers, 1);
    assert_eq!(get(port, "/").await, (200, "two".to_string()));

    fleet.stop().await;
}

#[tokio::test]
async fn zero_handlers_publish_an_empty_fleet() {
    let fleet = start_fleet(quick_config(3)).await;
    let status = fleet.status.borrow().clone();
    assert_eq!(status.snapshot_version, 0);
    assert_eq!(status.workers, 3);
    assert_eq!(status.listeners, 0);
    fleet.stop().await;
}

#[tokio::test]
async fn crashed_worker_is_respawned() {
    let port = free_port();
    let mut fleet = start_fleet_with(quick_config(1), Arc::new(CrashOnPath)).await;

    fleet.host.insert(catch_all(1, port, "alive")).unwrap();
    fleet.wait_for_version(1).await;

    // The failed request still gets its response before the worker goes.
    let crashed = client()
        .get(format!("http://{}/crash", local(port)))
        .send()
        .await;
    if let Ok(response) = crashed {
        assert_eq!(response.status(), 500);
    }

    let status = fleet
        .wait_for("respawn", |s| s.worker_exits >= 1 && s.workers == 1)
        .await;
    assert_eq!(status.listeners, 1);
    assert_eq!(get(port, "/ok").await, (200, "alive".to_string()));

    fleet.stop().await;
}

#[tokio::test]
async fn crash_in_one_worker_leaves_the_others_serving() {
    let port = free_port();
    let mut fleet = start_fleet_with(quick_config(3), Arc::new(CrashOnPath)).await;

    fleet.host.insert(catch_all(1, port, "steady")).unwrap();
    fleet.wait_for_version(1).await;

    let _ = client()
        .get(format!("http://{}/crash", local(port)))
        .send()
        .await;
    for _ in 0..10 {
        assert_eq!(get(port, "/").await, (200, "steady".to_string()));
    }

    let status = fleet
        .wait_for("respawn", |s| s.worker_exits >= 1 && s.workers == 3)
        .await;
    assert_eq!(status.snapshot_version, 1);
    fleet.stop().await;
}

#[tokio::test]
async fn republishing_the_same_table_changes_nothing() {
    let port = free_port();
    let mut fleet = start_fleet(quick_config(2)).await;

    let rows = vec![catch_all(1, port, "same")];
    fleet.host.replace_all(rows.clone()).unwrap();
    let applied = fleet.wait_for_version(1).await;

    fleet.host.replace_all(rows).unwrap();
    let status = fleet.wait_for_cycles(applied.reload_cycles + 1).await;
    assert_eq!(status.snapshot_version, 1);
    assert_eq!(status.last_outcome, Some(ReloadOutcome::Unchanged));
    assert_eq!(status.worker_exits, 0);

    fleet.reload_tx.send(ReloadEdge::Signal).unwrap();
    let status = fleet.wait_for_cycles(applied.reload_cycles + 2).await;
    assert_eq!(status.snapshot_version, 1);
    assert_eq!(status.last_outcome, Some(ReloadOutcome::Unchanged));

    assert_eq!(get(port, "/").await, (200, "same".to_string()));
    fleet.stop().await;
}

#[tokio::test]
async fn config_update_resizes_the_fleet() {
    let port = free_port();
    let mut fleet = start_fleet(quick_config(2)).await;
    fleet.host.insert(catch_all(1, port, "sized")).unwrap();
    fleet.wait_for_version(1).await;

    fleet.config_tx.send(quick_config(4)).unwrap();
    fleet.wait_for("four workers", |s| s.workers == 4).await;
    assert_eq!(get(port, "/").await, (200, "sized".to_string()));

    fleet.config_tx.send(quick_config(1)).unwrap();
    fleet.wait_for("one worker", |s| s.workers == 1).await;
    fleet
        .wait_for("trimmed workers to exit", |s| s.worker_exits >= 3)
        .await;
    assert_eq!(get(port, "/").await, (200, "sized".to_string()));

    fleet.stop().await;
}
