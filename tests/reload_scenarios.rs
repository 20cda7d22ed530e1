//! End-to-end reload scenarios against a live fleet.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use dbhttpd::handlers::{HandlerId, HandlerRow};
use dbhttpd::host::{ConstantExecutor, ExecutionError, HostError, Interrupt, QueryExecutor, RequestBinding};
use dbhttpd::response::ResponseParts;
use dbhttpd::supervisor::ReloadOutcome;

mod common;
use common::{client, free_port, local, quick_config, start_fleet, start_fleet_with};

/// Holds `/slow` requests in the query for a while, announcing when they start.
struct SlowExecutor {
    started: Arc<Notify>,
}

impl QueryExecutor for SlowExecutor {
    fn execute(
        &self,
        query: &str,
        request: &RequestBinding,
        interrupt: &Interrupt,
    ) -> Result<ResponseParts, ExecutionError> {
        if request.path == "/slow" {
            self.started.notify_one();
            std::thread::sleep(Duration::from_millis(500));
        }
        ConstantExecutor.execute(query, request, interrupt)
    }
}

fn listen(port: u16) -> String {
    local(port).to_string()
}

#[tokio::test]
async fn text_handler_is_served_after_one_cycle() {
    let port = free_port();
    let mut fleet = start_fleet(quick_config(2)).await;

    fleet
        .host
        .insert(HandlerRow::new(
            1,
            listen(port),
            &["GET"],
            "/hi",
            "SELECT 200, NULL::http_header[], 'hello'",
        ))
        .unwrap();
    fleet.wait_for_version(1).await;

    let response = client()
        .get(format!("http://{}/hi", local(port)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; charset=utf-8"
    );
    assert_eq!(response.text().await.unwrap(), "hello");

    fleet.stop().await;
}

#[tokio::test]
async fn json_body_gets_text_json() {
    let port = free_port();
    let mut fleet = start_fleet(quick_config(1)).await;

    fleet
        .host
        .insert(HandlerRow::new(
            1,
            listen(port),
            &["GET"],
            "/j",
            r#"SELECT 200, NULL, '{"a":1}'::json"#,
        ))
        .unwrap();
    fleet.wait_for_version(1).await;

    let response = client()
        .get(format!("http://{}/j", local(port)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/json");
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"a": 1}));

    fleet.stop().await;
}

#[tokio::test]
async fn caller_content_type_is_kept() {
    let port = free_port();
    let mut fleet = start_fleet(quick_config(1)).await;

    fleet
        .host
        .insert(HandlerRow::new(
            1,
            listen(port),
            &["GET"],
            "/x",
            "SELECT 200, ARRAY[('Content-Type', 'application/xml', false)]::http_header[], '<x/>'",
        ))
        .unwrap();
    fleet.wait_for_version(1).await;

    let response = client()
        .get(format!("http://{}/x", local(port)))
        .send()
        .await
        .unwrap();
    let content_types: Vec<_> = response.headers().get_all("content-type").iter().collect();
    assert_eq!(content_types, vec!["application/xml"]);
    assert_eq!(response.text().await.unwrap(), "<x/>");

    fleet.stop().await;
}

#[tokio::test]
async fn multi_statement_handler_is_rejected() {
    let port = free_port();
    let fleet = start_fleet(quick_config(1)).await;

    let error = fleet
        .host
        .insert(HandlerRow::new(1, listen(port), &["GET"], "/", "SELECT 1; SELECT 2;"))
        .unwrap_err();
    match error {
        HostError::Validation { id, source } => {
            assert_eq!(id, HandlerId(1));
            assert_eq!(source.kind(), "not-a-single-statement");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(fleet.host.rows().is_empty());
    assert_eq!(fleet.status.borrow().snapshot_version, 0);

    fleet.stop().await;
}

#[tokio::test]
async fn moving_a_listen_address_never_refuses_retained_ones() {
    let old_port = free_port();
    let new_port = free_port();
    let kept_port = free_port();
    let mut fleet = start_fleet(quick_config(4)).await;

    fleet
        .host
        .replace_all(vec![
            HandlerRow::new(1, listen(old_port), &[], "/*", "SELECT 200, NULL, 'moving'"),
            HandlerRow::new(2, listen(kept_port), &[], "/*", "SELECT 200, NULL, 'kept'"),
        ])
        .unwrap();
    fleet.wait_for_version(1).await;

    // Hammer the retained address with fresh connections through the reload.
    let stop = Arc::new(AtomicBool::new(false));
    let refused = Arc::new(AtomicU64::new(0));
    let served = Arc::new(AtomicU64::new(0));
    let hammer = {
        let (stop, refused, served) = (stop.clone(), refused.clone(), served.clone());
        tokio::spawn(async move {
            let client = client();
            while !stop.load(Ordering::Relaxed) {
                match client.get(format!("http://{}/", local(kept_port))).send().await {
                    Ok(response) if response.status() == 200 => {
                        served.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        refused.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    fleet
        .host
        .update(HandlerRow::new(1, listen(new_port), &[], "/*", "SELECT 200, NULL, 'moved'"))
        .unwrap();
    let status = fleet.wait_for_version(2).await;
    assert_eq!(status.workers, 4);
    assert_eq!(status.listeners, 2);
    tokio::time::sleep(Duration::from_millis(50)).await;

    stop.store(true, Ordering::Relaxed);
    hammer.await.unwrap();
    assert_eq!(refused.load(Ordering::Relaxed), 0);
    assert!(served.load(Ordering::Relaxed) > 0);

    let body = client()
        .get(format!("http://{}/", local(new_port)))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "moved");

    let refused = tokio::net::TcpStream::connect(local(old_port)).await;
    assert_eq!(
        refused.unwrap_err().kind(),
        std::io::ErrorKind::ConnectionRefused
    );

    fleet.stop().await;
}

#[tokio::test]
async fn in_flight_request_finishes_on_a_retired_address() {
    let old_port = free_port();
    let new_port = free_port();
    let started = Arc::new(Notify::new());
    let executor = Arc::new(SlowExecutor {
        started: started.clone(),
    });
    let mut fleet = start_fleet_with(quick_config(2), executor).await;

    fleet
        .host
        .insert(HandlerRow::new(1, listen(old_port), &[], "/*", "SELECT 200, NULL, 'old'"))
        .unwrap();
    let before = fleet.wait_for_version(1).await.snapshot_version;

    let in_flight = tokio::spawn(async move {
        let response = client()
            .get(format!("http://{}/slow", local(old_port)))
            .send()
            .await
            .unwrap();
        (response.status().as_u16(), response.text().await.unwrap())
    });

    started.notified().await;
    fleet
        .host
        .update(HandlerRow::new(1, listen(new_port), &[], "/*", "SELECT 200, NULL, 'new'"))
        .unwrap();

    assert_eq!(in_flight.await.unwrap(), (200, "old".to_string()));
    let after = fleet.wait_for_version(before + 1).await.snapshot_version;
    assert!(after > before);

    let body = client()
        .get(format!("http://{}/", local(new_port)))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "new");

    fleet.stop().await;
}

#[tokio::test]
async fn unmatched_paths_get_404() {
    let port = free_port();
    let mut fleet = start_fleet(quick_config(2)).await;

    fleet
        .host
        .insert(HandlerRow::new(1, listen(port), &["GET"], "/only", "SELECT 200, NULL, 'x'"))
        .unwrap();
    fleet.wait_for_version(1).await;

    let response = client()
        .get(format!("http://{}/anything", local(port)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    fleet.stop().await;
}

#[tokio::test]
async fn deleting_every_handler_closes_every_listener() {
    let port = free_port();
    let mut fleet = start_fleet(quick_config(2)).await;

    fleet
        .host
        .insert(HandlerRow::new(1, listen(port), &["GET"], "/hi", "SELECT 200, NULL, 'hi'"))
        .unwrap();
    fleet.wait_for_version(1).await;

    fleet.host.delete(HandlerId(1)).unwrap();
    let status = fleet.wait_for_version(2).await;
    assert_eq!(status.listeners, 0);
    assert_eq!(status.last_outcome, Some(ReloadOutcome::Applied));
    assert!(tokio::net::TcpStream::connect(local(port)).await.is_err());

    fleet.stop().await;
}
