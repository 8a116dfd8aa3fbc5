//! Integration tests for webhook delivery of progress reports.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use common::*;
use genq::model::*;
use genq::notify::{Notifier, ProgressEvent, WebhookTarget};
use genq::queue::TaskQueue;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

type Received = (Option<String>, ProgressEvent);

async fn receiver() -> (String, mpsc::UnboundedReceiver<Received>) {
    let (tx, rx) = mpsc::unbounded_channel();

    async fn hook(
        State(tx): State<mpsc::UnboundedSender<Received>>,
        headers: HeaderMap,
        Json(event): Json<ProgressEvent>,
    ) {
        let token = headers
            .get("x-hook-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let _ = tx.send((token, event));
    }

    let app = Router::new()
        .route("/hooks/task-progress", post(hook))
        .with_state(tx);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    (format!("http://{addr}/hooks"), rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Received>) -> Received {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("webhook not delivered in time")
        .expect("receiver closed")
}

#[tokio::test]
async fn each_accepted_report_is_delivered() {
    let (url, mut rx) = receiver().await;
    let h = harness().await;
    let q = &h.queue;
    let headers = BTreeMap::from([("x-hook-token".to_string(), "abc".to_string())]);
    let id = q
        .create_task(&alice(), NewTask::new("sdxl").webhook(format!("{url}/"), Some(headers)))
        .await
        .unwrap();
    pull(q, &alice(), "w1", &["sdxl"]).await.unwrap();

    report(q, &alice(), id, "w1", 25.0).await.unwrap();
    let (token, event) = next(&mut rx).await;
    assert_eq!(token.as_deref(), Some("abc"));
    assert_eq!(event.task_id, id);
    assert_eq!(event.progress, 25.0);
    assert!(event.error.is_empty());

    // Rejected reports notify nobody.
    assert!(report(q, &alice(), id, "w2", 30.0).await.is_err());

    q.report_progress(
        &alice(),
        &ProgressReport::new(id, WorkerId::new("w1"), 25.0, 4.0).failed("nsfw filter"),
    )
    .await
    .unwrap();
    let (_, event) = next(&mut rx).await;
    assert_eq!(event.error, "nsfw filter");
    assert_eq!(event.execution_time, 4.0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unreachable_webhook_does_not_fail_the_report() {
    // Bind then drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let h = harness().await;
    let q = &h.queue;
    let id = q
        .create_task(&alice(), NewTask::new("sdxl").webhook(format!("http://{addr}"), None))
        .await
        .unwrap();
    pull(q, &alice(), "w1", &["sdxl"]).await.unwrap();
    report(q, &alice(), id, "w1", 100.0).await.unwrap();
    assert_eq!(q.get_task(&alice(), id, false).await.unwrap().state(), TaskState::Completed);
}

#[tokio::test]
async fn delivery_failure_is_contained_in_the_spawned_task() {
    let notifier = Notifier::new(Duration::from_millis(200)).unwrap();
    let target = WebhookTarget {
        url: "http://127.0.0.1:9".to_string(),
        headers: BTreeMap::new(),
    };
    let event = ProgressEvent {
        task_id: TaskId(1),
        progress: 10.0,
        execution_time: 0.5,
        error: String::new(),
    };
    notifier.notify(target, event).await.unwrap();
}
