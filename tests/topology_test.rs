//! The same operations against a local queue and against a remote queue
//! talking to an in-process server must give the same answers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use genq::error::{Error, Result};
use genq::model::*;
use genq::queue::{RemoteQueue, TaskQueue};
use genq::server;
use secrecy::SecretString;
use serde_json::json;
use tokio::net::TcpListener;

const TOKEN: &str = "s3cret-token";

async fn spawn_server(queue: Arc<dyn TaskQueue>, token: Option<&str>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server::router(queue, token.map(|t| SecretString::from(t.to_string())));
    tokio::spawn(server::serve(listener, router, std::future::pending::<()>()));
    format!("http://{addr}")
}

fn remote(base_url: &str, token: Option<&str>) -> RemoteQueue {
    RemoteQueue::new(
        base_url,
        token.map(|t| SecretString::from(t.to_string())),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn outcome<T>(result: &Result<T>) -> String {
    match result {
        Ok(_) => "ok".to_string(),
        Err(e) => e.code().to_string(),
    }
}

/// Drive one queue through a fixed script and record what happened.
async fn script(q: &dyn TaskQueue) -> Vec<String> {
    let me = alice();
    let mut log = Vec::new();

    let a = create(q, &me, "sdxl", 1, 0).await;
    let b = q
        .create_task(
            &me,
            NewTask::new("sdxl")
                .priority(5)
                .input_file(UploadFile::new("mask.png", b"mask".to_vec())),
        )
        .await
        .unwrap();
    log.push(format!("created {a} {b}"));

    let pulled = pull(q, &me, "w1", &["sdxl"]).await.unwrap();
    log.push(format!("pulled {} by {}", pulled.task_id, pulled.lock_owner));
    log.push(format!("inputs {:?}", pulled.input_files));

    log.push(outcome(&report(q, &me, b, "w2", 50.0).await));
    log.push(outcome(&report(q, &me, b, "w1", 50.0).await));
    log.push(outcome(&report(q, &me, b, "w1", 30.0).await));
    log.push(outcome(&report(q, &me, b, "w1", 101.0).await));

    let wrong = vec![UploadFile::new(format!("{b}_8_00001_.png"), vec![1])];
    log.push(outcome(&q.submit_results(&me, b, wrong).await));
    let right = vec![
        UploadFile::new(format!("{b}_9_00001_.png"), vec![1, 2, 3]),
        UploadFile::new(format!("{b}_9_00002_.png"), vec![4]),
    ];
    let task = q.submit_results(&me, b, right).await.unwrap();
    log.push(format!("outputs {:?}", task.outputs));

    log.push(outcome(&report(q, &me, b, "w1", 100.0).await));
    log.push(outcome(&report(q, &me, b, "w1", 100.0).await));
    log.push(outcome(&q.restart_task(&me, b, true).await));
    log.push(outcome(&q.update_task(&me, a, &TaskUpdate::priority(16)).await));
    log.push(outcome(&q.update_task(&me, a, &TaskUpdate::priority(2)).await));
    log.push(outcome(&q.get_task(&me, TaskId(999), false).await));
    log.push(outcome(&q.get_task(&Caller::user("bob"), a, false).await));
    log.push(outcome(&q.list_tasks(&me, &TaskFilter::default().group_scope(0)).await));

    let listed = q.list_tasks(&me, &TaskFilter::default()).await.unwrap();
    log.push(format!("listed {:?}", listed.keys().collect::<Vec<_>>()));
    let done = q
        .list_tasks(&me, &TaskFilter::default().only_completed())
        .await
        .unwrap();
    log.push(format!("done {:?}", done.keys().collect::<Vec<_>>()));

    log.push(outcome(&q.release_lock(&me, a).await));
    log.push(outcome(&q.release_lock(&me, a).await));
    log.push(format!("empty pull {:?}", pull(q, &me, "w3", &["upscale"]).await.map(|t| t.task_id)));

    let first = q.get_result(&me, b, 9, 0).await.unwrap();
    log.push(format!("result {} {:?}", first.file_name, first.data));
    log.push(outcome(&q.get_result(&me, b, 9, 2).await));
    log.push(outcome(&q.get_result(&Caller::user("bob"), b, 9, 0).await));
    let input = q.get_input(&me, b, 0).await.unwrap();
    log.push(format!("input {} {:?}", input.file_name, input.data));
    log.push(outcome(&q.get_input(&me, a, 0).await));

    let child = q
        .create_task(&me, NewTask::new("upscale").parent(b, 9))
        .await
        .unwrap();
    let slot0 = q.get_input(&me, child, 0).await.unwrap();
    log.push(format!("child input {} {:?}", slot0.file_name, slot0.data));
    log.push(outcome(&q.create_task(&me, NewTask::new("upscale").parent(a, 9)).await));

    let batch = q
        .create_tasks(&me, NewTask::new("upscale").params(json!({"seed": "7"})).count(2))
        .await
        .unwrap();
    let mut seeds = Vec::new();
    for id in &batch {
        seeds.push(q.get_task(&me, *id, false).await.unwrap().input_params["seed"].clone());
    }
    log.push(format!("batch {batch:?} seeds {seeds:?}"));

    log.push(format!("cleared {:?}", q.clear_finished(&me, "sdxl", 1).await.unwrap()));
    log.push(format!("deleted {:?}", q.delete_tasks(&me, &[a]).await.unwrap()));
    log.push(outcome(&q.dequeue_task(&me, a).await));
    log
}

#[tokio::test]
async fn local_and_remote_behave_identically() {
    let local = harness().await;
    let local_log = script(&local.queue).await;

    let served = harness().await;
    let url = spawn_server(served.shared(), Some(TOKEN)).await;
    let remote_log = script(&remote(&url, Some(TOKEN))).await;

    assert_eq!(local_log, remote_log);
    assert!(local_log.contains(&"conflict".to_string()));
    assert!(local_log.contains(&"not_found".to_string()));
    assert!(local_log.contains(&"validation".to_string()));
}

#[tokio::test]
async fn remote_errors_keep_their_variant() {
    let h = harness().await;
    let url = spawn_server(h.shared(), None).await;
    let q = remote(&url, None);

    let err = q.get_task(&alice(), TaskId(42), false).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
    assert!(!err.is_retryable());

    let err = q
        .create_task(&alice(), NewTask::new("sdxl").group_scope(256))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got {err:?}");
}

#[tokio::test]
async fn token_is_enforced() {
    let h = harness().await;
    let url = spawn_server(h.shared(), Some(TOKEN)).await;

    let err = remote(&url, None)
        .list_tasks(&alice(), &TaskFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)), "got {err:?}");

    let err = remote(&url, Some("wrong"))
        .list_tasks(&alice(), &TaskFilter::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)), "got {err:?}");

    remote(&url, Some(TOKEN)).health().await.unwrap();
}

#[tokio::test]
async fn admin_flag_crosses_the_wire() {
    let h = harness().await;
    let id = create(&h.queue, &alice(), "sdxl", 1, 0).await;
    let url = spawn_server(h.shared(), None).await;
    let q = remote(&url, None);

    let err = q.get_task(&Caller::user("bob"), id, false).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    let task = q.get_task(&Caller::admin("bob"), id, false).await.unwrap();
    assert_eq!(task.user_id, "alice");

    let claimed = pull(&q, &Caller::admin("bob"), "remote-1", &["sdxl"]).await.unwrap();
    assert_eq!(claimed.task_id, id);
    assert_eq!(claimed.lock_owner, "remote-1");
}
