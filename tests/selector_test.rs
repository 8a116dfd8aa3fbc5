//! Integration tests for admission: which task a worker gets, and that it
//! gets it alone.

mod common;

use std::collections::HashSet;

use common::*;
use genq::model::*;
use genq::queue::TaskQueue;

#[tokio::test]
async fn group_scope_outranks_priority() {
    let h = harness().await;
    let q = &h.queue;
    let low_scope = create(q, &alice(), "sdxl", 1, 15).await;
    let high_scope = create(q, &alice(), "sdxl", 2, 0).await;

    let first = pull(q, &alice(), "w1", &["sdxl"]).await.unwrap();
    assert_eq!(first.task_id, high_scope);
    let second = pull(q, &alice(), "w1", &["sdxl"]).await.unwrap();
    assert_eq!(second.task_id, low_scope);
}

#[tokio::test]
async fn higher_priority_wins_regardless_of_age() {
    let h = harness().await;
    let q = &h.queue;
    let _a = create(q, &alice(), "sdxl", 1, 0).await;
    let b = create(q, &alice(), "sdxl", 1, 5).await;

    let task = pull(q, &alice(), "w1", &["sdxl"]).await.unwrap();
    assert_eq!(task.task_id, b);
    assert_eq!(task.lock_owner, "w1");
    assert_eq!(task.state(), TaskState::Locked);
}

#[tokio::test]
async fn equal_priority_is_fifo() {
    let h = harness().await;
    let q = &h.queue;
    let ids = [
        create(q, &alice(), "sdxl", 1, 3).await,
        create(q, &alice(), "sdxl", 1, 3).await,
        create(q, &alice(), "sdxl", 1, 3).await,
    ];

    for expected in ids {
        let task = pull(q, &alice(), "w1", &["sdxl"]).await.unwrap();
        assert_eq!(task.task_id, expected);
    }
    assert!(pull(q, &alice(), "w1", &["sdxl"]).await.is_none());
}

#[tokio::test]
async fn affinity_comes_before_priority() {
    let h = harness().await;
    let q = &h.queue;
    let older_other = create(q, &alice(), "upscale", 1, 3).await;
    let same = create(q, &alice(), "sdxl", 1, 0).await;
    let urgent_other = create(q, &alice(), "upscale", 2, 9).await;

    let request = PullRequest::new(
        WorkerId::new("w1"),
        vec!["sdxl".to_string(), "upscale".to_string()],
    )
    .affinity("sdxl");

    let first = q.pull_next(&alice(), &request).await.unwrap().unwrap();
    assert_eq!(first.task_id, same);
    let second = q.pull_next(&alice(), &request).await.unwrap().unwrap();
    assert_eq!(second.task_id, urgent_other);
    let third = q.pull_next(&alice(), &request).await.unwrap().unwrap();
    assert_eq!(third.task_id, older_other);
}

#[tokio::test]
async fn affinity_outside_capabilities_is_ignored() {
    let h = harness().await;
    let q = &h.queue;
    let _low = create(q, &alice(), "upscale", 1, 1).await;
    let high = create(q, &alice(), "upscale", 1, 8).await;
    let _foreign = create(q, &alice(), "video", 1, 15).await;

    let request = PullRequest::new(WorkerId::new("w1"), vec!["upscale".to_string()]).affinity("video");
    let task = q.pull_next(&alice(), &request).await.unwrap().unwrap();
    assert_eq!(task.task_id, high);
}

#[tokio::test]
async fn only_capable_names_are_offered() {
    let h = harness().await;
    let q = &h.queue;
    create(q, &alice(), "video", 1, 15).await;

    assert!(pull(q, &alice(), "w1", &["sdxl"]).await.is_none());
    assert!(pull(q, &alice(), "w1", &[]).await.is_none());
    assert!(pull(q, &alice(), "w1", &["video"]).await.is_some());
}

#[tokio::test]
async fn locked_errored_and_finished_tasks_are_skipped() {
    let h = harness().await;
    let q = &h.queue;
    let locked = create(q, &alice(), "sdxl", 1, 15).await;
    let errored = create(q, &alice(), "sdxl", 1, 14).await;
    let finished = create(q, &alice(), "sdxl", 1, 13).await;
    let open = create(q, &alice(), "sdxl", 1, 0).await;

    assert_eq!(pull(q, &alice(), "w1", &["sdxl"]).await.unwrap().task_id, locked);
    assert_eq!(pull(q, &alice(), "w2", &["sdxl"]).await.unwrap().task_id, errored);
    q.report_progress(
        &alice(),
        &ProgressReport::new(errored, WorkerId::new("w2"), 10.0, 1.0).failed("boom"),
    )
    .await
    .unwrap();
    q.release_lock(&alice(), errored).await.unwrap();

    assert_eq!(pull(q, &alice(), "w3", &["sdxl"]).await.unwrap().task_id, finished);
    report(q, &alice(), finished, "w3", 100.0).await.unwrap();
    q.release_lock(&alice(), finished).await.unwrap();

    assert_eq!(pull(q, &alice(), "w4", &["sdxl"]).await.unwrap().task_id, open);
    assert!(pull(q, &alice(), "w5", &["sdxl"]).await.is_none());
}

#[tokio::test]
async fn non_admin_pulls_only_own_tasks() {
    let h = harness().await;
    let q = &h.queue;
    let bobs = create(q, &Caller::user("bob"), "sdxl", 1, 15).await;
    let alices = create(q, &alice(), "sdxl", 1, 0).await;

    assert_eq!(pull(q, &alice(), "w1", &["sdxl"]).await.unwrap().task_id, alices);
    assert_eq!(pull(q, &admin(), "w2", &["sdxl"]).await.unwrap().task_id, bobs);
}

#[tokio::test]
async fn concurrent_pulls_never_share_a_task() {
    let h = file_harness().await;
    let shared = h.shared();
    for _ in 0..8 {
        create(shared.as_ref(), &alice(), "sdxl", 1, 5).await;
    }

    let mut handles = Vec::new();
    for w in 0..16 {
        let queue = shared.clone();
        handles.push(tokio::spawn(async move {
            pull(queue.as_ref(), &alice(), &format!("w{w}"), &["sdxl"]).await
        }));
    }

    let mut claimed = HashSet::new();
    let mut empty = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Some(task) => assert!(claimed.insert(task.task_id), "task {} claimed twice", task.task_id),
            None => empty += 1,
        }
    }
    assert_eq!(claimed.len(), 8);
    assert_eq!(empty, 8);
}

#[tokio::test]
async fn one_task_two_workers_exactly_one_winner() {
    let h = file_harness().await;
    let shared = h.shared();
    let id = create(shared.as_ref(), &alice(), "sdxl", 1, 0).await;

    let (alice_a, alice_b) = (alice(), alice());
    let (a, b) = tokio::join!(
        pull(shared.as_ref(), &alice_a, "w1", &["sdxl"]),
        pull(shared.as_ref(), &alice_b, "w2", &["sdxl"]),
    );
    let winners: Vec<Task> = [a, b].into_iter().flatten().collect();
    assert_eq!(winners.len(), 1);

    let stored = shared.get_task(&alice(), id, false).await.unwrap();
    assert_eq!(stored.lock_owner, winners[0].lock_owner);
}
