//! Integration tests for the worker loop and executors.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use genq::error::{Error, Result};
use genq::model::*;
use genq::queue::TaskQueue;
use genq::worker::{CommandExecutor, Executor, Outcome, ProgressReporter, Worker, WorkerConfig, WorkerProfile};

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Fail,
    /// Unlocks its own task halfway through, as an operator would.
    LoseLock,
}

struct FakeExecutor {
    queue: Arc<dyn TaskQueue>,
    behavior: Behavior,
    seen: Mutex<Vec<TaskId>>,
}

impl FakeExecutor {
    fn new(queue: Arc<dyn TaskQueue>, behavior: Behavior) -> Self {
        Self {
            queue,
            behavior,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<TaskId> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, task: &Task, progress: &ProgressReporter) -> Result<Vec<UploadFile>> {
        self.seen.lock().unwrap().push(task.task_id);
        progress.report(50.0).await?;
        match self.behavior {
            Behavior::Succeed => Ok(vec![UploadFile::new(
                format!("{}_9_00001_.png", task.task_id),
                vec![7u8; 16],
            )]),
            Behavior::Fail => Err(Error::Other("sampler diverged".into())),
            Behavior::LoseLock => {
                self.queue.release_lock(&admin(), task.task_id).await?;
                progress.report(75.0).await?;
                Ok(Vec::new())
            }
        }
    }
}

fn config(capabilities: &[&str]) -> WorkerConfig {
    WorkerConfig {
        worker_id: WorkerId::new("gpu-1"),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        poll_interval: Duration::from_millis(20),
    }
}

fn worker(queue: Arc<dyn TaskQueue>, executor: Arc<FakeExecutor>, capabilities: &[&str]) -> Worker {
    Worker::new(queue, executor, alice(), config(capabilities))
}

#[tokio::test]
async fn idle_when_nothing_matches() {
    let h = harness().await;
    create(&h.queue, &alice(), "video", 1, 0).await;
    let executor = Arc::new(FakeExecutor::new(h.shared(), Behavior::Succeed));
    let w = worker(h.shared(), executor.clone(), &["sdxl"]);

    assert_eq!(w.run_once().await.unwrap(), Outcome::Idle);
    assert!(executor.seen().is_empty());
}

#[tokio::test]
async fn successful_run_uploads_results_and_completes() {
    let h = harness().await;
    let id = create(&h.queue, &alice(), "sdxl", 1, 0).await;
    let executor = Arc::new(FakeExecutor::new(h.shared(), Behavior::Succeed));
    let w = worker(h.shared(), executor.clone(), &["sdxl"]);

    assert_eq!(w.run_once().await.unwrap(), Outcome::Completed);

    let task = h.queue.get_task(&alice(), id, false).await.unwrap();
    assert_eq!(task.state(), TaskState::Completed);
    assert_eq!(task.lock_owner, "gpu-1");
    assert_eq!(task.outputs[0].batch_size, 1);
    assert_eq!(task.outputs[0].file_size, 16);
    assert!(task.execution_time >= 0.0);
}

#[tokio::test]
async fn failed_execution_is_reported_as_error() {
    let h = harness().await;
    let id = create(&h.queue, &alice(), "sdxl", 1, 0).await;
    let executor = Arc::new(FakeExecutor::new(h.shared(), Behavior::Fail));
    let w = worker(h.shared(), executor, &["sdxl"]);

    assert_eq!(w.run_once().await.unwrap(), Outcome::Failed);

    let task = h.queue.get_task(&alice(), id, false).await.unwrap();
    assert_eq!(task.state(), TaskState::Errored);
    assert!(task.error.contains("sampler diverged"));
    assert_eq!(task.progress, 50.0);
}

#[tokio::test]
async fn lost_lock_abandons_the_task() {
    let h = harness().await;
    let id = create(&h.queue, &alice(), "sdxl", 1, 0).await;
    let executor = Arc::new(FakeExecutor::new(h.shared(), Behavior::LoseLock));
    let w = worker(h.shared(), executor, &["sdxl"]);

    assert_eq!(w.run_once().await.unwrap(), Outcome::Abandoned);

    let task = h.queue.get_task(&alice(), id, false).await.unwrap();
    assert!(!task.is_locked());
    assert_eq!(task.progress, 50.0);
    assert!(task.error.is_empty());
}

#[tokio::test]
async fn worker_prefers_the_flow_it_just_ran() {
    let h = harness().await;
    let q = &h.queue;
    let first = create(q, &alice(), "sdxl", 1, 0).await;
    let other = create(q, &alice(), "upscale", 1, 0).await;
    let same = create(q, &alice(), "sdxl", 1, 0).await;
    let executor = Arc::new(FakeExecutor::new(h.shared(), Behavior::Succeed));
    let w = worker(h.shared(), executor.clone(), &["sdxl", "upscale"]);

    for _ in 0..3 {
        w.run_once().await.unwrap();
    }
    assert_eq!(executor.seen(), vec![first, same, other]);
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let h = harness().await;
    let ids = [
        create(&h.queue, &alice(), "sdxl", 1, 0).await,
        create(&h.queue, &alice(), "sdxl", 1, 0).await,
    ];
    let executor = Arc::new(FakeExecutor::new(h.shared(), Behavior::Succeed));
    let w = Arc::new(worker(h.shared(), executor.clone(), &["sdxl"]));

    let runner = Arc::clone(&w);
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while executor.seen().len() < ids.len() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    w.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    for id in ids {
        let task = h.queue.get_task(&alice(), id, false).await.unwrap();
        assert_eq!(task.state(), TaskState::Completed);
    }
}

#[tokio::test]
async fn profile_parses_and_requires_capabilities() {
    let profile = WorkerProfile::parse(
        r#"
        [worker]
        id = "gpu-7"
        user_id = "render-farm"
        capabilities = ["sdxl", "upscale"]
        command = "./run-flow"
        poll_interval_ms = 500
        "#,
    )
    .unwrap();
    let config = profile.worker_config();
    assert_eq!(config.worker_id, WorkerId::new("gpu-7"));
    assert_eq!(config.poll_interval, Duration::from_millis(500));
    assert_eq!(profile.caller(), Caller::user("render-farm"));

    let err = WorkerProfile::parse(
        r#"
        [worker]
        user_id = "render-farm"
        capabilities = []
        command = "./run-flow"
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    let generated = WorkerProfile::parse(
        r#"
        [worker]
        user_id = "u"
        capabilities = ["sdxl"]
        command = "x"
        "#,
    )
    .unwrap()
    .worker_config();
    assert!(generated.worker_id.as_str().starts_with("worker-"));
}

#[cfg(unix)]
#[tokio::test]
async fn command_executor_runs_scripts() {
    use std::os::unix::fs::PermissionsExt;

    let scripts = tempfile::tempdir().unwrap();
    let write_script = |name: &str, body: &str| {
        let path = scripts.path().join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    };
    let good = write_script(
        "good.sh",
        "#!/bin/sh\n\
         test -f task.json || exit 9\n\
         echo \"PROGRESS 40\"\n\
         echo \"PROGRESS nonsense\"\n\
         printf abcd > \"$GENQ_OUTPUT_DIR/${GENQ_TASK_ID}_9_00001_.png\"\n\
         printf zz > \"$GENQ_OUTPUT_DIR/other.png\"\n",
    );
    let bad = write_script("bad.sh", "#!/bin/sh\necho 'model not found' >&2\nexit 3\n");

    let h = harness().await;
    let work = tempfile::tempdir().unwrap();

    let id = create(&h.queue, &alice(), "sdxl", 1, 0).await;
    let task = pull(&h.queue, &alice(), "w1", &["sdxl"]).await.unwrap();
    let reporter = ProgressReporter::new(h.shared(), alice(), WorkerId::new("w1"), id);
    let files = CommandExecutor::new(&good, work.path())
        .execute(&task, &reporter)
        .await
        .unwrap();
    assert_eq!(files, vec![UploadFile::new(format!("{id}_9_00001_.png"), b"abcd".to_vec())]);
    assert_eq!(reporter.last(), 40.0);
    assert_eq!(h.queue.get_task(&alice(), id, false).await.unwrap().progress, 40.0);
    assert!(!work.path().join(id.to_string()).exists());

    let id = create(&h.queue, &alice(), "sdxl", 1, 0).await;
    let task = pull(&h.queue, &alice(), "w1", &["sdxl"]).await.unwrap();
    let reporter = ProgressReporter::new(h.shared(), alice(), WorkerId::new("w1"), id);
    let err = CommandExecutor::new(&bad, work.path())
        .execute(&task, &reporter)
        .await
        .unwrap_err();
    match err {
        Error::Other(message) => assert!(message.contains("model not found"), "{message}"),
        other => panic!("expected Other, got {other:?}"),
    }
}
