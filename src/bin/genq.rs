//! genq CLI: run the queue server, run a worker, manage tasks and flows.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use genq::config::{Config, Mode};
use genq::flows::{FlowDefinition, FlowDirectory};
use genq::model::{Caller, NewTask, Task, TaskFilter, TaskId, TaskUpdate, UploadFile};
use genq::queue::{self, TaskQueue};
use genq::server;
use genq::telemetry::{TelemetryConfig, init_telemetry};
use genq::worker::{Worker, WorkerProfile};

#[derive(Parser)]
#[command(name = "genq", about = "Distributed queue for generation tasks")]
struct Cli {
    /// User id to act as
    #[arg(long, global = true, default_value = "admin")]
    user: String,
    /// Act with admin visibility
    #[arg(long, global = true)]
    admin: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the queue over HTTP
    Serve {
        /// Address to bind (overrides GENQ_BIND)
        #[arg(long)]
        bind: Option<std::net::SocketAddr>,
    },
    /// Run a worker loop
    Worker {
        /// Worker profile TOML
        #[arg(long)]
        profile: PathBuf,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Flow catalog operations (local store only)
    Flow {
        #[command(subcommand)]
        action: FlowAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Create a task from an installed flow
    Create {
        /// Flow name
        name: String,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
        #[arg(long, default_value_t = 1)]
        group_scope: i32,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Input files, in slot order
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Progress webhook base URL
        #[arg(long)]
        webhook: Option<String>,
        /// Parent task whose output feeds this one
        #[arg(long, requires = "parent_node")]
        parent: Option<i64>,
        /// Output node of the parent task
        #[arg(long)]
        parent_node: Option<i64>,
        /// Number of tasks to create, each with the next seed
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// List tasks
    List {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 1)]
        group_scope: i32,
        /// Only finished tasks
        #[arg(long)]
        completed: bool,
        /// Only top-level tasks
        #[arg(long)]
        parents: bool,
        /// Include child tasks
        #[arg(long)]
        children: bool,
    },
    /// Show a task
    Show {
        id: i64,
        #[arg(long)]
        children: bool,
    },
    /// Download a result file
    Result {
        id: i64,
        node_id: i64,
        #[arg(long, default_value_t = 0)]
        batch_index: usize,
        /// Directory to write into
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Download an input file
    Input {
        id: i64,
        #[arg(default_value_t = 0)]
        index: usize,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Restart a failed task
    Restart {
        id: i64,
        /// Restart even without an error
        #[arg(long)]
        force: bool,
    },
    /// Release a task's lock
    Unlock { id: i64 },
    /// Change a task that has not started yet
    Update {
        id: i64,
        #[arg(long)]
        priority: Option<i32>,
    },
    /// Delete tasks and their children
    Delete {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Delete finished tasks of a flow
    Clear {
        name: String,
        #[arg(long, default_value_t = 1)]
        group_scope: i32,
    },
    /// Remove unfinished tasks from the queue
    Dequeue {
        /// Flow whose unfinished top-level tasks are removed
        #[arg(required_unless_present = "id", conflicts_with = "id")]
        name: Option<String>,
        /// A single task to remove instead
        #[arg(long)]
        id: Option<i64>,
        #[arg(long, default_value_t = 1)]
        group_scope: i32,
    },
}

#[derive(Subcommand)]
enum FlowAction {
    /// List installed flows
    List,
    /// Install a flow definition file
    Install { file: PathBuf },
    /// Remove an installed flow
    Remove { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let caller = Caller {
        user_id: cli.user.clone(),
        is_admin: cli.admin,
    };

    match cli.command {
        Command::Serve { bind } => cmd_serve(bind).await,
        Command::Worker { profile } => cmd_worker(profile).await,
        Command::Task { action } => {
            let config = Config::from_env()?;
            let queue = queue::open(&config).await?;
            cmd_task(queue.as_ref(), &caller, action).await
        }
        Command::Flow { action } => {
            let config = Config::from_env()?;
            cmd_flow(FlowDirectory::new(&config.flows_dir), action).await
        }
    }
}

async fn cmd_serve(bind: Option<std::net::SocketAddr>) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    if config.mode == Mode::Worker {
        anyhow::bail!("GENQ_MODE=worker holds no store and cannot serve");
    }

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "genq"))?;

    let queue: Arc<dyn TaskQueue> = Arc::new(queue::open_local(&config).await?);
    let router = server::router(queue, config.auth_token.clone());
    let listener = tokio::net::TcpListener::bind(bind.unwrap_or(config.bind)).await?;

    server::serve(listener, router, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await?;
    Ok(())
}

async fn cmd_worker(profile: PathBuf) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let profile = WorkerProfile::load(&profile)?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "genq-worker"))?;

    let queue = queue::open(&config).await?;
    let worker = Arc::new(Worker::new(
        queue,
        Arc::new(profile.executor()),
        profile.caller(),
        profile.worker_config(),
    ));

    let w = Arc::clone(&worker);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_task(queue: &dyn TaskQueue, caller: &Caller, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::Create {
            name,
            params,
            group_scope,
            priority,
            files,
            webhook,
            parent,
            parent_node,
            count,
        } => {
            let params: serde_json::Value = match params {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::json!({}),
            };
            let mut new = NewTask::new(name)
                .params(params)
                .group_scope(group_scope)
                .priority(priority)
                .count(count);
            if let Some(url) = webhook {
                new = new.webhook(url, None);
            }
            if let (Some(parent), Some(node)) = (parent, parent_node) {
                new = new.parent(TaskId(parent), node);
            }
            for path in files {
                let data = tokio::fs::read(&path).await?;
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow::anyhow!("not a file: {}", path.display()))?;
                new = new.input_file(UploadFile::new(file_name, data));
            }
            for task_id in queue.create_tasks(caller, new).await? {
                println!("Created: {task_id}");
            }
        }
        TaskAction::List {
            name,
            group_scope,
            completed,
            parents,
            children,
        } => {
            let mut filter = TaskFilter::default().group_scope(group_scope);
            if let Some(name) = name {
                filter = filter.name(name);
            }
            if completed {
                filter = filter.only_completed();
            }
            if parents {
                filter = filter.only_parent();
            }
            if children {
                filter = filter.with_children();
            }
            print_task_table(&queue.list_tasks(caller, &filter).await?.into_values().collect::<Vec<_>>());
        }
        TaskAction::Show { id, children } => {
            let task = queue.get_task(caller, TaskId(id), children).await?;
            print_task(&task)?;
        }
        TaskAction::Result {
            id,
            node_id,
            batch_index,
            out,
        } => {
            let file = queue.get_result(caller, TaskId(id), node_id, batch_index).await?;
            save_download(&out, file).await?;
        }
        TaskAction::Input { id, index, out } => {
            let file = queue.get_input(caller, TaskId(id), index).await?;
            save_download(&out, file).await?;
        }
        TaskAction::Restart { id, force } => {
            queue.restart_task(caller, TaskId(id), force).await?;
            println!("Restarted: {id}");
        }
        TaskAction::Unlock { id } => {
            queue.release_lock(caller, TaskId(id)).await?;
            println!("Unlocked: {id}");
        }
        TaskAction::Update { id, priority } => {
            let update = TaskUpdate { priority };
            queue.update_task(caller, TaskId(id), &update).await?;
            println!("Updated: {id}");
        }
        TaskAction::Delete { ids } => {
            let ids: Vec<TaskId> = ids.into_iter().map(TaskId).collect();
            let deleted = queue.delete_tasks(caller, &ids).await?;
            println!("Deleted {} task(s)", deleted.len());
        }
        TaskAction::Clear { name, group_scope } => {
            let deleted = queue.clear_finished(caller, &name, group_scope).await?;
            println!("Cleared {} task(s)", deleted.len());
        }
        TaskAction::Dequeue {
            name,
            id,
            group_scope,
        } => match (id, name) {
            (Some(id), _) => {
                queue.dequeue_task(caller, TaskId(id)).await?;
                println!("Dequeued: {id}");
            }
            (None, Some(name)) => {
                let removed = queue.dequeue_unfinished(caller, &name, group_scope).await?;
                println!("Dequeued {} task(s)", removed.len());
            }
            (None, None) => anyhow::bail!("give a flow name or --id"),
        },
    }
    Ok(())
}

async fn save_download(dir: &std::path::Path, file: UploadFile) -> anyhow::Result<()> {
    let name = std::path::Path::new(&file.file_name)
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("invalid file name: {}", file.file_name))?;
    let path = dir.join(name);
    tokio::fs::write(&path, &file.data).await?;
    println!("Saved {} ({} bytes)", path.display(), file.data.len());
    Ok(())
}

async fn cmd_flow(flows: FlowDirectory, action: FlowAction) -> anyhow::Result<()> {
    match action {
        FlowAction::List => {
            let installed = flows.installed().await?;
            if installed.is_empty() {
                println!("No flows installed.");
                return Ok(());
            }
            println!("{:<30}  {:<10}  DESCRIPTION", "NAME", "VERSION");
            for flow in installed.values() {
                println!("{:<30}  {:<10}  {}", flow.name, flow.version, flow.description);
            }
        }
        FlowAction::Install { file } => {
            let content = tokio::fs::read(&file).await?;
            let flow: FlowDefinition = serde_json::from_slice(&content)?;
            flows.install(&flow).await?;
            println!("Installed: {}", flow.name);
        }
        FlowAction::Remove { name } => {
            flows.uninstall(&name).await?;
            println!("Removed: {name}");
        }
    }
    Ok(())
}

fn print_task_table(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }

    println!(
        "{:<8}  {:<24}  {:<12}  {:>5}  {:>4}  {:>7}  CREATED",
        "ID", "NAME", "STATE", "SCOPE", "PRI", "PROG"
    );
    println!("{}", "-".repeat(90));

    let mut pending: Vec<(usize, &Task)> = tasks.iter().rev().map(|t| (0, t)).collect();
    while let Some((depth, task)) = pending.pop() {
        let name = format!("{}{}", "  ".repeat(depth), task.name);
        println!(
            "{:<8}  {:<24}  {:<12}  {:>5}  {:>4}  {:>6.1}%  {}",
            task.task_id,
            name,
            task.state(),
            task.group_scope,
            task.priority,
            task.progress,
            task.created_at.format("%Y-%m-%d %H:%M")
        );
        pending.extend(task.child_tasks.iter().rev().map(|c| (depth + 1, c)));
    }

    println!("\n{} task(s)", tasks.len());
}

fn print_task(task: &Task) -> anyhow::Result<()> {
    println!("ID:          {}", task.task_id);
    println!("Name:        {}", task.name);
    println!("User:        {}", task.user_id);
    println!("State:       {}", task.state());
    println!("Scope:       {}", task.group_scope);
    println!("Priority:    {}", task.priority);
    println!("Progress:    {:.1}%", task.progress);
    println!("Exec Time:   {:.2}s", task.execution_time);
    println!(
        "Lock Owner:  {}",
        if task.lock_owner.is_empty() { "-" } else { &task.lock_owner }
    );
    if task.has_error() {
        println!("Error:       {}", task.error);
    }
    if let Some(parent) = task.parent_task_id {
        println!(
            "Parent:      {parent} (node {})",
            task.parent_task_node_id.unwrap_or_default()
        );
    }
    println!("Params:      {}", serde_json::to_string_pretty(&task.input_params)?);
    for output in &task.outputs {
        println!(
            "Output:      node {} ({}) files={} bytes={}",
            output.node_id, output.output_type, output.batch_size, output.file_size
        );
    }
    println!("Created:     {}", task.created_at);
    println!("Updated:     {}", task.updated_at);
    if let Some(finished) = task.finished_at {
        println!("Finished:    {finished}");
    }
    if !task.child_tasks.is_empty() {
        println!("---");
        print_task_table(&task.child_tasks);
    }
    Ok(())
}
