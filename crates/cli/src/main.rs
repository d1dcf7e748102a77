use std::{path::PathBuf, str::FromStr, sync::Arc};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use db::{
    models::{
        session::{SessionContext, UserRole},
        task::{CreateTask, Task, TaskFilter, TaskPatch, TaskPriority, TaskStage},
    },
    sqlite::SqliteBackend,
};
use services::services::{
    config::BoardConfig,
    notification::TracingAlertSink,
    prioritization::ClaudePrioritizer,
    stage_lanes::StageBuckets,
    task_board::TaskBoard,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "taskboard")]
#[command(about = "Stage lanes for construction site tasks", long_about = None)]
struct Cli {
    /// Sqlite database holding the task rows.
    #[arg(long, env = "TASKBOARD_DATABASE_URL", default_value = "sqlite://taskboard.db")]
    database: String,

    #[arg(long, env = "TASKBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Acting user.
    #[arg(long, env = "TASKBOARD_USER", default_value_t = Uuid::nil())]
    user: Uuid,

    #[arg(long, env = "TASKBOARD_ROLE", default_value = "admin", value_parser = parse_role)]
    role: UserRole,

    #[arg(long, env = "TASKBOARD_TRADE")]
    trade: Option<String>,

    /// Only tasks of this project.
    #[arg(long, global = true)]
    project: Option<Uuid>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Show tasks grouped by stage
    Lanes {
        /// Include completed tasks.
        #[arg(long)]
        all: bool,
    },
    /// Create a task
    #[command(alias = "new")]
    Add {
        title: String,
        #[arg(long, value_parser = parse_stage)]
        stage: Option<TaskStage>,
        #[arg(long, value_parser = parse_priority)]
        priority: Option<TaskPriority>,
        /// Due date, YYYY-MM-DD.
        #[arg(long)]
        due: Option<NaiveDate>,
        #[arg(long)]
        assign: Option<Uuid>,
        #[arg(long)]
        trade: Option<String>,
    },
    /// Rename a task
    Title { id: String, title: String },
    /// Move a task to another stage
    Move {
        id: String,
        #[arg(value_parser = parse_stage)]
        stage: TaskStage,
    },
    /// Delete a task
    #[command(alias = "delete")]
    Rm { id: String },
    /// Print open tasks in suggested working order
    Prioritize,
    /// Print the lanes every time the board changes, until interrupted
    Watch {
        #[arg(long)]
        all: bool,
    },
}

fn parse_stage(raw: &str) -> Result<TaskStage, String> {
    TaskStage::parse_lenient(raw).ok_or_else(|| {
        format!("unknown stage '{raw}' (expected not-started, in-progress, completed or blocked)")
    })
}

fn parse_priority(raw: &str) -> Result<TaskPriority, String> {
    TaskPriority::from_str(raw.trim()).map_err(|_| format!("unknown priority '{raw}'"))
}

fn parse_role(raw: &str) -> Result<UserRole, String> {
    UserRole::from_str(&raw.trim().to_ascii_lowercase().replace('-', "_"))
        .map_err(|_| format!("unknown role '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing("warn");
    let cli = Cli::parse();

    let config = BoardConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    let backend = SqliteBackend::connect(&cli.database)
        .await
        .with_context(|| format!("Failed to open {}", cli.database))?;

    let mut session = SessionContext::new(cli.user, cli.role);
    session.trade_specialty = cli.trade.clone();
    let mut board = TaskBoard::new(
        Arc::new(backend),
        session,
        &config,
        Arc::new(TracingAlertSink),
    );
    if matches!(cli.command, Commands::Prioritize) {
        match ClaudePrioritizer::from_config(&config.prioritization) {
            Ok(prioritizer) => board = board.with_prioritizer(Arc::new(prioritizer)),
            Err(e) => debug!(error = %e, "Using fallback prioritisation"),
        }
    }

    let include_completed = match &cli.command {
        Commands::Lanes { all } | Commands::Watch { all } => *all,
        Commands::Prioritize => false,
        _ => true,
    };
    board
        .set_filter(TaskFilter {
            project_id: cli.project,
            include_completed,
            ..Default::default()
        })
        .await?;

    match cli.command {
        Commands::Lanes { .. } => print_lanes(&board.tasks_by_stage()),
        Commands::Add {
            title,
            stage,
            priority,
            due,
            assign,
            trade,
        } => {
            let mut data = CreateTask::from_title(title);
            data.stage = stage;
            data.priority = priority;
            data.due_date = due;
            data.assigned_to = assign;
            data.project_id = cli.project;
            data.metadata.trade_required = trade;
            let task = board.create_task(data).await?;
            println!("{}", task.id);
        }
        Commands::Title { id, title } => {
            let id = resolve(&board, &id)?;
            let task = board
                .update_task(id, TaskPatch::title(title))?
                .settled()
                .await?;
            print_task(&task);
        }
        Commands::Move { id, stage } => {
            let id = resolve(&board, &id)?;
            let task = board.update_task_stage(id, stage)?.settled().await?;
            print_task(&task);
        }
        Commands::Rm { id } => {
            let id = resolve(&board, &id)?;
            board.delete_task(id).await?;
            println!("deleted {id}");
        }
        Commands::Prioritize => {
            for (rank, task) in board.prioritized_tasks().await.iter().enumerate() {
                print!("{:>3}. ", rank + 1);
                print_task(task);
            }
        }
        Commands::Watch { .. } => {
            let mut revisions = board.watch();
            print_lanes(&board.tasks_by_stage());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        println!();
                        print_lanes(&board.tasks_by_stage());
                    }
                }
            }
        }
    }

    board.teardown();
    Ok(())
}

/// Accept a full id or an unambiguous prefix of one.
fn resolve(board: &TaskBoard, raw: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(raw) {
        return Ok(id);
    }
    let prefix = raw.trim().to_ascii_lowercase();
    let matches: Vec<Uuid> = board
        .tasks()
        .iter()
        .map(|t| t.id)
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();
    match matches.as_slice() {
        [id] => Ok(*id),
        [] => bail!("no task matches '{raw}'"),
        _ => bail!("'{raw}' matches {} tasks", matches.len()),
    }
}

fn print_lanes(buckets: &StageBuckets<Task>) {
    for (stage, lane) in buckets.iter() {
        println!("{} ({})", stage.to_string().to_uppercase(), lane.len());
        for task in lane {
            print!("  ");
            print_task(task);
        }
    }
}

fn print_task(task: &Task) {
    let id = task.id.to_string();
    let due = task
        .due_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "-".repeat(10));
    let priority = task
        .priority
        .map(|p| format!("[{p}]"))
        .unwrap_or_default();
    println!(
        "{}  {}  {:<12} {:<10} {}",
        &id[..8],
        due,
        task.stage.to_string(),
        priority,
        task.title
    );
}
