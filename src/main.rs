use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tickwarden::config::{LogFormat, LoggingConfig, TickwardenConfig};
use tickwarden::executor::{self, Attempt, ExecutorSettings};
use tickwarden::storage::{self, NewTask};
use tickwarden::task::TaskCommand;

#[derive(Parser)]
#[command(
    name = "tickwarden",
    about = "Crash-safe polling task scheduler backed by SQLite",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults: $TICKWARDEN_CONFIG, /etc/tickwarden/tickwarden.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path, overriding the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (crash recovery + polling loop)
    Serve,

    /// Manage scheduled tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Show recent executions of a task
    History {
        /// Task name
        #[arg(long)]
        name: String,

        /// Number of executions to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Mark executions left running by a crash as failed (refused while the daemon runs)
    Recover,

    /// Execute a task once, right now
    Run {
        /// Task name
        #[arg(long)]
        name: String,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum TaskAction {
    /// List all tasks
    List,

    /// Add a new task
    Add {
        /// Task name
        #[arg(long)]
        name: String,

        /// Seconds between runs
        #[arg(long)]
        interval: u64,

        /// Per-task timeout in seconds (defaults to scheduler.task_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,

        /// Program and arguments, after `--`
        #[arg(last = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// Retire a task; its execution history is kept
    Remove {
        /// Task name
        #[arg(long)]
        name: String,
    },

    /// Enable a task
    Enable {
        /// Task name
        #[arg(long)]
        name: String,
    },

    /// Disable a task without removing it
    Disable {
        /// Task name
        #[arg(long)]
        name: String,
    },
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match cfg.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = TickwardenConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting tickwarden daemon");
            tickwarden::serve(&config).await?;
        }
        Commands::Task { action } => {
            let pool = storage::open_pool(&config.database.path)?;

            match action {
                TaskAction::List => {
                    let list = storage::list_tasks(&pool)?;
                    if list.is_empty() {
                        println!("No tasks found.");
                    } else {
                        println!(
                            "{:<20} | {:<10} | {:<8} | {:<27} | Command",
                            "Name", "Interval", "Enabled", "Last run"
                        );
                        println!("{:-<20}-|-{:-<10}-|-{:-<8}-|-{:-<27}-|-{:-<20}", "", "", "", "", "");
                        for task in list {
                            let last_run = task
                                .last_run
                                .map(storage::format_ts)
                                .unwrap_or_else(|| "never".to_string());
                            println!(
                                "{:<20} | {:<10} | {:<8} | {:<27} | {}",
                                task.name,
                                format!("{}s", task.interval_secs),
                                task.enabled,
                                last_run,
                                task.command
                            );
                        }
                    }
                }
                TaskAction::Add {
                    name,
                    interval,
                    timeout,
                    command,
                } => {
                    let command = TaskCommand::from_argv(command)?;
                    storage::insert_task(
                        &pool,
                        &NewTask {
                            name: name.clone(),
                            command,
                            interval_secs: interval,
                            timeout_secs: timeout,
                        },
                    )?;
                    println!("Task '{}' added.", name);
                }
                TaskAction::Remove { name } => {
                    storage::remove_task(&pool, &name)?;
                    println!("Task '{}' removed.", name);
                }
                TaskAction::Enable { name } => {
                    storage::set_task_enabled(&pool, &name, true)?;
                    println!("Task '{}' enabled.", name);
                }
                TaskAction::Disable { name } => {
                    storage::set_task_enabled(&pool, &name, false)?;
                    println!("Task '{}' disabled.", name);
                }
            }
        }
        Commands::History { name, limit } => {
            let pool = storage::open_pool(&config.database.path)?;
            let task = storage::get_task_by_name(&pool, &name)?
                .with_context(|| format!("Task '{}' not found", name))?;
            let history = storage::list_executions(&pool, task.id, limit)?;
            if history.is_empty() {
                println!("No executions recorded for '{}'.", name);
            } else {
                println!("{:<8} | {:<8} | {:<27} | {:<10} | Error", "Id", "Status", "Started", "Duration");
                println!("{:-<8}-|-{:-<8}-|-{:-<27}-|-{:-<10}-|-{:-<20}", "", "", "", "", "");
                for exec in history {
                    let duration = exec
                        .end_time
                        .map(|end| format!("{:.1}s", (end - exec.start_time).num_milliseconds() as f64 / 1000.0))
                        .unwrap_or_else(|| "-".to_string());
                    let error = exec
                        .error_message
                        .as_deref()
                        .and_then(|e| e.lines().next())
                        .unwrap_or("");
                    println!(
                        "{:<8} | {:<8} | {:<27} | {:<10} | {}",
                        exec.id,
                        exec.status,
                        storage::format_ts(exec.start_time),
                        duration,
                        error
                    );
                }
            }
        }
        Commands::Recover => {
            let _lock = storage::DatabaseLock::acquire(&config.database.path)
                .context("refusing to recover while the database is in use")?;
            let pool = storage::open_pool(&config.database.path)?;
            let repaired =
                tickwarden::scheduler::recover(&pool, config.scheduler.recovery_batch_size);
            println!("Recovered {} interrupted execution(s).", repaired);
        }
        Commands::Run { name } => {
            let pool = storage::open_pool(&config.database.path)?;
            let task = storage::get_task_by_name(&pool, &name)?
                .with_context(|| format!("Task '{}' not found", name))?;
            let settings = ExecutorSettings::from(&config.scheduler);

            match executor::execute(&pool, &task, &settings).await {
                Attempt::Finished {
                    execution_id,
                    status,
                } => {
                    println!("Execution {} finished: {}", execution_id, status);
                    if let Some(exec) = storage::get_execution(&pool, execution_id)? {
                        if let Some(output) = exec.output {
                            print!("{}", output);
                        }
                        if let Some(error) = exec.error_message {
                            eprintln!("{}", error);
                        }
                    }
                }
                Attempt::Skipped => println!("Task '{}' is already running.", name),
                Attempt::Abandoned => anyhow::bail!("Could not claim an execution slot for '{}'", name),
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
