//! Quartermaster CLI - coordination core for agent workers.

use std::env;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use quartermaster::cli::{
    AgentCommands, CheckpointCommands, Cli, Commands, ConfigCommands, KnowledgeCommands,
    MonitorCommands, SuperviseCommands, TaskCommands,
};
use quartermaster::commands::{self, Context, Output};
use quartermaster::knowledge::QueryKind;
use quartermaster::scheduler::NewTask;
use quartermaster::storage::find_git_root;
use quartermaster::supervisor::SystemProcesses;
use quartermaster::{Error, poll};

/// Environment variable holding the tracing filter.
const LOG_ENV: &str = "QM_LOG";

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;
    init_tracing();

    let result = resolve_project_root(cli.project)
        .and_then(|root| Context::open(&root))
        .and_then(|ctx| run_command(cli.command, &ctx, human));

    if let Err(e) = result {
        tracing::debug!(error = ?e, "command failed");
        if human {
            eprintln!("Error [{}]: {}", e.kind(), e);
        } else {
            eprintln!(
                "{}",
                serde_json::json!({ "error": e.to_string(), "kind": e.kind() })
            );
        }
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Priority: --project flag > QM_PROJECT env var > git root of cwd > cwd.
///
/// An explicit path is used literally so a subdirectory of a repository can
/// be coordinated on its own.
fn resolve_project_root(explicit: Option<PathBuf>) -> Result<PathBuf, Error> {
    match explicit {
        Some(path) => {
            if !path.is_dir() {
                return Err(Error::InvalidInput(format!(
                    "Specified project path does not exist: {}",
                    path.display()
                )));
            }
            Ok(path)
        }
        None => {
            let cwd = env::current_dir()?;
            Ok(find_git_root(&cwd).unwrap_or(cwd))
        }
    }
}

fn output<T: Output>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}

fn run_command(command: Commands, ctx: &Context, human: bool) -> Result<(), Error> {
    match command {
        Commands::Agent { command } => run_agent(command, ctx, human)?,
        Commands::Task { command } => run_task(command, ctx, human)?,
        Commands::Supervise { command } => match command {
            SuperviseCommands::Run { dry_run: true } => {
                output(&commands::supervise_once(ctx, None)?, human);
            }
            SuperviseCommands::Run { dry_run: false } => {
                let mut procs = SystemProcesses::new();
                output(&commands::supervise_once(ctx, Some(&mut procs))?, human);
            }
            SuperviseCommands::Watch => {
                let mut procs = SystemProcesses::new();
                watch(ctx.settings().supervise_interval, || {
                    commands::supervise_once(ctx, Some(&mut procs)).map(|r| output(&r, human))
                })?;
            }
        },
        Commands::Checkpoint { command } => run_checkpoint(command, ctx, human)?,
        Commands::Knowledge { command } => run_knowledge(command, ctx, human)?,
        Commands::Monitor { command } => run_monitor(command, ctx, human)?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => output(&commands::config_show(ctx)?, human),
        },
    }
    Ok(())
}

/// Run `pass` every `interval` until Ctrl-C.
///
/// A failing pass is logged and retried on the next tick.
fn watch(
    interval: std::time::Duration,
    mut pass: impl FnMut() -> Result<(), Error>,
) -> Result<(), Error> {
    let shutdown = poll::shutdown_flag()?;
    let passes = poll::every(interval, &shutdown, || {
        if let Err(e) = pass() {
            tracing::warn!(kind = e.kind(), error = %e, "pass failed");
        }
    });
    tracing::info!(passes, "watch loop stopped");
    Ok(())
}

fn run_agent(command: AgentCommands, ctx: &Context, human: bool) -> Result<(), Error> {
    match command {
        AgentCommands::Register {
            name,
            capabilities,
            weight,
            command,
        } => output(
            &commands::agent_register(ctx, &name, capabilities, weight, command)?,
            human,
        ),
        AgentCommands::Heartbeat { name, pid, status } => {
            output(&commands::agent_heartbeat(ctx, &name, pid, status)?, human)
        }
        AgentCommands::Status { name } => output(&commands::agent_status(ctx, &name)?, human),
        AgentCommands::List { status } => output(&commands::agent_list(ctx, status)?, human),
        AgentCommands::Rm { name } => output(&commands::agent_remove(ctx, &name)?, human),
        AgentCommands::Start { name } => {
            let mut procs = SystemProcesses::new();
            output(&commands::agent_start(ctx, &mut procs, &name)?, human)
        }
        AgentCommands::Stop { name } => {
            let mut procs = SystemProcesses::new();
            output(&commands::agent_stop(ctx, &mut procs, &name)?, human)
        }
        AgentCommands::Restart { name } => {
            let mut procs = SystemProcesses::new();
            output(&commands::agent_restart(ctx, &mut procs, &name)?, human)
        }
        AgentCommands::Inbox { name, peek } => {
            output(&commands::agent_inbox(ctx, &name, peek)?, human)
        }
    }
    Ok(())
}

fn run_task(command: TaskCommands, ctx: &Context, human: bool) -> Result<(), Error> {
    match command {
        TaskCommands::Submit {
            task_type,
            description,
            priority,
            depends_on,
        } => {
            let new = NewTask {
                task_type,
                description,
                priority,
                dependencies: depends_on,
            };
            output(&commands::task_submit(ctx, new)?, human)
        }
        TaskCommands::List { status, agent } => output(
            &commands::task_list(ctx, status, agent.as_deref())?,
            human,
        ),
        TaskCommands::Show { id } => output(&commands::task_show(ctx, &id)?, human),
        TaskCommands::Start { id, agent } => {
            output(&commands::task_start(ctx, &id, &agent)?, human)
        }
        TaskCommands::Complete { id, agent } => {
            output(&commands::task_complete(ctx, &id, &agent)?, human)
        }
        TaskCommands::Fail { id, agent, reason } => {
            output(&commands::task_fail(ctx, &id, &agent, reason)?, human)
        }
        TaskCommands::Distribute => output(&commands::task_distribute(ctx)?, human),
        TaskCommands::Balance => output(&commands::task_balance(ctx)?, human),
        TaskCommands::Normalize => output(&commands::task_normalize(ctx)?, human),
    }
    Ok(())
}

fn run_checkpoint(command: CheckpointCommands, ctx: &Context, human: bool) -> Result<(), Error> {
    match command {
        CheckpointCommands::Create {
            operation_id,
            paths,
        } => output(
            &commands::checkpoint_create(ctx, &operation_id, &paths)?,
            human,
        ),
        CheckpointCommands::Restore {
            id,
            force,
            reverse_diff,
        } => output(
            &commands::checkpoint_restore(ctx, &id, force, reverse_diff)?,
            human,
        ),
        CheckpointCommands::Monitor {
            id,
            result,
            no_rollback,
        } => {
            let validation = commands::read_validation_result(Path::new(&result))?;
            let outcome = commands::checkpoint_monitor(ctx, &id, &validation, !no_rollback)?;
            output(&outcome, human);
            if let Some(e) = outcome.manual_intervention_error() {
                return Err(e);
            }
        }
        CheckpointCommands::Alternative {
            operation,
            error_pattern,
            tried,
        } => output(
            &commands::checkpoint_alternative(ctx, &operation, &error_pattern, &tried)?,
            human,
        ),
        CheckpointCommands::List => output(&commands::checkpoint_list(ctx)?, human),
        CheckpointCommands::Clean { keep } => {
            output(&commands::checkpoint_clean(ctx, keep)?, human)
        }
    }
    Ok(())
}

fn run_knowledge(command: KnowledgeCommands, ctx: &Context, human: bool) -> Result<(), Error> {
    match command {
        KnowledgeCommands::Sync => output(&commands::knowledge_sync(ctx)?, human),
        KnowledgeCommands::Watch => watch(ctx.settings().sync_interval, || {
            commands::knowledge_sync(ctx).map(|r| output(&r, human))
        })?,
        KnowledgeCommands::Query { query_type } => {
            let kind: QueryKind = query_type.parse().map_err(Error::InvalidInput)?;
            output(&commands::knowledge_query(ctx, kind, &query_type)?, human)
        }
        KnowledgeCommands::Init => output(&commands::knowledge_init(ctx)?, human),
        KnowledgeCommands::Record {
            error,
            category,
            action,
            success,
            failure,
            duration_ms,
        } => {
            let outcome = match action {
                Some(action) if success || failure => Some(commands::Outcome {
                    action,
                    success,
                    duration_ms,
                }),
                Some(_) => {
                    return Err(Error::InvalidInput(
                        "--action needs --success or --failure".to_string(),
                    ));
                }
                None => None,
            };
            output(
                &commands::knowledge_record(ctx, &error, category.as_deref(), outcome)?,
                human,
            )
        }
        KnowledgeCommands::Reset { yes } => output(&commands::knowledge_reset(ctx, yes)?, human),
    }
    Ok(())
}

fn run_monitor(command: MonitorCommands, ctx: &Context, human: bool) -> Result<(), Error> {
    match command {
        MonitorCommands::Init => output(&commands::monitor_init(ctx)?, human),
        MonitorCommands::Run => output(&commands::monitor_run(ctx)?, human),
        MonitorCommands::Watch => watch(ctx.settings().monitor_interval, || {
            commands::monitor_run(ctx).map(|r| output(&r, human))
        })?,
        MonitorCommands::Status => output(&commands::monitor_status(ctx)?, human),
        MonitorCommands::Alerts { all } => output(&commands::monitor_alerts(ctx, all)?, human),
        MonitorCommands::Resolve { id } => output(&commands::monitor_resolve(ctx, &id)?, human),
        MonitorCommands::Report { metric, value } => {
            output(&commands::monitor_report(ctx, &metric, value)?, human)
        }
    }
    Ok(())
}
