//! Stepwise CLI
//!
//! Command-line interface for listing, running and inspecting system migrations.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use stepwise_core::{
    AuditLog, Config, Engine, ListFilter, MigrationState, Mode, Outcome, Registry, RunReport,
    RunRequest, SelfUpgrade, StateStore, builtin,
};
use tracing_subscriber::EnvFilter;

/// Stepwise - System Migration Engine
#[derive(Parser)]
#[command(name = "stepwise")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Apply ordered, one-shot system migrations")]
#[command(long_about = "Stepwise applies ordered, one-shot system migrations on a long-lived machine.\n\nEach migration runs at most once; its outcome is recorded in a state file, and risky ones are wrapped in a backup/rollback transaction.")]
struct Cli {
    /// Custom data directory (state file, manifests, backups, journal)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known migrations and their state
    List {
        /// Only pending migrations
        #[arg(long)]
        pending: bool,
        /// Only migrations already decided (done or skipped)
        #[arg(long)]
        done: bool,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run migrations (every pending one when no target is given)
    Run {
        /// Migration ids, slugs or ordinals
        targets: Vec<String>,
        /// Mark the targets as skipped instead of running them
        #[arg(long)]
        skip: bool,
        /// Unattended run: manual migrations are left pending
        #[arg(long)]
        auto: bool,
        /// Run again migrations that are done or skipped
        #[arg(long)]
        force_rerun: bool,
        /// Accept the disclaimer of the first migration that has one
        #[arg(long)]
        accept_disclaimer: bool,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the persisted migration state
    State {
        #[arg(long)]
        json: bool,
    },

    /// Mark every known migration as skipped (fresh install only)
    Init,

    /// Show recent entries of the operation journal
    Log {
        /// Number of entries
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },

    /// Run restore-time hooks for a backup taken on an older release
    RestoreHooks {
        /// Release that produced the backup
        #[arg(long)]
        backup_version: String,
        /// Release being restored onto
        #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
        current_version: String,
        /// Run the pre-restore hooks of this application instead of the system ones
        #[arg(long)]
        app: Option<String>,
    },

    /// Schedule an upgrade of this tool once the current invocation releases its lock
    SelfUpgrade {
        /// Shell command performing the upgrade
        #[arg(long)]
        command: String,
        /// Launcher prepended to the worker command line (e.g. "systemd-run --scope")
        #[arg(long)]
        launcher: Option<String>,
        /// Run in this process and wait for completion
        #[arg(long)]
        foreground: bool,
    },

    /// Detached self-upgrade job (internal)
    #[command(name = "self-upgrade-worker", hide = true)]
    SelfUpgradeWorker {
        #[arg(long)]
        command: String,
        #[arg(long)]
        lock_path: PathBuf,
        #[arg(long)]
        log_path: PathBuf,
        #[arg(long)]
        marker_path: PathBuf,
        #[arg(long, default_value = "1000")]
        poll_interval_ms: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let data_dir = cli.data_dir;
    match cli.command {
        Commands::List {
            pending,
            done,
            json,
        } => run_list(data_dir, ListFilter { pending, done }, json),
        Commands::Run {
            targets,
            skip,
            auto,
            force_rerun,
            accept_disclaimer,
            json,
        } => run_run(
            data_dir,
            RunRequest {
                targets,
                skip,
                auto,
                force_rerun,
                accept_disclaimer,
            },
            json,
        ),
        Commands::State { json } => run_state(data_dir, json),
        Commands::Init => run_init(data_dir),
        Commands::Log { limit, json } => run_log(data_dir, limit, json),
        Commands::RestoreHooks {
            backup_version,
            current_version,
            app,
        } => run_restore_hooks(data_dir, backup_version, current_version, app),
        Commands::SelfUpgrade {
            command,
            launcher,
            foreground,
        } => run_self_upgrade(data_dir, command, launcher, foreground),
        Commands::SelfUpgradeWorker {
            command,
            lock_path,
            log_path,
            marker_path,
            poll_interval_ms,
        } => run_worker(SelfUpgrade {
            command,
            lock_path,
            log_path,
            marker_path,
            poll_interval: Duration::from_millis(poll_interval_ms),
        }),
    }
}

/// Logs go to stderr so `--json` output on stdout stays parseable
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(data_dir: Option<PathBuf>) -> anyhow::Result<Config> {
    Ok(Config::new(data_dir)?.with_env_overrides())
}

fn open_engine(data_dir: Option<PathBuf>) -> anyhow::Result<Engine> {
    engine_for(load_config(data_dir)?)
}

fn engine_for(config: Config) -> anyhow::Result<Engine> {
    tracing::debug!(data_dir = %config.data_dir.display(), "Configuration resolved");
    let store = StateStore::new(&config.state_path);
    let registry = Registry::load(builtin::migrations()?, &config, &store)
        .context("Failed to load migrations")?;
    let audit = AuditLog::open(&config.audit_db_path)
        .with_context(|| format!("Failed to open journal {}", config.audit_db_path.display()))?;
    Ok(Engine::new(registry, config).with_audit(audit))
}

fn colored_state(state: MigrationState) -> colored::ColoredString {
    match state {
        MigrationState::Pending => state.as_str().yellow(),
        MigrationState::Done => state.as_str().green(),
        MigrationState::Skipped => state.as_str().dimmed(),
    }
}

/// Run list command
fn run_list(data_dir: Option<PathBuf>, filter: ListFilter, json: bool) -> anyhow::Result<()> {
    let engine = open_engine(data_dir)?;
    let migrations = engine.list(filter)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&migrations)?);
        return Ok(());
    }

    println!("{}", "=== Migrations ===".cyan().bold());
    if migrations.is_empty() {
        println!("{}", "No migrations found.".dimmed());
        return Ok(());
    }

    for migration in &migrations {
        let mode = match migration.mode {
            Mode::Auto => String::new(),
            Mode::Manual => format!(" {}", "[manual]".magenta()),
        };
        println!(
            "{:<40} {:<8}{}  {}",
            migration.id.white().bold(),
            colored_state(migration.state),
            mode,
            migration.description
        );
        if let Some(disclaimer) = &migration.disclaimer {
            println!("    {} {}", "disclaimer:".yellow(), disclaimer);
        }
    }
    Ok(())
}

/// Run run command
fn run_run(data_dir: Option<PathBuf>, request: RunRequest, json: bool) -> anyhow::Result<()> {
    let mut engine = open_engine(data_dir)?;
    let report = engine.run(&request)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    let failed = report
        .outcomes
        .iter()
        .filter(|o| matches!(o.outcome, Outcome::Failed { .. }))
        .count();
    if failed > 0 {
        anyhow::bail!("{} migration(s) failed", failed);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    if report.nothing_to_do {
        println!("{}", "Nothing to do.".dimmed());
        return;
    }

    for target in &report.outcomes {
        let label = match &target.outcome {
            Outcome::Done => "done".green().bold(),
            Outcome::Skipped => "skipped".dimmed(),
            Outcome::Failed { .. } => "failed".red().bold(),
            Outcome::DeferredManual => "deferred (manual)".yellow(),
            Outcome::BlockedByDependencies { .. } => "blocked".red(),
            Outcome::DisclaimerRequired { .. } => "needs --accept-disclaimer".yellow(),
        };
        println!("{:<40} {}", target.id.white().bold(), label);

        match &target.outcome {
            Outcome::Failed { error } => println!("    {}", error.red()),
            Outcome::BlockedByDependencies { unmet } => {
                println!("    {} {}", "unmet dependencies:".dimmed(), unmet.join(", "))
            }
            Outcome::DisclaimerRequired { disclaimer } => println!("    {}", disclaimer),
            _ => {}
        }
    }
}

/// Run state command
fn run_state(data_dir: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let config = load_config(data_dir)?;
    let document = StateStore::new(&config.state_path).document()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    println!("{}", "=== Migration State ===".cyan().bold());
    println!("{}: {}", "State file".white().bold(), config.state_path.display());
    if document.migrations.is_empty() {
        println!("{}", "No migration has run or been skipped.".dimmed());
    }
    for (id, value) in &document.migrations {
        println!("{:<40} {}", id, colored_state(*value));
    }
    Ok(())
}

/// Run init command
fn run_init(data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut engine = open_engine(data_dir)?;
    let count = engine.skip_all()?;
    println!("{} {} migration(s) marked as skipped", "Initialized:".green().bold(), count);
    Ok(())
}

/// Run log command
fn run_log(data_dir: Option<PathBuf>, limit: usize, json: bool) -> anyhow::Result<()> {
    let config = load_config(data_dir)?;
    let journal = AuditLog::open(&config.audit_db_path)?;
    let records = journal.recent(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!("{}", "=== Operation Journal ===".cyan().bold());
    if records.is_empty() {
        println!("{}", "No operations recorded.".dimmed());
    }
    for record in &records {
        let status = match record.success {
            Some(true) => "ok".green(),
            Some(false) => "failed".red(),
            None => "open".yellow(),
        };
        println!(
            "{}  {:<16} {:<40} {}",
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.kind.as_str(),
            record.migration_id.as_deref().unwrap_or("-"),
            status
        );
        if let Some(error) = &record.error {
            println!("    {}", error.dimmed());
        }
    }
    Ok(())
}

/// Run restore-hooks command
fn run_restore_hooks(
    data_dir: Option<PathBuf>,
    backup_version: String,
    current_version: String,
    app: Option<String>,
) -> anyhow::Result<()> {
    let engine = open_engine(data_dir)?;
    let ran = match &app {
        Some(app_id) => engine.run_before_app_restore(&backup_version, &current_version, app_id)?,
        None => engine.run_after_system_restore(&backup_version, &current_version)?,
    };

    if ran.is_empty() {
        println!("{}", "No restore hooks to run.".dimmed());
    } else {
        for id in &ran {
            println!("{:<40} {}", id.white().bold(), "ok".green());
        }
    }
    Ok(())
}

/// Run self-upgrade command
fn run_self_upgrade(
    data_dir: Option<PathBuf>,
    command: String,
    launcher: Option<String>,
    foreground: bool,
) -> anyhow::Result<()> {
    let config = load_config(data_dir)?;
    let upgrade = SelfUpgrade::new(command, &config);

    if foreground {
        return run_worker(upgrade);
    }

    let launcher: Vec<String> = launcher
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let program = std::env::current_exe().context("Cannot locate the stepwise binary")?;
    let pid = upgrade.detach(&program, &launcher)?;

    println!("{} worker pid {}", "Self-upgrade scheduled:".green().bold(), pid);
    println!("{}: {}", "Log".white().bold(), upgrade.log_path.display());
    println!("{}: {}", "Marker".white().bold(), upgrade.marker_path.display());
    Ok(())
}

/// Run the self-upgrade job to completion in this process
fn run_worker(upgrade: SelfUpgrade) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let marker = rt.block_on(upgrade.spawn().wait())?;
    if !marker.success {
        anyhow::bail!("Self-upgrade command exited with {:?}", marker.exit_code);
    }
    Ok(())
}
