use anyhow::Result;
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use transcriptor::app;
use transcriptor::cli::{Cli, Commands, ConfigAction, JobsAction};
use transcriptor::config::Config;
use transcriptor::defaults;
use transcriptor::ledger::{Job, JobFilter, JobStatus, JobUpdate, Ledger, LedgerStats};
use transcriptor::pipeline::JobStage;
use transcriptor::sys::{Signal, SignalOutcome, send_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    transcriptor::logging::init(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Supervise {
            poll_interval,
            max_active,
        } => {
            let config = load_config(cli.config.as_deref())?;
            app::run_supervise(config, cli.config.clone(), poll_interval, max_active, cli.quiet)
                .await?;
        }
        Commands::Submit {
            input,
            output,
            overrides,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let id = app::run_submit(config, &input, output.as_deref(), &overrides)?;
            if cli.quiet {
                println!("{id}");
            } else {
                println!("Submitted job {}", id.green());
                println!("Follow it with: transcriptor logs {id}");
            }
        }
        Commands::RunJob { job_id, lanes } => {
            let config = load_config(cli.config.as_deref())?;
            let outcome =
                app::run_job_command(config, job_id, lanes.map(Into::into), cli.quiet).await?;
            // The job's own state is in the ledger; the exit code reports
            // whether it could be recorded.
            if let Some(error) = &outcome.ledger_error {
                eprintln!("{}", format!("Failed to record job {job_id}: {error}").red());
                std::process::exit(1);
            }
            if outcome.stage == JobStage::Failed && !cli.quiet {
                eprintln!("{}", app::describe_outcome(&outcome).red());
            }
        }
        Commands::Batch {
            inputs,
            output_dir,
            parallel_preparation,
            lanes,
            keep_work_dir,
            json,
            overrides,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let outcomes = app::run_batch_command(
                config,
                &inputs,
                output_dir.as_deref(),
                parallel_preparation,
                lanes.map(Into::into),
                keep_work_dir,
                &overrides,
                cli.quiet || json,
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcomes)?);
            } else {
                println!();
                for outcome in &outcomes {
                    let line = app::describe_outcome(outcome);
                    if outcome.is_success() {
                        println!("{}", line.green());
                    } else {
                        println!("{}", line.red());
                    }
                }
            }
            if outcomes.iter().any(|o| !o.is_success()) {
                std::process::exit(1);
            }
        }
        Commands::Worker { manifest } => {
            app::run_worker_command(manifest).await?;
        }
        Commands::Jobs { action } => {
            let config = load_config(cli.config.as_deref())?;
            handle_jobs_command(&config, action)?;
        }
        Commands::Logs { job_id, lines } => {
            let config = load_config(cli.config.as_deref())?;
            let ledger = app::open_ledger(&config)?;
            let supervisor = app::build_supervisor(&config, ledger);
            for line in supervisor.logs(job_id, lines)? {
                println!("{line}");
            }
        }
        Commands::Check { json } => {
            let config = load_config(cli.config.as_deref())?;
            let report = transcriptor::diagnostics::probe(&config);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                transcriptor::diagnostics::print_report(&report);
            }
            if !report.is_ready() {
                std::process::exit(1);
            }
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "transcriptor",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/transcriptor/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        Config::load_or_default(&Config::default_path())?
    };
    Ok(config.with_env_overrides())
}

/// Handle ledger job commands.
fn handle_jobs_command(config: &Config, action: JobsAction) -> Result<()> {
    let ledger = app::open_ledger(config)?;

    match action {
        JobsAction::List {
            status,
            limit,
            json,
        } => {
            let jobs = ledger.list(&JobFilter { status, limit })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else if jobs.is_empty() {
                println!("No jobs.");
            } else {
                println!("{:>5}  {:<10}  {:>6}  {:<19}  INPUT", "ID", "STATUS", "PROG", "CREATED");
                for job in &jobs {
                    println!(
                        "{:>5}  {:<10}  {:>5.1}%  {:<19}  {}",
                        job.id,
                        colored_status(job.status),
                        job.progress,
                        job.created_at
                            .with_timezone(&chrono::Local)
                            .format("%Y-%m-%d %H:%M:%S"),
                        job.input.display()
                    );
                }
            }
        }
        JobsAction::Show { job_id, json } => {
            let job = find_job(&*ledger, job_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job(&job);
            }
        }
        JobsAction::Cancel { job_id } => {
            let job = find_job(&*ledger, job_id)?;
            if job.status.is_terminal() {
                eprintln!("Job {job_id} is already {}", job.status);
                std::process::exit(1);
            }
            ledger.update(
                job_id,
                JobUpdate::status(JobStatus::Cancelled).with_error(defaults::CANCELLED_ERROR),
            )?;
            // A daemon stops its child on the next pass; a process started
            // by hand is asked directly.
            if let Some(pid) = job.pid {
                match send_signal(pid, Signal::Terminate) {
                    SignalOutcome::Delivered | SignalOutcome::NoSuchProcess => {}
                    SignalOutcome::PermissionDenied => {
                        eprintln!("Not allowed to signal pid {pid}; the supervisor will stop it.");
                    }
                    SignalOutcome::Failed(e) => eprintln!("Failed to signal pid {pid}: {e}"),
                }
            }
            println!("Cancelled job {job_id}");
        }
        JobsAction::Delete { job_id, force } => {
            let job = find_job(&*ledger, job_id)?;
            if !job.status.is_terminal() && !force {
                eprintln!(
                    "Job {job_id} is {}; cancel it first or pass --force",
                    job.status
                );
                std::process::exit(1);
            }
            ledger.delete(job_id)?;
            println!("Deleted job {job_id}");
        }
        JobsAction::Stats => {
            let jobs = ledger.list(&JobFilter::default())?;
            let stats = LedgerStats::from_jobs(&jobs);
            println!("Jobs:       {}", stats.total);
            println!("  pending:    {}", stats.pending);
            println!("  processing: {}", stats.processing);
            println!("  completed:  {}", stats.completed);
            println!("  failed:     {}", stats.failed);
            println!("  cancelled:  {}", stats.cancelled);
            println!("Success rate: {:.1}%", stats.success_rate);
        }
    }
    Ok(())
}

fn find_job(ledger: &dyn Ledger, job_id: u64) -> Result<Job> {
    ledger
        .get(job_id)?
        .ok_or_else(|| anyhow::anyhow!("Job {job_id} not found"))
}

fn colored_status(status: JobStatus) -> String {
    let text = format!("{:<10}", status.as_str());
    match status {
        JobStatus::Completed => text.green().to_string(),
        JobStatus::Failed => text.red().to_string(),
        JobStatus::Cancelled => text.yellow().to_string(),
        JobStatus::Processing => text.cyan().to_string(),
        JobStatus::Pending => text.dimmed().to_string(),
    }
}

fn print_job(job: &Job) {
    println!("Job {}", job.id);
    println!("  {}     {}", "Status:".dimmed(), colored_status(job.status));
    println!("  {}   {:.1}%", "Progress:".dimmed(), job.progress);
    println!("  {}      {}", "Input:".dimmed(), job.input.display());
    println!("  {}     {}", "Output:".dimmed(), job.output.display());
    println!(
        "  {}     {} / {} / {}x{} / {}s+{}s",
        "Engine:".dimmed(),
        job.settings.model,
        job.settings.language,
        job.settings.processes,
        job.settings.threads_per_process,
        job.settings.window_secs,
        job.settings.overlap_secs
    );
    println!("  {}    {}", "Created:".dimmed(), job.created_at.with_timezone(&chrono::Local));
    if let Some(at) = job.started_at {
        println!("  {}    {}", "Started:".dimmed(), at.with_timezone(&chrono::Local));
    }
    if let Some(at) = job.completed_at {
        println!("  {}   {}", "Finished:".dimmed(), at.with_timezone(&chrono::Local));
    }
    if let Some(pid) = job.pid {
        println!("  {}        {}", "Pid:".dimmed(), pid);
    }
    if let Some(at) = job.heartbeat_at {
        println!("  {}  {}", "Heartbeat:".dimmed(), at.with_timezone(&chrono::Local));
    }
    if let Some(log) = &job.log_file {
        println!("  {}        {}", "Log:".dimmed(), log.display());
    }
    if let Some(error) = &job.error {
        println!("  {}      {}", "Error:".dimmed(), error.red());
    }
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let config_path = custom_path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", toml::to_string_pretty(&config)?);
            if let Err(e) = config.validate() {
                eprintln!("{}", format!("Warning: {e}").yellow());
            }
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
    }
    Ok(())
}
