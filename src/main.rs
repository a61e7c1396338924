mod cli;
mod ui;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use ui::Ui;
use viki::{Engine, FsJobStore, JobDefinition, JobPatch, Jobs, ShellRunner, VikiConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "viki=debug" } else { "viki=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Executes the subcommand. Returns whether the operation succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let config = VikiConfig::load(cli.config.as_deref())?;
    let jobs_path = cli.jobs_dir.clone().unwrap_or_else(|| config.jobs_path());

    let engine = Engine::new(
        FsJobStore::new(jobs_path),
        ShellRunner::new(config.shell.clone()),
        config.workspace_root.clone(),
    )
    .with_step_timeout(config.step_timeout());
    let jobs = Jobs::new(engine);
    let ui = Ui::new(cli.json);

    let success = match cli.command {
        Command::List => {
            let response = jobs.list_jobs();
            ui.show(&response, |list| {
                for name in &list.jobs {
                    ui.line(name);
                }
            });
            response.success
        }
        Command::Get { name } => {
            let response = jobs.get_job(&name);
            ui.show(&response, |config| ui.line(&config.config_json));
            response.success
        }
        Command::Create {
            name,
            description,
            steps,
            file,
        } => {
            let response = match file {
                Some(path) => {
                    let json = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    jobs.create_job_from_json(&name, &json)
                }
                None => jobs.create_job(
                    &name,
                    JobDefinition::new(description.unwrap_or_default(), steps),
                ),
            };
            ui.show(&response, |_| {});
            response.success
        }
        Command::Update {
            name,
            description,
            steps,
        } => {
            let patch = JobPatch {
                description,
                steps: (!steps.is_empty()).then_some(steps),
            };
            let response = jobs.update_job(&name, patch);
            ui.show(&response, |_| {});
            response.success
        }
        Command::Delete { name } => {
            let response = jobs.delete_job(&name);
            ui.show(&response, |_| {});
            response.success
        }
        Command::Run { name } => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, cancelling run");
                    on_interrupt.cancel();
                }
            });

            let spinner = ui.start_run(&name);
            let response = jobs.run_job(&name, &cancel).await;
            spinner.finish_and_clear();
            ui.show(&response, |result| {
                if let Some(run_number) = result.run_number {
                    ui.line(&format!("run #{run_number}"));
                }
            });
            response.success
        }
        Command::Output { name } => {
            let response = jobs.job_output(&name);
            ui.show(&response, |log| print!("{}", log.output));
            response.success
        }
    };

    Ok(success)
}
