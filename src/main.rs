use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ttmm::cli::{self, Command, RepoArgs};
use ttmm::trace::{StopHandle, TraceEntry};
use ttmm::workspace::{Workspace, WorkspaceOptions};

fn open(repo: &RepoArgs, options: WorkspaceOptions) -> Result<Workspace> {
    Workspace::open_with(&repo.repo, options)
        .with_context(|| format!("failed to open workspace at {}", repo.repo.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ttmm=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = cli::Args::parse();

    let output = match args.command {
        Command::Index {
            repo,
            no_ignore,
            churn_days,
        } => {
            let options = WorkspaceOptions {
                no_ignore,
                churn_days,
                ..repo.options()
            };
            let mut workspace = open(&repo, options)?;
            let stats = workspace.index()?;
            cli::render(repo.json, &stats, cli::format_stats)?
        }
        Command::Hotspots { repo, limit } => {
            let workspace = open(&repo, repo.options())?;
            let hotspots = workspace.hotspots(limit)?;
            cli::render(repo.json, hotspots.as_slice(), cli::format_hotspots)?
        }
        Command::Callers {
            repo,
            symbol,
            edges,
        } => {
            let workspace = open(&repo, repo.options())?;
            let callers = workspace.callers(&symbol, edges.into())?;
            cli::render(repo.json, callers.as_slice(), cli::format_edges)?
        }
        Command::Callees {
            repo,
            symbol,
            edges,
        } => {
            let workspace = open(&repo, repo.options())?;
            let callees = workspace.callees(&symbol, edges.into())?;
            cli::render(repo.json, callees.as_slice(), cli::format_edges)?
        }
        Command::Trace {
            repo,
            module,
            script,
            python,
            timeout_secs,
            args,
        } => {
            let entry = match (module, script) {
                (Some(module), _) => TraceEntry::module(&module),
                (None, Some(script)) => TraceEntry::script(script),
                (None, None) => anyhow::bail!("either --module or --script is required"),
            };
            let options = WorkspaceOptions {
                python,
                trace_timeout: cli::trace_timeout(timeout_secs),
                ..repo.options()
            };
            let workspace = open(&repo, options)?;
            ensure_indexed(&workspace, &repo.repo)?;
            let run = workspace
                .trace(&entry, &args, &StopHandle::new())
                .with_context(|| format!("trace of {entry} failed; captured events were kept"))?;
            cli::render(repo.json, &run, cli::format_run)?
        }
        Command::Answer {
            repo,
            question,
            limit,
        } => {
            let workspace = open(&repo, repo.options())?;
            let hits = workspace.answer(&question.join(" "), limit)?;
            cli::render(repo.json, hits.as_slice(), cli::format_hits)?
        }
        Command::Runs { repo, limit } => {
            let workspace = open(&repo, repo.options())?;
            let runs = workspace.runs(limit)?;
            cli::render(repo.json, runs.as_slice(), cli::format_runs)?
        }
        Command::Events {
            repo,
            run_id,
            limit,
        } => {
            let workspace = open(&repo, repo.options())?;
            let events = workspace.events(run_id, limit)?;
            cli::render(repo.json, events.as_slice(), cli::format_events)?
        }
        Command::Digest { repo } => {
            let workspace = open(&repo, repo.options())?;
            let digest = workspace.digest()?;
            cli::render(repo.json, &digest, cli::format_digest)?
        }
    };
    println!("{output}");
    Ok(())
}

/// Traced calls are mapped onto indexed symbols, so an empty store would
/// record nothing.
fn ensure_indexed(workspace: &Workspace, repo: &Path) -> Result<()> {
    if workspace.db().latest_run()?.is_none() {
        tracing::warn!(
            "{} has not been indexed; run `ttmm index` first to record calls",
            repo.display()
        );
    }
    Ok(())
}
