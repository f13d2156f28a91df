use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use research_core::{
    ConfigLoader, ResearchTarget, SessionOptions, TelemetryOptions, build_services,
    init_metrics_from_env, init_telemetry, run_research,
};
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "research-cli",
    version,
    about = "Iterative company research loop"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Research one company and write a weekly report.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Company to research.
    #[arg(long)]
    company: String,

    /// Topics to steer the planner towards.
    #[arg(long, num_args = 1..)]
    keywords: Vec<String>,

    /// Documents whose URL or title mention any of these are never curated.
    #[arg(long, num_args = 1..)]
    exclude: Vec<String>,

    /// Path to a TOML config file (defaults to `RESEARCH_CONFIG` or `config.toml`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `research.max_iterations`.
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Directory the markdown report is written to.
    #[arg(long, default_value = "reports")]
    output_dir: PathBuf,

    /// Optional session ID used for the trace and run log.
    #[arg(long)]
    session: Option<String>,

    /// Persist the run trace as JSON into this directory.
    #[arg(long)]
    trace_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(args).await?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn run_command(args: RunArgs) -> Result<()> {
    let mut config = ConfigLoader::load(args.config.clone()).context("failed to load config")?;
    if let Some(max_iterations) = args.max_iterations {
        config.research.max_iterations = max_iterations;
        ConfigLoader::validate(&config)?;
    }

    init_telemetry(TelemetryOptions {
        with_target: false,
        ..TelemetryOptions::from_config(&config.logging)
    })?;
    init_metrics_from_env("research-cli")?;

    let (model, search) = build_services(&config)?;

    let target = ResearchTarget::new(args.company)
        .with_keywords(args.keywords)
        .with_exclusions(args.exclude);
    let mut options = SessionOptions::new(target).with_output_dir(args.output_dir);
    if let Some(session) = args.session {
        options = options.with_session_id(session);
    }
    if let Some(dir) = args.trace_dir {
        options = options.with_trace_dir(dir);
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; curating what has been collected so far");
            ctrl_c.cancel();
        }
    });

    let outcome = run_research(&config, options, model, search, &cancel).await?;

    info!(
        session_id = %outcome.session_id,
        stop_reason = outcome.stop_reason.as_str(),
        "session complete"
    );
    println!("{}", outcome.trace.render_markdown());
    match &outcome.report_path {
        Some(path) => println!("\nReport written to {}", path.display()),
        None => println!(
            "\nNo report written ({} documents curated).",
            outcome.state.curated.len()
        ),
    }
    if let Some(path) = &outcome.trace_path {
        println!("Trace written to {}", path.display());
    }

    Ok(())
}
