use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use branchline::cmd;
use branchline::config::{CliOverrides, Config};
use branchline_common::{PipelineRequest, PipelineRequestConfig};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "branchline")]
#[command(version, about = "Parallel-agent pipeline orchestrator")]
struct Cli {
    /// Project root. Defaults to the current directory.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Overrides `logging.level` from the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Overrides `branch.main` from the config file.
    #[arg(long, global = true)]
    main_branch: Option<String>,

    /// Overrides `events.path` from the config file.
    #[arg(long, global = true)]
    events_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold `.branchline/branchline.toml` and `.pipeline/`.
    Init,
    /// Submit one pipeline request and drive it to a terminal state.
    Run {
        /// Branch the agent runs against.
        branch: String,
        /// Worktree the agent runs in.
        worktree_path: PathBuf,
        #[arg(long)]
        base_branch: Option<String>,
        #[arg(long)]
        tier: Option<branchline_common::Tier>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        max_turns: Option<u32>,
    },
    /// Run the scheduler loop: pick up ready branches and drive the Integrator.
    Director {
        /// Git remote URL used to derive the GitHub owner/repo slug.
        #[arg(long)]
        remote_url: Option<String>,
    },
    /// Run the combined service: scheduler loop plus the inbound webhook adapter.
    Serve {
        #[arg(long)]
        remote_url: Option<String>,
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
    },
    /// Manifest inspection.
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },
}

#[derive(Subcommand)]
enum ManifestCommands {
    /// Print the manifest's ready/pending-merge/merge-history lists.
    Show,
}

/// Stdout plus a daily-rolling log file under `log_dir`. The returned
/// guard must stay alive for the program's lifetime — dropping it stops
/// the non-blocking writer's background flush thread.
fn init_logging(level: &str, log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = std::fs::create_dir_all(log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "branchline.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_ansi(false).with_writer(file_writer))
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load a `.env` file from the current directory if present, before any
    // env-var-driven config layer (`Config::apply_env`, `CLAUDE_CMD`,
    // `GITHUB_TOKEN`) reads `std::env`. Absence is not an error.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    let overrides = CliOverrides {
        log_level: cli.log_level.clone(),
        main_branch: cli.main_branch.clone(),
        events_path: cli.events_path.clone(),
    };

    if matches!(cli.command, Commands::Init) {
        return cmd::cmd_init(project_dir).await;
    }

    let config = Config::load(&project_dir, overrides)?;
    let _log_guard = init_logging(&config.logging.level, &project_dir.join(".pipeline/logs"));

    let github_token = std::env::var("GITHUB_TOKEN").ok();

    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Run { branch, worktree_path, base_branch, tier, model, max_turns } => {
            let request = PipelineRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                branch,
                worktree_path: worktree_path.to_string_lossy().to_string(),
                base_branch,
                config: PipelineRequestConfig { tier, agents: None, model, max_turns },
                metadata: None,
            };
            let exit_code = cmd::cmd_run(project_dir, config, request).await?;
            drop(_log_guard);
            std::process::exit(exit_code);
        }
        Commands::Director { remote_url } => {
            cmd::cmd_director(project_dir.clone(), project_dir, config, github_token, remote_url).await?;
        }
        Commands::Serve { remote_url, bind } => {
            cmd::cmd_serve(project_dir.clone(), project_dir, config, github_token, remote_url, bind).await?;
        }
        Commands::Manifest { command: ManifestCommands::Show } => {
            cmd::cmd_manifest_show(project_dir, config).await?;
        }
    }

    Ok(())
}
