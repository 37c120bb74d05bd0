use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;

use toolgate::config::{self, Config};
use toolgate::tools::path_guard::{AccessMode, PathDecision, PathGuard};
use toolgate::tools::policy::CommandValidator;
use toolgate::Dispatcher;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "toolgate",
    about = "Run agent tool calls inside a confined project directory",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Config file (defaults to $TOOLGATE_CONFIG, then ~/.toolgate/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Sandbox root (defaults to the configured root, then the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract tool calls from agent output and dispatch them in order
    Run {
        /// File holding the agent output (stdin when omitted)
        file: Option<PathBuf>,

        /// Validate and resolve every call without touching anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the tool calls and warnings found in agent output, as JSON
    Extract {
        /// File holding the agent output (stdin when omitted)
        file: Option<PathBuf>,
    },
    /// Validate a shell command against the policy
    Check {
        /// The command, exactly as the agent wrote it
        command: String,
    },
    /// Resolve a path against the sandbox
    Resolve {
        path: String,

        /// Resolve for writing instead of reading
        #[arg(long)]
        write: bool,
    },
    /// Print the effective configuration as YAML
    Config,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;
    config.validate()?;

    match cli.command {
        Commands::Run { file, dry_run } => {
            let root = resolve_root(cli.root, &config)?;
            cmd_run(&root, &config, file.as_deref(), dry_run).await
        }
        Commands::Extract { file } => cmd_extract(file.as_deref()).await,
        Commands::Check { command } => {
            let root = resolve_root(cli.root, &config)?;
            cmd_check(&root, &config, &command)
        }
        Commands::Resolve { path, write } => {
            let root = resolve_root(cli.root, &config)?;
            cmd_resolve(&root, &config, &path, write)
        }
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config).context("serializing config")?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("toolgate=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// `--root`, then the configured root, then the current directory.
fn resolve_root(flag: Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    match flag.or_else(|| config.root.clone()) {
        Some(root) => Ok(root),
        None => std::env::current_dir().context("determining current directory"),
    }
}

async fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("reading agent output from stdin")?;
            Ok(text)
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn cmd_run(root: &Path, config: &Config, file: Option<&Path>, dry_run: bool) -> Result<ExitCode> {
    let text = read_input(file).await?;
    let dispatcher = Dispatcher::new(root, config)
        .context("setting up the sandbox")?
        .with_dry_run(dry_run);

    let report = dispatcher.run_turn(&text).await;
    if report.results.is_empty() && report.warnings.is_empty() {
        eprintln!("No tool calls found.");
        return Ok(ExitCode::SUCCESS);
    }
    println!("{}", report.render());

    Ok(if report.has_errors() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn cmd_extract(file: Option<&Path>) -> Result<ExitCode> {
    let text = read_input(file).await?;
    let extraction = toolgate::extract(&text);
    println!(
        "{}",
        serde_json::to_string_pretty(&extraction).context("serializing tool calls")?
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_check(root: &Path, config: &Config, command: &str) -> Result<ExitCode> {
    let guard = PathGuard::new(root, &config.policy).context("setting up the sandbox")?;
    let validator = CommandValidator::new(&config.policy, guard);
    let result = validator.validate(command);
    if result.allowed {
        println!("allowed");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("denied: {}", result.reason);
        Ok(ExitCode::FAILURE)
    }
}

fn cmd_resolve(root: &Path, config: &Config, path: &str, write: bool) -> Result<ExitCode> {
    let guard = PathGuard::new(root, &config.policy).context("setting up the sandbox")?;
    let mode = if write {
        AccessMode::Write
    } else {
        AccessMode::Read
    };
    match guard.resolve(path, mode) {
        PathDecision::Allowed(resolved) => {
            println!("{}", resolved.as_path().display());
            Ok(ExitCode::SUCCESS)
        }
        PathDecision::Denied(reason) => {
            println!("denied: {reason}");
            Ok(ExitCode::FAILURE)
        }
    }
}
