//! `storyloop` CLI: plan a feature with an agent, then run it story by story.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use storyloop::engine::{Collaborators, Engine};
use storyloop::error::EngineError;
use storyloop::events;
use storyloop::exit_codes;
use storyloop::io::config::{CONFIG_FILE, EngineConfig, load_config, write_config};
use storyloop::logging;
use storyloop::presenter::Presenter;

#[derive(Parser)]
#[command(
    name = "storyloop",
    version,
    about = "Plan a feature with a coding agent, then drive it to completion story by story"
)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Overrides {
    /// Config file (defaults to `storyloop.toml` in the working directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory the agent works in and the plan lives in.
    #[arg(short = 'C', long, global = true)]
    workdir: Option<PathBuf>,

    #[arg(long, global = true)]
    max_iterations: Option<u32>,

    #[arg(long, global = true)]
    retry_limit: Option<u32>,

    /// Model passed to the agent command.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Show agent lines that look like log chatter, and info-level diagnostics.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print events as JSON lines.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `storyloop.toml`.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Generate a plan from a feature request without running it.
    Plan {
        prompt: String,
        /// Replace an existing plan.
        #[arg(short, long)]
        force: bool,
    },
    /// Resume the existing plan.
    Run,
    /// Generate a plan, then run it.
    Start {
        prompt: String,
        /// Replace an existing plan.
        #[arg(short, long)]
        force: bool,
    },
}

impl Overrides {
    fn config_path(&self) -> PathBuf {
        match (&self.config, &self.workdir) {
            (Some(path), _) => path.clone(),
            (None, Some(workdir)) => workdir.join(CONFIG_FILE),
            (None, None) => PathBuf::from(CONFIG_FILE),
        }
    }

    fn apply(&self, cfg: &mut EngineConfig) {
        if let Some(workdir) = &self.workdir {
            cfg.workdir = workdir.clone();
        }
        if let Some(max_iterations) = self.max_iterations {
            cfg.max_iterations = max_iterations;
        }
        if let Some(retry_limit) = self.retry_limit {
            cfg.retry_limit = retry_limit;
        }
        if let Some(model) = &self.model {
            cfg.model = model.clone();
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.overrides.verbose);
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = cli.overrides.config_path();
    let (prompt, force, run_after) = match cli.command {
        Command::Init { force } => {
            cmd_init(&config_path, force)?;
            return Ok(exit_codes::OK);
        }
        Command::Plan { prompt, force } => (Some(prompt), force, false),
        Command::Run => (None, false, true),
        Command::Start { prompt, force } => (Some(prompt), force, true),
    };

    let mut cfg = load_config(&config_path)?;
    cli.overrides.apply(&mut cfg);
    cfg.validate().context("invalid configuration")?;

    let plan_path = cfg.plan_path();
    if prompt.is_some() && plan_path.exists() && !force {
        bail!(
            "a plan already exists at {} (use `storyloop run` to resume or --force to replace it)",
            plan_path.display()
        );
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling after the current step...");
            on_signal.cancel();
        }
    });

    let (tx, rx) = events::channel(cfg.event_capacity);
    let presenter = Presenter {
        show_verbose: cli.overrides.verbose,
        json: cli.overrides.json,
    };
    let presenting = tokio::spawn(presenter.drain(rx));

    let collaborators = Collaborators::production(&cfg)?;
    let engine = Engine::new(cfg, collaborators, tx, cancel)?;
    let outcome = async {
        let plan = match &prompt {
            Some(prompt) => engine.generate(prompt).await?,
            None => engine.load().await?,
        };
        if run_after {
            engine.run(plan).await?;
        }
        Ok::<(), EngineError>(())
    }
    .await;

    drop(engine);
    let status = presenting.await.context("presenter task failed")?;
    debug!(?status, "event stream closed");

    Ok(match outcome {
        Ok(()) => exit_codes::OK,
        Err(err) => err.exit_code(),
    })
}

fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }
    write_config(config_path, &EngineConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(())
}
