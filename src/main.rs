mod doctor;

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepgraph_apps::{essay, quadratic, review, tweet, AppError, AppRun};
use stepgraph_core::config::AppConfig;
use stepgraph_core::traits::TextGenerator;
use stepgraph_engine::{RunError, RunOptions};
use stepgraph_llm::{create_client, LlmGenerator};

const DEFAULT_CONFIG: &str = "stepgraph.toml";

#[derive(Parser)]
#[command(name = "stepgraph", version, about = "Run LLM step-graph workflows")]
struct Cli {
    /// Path to config file [default: stepgraph.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the final record as JSON instead of the rendered result
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a customer review and draft a reply
    Review {
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },
    /// Write a tweet and refine it until a critic approves
    Tweet {
        #[arg(trailing_var_arg = true, required = true)]
        topic: Vec<String>,
        /// Maximum number of drafts (overrides apps.tweet.max_iterations)
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Grade an essay on three dimensions in parallel (reads stdin when no text is given)
    Essay {
        #[arg(trailing_var_arg = true)]
        text: Vec<String>,
    },
    /// Solve a·x² + b·x + c = 0
    Quadratic {
        #[arg(allow_negative_numbers = true)]
        a: f64,
        #[arg(allow_negative_numbers = true)]
        b: f64,
        #[arg(allow_negative_numbers = true)]
        c: f64,
    },
    /// Show current configuration
    Config,
    /// Check configuration and model reachability
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepgraph=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepgraph", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Doctor => {
            if !doctor::run_doctor(&config).await {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
        command => {
            let generator = build_generator(&config)?;
            let options = run_options(&config);
            let json = cli.json;
            let result = match command {
                Commands::Review { text } => {
                    let input = review::ReviewInput::new(text.join(" "));
                    review::run(input, generator, options)
                        .await
                        .map(|run| render(run, json))
                }
                Commands::Tweet {
                    topic,
                    max_iterations,
                } => {
                    let max = max_iterations.unwrap_or(config.apps.tweet.max_iterations);
                    let input = tweet::TweetInput::new(topic.join(" "), max);
                    tweet::run(input, generator, options)
                        .await
                        .map(|run| render(run, json))
                }
                Commands::Essay { text } => {
                    let input = essay::EssayInput::new(essay_text(text)?);
                    essay::run(input, generator, options)
                        .await
                        .map(|run| render(run, json))
                }
                Commands::Quadratic { a, b, c } => {
                    let input = quadratic::QuadraticInput { a, b, c };
                    quadratic::run(input, generator, options)
                        .await
                        .map(|run| render(run, json))
                }
                Commands::Config | Commands::Doctor | Commands::Completions { .. } => {
                    unreachable!("handled above")
                }
            };

            match result {
                Ok(rendered) => {
                    println!("{}", rendered?);
                    Ok(())
                }
                Err(e) => {
                    report_failure(&e, json);
                    std::process::exit(1);
                }
            }
        }
    }
}

/// An explicit `--config` must exist; the default path falls back to defaults.
fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            AppConfig::load(path)?
        }
        None => AppConfig::load_or_default(Path::new(DEFAULT_CONFIG))?,
    };
    Ok(config)
}

fn build_generator(config: &AppConfig) -> anyhow::Result<Arc<dyn TextGenerator>> {
    let client = create_client(&config.model)?;
    Ok(Arc::new(LlmGenerator::new(Arc::from(client), config.model.clone())))
}

/// Run options from `[engine]`, cancelled on Ctrl-C.
fn run_options(config: &AppConfig) -> RunOptions {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            trigger.cancel();
        }
    });
    RunOptions::from(&config.engine).with_cancel(cancel)
}

fn essay_text(args: Vec<String>) -> anyhow::Result<String> {
    if !args.is_empty() {
        return Ok(args.join(" "));
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}

fn render<T>(run: AppRun<T>, json: bool) -> anyhow::Result<String>
where
    T: std::fmt::Display,
{
    if json {
        Ok(serde_json::to_string_pretty(&run.outcome.record)?)
    } else {
        Ok(run.output.to_string())
    }
}

fn report_failure(err: &AppError, json: bool) {
    eprintln!("Error: {}", err);
    let AppError::Run(run_err) = err else {
        return;
    };
    if let Some(step) = run_err.failed_step() {
        eprintln!("Failed step: {}", step);
    }
    if let RunError::Stalled { pending, .. } = run_err {
        eprintln!("Steps still waiting on predecessors: {}", pending.join(", "));
    }
    if json {
        if let Some(record) = run_err.record() {
            if let Ok(text) = serde_json::to_string_pretty(record) {
                eprintln!("{}", text);
            }
        }
    }
}
