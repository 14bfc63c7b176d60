use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cassandra::cli::RunOptions;
use cassandra::config::ConfigFormat;

/// Parse output format from string
fn parse_config_format(s: &str) -> Result<ConfigFormat, String> {
    s.parse::<ConfigFormat>().map_err(|e| e.to_string())
}

#[derive(Parser)]
#[command(name = "cassandra")]
#[command(
    version,
    about = "Resilient multi-stage research pipeline producing evidence-scored risk reports"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, short, global = true, env = "CASSANDRA_CONFIG", help = "Explicit config file")]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, short, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the research pipeline for a query
    Run {
        #[arg(help = "Research query, e.g. a compound name")]
        query: String,
        #[arg(long, help = "JSON corpus manifest listing candidate documents")]
        corpus: PathBuf,
        #[arg(long, short, help = "Output directory for reports")]
        output: Option<PathBuf>,
        #[arg(long, help = "LLM provider (gemini, openai)")]
        provider: Option<String>,
        #[arg(long, help = "Model to use")]
        model: Option<String>,
        #[arg(long = "timeout-secs", help = "Whole-run timeout in seconds")]
        timeout_secs: Option<u64>,
        #[arg(long = "no-storage", help = "Do not persist findings to SQLite")]
        no_storage: bool,
        #[arg(long = "dry-run", help = "Validate inputs and show the plan, don't run")]
        dry_run: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration (merged from all sources)
    Show {
        #[arg(
            short = 'f',
            long,
            default_value = "toml",
            value_parser = parse_config_format,
            help = "Output format: toml, json, yaml"
        )]
        format: ConfigFormat,
    },
    /// Show configuration file paths
    Path,
    /// Initialize configuration
    Init {
        #[arg(long, short, help = "Initialize global config")]
        global: bool,
        #[arg(long, help = "Overwrite existing config")]
        force: bool,
    },
}

/// Set up panic handler for graceful error reporting
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("\n\x1b[1;31m━━━ PANIC ━━━\x1b[0m");
        eprintln!("\x1b[31mCassandra encountered an unexpected error:\x1b[0m");
        eprintln!("  {}", message);

        if let Some(location) = panic_info.location() {
            eprintln!(
                "\x1b[90mLocation: {}:{}:{}\x1b[0m",
                location.file(),
                location.line(),
                location.column()
            );
        }
        eprintln!();

        // Backtrace when RUST_BACKTRACE=1
        default_hook(panic_info);
    }));
}

fn main() -> ExitCode {
    setup_panic_handler();

    match run_cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("\x1b[31mError:\x1b[0m {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Run {
            query,
            corpus,
            output,
            provider,
            model,
            timeout_secs,
            no_storage,
            dry_run,
        } => {
            cassandra::cli::commands::run::run(RunOptions {
                query,
                corpus,
                config: cli.config,
                output,
                provider,
                model,
                timeout_secs,
                no_storage,
                dry_run,
                verbose: cli.verbose,
                quiet: cli.quiet,
            })?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { format } => {
                cassandra::cli::commands::config::show(cli.config.as_deref(), format)?;
            }
            ConfigAction::Path => {
                cassandra::cli::commands::config::path()?;
            }
            ConfigAction::Init { global, force } => {
                cassandra::cli::commands::config::init(global, force)?;
            }
        },
    }

    Ok(())
}
