use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailposture::{
    EngineConfig, EngineError, HickoryResolver, MemoryCatalog, MemoryDomainStore, OrgId,
    PostureEngine, RecordKind,
};

/// Inspect the email authentication posture of a domain.
#[derive(Debug, Parser)]
#[command(name = "mailposture", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short, env = "MAILPOSTURE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Debug logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Log as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch one authentication record.
    Lookup {
        domain: String,
        /// dmarc, spf or dkim
        #[arg(long = "type", short = 't', default_value = "dmarc")]
        kind: String,
        /// DKIM selector, required for `--type dkim`.
        #[arg(long, short)]
        selector: Option<String>,
    },
    /// SPF, DMARC and DKIM status in one call.
    Status { domain: String },
    /// Flatten an SPF include into IP ranges.
    ResolveInclude { include: String },
    /// Match SPF mechanisms against the built-in sender catalog.
    Classify {
        /// Domain whose live SPF record is classified.
        #[arg(required_unless_present = "record", conflicts_with = "record")]
        domain: Option<String>,
        /// Classify this SPF record text instead of looking one up.
        #[arg(long)]
        record: Option<String>,
    },
}

fn init_logger(verbose: bool, json: bool) {
    let default = if verbose { "mailposture=debug,info" } else { "mailposture=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer.compact()).init();
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to render result: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Engine(e) if e.is_client_error() => ExitCode::from(2),
            CliError::Engine(e) if e.is_retryable() => ExitCode::from(3),
            _ => ExitCode::FAILURE,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).map_err(EngineError::from)?,
        None => EngineConfig::default(),
    };
    let engine: PostureEngine<HickoryResolver> = PostureEngine::from_config(
        config,
        Arc::new(MemoryDomainStore::new()),
        Arc::new(MemoryCatalog::with_builtin()),
    )?;
    // Only global catalog entries exist in a CLI session.
    let org = OrgId::nil();

    match cli.command {
        Command::Lookup {
            domain,
            kind,
            selector,
        } => {
            let kind: RecordKind = kind.parse().map_err(CliError::Engine)?;
            print_json(&engine.lookup_record(&domain, kind, selector.as_deref()).await?)
        }
        Command::Status { domain } => print_json(&engine.domain_status(&domain).await?),
        Command::ResolveInclude { include } => {
            print_json(&engine.resolve_spf_include(&include).await?)
        }
        Command::Classify { domain, record } => {
            let classification = match record {
                Some(record) => engine.classify_record(org, &record).await?,
                None => {
                    let domain = domain.unwrap_or_default();
                    engine.classify_domain(org, &domain).await?
                }
            };
            print_json(&classification)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose, cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}
