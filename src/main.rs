use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use stackhut::backend::ConsoleSink;
use stackhut::cli::{Cli, Command, InvocationCli};
use stackhut::config::{self, StackhutConfig};
use stackhut::orchestrator::{InvocationArgs, Orchestrator, Outcome};
use stackhut::{CancellationToken, ContentStore, HutError, Registry, cmd};
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "STACKHUT_LOG";

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli) -> Result<u8> {
    let config = config::load()?;
    let registry = Registry::standard(config.cloud_profiles(), config.default_profile());

    match cli.command {
        Command::Commands => {
            for command in registry.iter() {
                println!("{:<12} {}", command.name(), command.summary());
            }
            Ok(0)
        }
        Command::Inspect(args) => {
            let store = open_store(cli.store, &config)?;
            cmd::inspect::run(&store, &args.target)?;
            Ok(0)
        }
        Command::Config(config_cmd) => {
            cmd::config::run(config_cmd)?;
            Ok(0)
        }
        Command::Registered(raw) => invoke(&registry, &config, cli.store, raw),
    }
}

fn invoke(registry: &Registry, config: &StackhutConfig, store: Option<PathBuf>, raw: Vec<String>) -> Result<u8> {
    let Some((name, rest)) = raw.split_first() else {
        anyhow::bail!("missing command name");
    };

    let (args, store_override) = if registry.lookup(name).is_ok() {
        let parsed = InvocationCli::try_parse_from(rest).unwrap_or_else(|err| err.exit());
        let store_override = parsed.store.clone();
        (parsed.into_args(config.default_timeout()), store_override)
    } else {
        (InvocationArgs::default(), None)
    };

    let store = open_store(store_override.or(store), config)?;
    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("failed to install Ctrl-C handler")?;

    let orchestrator = Orchestrator::new(registry, &store, cancel);
    let report = orchestrator.invoke(name, &args, &mut ConsoleSink);
    match &report.result {
        Ok(Outcome::Built(artifact)) => {
            info!(kind = %artifact.kind, stack = %artifact.stack_ref, "build finished");
            println!("{}", artifact.id);
        }
        Ok(Outcome::Ran(result)) => {
            info!(status = %result.status, exit_code = ?result.exit_code, "run finished");
        }
        Err(HutError::Cancelled) => info!("cancelled before the run started"),
        Err(err) => eprintln!("error: {err}"),
    }
    let code = report.exit_code();
    Ok(u8::try_from(code).unwrap_or(1))
}

fn open_store(path: Option<PathBuf>, config: &StackhutConfig) -> Result<ContentStore> {
    let path = path.unwrap_or_else(|| config.store_path());
    ContentStore::open(&path).with_context(|| format!("failed to open content store at {}", path.display()))
}
