use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::orchestrator::{InvocationArgs, manifest_or_default};

#[derive(Parser, Debug)]
#[command(name = "stackhut")]
#[command(version)]
#[command(about = "Build stacks and huts, then run them locally or in the cloud")]
#[command(
    after_help = "Registered commands (see `stackhut commands`):\n  run-local, run-cloud, build-hut, build-stack\n\nUsage: stackhut <COMMAND> [MANIFEST] [--env K=V]... [--timeout SECS] [--profile NAME] [--store DIR]"
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Content store directory (default: $STACKHUT_STORE or the config file)
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List registered commands
    Commands,
    /// Print the metadata of an artifact by id or stack ref
    Inspect(InspectArgs),
    /// Manage stackhut configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// A registered command such as run-local or build-stack
    #[command(external_subcommand)]
    Registered(Vec<String>),
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Artifact id or `name@version` stack ref
    pub target: String,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Set a key in the stackhut config (e.g. cloud.default.base_url)
    Set(ConfigSetArgs),
}

#[derive(Args, Debug)]
pub struct ConfigSetArgs {
    /// Config key path (e.g. run.timeout_secs)
    pub key: String,
    /// Value to assign; integers and booleans are stored unquoted
    pub value: String,
    /// Override config file path (default: $XDG_CONFIG_HOME/stackhut/config.toml)
    #[arg(long = "file")]
    pub file: Option<PathBuf>,
}

/// Arguments accepted by every registered command.
#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
pub struct InvocationCli {
    /// Path to the manifest (default: Hutfile.yaml)
    pub manifest: Option<PathBuf>,
    /// Environment variable passed to the service (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,
    /// Stop the run after this many seconds
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,
    /// Cloud profile from the config file
    #[arg(long = "profile")]
    pub profile: Option<String>,
    /// Content store directory
    #[arg(long = "store")]
    pub store: Option<PathBuf>,
}

impl InvocationCli {
    pub fn into_args(self, default_timeout: Option<Duration>) -> InvocationArgs {
        InvocationArgs {
            manifest: manifest_or_default(self.manifest.as_deref()),
            env: self.env.into_iter().collect::<BTreeMap<_, _>>(),
            timeout: self.timeout.map(Duration::from_secs).or(default_timeout),
            profile: self.profile,
        }
    }
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}
