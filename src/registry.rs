use std::collections::BTreeMap;

use crate::backend::CloudProfile;
use crate::cmd::build::{HutBuildCmd, StackBuildCmd};
use crate::cmd::run::{RunCloudCmd, RunLocalCmd};
use crate::error::HutError;
use crate::orchestrator::{Context, Invocation, InvocationArgs, Outcome};

/// The closed set of commands the CLI can dispatch to.
#[derive(Debug, Clone)]
pub enum Command {
    RunLocal(RunLocalCmd),
    RunCloud(RunCloudCmd),
    StackBuild(StackBuildCmd),
    HutBuild(HutBuildCmd),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::RunLocal(_) => "run-local",
            Command::RunCloud(_) => "run-cloud",
            Command::StackBuild(_) => "build-stack",
            Command::HutBuild(_) => "build-hut",
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Command::RunLocal(_) => "Build the hut if needed and run it on this machine",
            Command::RunCloud(_) => "Build the hut if needed and run it on the cloud backend",
            Command::StackBuild(_) => "Build a stack and publish it under its stack ref",
            Command::HutBuild(_) => "Build a hut on top of an existing stack",
        }
    }

    pub fn execute(
        &self,
        ctx: &mut Context<'_>,
        args: &InvocationArgs,
        invocation: &mut Invocation,
    ) -> Result<Outcome, HutError> {
        match self {
            Command::RunLocal(cmd) => cmd.execute(ctx, args, invocation),
            Command::RunCloud(cmd) => cmd.execute(ctx, args, invocation),
            Command::StackBuild(cmd) => cmd.execute(ctx, args, invocation),
            Command::HutBuild(cmd) => cmd.execute(ctx, args, invocation),
        }
    }
}

/// Ordered table of commands, built once at start-up.
#[derive(Debug, Clone)]
pub struct Registry {
    commands: Vec<Command>,
}

impl Registry {
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// The standard command set.
    pub fn standard(cloud_profiles: BTreeMap<String, CloudProfile>, default_profile: String) -> Self {
        Self::new(vec![
            Command::RunLocal(RunLocalCmd::default()),
            Command::RunCloud(RunCloudCmd::new(cloud_profiles, default_profile)),
            Command::HutBuild(HutBuildCmd),
            Command::StackBuild(StackBuildCmd),
        ])
    }

    pub fn lookup(&self, name: &str) -> Result<&Command, HutError> {
        self.commands
            .iter()
            .find(|command| command.name() == name)
            .ok_or_else(|| HutError::UnknownCommand {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.commands.iter().map(Command::name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }
}
