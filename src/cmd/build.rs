use hutfile::ArtifactKind;

use crate::error::HutError;
use crate::orchestrator::{Context, Invocation, InvocationArgs, Outcome, build_artifact};

/// `build-stack`: publish a stack artifact and point its ref at it.
#[derive(Debug, Clone, Default)]
pub struct StackBuildCmd;

impl StackBuildCmd {
    pub fn execute(
        &self,
        ctx: &mut Context<'_>,
        args: &InvocationArgs,
        invocation: &mut Invocation,
    ) -> Result<Outcome, HutError> {
        build_artifact(ctx, args, ArtifactKind::Stack, invocation)
    }
}

/// `build-hut`: layer a service on an existing stack.
#[derive(Debug, Clone, Default)]
pub struct HutBuildCmd;

impl HutBuildCmd {
    pub fn execute(
        &self,
        ctx: &mut Context<'_>,
        args: &InvocationArgs,
        invocation: &mut Invocation,
    ) -> Result<Outcome, HutError> {
        build_artifact(ctx, args, ArtifactKind::Hut, invocation)
    }
}
