use std::collections::BTreeMap;

use crate::backend::{Backend, CloudBackend, CloudProfile, LocalBackend};
use crate::error::HutError;
use crate::orchestrator::{Context, Invocation, InvocationArgs, Outcome, run_artifact};

#[derive(Debug, Clone, Default)]
pub struct RunLocalCmd {
    backend: LocalBackend,
}

impl RunLocalCmd {
    pub fn execute(
        &self,
        ctx: &mut Context<'_>,
        args: &InvocationArgs,
        invocation: &mut Invocation,
    ) -> Result<Outcome, HutError> {
        let backend = Backend::Local(self.backend.clone());
        run_artifact(ctx, args, &backend, invocation)
    }
}

#[derive(Debug, Clone)]
pub struct RunCloudCmd {
    profiles: BTreeMap<String, CloudProfile>,
    default_profile: String,
}

impl RunCloudCmd {
    pub fn new(profiles: BTreeMap<String, CloudProfile>, default_profile: String) -> Self {
        Self {
            profiles,
            default_profile,
        }
    }

    /// `--profile` wins over the configured default.
    pub fn profile(&self, requested: Option<&str>) -> Result<&CloudProfile, HutError> {
        let name = requested.unwrap_or(&self.default_profile);
        self.profiles.get(name).ok_or_else(|| {
            HutError::Config(format!(
                "cloud profile `{name}` is not configured; add a [cloud.{name}] table to the config file"
            ))
        })
    }

    pub fn execute(
        &self,
        ctx: &mut Context<'_>,
        args: &InvocationArgs,
        invocation: &mut Invocation,
    ) -> Result<Outcome, HutError> {
        let profile = self.profile(args.profile.as_deref())?;
        let backend = Backend::Cloud(CloudBackend::new(profile.clone())?);
        run_artifact(ctx, args, &backend, invocation)
    }
}
