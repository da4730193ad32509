//! How a terminal's shell is started.
//!
//! The strategy is picked once per session from what the host offers.
//! A spawn that fails is reported to the client; it never falls through
//! to the next tier.

use std::path::{Path, PathBuf};

use {
    labrun_containers::{SchedulerClient, invocation::ContainerInvocation},
    portable_pty::CommandBuilder,
    serde::Serialize,
    tracing::{debug, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnStrategy {
    /// Interactive scheduler job wrapping a container shell.
    Scheduler,
    /// Container shell on this host.
    DirectContainer,
    /// Login shell without isolation. Development only.
    BareShell,
}

impl std::fmt::Display for SpawnStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Scheduler => "scheduler",
            Self::DirectContainer => "direct_container",
            Self::BareShell => "bare_shell",
        })
    }
}

/// Probe the environment and pick the highest available tier.
pub fn select_strategy(
    runtime: &str,
    image: &Path,
    scheduler: Option<&SchedulerClient>,
) -> SpawnStrategy {
    let runtime_found = which::which(runtime).is_ok();
    let image_found = image.is_file();

    if let Some(scheduler) = scheduler
        && scheduler.enabled()
        && which::which(&scheduler.config().srun).is_ok()
    {
        return SpawnStrategy::Scheduler;
    }
    if runtime_found && image_found {
        return SpawnStrategy::DirectContainer;
    }
    warn!(
        runtime,
        runtime_found,
        image = %image.display(),
        image_found,
        "no container runtime available, terminal falls back to an unisolated shell (development only)"
    );
    SpawnStrategy::BareShell
}

/// Everything needed to build the child command.
#[derive(Debug, Clone)]
pub struct SpawnContext<'a> {
    pub runtime: &'a str,
    pub image: &'a Path,
    pub project_dir: &'a Path,
    /// `HOME` for unisolated shells.
    pub user_root: &'a Path,
    pub workspace_mount: &'a str,
    pub shell: &'a str,
    pub job_name: String,
}

/// A resolved child command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPlan {
    pub strategy: SpawnStrategy,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub home: PathBuf,
}

impl SpawnPlan {
    pub fn build(
        strategy: SpawnStrategy,
        ctx: &SpawnContext<'_>,
        scheduler: Option<&SchedulerClient>,
    ) -> Self {
        let invocation = || {
            ContainerInvocation::new(ctx.runtime, ctx.image)
                .workspace(ctx.project_dir, ctx.workspace_mount)
        };
        let (program, args) = match (strategy, scheduler) {
            (SpawnStrategy::Scheduler, Some(scheduler)) => {
                scheduler.interactive_command(&ctx.job_name, &invocation(), ctx.shell)
            },
            (SpawnStrategy::Scheduler, None) | (SpawnStrategy::DirectContainer, _) => {
                (ctx.runtime.to_string(), invocation().shell_args(ctx.shell))
            },
            (SpawnStrategy::BareShell, _) => (ctx.shell.to_string(), vec!["-l".to_string()]),
        };
        let plan = Self {
            strategy,
            program,
            args,
            cwd: ctx.project_dir.to_path_buf(),
            home: ctx.user_root.to_path_buf(),
        };
        debug!(strategy = %plan.strategy, command = %plan.display(), "spawn plan");
        plan
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        cmd.cwd(&self.cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        if self.strategy == SpawnStrategy::BareShell {
            cmd.env("HOME", &self.home);
        }
        cmd
    }
}
