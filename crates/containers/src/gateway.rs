//! Admission-controlled script execution inside isolated containers.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge, histogram};
use {
    labrun_accounting::{AccountingStore, AdmissionGate, UsageRecorder, UsageStats, keys},
    labrun_common::{ProjectRef, UserIdentity},
    labrun_config::LabrunConfig,
    serde::Serialize,
    tracing::{debug, info, warn},
};

use crate::{
    cgroups::ResourceLimits,
    error::ExecError,
    invocation::{BindMode, ContainerInvocation, SCRIPT_MOUNT_DIR, interpreter_for},
    runner::{CommandRunner, CommandSpec},
    scheduler::{BatchOptions, JobState, SchedulerClient, SubmittedJob},
};

type ExecResult<T> = Result<T, ExecError>;

/// Added to the max timeout to get the job slot lease.
const JOB_LEASE_SLACK: Duration = Duration::from_secs(5 * 60);

/// One script run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Absolute, or relative to the project workspace.
    pub script: PathBuf,
    pub args: Vec<String>,
    /// `None` or zero selects the default timeout.
    pub timeout: Option<Duration>,
    /// Mount the project workspace read-write at the workspace mount.
    pub bind_workspace: bool,
    pub capture_output: bool,
}

impl ExecutionRequest {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
            timeout: None,
            bind_workspace: true,
            capture_output: true,
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn bind_workspace(mut self, bind: bool) -> Self {
        self.bind_workspace = bind;
        self
    }

    #[must_use]
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub duration_ms: u64,
    pub success: bool,
    pub timed_out: bool,
    pub image: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub runtime: String,
    pub max_concurrent_jobs: u32,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_output_bytes: usize,
    pub workspace_mount: String,
    pub limits: ResourceLimits,
}

impl ExecSettings {
    pub fn from_config(cfg: &LabrunConfig) -> Self {
        let exec = &cfg.execution;
        Self {
            runtime: cfg.containers.runtime.clone(),
            max_concurrent_jobs: exec.max_concurrent_jobs,
            default_timeout: Duration::from_secs(exec.default_timeout_secs),
            max_timeout: Duration::from_secs(exec.max_timeout_secs),
            max_output_bytes: exec.max_output_bytes,
            workspace_mount: exec.workspace_mount.clone(),
            limits: ResourceLimits::from(&exec.resource_limits),
        }
    }

    /// Unset or zero selects the default; anything else is capped at the max.
    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t.min(self.max_timeout),
            _ => self.default_timeout.min(self.max_timeout),
        }
    }
}

pub struct ExecutionGateway {
    settings: ExecSettings,
    resolver: Arc<crate::resolver::ContainerResolver>,
    gate: AdmissionGate,
    usage: UsageRecorder,
    runner: Arc<dyn CommandRunner>,
    scheduler: Option<Arc<SchedulerClient>>,
}

impl ExecutionGateway {
    pub fn new(
        settings: ExecSettings,
        resolver: Arc<crate::resolver::ContainerResolver>,
        store: Arc<dyn AccountingStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let gate = AdmissionGate::new(
            Arc::clone(&store),
            keys::ACTIVE_JOBS,
            settings.max_concurrent_jobs,
        )
        .with_lease(settings.max_timeout + JOB_LEASE_SLACK);
        Self {
            settings,
            resolver,
            gate,
            usage: UsageRecorder::new(store),
            runner,
            scheduler: None,
        }
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<SchedulerClient>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn settings(&self) -> &ExecSettings {
        &self.settings
    }

    /// Jobs currently holding an execution slot.
    pub fn active_jobs(&self) -> i64 {
        self.gate.in_flight()
    }

    pub fn usage_stats(&self, user: &UserIdentity) -> UsageStats {
        self.usage.stats(user.id)
    }

    /// Run a script in the user's container and wait for it.
    ///
    /// Over-capacity calls are rejected before anything touches the disk.
    /// A run that hits its timeout is a failed result, not an error.
    pub async fn execute(
        &self,
        user: &UserIdentity,
        project: &ProjectRef,
        request: &ExecutionRequest,
    ) -> ExecResult<ExecutionResult> {
        if !self.gate.has_capacity() {
            return Err(self.unavailable());
        }
        let timeout = self.settings.clamp_timeout(request.timeout);
        let workspace = self.ensure_workspace(user, project).await?;
        let script = locate_script(&workspace, &request.script).await?;

        let image = self.resolver.resolve(user, Some(project));
        let (mut invocation, script_in_container) = self.invocation_for(
            &image,
            &workspace,
            &script,
            request.bind_workspace,
        );

        let cgroup_file = match self
            .settings
            .limits
            .write_to(&self.resolver.layout().cgroups_dir())
        {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(error = %e, "resource limits unavailable, running without them");
                None
            },
        };
        if let Some(ref file) = cgroup_file {
            invocation = invocation.apply_cgroups(file.path());
        }

        let mut command: Vec<String> = interpreter_for(&script)
            .map(str::to_string)
            .into_iter()
            .collect();
        command.push(script_in_container);
        command.extend(request.args.iter().cloned());

        let spec = CommandSpec::new(&self.settings.runtime, timeout)
            .args(invocation.exec_args(&command))
            .max_output_bytes(self.settings.max_output_bytes)
            .capture(request.capture_output);

        let permit = self.gate.try_acquire().map_err(|_| self.unavailable())?;
        #[cfg(feature = "metrics")]
        gauge!("labrun_active_jobs").set(self.gate.in_flight() as f64);
        info!(
            user = %user,
            project = %project.slug,
            script = %script.display(),
            image = %image.display(),
            timeout_secs = timeout.as_secs(),
            "executing script"
        );

        let outcome = self.runner.run(&spec).await;
        drop(permit);
        drop(cgroup_file);
        #[cfg(feature = "metrics")]
        gauge!("labrun_active_jobs").set(self.gate.in_flight() as f64);

        let out = match outcome {
            Ok(out) => out,
            Err(e) => {
                self.usage.record(user.id, Duration::ZERO, false, false);
                return Err(ExecError::spawn(&self.settings.runtime, e));
            },
        };

        let success = out.success();
        let return_code = out.exit_code();
        let mut stderr = out.stderr;
        if out.timed_out {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "Execution timed out after {} seconds",
                timeout.as_secs()
            ));
        }
        self.usage
            .record(user.id, out.duration, success, out.timed_out);

        #[cfg(feature = "metrics")]
        {
            let outcome = if out.timed_out {
                "timeout"
            } else if success {
                "success"
            } else {
                "failure"
            };
            counter!("labrun_executions_total", "outcome" => outcome).increment(1);
            histogram!("labrun_execution_duration_seconds").record(out.duration.as_secs_f64());
        }
        debug!(
            user = %user,
            exit_code = return_code,
            timed_out = out.timed_out,
            duration_ms = out.duration.as_millis() as u64,
            "script finished"
        );

        Ok(ExecutionResult {
            stdout: out.stdout,
            stderr,
            return_code,
            duration_ms: u64::try_from(out.duration.as_millis()).unwrap_or(u64::MAX),
            success,
            timed_out: out.timed_out,
            image,
        })
    }

    /// Hand a script to the cluster scheduler instead of running it here.
    pub async fn submit_to_scheduler(
        &self,
        user: &UserIdentity,
        project: &ProjectRef,
        script: &Path,
        opts: &BatchOptions,
    ) -> ExecResult<SubmittedJob> {
        let scheduler = self.scheduler()?;
        let workspace = self.ensure_workspace(user, project).await?;
        let script = locate_script(&workspace, script).await?;
        let image = self.resolver.resolve(user, Some(project));
        let (invocation, script_in_container) =
            self.invocation_for(&image, &workspace, &script, true);

        let mut command: Vec<String> = interpreter_for(&script)
            .map(str::to_string)
            .into_iter()
            .collect();
        command.push(script_in_container);

        let job_name = opts
            .job_name
            .clone()
            .unwrap_or_else(|| format!("labrun-{}-{}", user.username, project.slug));
        scheduler
            .submit(&job_name, &invocation, &command, opts)
            .await
    }

    pub async fn get_scheduler_job_status(&self, job_id: &str) -> ExecResult<JobState> {
        self.scheduler()?.status(job_id).await
    }

    fn scheduler(&self) -> ExecResult<&SchedulerClient> {
        self.scheduler
            .as_deref()
            .filter(|s| s.enabled())
            .ok_or(ExecError::SchedulerDisabled)
    }

    fn unavailable(&self) -> ExecError {
        ExecError::ResourceUnavailable {
            limit: self.settings.max_concurrent_jobs,
        }
    }

    async fn ensure_workspace(&self, user: &UserIdentity, project: &ProjectRef) -> ExecResult<PathBuf> {
        let dir = self
            .resolver
            .layout()
            .project_dir(&user.username, &project.slug);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(tokio::fs::canonicalize(&dir).await?)
    }

    /// Build the isolated invocation and the script's path inside it.
    fn invocation_for(
        &self,
        image: &Path,
        workspace: &Path,
        script: &Path,
        bind_workspace: bool,
    ) -> (ContainerInvocation, String) {
        let mount = self.settings.workspace_mount.as_str();
        let mut invocation = ContainerInvocation::new(&self.settings.runtime, image);
        if bind_workspace {
            invocation = invocation.workspace(workspace, mount);
            if let Ok(rel) = script.strip_prefix(workspace) {
                return (invocation, format!("{mount}/{}", rel.display()));
            }
        }
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".into());
        let target = format!("{SCRIPT_MOUNT_DIR}/{name}");
        (
            invocation.bind(script, target.clone(), BindMode::ReadOnly),
            target,
        )
    }
}

/// Resolve `script` against the workspace and require a regular file.
async fn locate_script(workspace: &Path, script: &Path) -> ExecResult<PathBuf> {
    let candidate = if script.is_absolute() {
        script.to_path_buf()
    } else {
        workspace.join(script)
    };
    let not_found = || ExecError::ScriptNotFound {
        path: candidate.clone(),
    };
    let resolved = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| not_found())?;
    match tokio::fs::metadata(&resolved).await {
        Ok(meta) if meta.is_file() => Ok(resolved),
        _ => Err(not_found()),
    }
}
