//! Slurm-compatible cluster scheduler client.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    labrun_config::SchedulerConfig,
    serde::Serialize,
    tracing::{debug, info, warn},
};

use crate::{
    error::ExecError,
    invocation::{ContainerInvocation, shell_quote},
    runner::{CommandRunner, CommandSpec},
};

/// Per-submission overrides of the configured resources.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub job_name: Option<String>,
    pub partition: Option<String>,
    pub time_limit: Option<String>,
    pub cpus_per_task: Option<u32>,
    pub mem_gb: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedJob {
    pub job_id: String,
    pub job_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NotFound,
    Unknown,
}

impl JobStatus {
    /// Map a `%T` state. `CANCELLED by <uid>` counts as cancelled.
    pub fn from_state(state: &str) -> Self {
        let word = state.split_whitespace().next().unwrap_or_default();
        match word.to_ascii_uppercase().as_str() {
            "PENDING" | "CONFIGURING" => Self::Pending,
            "RUNNING" => Self::Running,
            "COMPLETING" => Self::Completing,
            "COMPLETED" => Self::Completed,
            "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" => Self::Failed,
            "CANCELLED" | "PREEMPTED" => Self::Cancelled,
            "TIMEOUT" | "DEADLINE" => Self::Timeout,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Unknown => "unknown",
        })
    }
}

/// Normalised `squeue` answer for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobState {
    pub job_id: String,
    pub status: JobStatus,
    pub runtime: Option<String>,
    /// Node list while running, pending reason otherwise.
    pub node: Option<String>,
    pub found: bool,
    pub detail: Option<String>,
}

impl JobState {
    fn not_found(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: JobStatus::NotFound,
            runtime: None,
            node: None,
            found: false,
            detail: None,
        }
    }
}

pub struct SchedulerClient {
    config: SchedulerConfig,
    runner: Arc<dyn CommandRunner>,
}

impl SchedulerClient {
    pub fn new(config: SchedulerConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Rewrite a host path to its cluster-side location (first match wins).
    pub fn translate_path(&self, path: &Path) -> PathBuf {
        for mapping in &self.config.path_map {
            if let Ok(rest) = path.strip_prefix(&mapping.host) {
                return mapping.cluster.join(rest);
            }
        }
        path.to_path_buf()
    }

    /// `--partition`, `--time`, `--cpus-per-task`, `--mem` and `--account`.
    pub fn resource_args(&self, opts: &BatchOptions) -> Vec<String> {
        let cfg = &self.config;
        let mut args = vec![
            format!(
                "--partition={}",
                opts.partition.as_deref().unwrap_or(&cfg.partition)
            ),
            format!(
                "--time={}",
                opts.time_limit.as_deref().unwrap_or(&cfg.time_limit)
            ),
            format!(
                "--cpus-per-task={}",
                opts.cpus_per_task.unwrap_or(cfg.cpus_per_task)
            ),
            format!("--mem={}G", opts.mem_gb.unwrap_or(cfg.mem_gb)),
        ];
        if let Some(ref account) = cfg.account {
            args.push(format!("--account={account}"));
        }
        args
    }

    /// `srun --pty ... <runtime> shell ...` for an interactive session.
    pub fn interactive_command(
        &self,
        job_name: &str,
        invocation: &ContainerInvocation,
        shell: &str,
    ) -> (String, Vec<String>) {
        let invocation = invocation
            .clone()
            .map_host_paths(|p| self.translate_path(p));
        let mut args = vec!["--pty".to_string()];
        args.extend(self.resource_args(&BatchOptions::default()));
        args.push(format!("--job-name={job_name}"));
        args.push(invocation.runtime().to_string());
        args.extend(invocation.shell_args(shell));
        (self.config.srun.clone(), args)
    }

    /// Job script piped to `sbatch`.
    pub fn render_batch_script(
        &self,
        job_name: &str,
        invocation: &ContainerInvocation,
        command: &[String],
        opts: &BatchOptions,
    ) -> String {
        let invocation = invocation
            .clone()
            .map_host_paths(|p| self.translate_path(p));
        let mut script = String::from("#!/bin/bash\n");
        let _ = writeln!(script, "#SBATCH --job-name={job_name}");
        for arg in self.resource_args(opts) {
            let _ = writeln!(script, "#SBATCH {arg}");
        }
        if let Some(ref dir) = self.config.log_dir {
            let dir = self.translate_path(dir);
            let _ = writeln!(script, "#SBATCH --output={}/%x-%j.out", dir.display());
        }
        script.push_str("set -euo pipefail\n");
        let argv: Vec<String> = std::iter::once(invocation.runtime().to_string())
            .chain(invocation.exec_args(command))
            .map(|a| shell_quote(&a))
            .collect();
        let _ = writeln!(script, "exec {}", argv.join(" "));
        script
    }

    pub async fn submit(
        &self,
        job_name: &str,
        invocation: &ContainerInvocation,
        command: &[String],
        opts: &BatchOptions,
    ) -> Result<SubmittedJob, ExecError> {
        if !self.config.enabled {
            return Err(ExecError::SchedulerDisabled);
        }
        let script = self.render_batch_script(job_name, invocation, command, opts);
        debug!(job_name, %script, "submitting batch job");

        let spec = CommandSpec::new(&self.config.sbatch, self.command_timeout()).stdin(script);
        let out = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| ExecError::spawn(&self.config.sbatch, e))?;
        if out.timed_out {
            return Err(ExecError::scheduler(&self.config.sbatch, "timed out"));
        }
        if !out.success() {
            return Err(ExecError::scheduler(
                &self.config.sbatch,
                out.stderr.trim().to_string(),
            ));
        }
        let job_id = parse_job_id(&out.stdout).ok_or_else(|| {
            ExecError::scheduler(
                &self.config.sbatch,
                format!("unexpected output: {}", out.stdout.trim()),
            )
        })?;
        info!(job_id, job_name, "batch job submitted");
        Ok(SubmittedJob {
            job_id,
            job_name: job_name.to_string(),
        })
    }

    /// Poll one job. Unknown jobs and a slow `squeue` are states, not errors.
    pub async fn status(&self, job_id: &str) -> Result<JobState, ExecError> {
        if !self.config.enabled {
            return Err(ExecError::SchedulerDisabled);
        }
        if job_id.is_empty() || !job_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(ExecError::scheduler(
                &self.config.squeue,
                format!("invalid job id '{job_id}'"),
            ));
        }

        let spec = CommandSpec::new(&self.config.squeue, self.command_timeout())
            .args(["-j", job_id, "-h", "-o", "%T,%M,%R"]);
        let out = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| ExecError::spawn(&self.config.squeue, e))?;

        if out.timed_out {
            warn!(job_id, "squeue timed out");
            return Ok(JobState {
                status: JobStatus::Unknown,
                detail: Some("squeue timed out".into()),
                ..JobState::not_found(job_id)
            });
        }
        if !out.success() {
            if out.stderr.to_ascii_lowercase().contains("invalid job id") {
                return Ok(JobState::not_found(job_id));
            }
            return Err(ExecError::scheduler(
                &self.config.squeue,
                out.stderr.trim().to_string(),
            ));
        }

        Ok(out
            .stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .map_or_else(|| JobState::not_found(job_id), |line| parse_squeue_line(job_id, line)))
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }
}

/// Job id from `sbatch` output: the last token, e.g. `Submitted batch job 4242`.
pub fn parse_job_id(output: &str) -> Option<String> {
    let token = output.split_whitespace().last()?;
    let id = token.split(';').next().unwrap_or(token);
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Parse one `%T,%M,%R` line.
pub fn parse_squeue_line(job_id: &str, line: &str) -> JobState {
    let mut fields = line.trim().splitn(3, ',');
    let state = fields.next().unwrap_or_default();
    let non_empty = |s: Option<&str>| {
        s.map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    JobState {
        job_id: job_id.to_string(),
        status: JobStatus::from_state(state),
        runtime: non_empty(fields.next()),
        node: non_empty(fields.next()),
        found: true,
        detail: None,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::runner::{CommandOutput, fake::{FakeRunner, ok}},
        labrun_config::PathMapping,
        rstest::rstest,
    };

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            enabled: true,
            account: Some("lab42".into()),
            log_dir: Some("/srv/labrun/logs".into()),
            path_map: vec![PathMapping {
                host: "/srv/labrun".into(),
                cluster: "/cluster/labrun".into(),
            }],
            ..Default::default()
        }
    }

    fn invocation() -> ContainerInvocation {
        ContainerInvocation::new("singularity", "/srv/labrun/images/base.sif")
            .workspace("/srv/labrun/ws/alice/projects/p", "/workspace")
    }

    #[rstest]
    #[case("Submitted batch job 4242\n", Some("4242"))]
    #[case("4242;cluster-a", Some("4242"))]
    #[case("sbatch: error: something", None)]
    #[case("", None)]
    fn job_id_parsing(#[case] output: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_job_id(output).as_deref(), expected);
    }

    #[rstest]
    #[case("RUNNING,1:02,node07", JobStatus::Running, Some("node07"))]
    #[case("PENDING,0:00,(Priority)", JobStatus::Pending, Some("(Priority)"))]
    #[case("CANCELLED by 1000,0:10,", JobStatus::Cancelled, None)]
    #[case("WEIRD,0:00,x", JobStatus::Unknown, Some("x"))]
    fn squeue_line_parsing(
        #[case] line: &str,
        #[case] status: JobStatus,
        #[case] node: Option<&str>,
    ) {
        let state = parse_squeue_line("9", line);
        assert_eq!(state.status, status);
        assert_eq!(state.node.as_deref(), node);
        assert!(state.found);
    }

    #[test]
    fn batch_script_translates_paths() {
        let client = SchedulerClient::new(config(), Arc::new(FakeRunner::succeeding("")));
        let script = client.render_batch_script(
            "labrun-alice-p",
            &invocation(),
            &["python3".into(), "/workspace/run me.py".into()],
            &BatchOptions {
                mem_gb: Some(16),
                ..Default::default()
            },
        );
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --partition=interactive\n"));
        assert!(script.contains("#SBATCH --mem=16G\n"));
        assert!(script.contains("#SBATCH --account=lab42\n"));
        assert!(script.contains("#SBATCH --output=/cluster/labrun/logs/%x-%j.out\n"));
        assert!(script.contains("/cluster/labrun/ws/alice/projects/p:/workspace:rw"));
        assert!(script.contains("/cluster/labrun/images/base.sif"));
        assert!(script.contains("'/workspace/run me.py'"));
        assert!(!script.contains("/srv/labrun/images"));
    }

    #[test]
    fn interactive_command_wraps_runtime_shell() {
        let client = SchedulerClient::new(config(), Arc::new(FakeRunner::succeeding("")));
        let (program, args) = client.interactive_command("term-1", &invocation(), "/bin/bash");
        assert_eq!(program, "srun");
        assert_eq!(args[0], "--pty");
        let runtime_at = args.iter().position(|a| a == "singularity").unwrap();
        assert_eq!(args[runtime_at + 1], "shell");
        assert_eq!(args.last().unwrap(), "/cluster/labrun/images/base.sif");
    }

    #[tokio::test]
    async fn submit_pipes_script_and_parses_id() {
        let runner = FakeRunner::succeeding("Submitted batch job 777\n");
        let client = SchedulerClient::new(config(), Arc::new(runner.clone()));
        let job = client
            .submit("j", &invocation(), &["bash".into()], &BatchOptions::default())
            .await
            .unwrap();
        assert_eq!(job.job_id, "777");
        let calls = runner.calls();
        assert_eq!(calls[0].program, "sbatch");
        assert!(calls[0].stdin.as_deref().unwrap().contains("#SBATCH --job-name=j"));
    }

    #[tokio::test]
    async fn disabled_scheduler_refuses() {
        let client = SchedulerClient::new(SchedulerConfig::default(), Arc::new(FakeRunner::succeeding("")));
        let err = client
            .submit("j", &invocation(), &[], &BatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SchedulerDisabled));
    }

    #[tokio::test]
    async fn status_reports_missing_and_slow_jobs() {
        let empty = SchedulerClient::new(config(), Arc::new(FakeRunner::succeeding("")));
        let state = empty.status("12").await.unwrap();
        assert_eq!(state.status, JobStatus::NotFound);
        assert!(!state.found);

        let invalid = SchedulerClient::new(
            config(),
            Arc::new(FakeRunner::new(|_| {
                Ok(CommandOutput {
                    code: Some(1),
                    stderr: "slurm_load_jobs error: Invalid job id specified".into(),
                    ..Default::default()
                })
            })),
        );
        assert_eq!(invalid.status("12").await.unwrap().status, JobStatus::NotFound);

        let slow = SchedulerClient::new(
            config(),
            Arc::new(FakeRunner::new(|_| {
                Ok(CommandOutput {
                    timed_out: true,
                    ..Default::default()
                })
            })),
        );
        let state = slow.status("12").await.unwrap();
        assert_eq!(state.status, JobStatus::Unknown);
        assert!(!state.found);
        assert!(state.detail.is_some());

        let running = SchedulerClient::new(config(), Arc::new(FakeRunner::new(|_| Ok(ok("RUNNING,5:00,gpu01\n")))));
        let state = running.status("12").await.unwrap();
        assert_eq!(state.status, JobStatus::Running);
        assert_eq!(state.runtime.as_deref(), Some("5:00"));
    }

    #[tokio::test]
    async fn status_rejects_non_numeric_ids() {
        let runner = FakeRunner::succeeding("");
        let client = SchedulerClient::new(config(), Arc::new(runner.clone()));
        assert!(client.status("1; rm -rf /").await.is_err());
        assert!(runner.calls().is_empty());
    }
}
