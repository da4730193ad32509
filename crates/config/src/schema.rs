/// Config schema types (server, workspace, containers, execution, scheduler, terminal).
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabrunConfig {
    pub server: ServerConfig,
    pub workspace: WorkspaceConfig,
    pub containers: ContainersConfig,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
    pub terminal: TerminalConfig,
    /// Project metadata served to the terminal access check. In a full
    /// deployment the hosting platform provides this; the static list is
    /// enough for a standalone server.
    pub projects: Vec<ProjectEntry>,
}

/// HTTP/WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8765,
        }
    }
}

/// Where per-user workspaces live on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root of all user workspaces: `{root}/{username}/projects/{slug}`.
    pub root: PathBuf,
    /// Domain used for the default git identity written into dotfiles.
    pub git_email_domain: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/srv/labrun/workspaces"),
            git_email_domain: "users.labrun.local".into(),
        }
    }
}

/// Container runtime, image locations, and build limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainersConfig {
    /// Container runtime binary (`singularity` or `apptainer`).
    pub runtime: String,
    /// Deployment-provisioned base image. Must exist at startup.
    pub base_image: PathBuf,
    /// Storage for sandboxes, staging artifacts and cgroup files.
    pub storage_root: PathBuf,
    /// Hard wall-clock limit for build, install and finalize runs.
    pub max_build_time_secs: u64,
    /// Successful builds allowed per user per day.
    pub max_builds_per_day: u32,
    /// Per-user storage quota for sandbox + custom image, in bytes.
    pub quota_bytes: u64,
}

impl Default for ContainersConfig {
    fn default() -> Self {
        Self {
            runtime: "singularity".into(),
            base_image: PathBuf::from("/srv/labrun/images/base.sif"),
            storage_root: PathBuf::from("/srv/labrun/containers"),
            max_build_time_secs: 1800,
            max_builds_per_day: 5,
            quota_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

/// Execution Gateway limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Global cap on in-flight script runs. Further calls are rejected.
    pub max_concurrent_jobs: u32,
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    /// Per-stream output cap before truncation.
    pub max_output_bytes: usize,
    /// Mount point of the user's workspace inside the container.
    pub workspace_mount: String,
    pub resource_limits: ResourceLimitsConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 10,
            default_timeout_secs: 300,
            max_timeout_secs: 3600,
            max_output_bytes: 1024 * 1024,
            workspace_mount: "/workspace".into(),
            resource_limits: ResourceLimitsConfig::default(),
        }
    }
}

/// Values written into the `--apply-cgroups` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitsConfig {
    /// Relative CPU weight (cgroup `cpu.shares`).
    pub cpu_shares: u64,
    /// Memory ceiling in MiB. Swap is capped at the same value.
    pub memory_mb: u64,
    /// Maximum number of processes.
    pub pids_max: u64,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            cpu_shares: 512,
            memory_mb: 4096,
            pids_max: 256,
        }
    }
}

/// Cluster scheduler integration (Slurm-compatible CLI).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether terminal sessions and batch submission may use the scheduler.
    pub enabled: bool,
    pub srun: String,
    pub sbatch: String,
    pub squeue: String,
    pub partition: String,
    /// Wall-clock limit in scheduler syntax (e.g. "02:00:00").
    pub time_limit: String,
    pub cpus_per_task: u32,
    pub mem_gb: u32,
    pub account: Option<String>,
    /// Directory on shared storage where batch logs are written.
    pub log_dir: Option<PathBuf>,
    /// Seconds to wait for `sbatch` / `squeue` before giving up.
    pub command_timeout_secs: u64,
    /// Host-to-cluster path prefix rewrites, applied in order.
    pub path_map: Vec<PathMapping>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            srun: "srun".into(),
            sbatch: "sbatch".into(),
            squeue: "squeue".into(),
            partition: "interactive".into(),
            time_limit: "02:00:00".into(),
            cpus_per_task: 2,
            mem_gb: 4,
            account: None,
            log_dir: None,
            command_timeout_secs: 30,
            path_map: Vec::new(),
        }
    }
}

/// One host path prefix and the path it is visible under on cluster nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub host: PathBuf,
    pub cluster: PathBuf,
}

/// Interactive terminal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Global cap on open terminal sessions. `0` disables the cap.
    pub max_sessions: u32,
    /// Shell used inside containers and for the bare fallback.
    pub shell: String,
    pub default_rows: u16,
    pub default_cols: u16,
    /// Maximum inbound frame size accepted from the client.
    pub max_input_bytes: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            shell: "/bin/bash".into(),
            default_rows: 24,
            default_cols: 80,
            max_input_bytes: 64 * 1024,
        }
    }
}

/// A project as known to the access check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectEntry {
    pub id: u64,
    pub slug: String,
    pub owner: String,
    pub collaborators: Vec<String>,
    /// Anonymous session keys this project has been allocated to.
    pub guest_sessions: Vec<String>,
}
