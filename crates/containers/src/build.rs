//! Per-user sandbox lifecycle and custom image builds.
//!
//! A user moves through `NoSandbox -> SandboxOpen -> (Finalized | Deleted)`.
//! Every mutating operation for one user runs under an in-process async
//! mutex and an advisory file lock, so two requests (or two server
//! processes) never interleave their check-and-create steps.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use {
    dashmap::DashMap,
    labrun_accounting::BuildLedger,
    labrun_common::UserIdentity,
    labrun_config::ContainersConfig,
    serde::Serialize,
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

use crate::{
    error::BuildError,
    resolver::WorkspaceLayout,
    runner::{CommandOutput, CommandRunner, CommandSpec},
};

type BuildResult<T> = Result<T, BuildError>;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_PACKAGE_NAME_LEN: usize = 200;

/// Package managers available inside a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Pip,
    Apt,
    Conda,
}

impl PackageManager {
    /// Commands run inside the writable sandbox, in order.
    fn commands(self, packages: &[String]) -> Vec<Vec<String>> {
        let with = |prefix: &[&str]| {
            prefix
                .iter()
                .map(|s| (*s).to_string())
                .chain(packages.iter().cloned())
                .collect::<Vec<_>>()
        };
        match self {
            Self::Pip => vec![with(&["pip", "install", "--no-cache-dir"])],
            Self::Apt => vec![
                vec!["apt-get".to_string(), "update".to_string()],
                with(&["apt-get", "install", "-y", "--no-install-recommends"]),
            ],
            Self::Conda => vec![with(&["conda", "install", "-y"])],
        }
    }
}

impl FromStr for PackageManager {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pip" => Ok(Self::Pip),
            "apt" => Ok(Self::Apt),
            "conda" => Ok(Self::Conda),
            other => Err(BuildError::invalid_input(format!(
                "unsupported package manager '{other}' (expected pip, apt or conda)"
            ))),
        }
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pip => "pip",
            Self::Apt => "apt",
            Self::Conda => "conda",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub runtime: String,
    pub base_image: PathBuf,
    pub max_build_time: Duration,
    pub quota_bytes: u64,
}

impl BuildSettings {
    pub fn from_config(cfg: &ContainersConfig) -> Self {
        Self {
            runtime: cfg.runtime.clone(),
            base_image: cfg.base_image.clone(),
            max_build_time: Duration::from_secs(cfg.max_build_time_secs),
            quota_bytes: cfg.quota_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxCreated {
    pub path: PathBuf,
    pub builds_today: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub manager: PackageManager,
    pub packages: Vec<String>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageBuilt {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub removed_image: bool,
    pub removed_sandbox: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub image_bytes: u64,
    pub sandbox_bytes: u64,
    pub total_bytes: u64,
    pub quota_bytes: u64,
    pub quota_used_percent: f64,
    pub sandbox_open: bool,
    pub builds_today: i64,
    pub max_builds_per_day: u32,
}

pub struct SandboxBuildPipeline {
    settings: BuildSettings,
    layout: WorkspaceLayout,
    ledger: BuildLedger,
    runner: Arc<dyn CommandRunner>,
    user_locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl SandboxBuildPipeline {
    pub fn new(
        settings: BuildSettings,
        layout: WorkspaceLayout,
        ledger: BuildLedger,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            settings,
            layout,
            ledger,
            runner,
            user_locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Whether `user` currently has an open sandbox.
    pub fn sandbox_status(&self, user: &UserIdentity) -> bool {
        self.layout.sandbox_dir(user.id).is_dir()
    }

    /// Create a writable sandbox from the base image.
    pub async fn create_sandbox(&self, user: &UserIdentity) -> BuildResult<SandboxCreated> {
        let result = match self.check_rate_limit(user.id) {
            Ok(()) => self.serialized(user.id, self.create_locked(user)).await,
            Err(e) => Err(e),
        };
        observe("create_sandbox", user, &result);
        result
    }

    /// Install packages into the open sandbox.
    pub async fn install_package(
        &self,
        user: &UserIdentity,
        manager: PackageManager,
        packages: &[String],
    ) -> BuildResult<InstallReport> {
        let result = match validate_packages(packages) {
            Ok(()) => {
                self.serialized(user.id, self.install_locked(user, manager, packages))
                    .await
            },
            Err(e) => Err(e),
        };
        observe("install_package", user, &result);
        result
    }

    /// Freeze the open sandbox into the user's custom image.
    ///
    /// The sandbox is removed only when the new image is in place; on every
    /// failure it stays open so the user can fix it and retry.
    pub async fn finalize_sandbox(&self, user: &UserIdentity) -> BuildResult<ImageBuilt> {
        let result = self.serialized(user.id, self.finalize_locked(user)).await;
        observe("finalize_sandbox", user, &result);
        result
    }

    /// Build the user's custom image straight from a definition file.
    pub async fn build_from_definition(
        &self,
        user: &UserIdentity,
        definition: &str,
    ) -> BuildResult<ImageBuilt> {
        let result = match validate_definition(definition).and_then(|()| self.check_rate_limit(user.id)) {
            Ok(()) => {
                self.serialized(user.id, self.definition_locked(user, definition))
                    .await
            },
            Err(e) => Err(e),
        };
        observe("build_from_definition", user, &result);
        result
    }

    /// Remove the custom image and any open sandbox. Safe to repeat.
    pub async fn delete_custom_container(&self, user: &UserIdentity) -> BuildResult<DeleteReport> {
        let image = self.layout.user_image(&user.username);
        let sandbox = self.layout.sandbox_dir(user.id);
        let result = self
            .serialized(user.id, async {
                Ok::<_, BuildError>(DeleteReport {
                    removed_image: remove_path(&image).await?,
                    removed_sandbox: remove_path(&sandbox).await?,
                })
            })
            .await;
        observe("delete_custom_container", user, &result);
        result
    }

    pub async fn get_stats(&self, user: &UserIdentity) -> BuildResult<StorageStats> {
        let image_bytes = file_size(&self.layout.user_image(&user.username)).await;
        let sandbox = self.layout.sandbox_dir(user.id);
        let sandbox_open = sandbox.is_dir();
        let sandbox_bytes = if sandbox_open {
            dir_size(&sandbox).await?
        } else {
            0
        };
        let total_bytes = image_bytes.saturating_add(sandbox_bytes);
        let quota_bytes = self.settings.quota_bytes;
        let quota_used_percent = if quota_bytes == 0 {
            100.0
        } else {
            (total_bytes as f64 / quota_bytes as f64 * 1000.0).round() / 10.0
        };
        Ok(StorageStats {
            image_bytes,
            sandbox_bytes,
            total_bytes,
            quota_bytes,
            quota_used_percent,
            sandbox_open,
            builds_today: self.ledger.count_today(user.id),
            max_builds_per_day: self.ledger.max_per_day(),
        })
    }

    async fn create_locked(&self, user: &UserIdentity) -> BuildResult<SandboxCreated> {
        self.check_rate_limit(user.id)?;
        let dest = self.layout.sandbox_dir(user.id);
        if dest.exists() {
            return Err(BuildError::AlreadyExists { user_id: user.id });
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(user = %user, path = %dest.display(), "creating sandbox");
        let spec = self
            .runtime_command()
            .args(["build", "--sandbox", "--fakeroot"])
            .arg(path_arg(&dest))
            .arg(path_arg(&self.settings.base_image));
        if let Err(e) = self.run_checked("sandbox build", &spec).await {
            discard(&dest).await;
            return Err(e);
        }

        let builds_today = self.ledger.record_build(user.id);
        Ok(SandboxCreated {
            path: dest,
            builds_today,
        })
    }

    async fn install_locked(
        &self,
        user: &UserIdentity,
        manager: PackageManager,
        packages: &[String],
    ) -> BuildResult<InstallReport> {
        let sandbox = self.require_sandbox(user.id)?;
        info!(user = %user, %manager, count = packages.len(), "installing packages");

        let mut stdout = String::new();
        let mut stderr = String::new();
        for command in manager.commands(packages) {
            let spec = self
                .runtime_command()
                .args(["exec", "--fakeroot", "--writable"])
                .arg(path_arg(&sandbox))
                .args(command);
            let out = self.run_checked("package install", &spec).await?;
            stdout.push_str(&out.stdout);
            stderr.push_str(&out.stderr);
        }

        Ok(InstallReport {
            manager,
            packages: packages.to_vec(),
            stdout,
            stderr,
        })
    }

    async fn finalize_locked(&self, user: &UserIdentity) -> BuildResult<ImageBuilt> {
        let sandbox = self.require_sandbox(user.id)?;
        let image = self.layout.user_image(&user.username);

        let sandbox_bytes = dir_size(&sandbox).await?;
        let needed = sandbox_bytes.saturating_add(file_size(&image).await);
        let quota = self.settings.quota_bytes;
        if needed > quota {
            warn!(user = %user, needed, quota, "finalize rejected, over quota");
            return Err(BuildError::TooLarge { needed, quota });
        }

        let container_dir = self.layout.user_container_dir(&user.username);
        tokio::fs::create_dir_all(&container_dir).await?;
        let staging = staging_path(&container_dir, "sif");

        info!(user = %user, sandbox_bytes, "finalizing sandbox");
        let spec = self
            .runtime_command()
            .args(["build", "--fakeroot"])
            .arg(path_arg(&staging))
            .arg(path_arg(&sandbox));
        if let Err(e) = self.run_checked("finalize", &spec).await {
            discard(&staging).await;
            return Err(e);
        }

        let size_bytes = self.install_artifact(&staging, &image).await?;
        if let Err(e) = remove_path(&sandbox).await {
            warn!(user = %user, error = %e, "image finalized but sandbox removal failed");
        }
        Ok(ImageBuilt {
            path: image,
            size_bytes,
        })
    }

    async fn definition_locked(
        &self,
        user: &UserIdentity,
        definition: &str,
    ) -> BuildResult<ImageBuilt> {
        self.check_rate_limit(user.id)?;
        let container_dir = self.layout.user_container_dir(&user.username);
        tokio::fs::create_dir_all(&container_dir).await?;

        let def_path = staging_path(&container_dir, "def");
        tokio::fs::write(&def_path, definition).await?;
        let staging = staging_path(&container_dir, "sif");

        info!(user = %user, "building image from definition");
        let spec = self
            .runtime_command()
            .args(["build", "--fakeroot"])
            .arg(path_arg(&staging))
            .arg(path_arg(&def_path));
        let outcome = self.run_checked("definition build", &spec).await;
        discard(&def_path).await;
        if let Err(e) = outcome {
            discard(&staging).await;
            return Err(e);
        }

        let image = self.layout.user_image(&user.username);
        let size_bytes = self.install_artifact(&staging, &image).await?;
        self.ledger.record_build(user.id);
        Ok(ImageBuilt {
            path: image,
            size_bytes,
        })
    }

    /// Quota-check a freshly built artifact and move it over the live image.
    async fn install_artifact(&self, staging: &Path, image: &Path) -> BuildResult<u64> {
        let size = match tokio::fs::metadata(staging).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                discard(staging).await;
                return Err(e.into());
            },
        };
        let quota = self.settings.quota_bytes;
        if size > quota {
            warn!(path = %staging.display(), size, quota, "built image exceeds quota, discarding");
            discard(staging).await;
            return Err(BuildError::TooLarge {
                needed: size,
                quota,
            });
        }
        if let Err(e) = tokio::fs::rename(staging, image).await {
            discard(staging).await;
            return Err(e.into());
        }
        debug!(path = %image.display(), size, "image installed");
        Ok(size)
    }

    fn check_rate_limit(&self, user_id: u64) -> BuildResult<()> {
        if self.ledger.is_exhausted(user_id) {
            return Err(BuildError::RateLimited {
                used: self.ledger.count_today(user_id),
                limit: self.ledger.max_per_day(),
            });
        }
        Ok(())
    }

    fn require_sandbox(&self, user_id: u64) -> BuildResult<PathBuf> {
        let sandbox = self.layout.sandbox_dir(user_id);
        if sandbox.is_dir() {
            Ok(sandbox)
        } else {
            Err(BuildError::NoSandbox { user_id })
        }
    }

    fn runtime_command(&self) -> CommandSpec {
        CommandSpec::new(&self.settings.runtime, self.settings.max_build_time)
    }

    async fn run_checked(
        &self,
        operation: &'static str,
        spec: &CommandSpec,
    ) -> BuildResult<CommandOutput> {
        let out = self.runner.run(spec).await?;
        if out.timed_out {
            return Err(BuildError::Timeout {
                operation,
                timeout: spec.timeout,
            });
        }
        if !out.success() {
            warn!(operation, exit_code = out.exit_code(), stderr = %out.stderr, "build command failed");
            return Err(BuildError::CommandFailed {
                operation,
                code: out.exit_code(),
                stdout: out.stdout,
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    /// Run `op` while holding both of the user's locks.
    async fn serialized<T>(
        &self,
        user_id: u64,
        op: impl Future<Output = BuildResult<T>>,
    ) -> BuildResult<T> {
        let mutex = Arc::clone(self.user_locks.entry(user_id).or_default().value());
        let _in_process = mutex.lock().await;

        let lock_path = self.layout.lock_file(user_id);
        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        let mut file_lock = fd_lock::RwLock::new(file);
        let _cross_process = loop {
            match file_lock.try_write() {
                Ok(guard) => break guard,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {},
                Err(e) => return Err(e.into()),
            }
            debug!(user_id, "waiting for sandbox lock held by another process");
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        };

        op.await
    }
}

fn observe<T>(operation: &'static str, user: &UserIdentity, result: &BuildResult<T>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.reason(),
    };
    debug!(operation, user = %user, outcome, "build operation finished");
    #[cfg(feature = "metrics")]
    metrics::counter!(
        "labrun_build_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}

/// Reject package lists that are empty or could be read as options.
pub fn validate_packages(packages: &[String]) -> BuildResult<()> {
    if packages.is_empty() {
        return Err(BuildError::invalid_input("no packages given"));
    }
    for name in packages {
        let valid = !name.is_empty()
            && name.len() <= MAX_PACKAGE_NAME_LEN
            && !name.starts_with('-')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "._+=<>~:@/-".contains(c));
        if !valid {
            return Err(BuildError::invalid_input(format!(
                "invalid package name '{name}'"
            )));
        }
    }
    Ok(())
}

/// A definition must be non-empty and declare its bootstrap agent.
pub fn validate_definition(definition: &str) -> BuildResult<()> {
    if definition.trim().is_empty() {
        return Err(BuildError::invalid_input("definition is empty"));
    }
    let has_bootstrap = definition.lines().any(|line| {
        line.trim_start()
            .get(..10)
            .is_some_and(|head| head.eq_ignore_ascii_case("bootstrap:"))
    });
    if !has_bootstrap {
        return Err(BuildError::invalid_input(
            "definition has no 'Bootstrap:' header",
        ));
    }
    Ok(())
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn staging_path(dir: &Path, extension: &str) -> PathBuf {
    dir.join(format!(".staging-{}.{extension}", uuid::Uuid::new_v4()))
}

/// Remove a file or directory tree. Returns whether anything was there.
async fn remove_path(path: &Path) -> std::io::Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(true)
}

/// Best-effort rollback of a partial artifact.
async fn discard(path: &Path) {
    match remove_path(path).await {
        Ok(true) => debug!(path = %path.display(), "removed partial artifact"),
        Ok(false) => {},
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial artifact"),
    }
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map_or(0, |m| m.len())
}

/// Total size of regular files under `path`, without following symlinks.
async fn dir_size(path: &Path) -> std::io::Result<u64> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        walkdir::WalkDir::new(&path)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum::<u64>()
    })
    .await
    .map_err(std::io::Error::other)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::runner::fake::{FakeRunner, ok},
        labrun_accounting::MemoryStore,
        rstest::rstest,
    };

    #[rstest]
    #[case(&["numpy"])]
    #[case(&["numpy==1.26.4", "scipy>=1.11"])]
    #[case(&["r-base", "libxml2-dev"])]
    #[case(&["conda-forge::pandas"])]
    fn accepts_package_names(#[case] names: &[&str]) {
        let names: Vec<String> = names.iter().map(|s| (*s).to_string()).collect();
        assert!(validate_packages(&names).is_ok());
    }

    #[rstest]
    #[case(&[])]
    #[case(&["--index-url=http://evil"])]
    #[case(&["numpy; rm -rf /"])]
    #[case(&["$(id)"])]
    #[case(&[""])]
    fn rejects_package_names(#[case] names: &[&str]) {
        let names: Vec<String> = names.iter().map(|s| (*s).to_string()).collect();
        let err = validate_packages(&names).unwrap_err();
        assert_eq!(err.reason(), "invalid_input");
    }

    #[test]
    fn definition_needs_bootstrap() {
        assert!(validate_definition("Bootstrap: docker\nFrom: ubuntu:22.04\n").is_ok());
        assert!(validate_definition("  bootstrap: localimage\n").is_ok());
        assert!(validate_definition("").is_err());
        assert!(validate_definition("From: ubuntu\n").is_err());
    }

    #[test]
    fn package_manager_parsing() {
        assert_eq!("pip".parse::<PackageManager>().unwrap(), PackageManager::Pip);
        assert_eq!("conda".parse::<PackageManager>().unwrap(), PackageManager::Conda);
        assert!("brew".parse::<PackageManager>().is_err());
    }

    #[test]
    fn apt_updates_before_installing() {
        let cmds = PackageManager::Apt.commands(&["curl".to_string()]);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0], ["apt-get", "update"]);
        assert_eq!(cmds[1].last().map(String::as_str), Some("curl"));
    }

    fn pipeline(dir: &Path, runner: FakeRunner, quota: u64) -> SandboxBuildPipeline {
        let store = Arc::new(MemoryStore::new());
        SandboxBuildPipeline::new(
            BuildSettings {
                runtime: "singularity".into(),
                base_image: dir.join("base.sif"),
                max_build_time: Duration::from_secs(5),
                quota_bytes: quota,
            },
            WorkspaceLayout::new(dir.join("ws"), dir.join("store")),
            BuildLedger::new(store, 5),
            Arc::new(runner),
        )
    }

    #[tokio::test]
    async fn install_runs_inside_writable_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::succeeding("installed");
        let p = pipeline(dir.path(), runner.clone(), 1 << 20);
        let user = UserIdentity::new(4, "dana").unwrap();
        std::fs::create_dir_all(p.layout.sandbox_dir(4)).unwrap();

        let report = p
            .install_package(&user, PackageManager::Pip, &["requests".into()])
            .await
            .unwrap();
        assert_eq!(report.stdout, "installed");

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(&calls[0].args[..3], ["exec", "--fakeroot", "--writable"]);
        assert_eq!(calls[0].args.last().map(String::as_str), Some("requests"));
    }

    #[tokio::test]
    async fn stats_report_sizes_and_percent() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), FakeRunner::new(|_| Ok(ok(""))), 1000);
        let user = UserIdentity::new(5, "erin").unwrap();
        let image = p.layout.user_image("erin");
        std::fs::create_dir_all(image.parent().unwrap()).unwrap();
        std::fs::write(&image, vec![0_u8; 200]).unwrap();
        let sandbox = p.layout.sandbox_dir(5);
        std::fs::create_dir_all(sandbox.join("usr")).unwrap();
        std::fs::write(sandbox.join("usr/lib.so"), vec![0_u8; 50]).unwrap();

        let stats = p.get_stats(&user).await.unwrap();
        assert_eq!(stats.image_bytes, 200);
        assert_eq!(stats.sandbox_bytes, 50);
        assert_eq!(stats.total_bytes, 250);
        assert!((stats.quota_used_percent - 25.0).abs() < f64::EPSILON);
        assert!(stats.sandbox_open);
    }
}
