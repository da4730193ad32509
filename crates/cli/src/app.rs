//! Wiring: configuration in, shared services out.

use std::{path::Path, sync::Arc};

use {
    anyhow::{Context, Result, bail},
    clap::Args,
    labrun_accounting::{AccountingStore, BuildLedger, FileStore, MemoryStore},
    labrun_common::{ProjectRef, UserIdentity},
    labrun_config::{LabrunConfig, Severity, validate_config},
    labrun_containers::{
        ContainerResolver, ExecutionGateway, ProcessRunner, SandboxBuildPipeline, SchedulerClient,
        WorkspaceLayout, build::BuildSettings, gateway::ExecSettings, runner::CommandRunner,
    },
    labrun_terminal::{
        StaticProjectDirectory, TerminalService, TerminalSettings, WorkspaceManager,
    },
    tracing::{error, info, warn},
};

/// Load the config from `path`, or discover it in the standard locations.
pub fn load_config(path: Option<&Path>) -> Result<LabrunConfig> {
    match path {
        Some(path) => labrun_config::load_config(path),
        None => Ok(labrun_config::discover_and_load()),
    }
}

/// The user on whose behalf a command runs.
#[derive(Args, Debug, Clone)]
pub struct UserArgs {
    /// Platform user id.
    #[arg(long, env = "LABRUN_USER_ID")]
    pub user_id: u64,
    /// Platform username (used for workspace paths).
    #[arg(long, env = "LABRUN_USERNAME")]
    pub username: String,
}

impl UserArgs {
    pub fn identity(&self) -> Result<UserIdentity> {
        Ok(UserIdentity::new(self.user_id, &self.username)?)
    }
}

/// The project a command runs against.
#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    #[arg(long)]
    pub project_id: u64,
    #[arg(long)]
    pub project: String,
    /// Project owner. Defaults to the acting user.
    #[arg(long)]
    pub owner: Option<String>,
}

impl ProjectArgs {
    pub fn project_ref(&self, user: &UserIdentity) -> Result<ProjectRef> {
        let owner = self.owner.as_deref().unwrap_or(&user.username);
        Ok(ProjectRef::new(self.project_id, &self.project, owner)?)
    }
}

/// Every long-lived service, built once from one config.
pub struct App {
    pub config: LabrunConfig,
    pub store: Arc<dyn AccountingStore>,
    pub resolver: Arc<ContainerResolver>,
    pub pipeline: Arc<SandboxBuildPipeline>,
    pub gateway: Arc<ExecutionGateway>,
    pub scheduler: Arc<SchedulerClient>,
    runner: Arc<dyn CommandRunner>,
}

impl App {
    /// Validate `config` and construct the services.
    ///
    /// Refuses to start on configuration errors or a missing base image.
    pub fn build(config: LabrunConfig) -> Result<Self> {
        let report = validate_config(&config);
        for d in &report.diagnostics {
            match d.severity {
                Severity::Error => error!(path = %d.path, "{}", d.message),
                Severity::Warning => warn!(path = %d.path, "{}", d.message),
            }
        }
        if report.has_errors() {
            bail!(
                "configuration has {} error(s); run `labrun config check` for details",
                report.count(Severity::Error)
            );
        }

        let layout = WorkspaceLayout::from_config(&config);
        let resolver = Arc::new(
            ContainerResolver::new(layout.clone(), &config.containers.base_image)
                .context("cannot start without the base image")?,
        );
        let counters = layout.storage_root().join("accounting").join("counters.json");
        let store: Arc<dyn AccountingStore> = Arc::new(
            FileStore::open(&counters)
                .with_context(|| format!("cannot open counter store {}", counters.display()))?,
        );
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);

        let scheduler = Arc::new(SchedulerClient::new(
            config.scheduler.clone(),
            Arc::clone(&runner),
        ));
        let pipeline = Arc::new(SandboxBuildPipeline::new(
            BuildSettings::from_config(&config.containers),
            layout,
            BuildLedger::new(Arc::clone(&store), config.containers.max_builds_per_day),
            Arc::clone(&runner),
        ));
        let gateway = Arc::new(
            ExecutionGateway::new(
                ExecSettings::from_config(&config),
                Arc::clone(&resolver),
                Arc::clone(&store),
                Arc::clone(&runner),
            )
            .with_scheduler(Arc::clone(&scheduler)),
        );

        info!(
            runtime = %config.containers.runtime,
            base_image = %resolver.base_image().display(),
            scheduler = scheduler.enabled(),
            "services ready"
        );
        Ok(Self {
            config,
            store,
            resolver,
            pipeline,
            gateway,
            scheduler,
            runner,
        })
    }

    /// Terminal sessions live inside the serving process, so their counter
    /// stays in memory rather than in the shared store.
    pub fn terminal_service(&self) -> Result<TerminalService> {
        let projects = StaticProjectDirectory::from_entries(&self.config.projects)?;
        if projects.is_empty() {
            warn!("no [[projects]] configured, every terminal request will be refused");
        }
        let workspaces = WorkspaceManager::new(
            self.resolver.layout().clone(),
            &self.config.workspace.git_email_domain,
            Arc::clone(&self.runner),
        );
        Ok(TerminalService::new(
            TerminalSettings::from_config(&self.config),
            Arc::clone(&self.resolver),
            workspaces,
            Arc::new(projects),
            Arc::new(MemoryStore::new()),
        )
        .with_scheduler(Arc::clone(&self.scheduler)))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> LabrunConfig {
        let mut config = LabrunConfig::default();
        config.workspace.root = dir.join("workspaces");
        config.containers.storage_root = dir.join("storage");
        config.containers.base_image = dir.join("base.sif");
        config
    }

    #[test]
    fn missing_base_image_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let err = App::build(config_in(tmp.path())).err().unwrap();
        assert!(format!("{err:#}").contains("base image not found"));
    }

    #[test]
    fn invalid_config_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_in(tmp.path());
        std::fs::write(&config.containers.base_image, b"sif").unwrap();
        config.execution.default_timeout_secs = config.execution.max_timeout_secs + 1;
        let err = App::build(config).err().unwrap();
        assert!(err.to_string().contains("error(s)"));
    }

    #[test]
    fn builds_with_a_base_image() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        std::fs::write(&config.containers.base_image, b"sif").unwrap();
        let app = App::build(config).unwrap();
        assert_eq!(app.gateway.active_jobs(), 0);
        assert!(app.terminal_service().is_ok());
    }

    /// Container runtime stand-in that only materialises sandbox dirs.
    fn fake_runtime(dir: &Path) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-runtime");
        std::fs::write(
            &path,
            "#!/bin/sh\nif [ \"$1\" = build ] && [ \"$2\" = --sandbox ]; then mkdir -p \"$4\"; fi\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn daily_build_quota_holds_across_invocations() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_in(tmp.path());
        std::fs::write(&config.containers.base_image, b"sif").unwrap();
        config.containers.runtime = fake_runtime(tmp.path()).display().to_string();
        config.containers.max_builds_per_day = 1;
        let user = UserIdentity::new(3, "alice").unwrap();

        let first = App::build(config.clone()).unwrap();
        assert_eq!(first.pipeline.create_sandbox(&user).await.unwrap().builds_today, 1);
        first.pipeline.delete_custom_container(&user).await.unwrap();
        drop(first);

        let second = App::build(config).unwrap();
        let err = second.pipeline.create_sandbox(&user).await.unwrap_err();
        assert_eq!(err.reason(), "rate_limited");
        assert!(!second.pipeline.sandbox_status(&user));
    }

    #[test]
    fn job_slots_are_shared_between_apps() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        std::fs::write(&config.containers.base_image, b"sif").unwrap();

        let first = App::build(config.clone()).unwrap();
        let second = App::build(config).unwrap();
        first.store.incr(labrun_accounting::keys::ACTIVE_JOBS, 2, None);
        assert_eq!(second.gateway.active_jobs(), 2);
    }

    #[test]
    fn project_owner_defaults_to_user() {
        let user = UserIdentity::new(3, "alice").unwrap();
        let args = ProjectArgs {
            project_id: 9,
            project: "thesis".into(),
            owner: None,
        };
        assert_eq!(args.project_ref(&user).unwrap().owner, "alice");
    }
}
