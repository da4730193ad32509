//! Semantic validation of a loaded configuration.
//!
//! Parsing already rejects type errors; this pass catches values that parse
//! fine but cannot work together (timeouts inverted, zero caps, relative
//! paths handed to the container runtime).

use std::path::{Path, PathBuf};

use crate::schema::LabrunConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "execution.max_timeout_secs"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Load the config at `path` (or the discovered one) and validate it.
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = path
        .map(Path::to_path_buf)
        .or_else(crate::loader::find_config_file);

    let Some(actual_path) = config_path else {
        let mut result = validate_config(&LabrunConfig::default());
        result.push(
            Severity::Warning,
            "",
            "no config file found; using defaults",
        );
        return result;
    };

    match crate::loader::load_config(&actual_path) {
        Ok(cfg) => {
            let mut result = validate_config(&cfg);
            result.config_path = Some(actual_path);
            result
        },
        Err(e) => {
            let mut result = ValidationResult {
                config_path: Some(actual_path),
                ..Default::default()
            };
            result.push(Severity::Error, "", e.to_string());
            result
        },
    }
}

/// Check cross-field constraints of an already parsed config.
#[must_use]
pub fn validate_config(cfg: &LabrunConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if cfg.containers.runtime.trim().is_empty() {
        result.push(Severity::Error, "containers.runtime", "must not be empty");
    }
    for (path, value) in [
        ("containers.base_image", &cfg.containers.base_image),
        ("containers.storage_root", &cfg.containers.storage_root),
        ("workspace.root", &cfg.workspace.root),
    ] {
        if !value.is_absolute() {
            result.push(
                Severity::Error,
                path,
                format!("must be an absolute path, got {}", value.display()),
            );
        }
    }
    if cfg.containers.max_build_time_secs == 0 {
        result.push(
            Severity::Error,
            "containers.max_build_time_secs",
            "must be greater than zero",
        );
    }
    if cfg.containers.max_builds_per_day == 0 {
        result.push(
            Severity::Warning,
            "containers.max_builds_per_day",
            "is zero; every build will be rate limited",
        );
    }
    if cfg.containers.quota_bytes == 0 {
        result.push(
            Severity::Warning,
            "containers.quota_bytes",
            "is zero; every finalize will be rejected",
        );
    }

    let exec = &cfg.execution;
    if exec.max_concurrent_jobs == 0 {
        result.push(
            Severity::Warning,
            "execution.max_concurrent_jobs",
            "is zero; every execution will be rejected",
        );
    }
    if exec.default_timeout_secs > exec.max_timeout_secs {
        result.push(
            Severity::Error,
            "execution.default_timeout_secs",
            format!(
                "default timeout {}s exceeds max timeout {}s",
                exec.default_timeout_secs, exec.max_timeout_secs
            ),
        );
    }
    if !exec.workspace_mount.starts_with('/') {
        result.push(
            Severity::Error,
            "execution.workspace_mount",
            "must be an absolute in-container path",
        );
    }
    if exec.resource_limits.memory_mb == 0 || exec.resource_limits.pids_max == 0 {
        result.push(
            Severity::Error,
            "execution.resource_limits",
            "memory_mb and pids_max must be greater than zero",
        );
    }

    if cfg.scheduler.enabled && cfg.scheduler.partition.trim().is_empty() {
        result.push(
            Severity::Error,
            "scheduler.partition",
            "must be set when the scheduler is enabled",
        );
    }
    for (i, mapping) in cfg.scheduler.path_map.iter().enumerate() {
        if !mapping.host.is_absolute() || !mapping.cluster.is_absolute() {
            result.push(
                Severity::Error,
                &format!("scheduler.path_map[{i}]"),
                "host and cluster prefixes must be absolute",
            );
        }
    }

    if cfg.terminal.default_rows == 0 || cfg.terminal.default_cols == 0 {
        result.push(
            Severity::Error,
            "terminal",
            "default_rows and default_cols must be greater than zero",
        );
    }

    let mut seen = std::collections::HashSet::new();
    for (i, project) in cfg.projects.iter().enumerate() {
        if !seen.insert(project.id) {
            result.push(
                Severity::Error,
                &format!("projects[{i}].id"),
                format!("duplicate project id {}", project.id),
            );
        }
        if let Err(e) = labrun_common::validate_path_segment("project slug", &project.slug) {
            result.push(Severity::Error, &format!("projects[{i}].slug"), e.to_string());
        }
        if let Err(e) = labrun_common::validate_path_segment("username", &project.owner) {
            result.push(
                Severity::Error,
                &format!("projects[{i}].owner"),
                e.to_string(),
            );
        }
    }

    result
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PathMapping, ProjectEntry};

    #[test]
    fn defaults_are_valid() {
        let result = validate_config(&LabrunConfig::default());
        assert!(!result.has_errors(), "{:?}", result.diagnostics);
    }

    #[test]
    fn inverted_timeouts_are_an_error() {
        let mut cfg = LabrunConfig::default();
        cfg.execution.default_timeout_secs = 100;
        cfg.execution.max_timeout_secs = 10;
        let result = validate_config(&cfg);
        assert!(result.has_errors());
        assert!(
            result
                .diagnostics
                .iter()
                .any(|d| d.path == "execution.default_timeout_secs")
        );
    }

    #[test]
    fn relative_paths_are_rejected() {
        let mut cfg = LabrunConfig::default();
        cfg.containers.base_image = "base.sif".into();
        cfg.scheduler.path_map.push(PathMapping {
            host: "srv".into(),
            cluster: "/cluster".into(),
        });
        let result = validate_config(&cfg);
        assert_eq!(result.count(Severity::Error), 2);
    }

    #[test]
    fn zero_job_cap_is_only_a_warning() {
        let mut cfg = LabrunConfig::default();
        cfg.execution.max_concurrent_jobs = 0;
        let result = validate_config(&cfg);
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[test]
    fn duplicate_and_unsafe_projects_are_reported() {
        let mut cfg = LabrunConfig::default();
        cfg.projects = vec![
            ProjectEntry {
                id: 1,
                slug: "alpha".into(),
                owner: "alice".into(),
                ..Default::default()
            },
            ProjectEntry {
                id: 1,
                slug: "../escape".into(),
                owner: "bob".into(),
                ..Default::default()
            },
        ];
        let result = validate_config(&cfg);
        assert_eq!(result.count(Severity::Error), 2);
    }
}
