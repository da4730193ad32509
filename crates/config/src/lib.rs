//! Configuration loading, validation, and env substitution.
//!
//! Config files: `labrun.toml`, `labrun.yaml`, or `labrun.json`
//! Searched in `./` then `~/.config/labrun/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{config_dir, discover_and_load, find_config_file, load_config, render_toml},
    schema::{
        ContainersConfig, ExecutionConfig, LabrunConfig, PathMapping, ProjectEntry,
        ResourceLimitsConfig, SchedulerConfig, ServerConfig, TerminalConfig, WorkspaceConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate, validate_config},
};
