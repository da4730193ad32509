//! Container images, sandboxes and isolated script execution.
//!
//! - [`resolver`]: which image a user's code runs in
//! - [`build`]: per-user sandboxes and custom image builds
//! - [`gateway`]: admission-controlled script runs
//! - [`scheduler`]: batch and interactive jobs on a cluster scheduler

pub mod build;
pub mod cgroups;
pub mod error;
pub mod gateway;
pub mod invocation;
pub mod resolver;
pub mod runner;
pub mod scheduler;

pub use {
    build::{PackageManager, SandboxBuildPipeline},
    error::{BuildError, Error, ExecError, Result},
    gateway::{ExecutionGateway, ExecutionRequest, ExecutionResult},
    resolver::{ContainerResolver, ImageScope, WorkspaceLayout},
    runner::{CommandRunner, ProcessRunner},
    scheduler::{JobStatus, SchedulerClient},
};
