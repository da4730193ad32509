use std::{path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("base image not found at {}", path.display())]
    BaseImageMissing { path: PathBuf },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Common(#[from] labrun_common::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

impl Error {
    #[must_use]
    pub fn base_image_missing(path: impl Into<PathBuf>) -> Self {
        Self::BaseImageMissing { path: path.into() }
    }
}

impl labrun_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

labrun_common::impl_context!();

/// Failures of the Sandbox Build Pipeline.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("daily build limit reached ({used}/{limit})")]
    RateLimited { used: i64, limit: u32 },

    #[error("user {user_id} already has an open sandbox")]
    AlreadyExists { user_id: u64 },

    #[error("user {user_id} has no open sandbox")]
    NoSandbox { user_id: u64 },

    #[error("storage quota exceeded: {needed} bytes needed, quota is {quota} bytes")]
    TooLarge { needed: u64, quota: u64 },

    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{operation} failed with exit code {code}")]
    CommandFailed {
        operation: &'static str,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BuildError {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Stable machine-readable code for callers that report failures upstream.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::AlreadyExists { .. } => "already_exists",
            Self::NoSandbox { .. } => "no_sandbox",
            Self::TooLarge { .. } => "too_large",
            Self::Timeout { .. } => "timeout",
            Self::CommandFailed { .. } => "command_failed",
            Self::InvalidInput(_) => "invalid_input",
            Self::Io(_) => "io",
        }
    }
}

/// Failures of the Execution Gateway and scheduler client.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("execution capacity reached ({limit} concurrent jobs)")]
    ResourceUnavailable { limit: u32 },

    #[error("script not found: {}", path.display())]
    ScriptNotFound { path: PathBuf },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cluster scheduler is not enabled")]
    SchedulerDisabled,

    #[error("scheduler command {command} failed: {message}")]
    Scheduler { command: String, message: String },

    #[error(transparent)]
    Common(#[from] labrun_common::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ExecError {
    #[must_use]
    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    #[must_use]
    pub fn scheduler(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Scheduler {
            command: command.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        let cases = [
            (BuildError::RateLimited { used: 5, limit: 5 }, "rate_limited"),
            (BuildError::AlreadyExists { user_id: 1 }, "already_exists"),
            (BuildError::NoSandbox { user_id: 1 }, "no_sandbox"),
            (
                BuildError::TooLarge {
                    needed: 2,
                    quota: 1,
                },
                "too_large",
            ),
            (
                BuildError::Timeout {
                    operation: "build",
                    timeout: Duration::from_secs(1),
                },
                "timeout",
            ),
            (BuildError::invalid_input("x"), "invalid_input"),
        ];
        for (err, code) in cases {
            assert_eq!(err.reason(), code, "{err}");
        }
    }

    #[test]
    fn context_wraps_foreign_errors() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::other("disk on fire"));
        let err = res.context("reading image").err();
        assert!(matches!(err, Some(Error::Message(ref m)) if m == "reading image: disk on fire"));
    }
}
