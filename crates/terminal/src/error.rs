use thiserror::Error;

/// WebSocket close code for requests refused by policy.
pub const CLOSE_POLICY: u16 = 1008;
/// WebSocket close code for server-side failures.
pub const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Error)]
pub enum Error {
    #[error("missing identity headers")]
    Unauthenticated,

    #[error("invalid project id")]
    InvalidProject,

    #[error("project {0} not found")]
    ProjectNotFound(u64),

    #[error("access to project {project_id} denied")]
    AccessDenied { project_id: u64 },

    #[error("terminal capacity reached")]
    Admission(#[from] labrun_accounting::Error),

    #[error("failed to prepare workspace: {0}")]
    Workspace(String),

    #[error("failed to start terminal: {0}")]
    Spawn(String),

    #[error("terminal I/O failed: {0}")]
    Pty(String),

    #[error(transparent)]
    Common(#[from] labrun_common::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn workspace(message: impl std::fmt::Display) -> Self {
        Self::Workspace(message.to_string())
    }

    #[must_use]
    pub fn spawn(message: impl std::fmt::Display) -> Self {
        Self::Spawn(message.to_string())
    }

    #[must_use]
    pub fn pty(message: impl std::fmt::Display) -> Self {
        Self::Pty(message.to_string())
    }

    /// Close code sent to the client when this error ends a session.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Unauthenticated
            | Self::InvalidProject
            | Self::ProjectNotFound(_)
            | Self::AccessDenied { .. }
            | Self::Admission(_)
            | Self::Common(labrun_common::Error::InvalidName { .. }) => CLOSE_POLICY,
            _ => CLOSE_INTERNAL,
        }
    }

    /// Short reason for the close frame. Internal failures are not detailed
    /// to the client.
    pub fn close_reason(&self) -> String {
        match self.close_code() {
            CLOSE_POLICY => self.to_string(),
            _ => match self {
                Self::Workspace(_) => "workspace unavailable".into(),
                Self::Spawn(_) => "terminal failed to start".into(),
                _ => "internal error".into(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
