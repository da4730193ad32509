//! Interactive terminals over WebSocket.
//!
//! A connection to `/ws/terminal?project=<id>` is checked against the
//! project's access list, admitted against the global session cap, gets its
//! workspace prepared and a shell started in the user's container. Bytes
//! are then pumped both ways until either side goes away.

pub mod access;
pub mod error;
pub mod pty;
pub mod server;
pub mod session;
pub mod strategy;
pub mod workspace;

pub use {
    access::{Caller, ProjectDirectory, ProjectRecord, StaticProjectDirectory},
    error::{Error, Result},
    server::{build_router, serve},
    session::{TerminalService, TerminalSettings},
    strategy::SpawnStrategy,
    workspace::WorkspaceManager,
};
