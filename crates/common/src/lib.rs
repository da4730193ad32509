//! Shared types and error definitions used across all labrun crates.

pub mod error;
pub mod types;

pub use {
    error::{Error, FromMessage, Result},
    types::{GUEST_ID_BIT, ProjectRef, UserIdentity, is_guest_id, validate_path_segment},
};
