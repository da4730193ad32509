//! Identity and project references handed in by the hosting platform.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted username or project slug.
const MAX_SEGMENT_LEN: usize = 64;

/// Set on every guest id and never on a platform user id.
pub const GUEST_ID_BIT: u64 = 1 << 63;

/// Whether `id` falls in the range reserved for guests.
pub fn is_guest_id(id: u64) -> bool {
    id & GUEST_ID_BIT != 0
}

/// FNV-1a, so guest ids stay the same across builds and restarts.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

/// Check that `value` is safe to use as a single path segment.
///
/// Usernames and slugs end up in workspace paths, container names and
/// scheduler job names, so anything that could escape the parent directory
/// or needs shell quoting is rejected.
pub fn validate_path_segment(what: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_name(what, value, "must not be empty"));
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(Error::invalid_name(what, value, "too long"));
    }
    if value.starts_with('.') || value.starts_with('-') {
        return Err(Error::invalid_name(
            what,
            value,
            "must not start with '.' or '-'",
        ));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::invalid_name(
            what,
            value,
            "only ASCII letters, digits, '-', '_' and '.' are allowed",
        ));
    }
    Ok(())
}

/// An authenticated platform user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: u64,
    pub username: String,
}

impl UserIdentity {
    /// Build an identity, validating the username for filesystem use.
    pub fn new(id: u64, username: impl Into<String>) -> Result<Self> {
        let username = username.into();
        validate_path_segment("username", &username)?;
        Ok(Self { id, username })
    }

    /// Identity for an anonymous visitor, keyed by their session.
    ///
    /// Visitors get a workspace named after the alphanumeric prefix of the
    /// session key. The id is a hash of that name with [`GUEST_ID_BIT`] set,
    /// so visitors sharing a workspace also share sandboxes and quotas.
    pub fn guest(session_key: &str) -> Result<Self> {
        let short: String = session_key
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(16)
            .collect();
        let username = format!("guest-{short}");
        let id = fnv1a(username.as_bytes()) | GUEST_ID_BIT;
        Self::new(id, username)
    }

    pub fn is_guest(&self) -> bool {
        is_guest_id(self.id)
    }
}

impl std::fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.username, self.id)
    }
}

/// The slice of project metadata the execution subsystem needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: u64,
    pub slug: String,
    pub owner: String,
}

impl ProjectRef {
    pub fn new(id: u64, slug: impl Into<String>, owner: impl Into<String>) -> Result<Self> {
        let slug = slug.into();
        let owner = owner.into();
        validate_path_segment("project slug", &slug)?;
        validate_path_segment("username", &owner)?;
        Ok(Self { id, slug, owner })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        assert!(validate_path_segment("username", "alice").is_ok());
        assert!(validate_path_segment("username", "bob_2.x-y").is_ok());
    }

    #[test]
    fn rejects_traversal_and_shell_characters() {
        for bad in ["", "..", ".hidden", "-rf", "a/b", "a b", "x;rm", "$(id)"] {
            assert!(
                validate_path_segment("username", bad).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_overlong_names() {
        let long = "a".repeat(MAX_SEGMENT_LEN + 1);
        assert!(validate_path_segment("project slug", &long).is_err());
    }

    #[test]
    fn guest_identity_is_sanitized() {
        let guest = UserIdentity::guest("ab/../cd:ef").unwrap();
        assert_eq!(guest.username, "guest-abcdef");
        assert!(guest.is_guest());
    }

    #[test]
    fn guest_ids_are_stable_and_distinct() {
        let a = UserIdentity::guest("sess-abc").unwrap();
        let again = UserIdentity::guest("sess-abc").unwrap();
        let b = UserIdentity::guest("sess-zzz").unwrap();

        assert_eq!(a.id, again.id);
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, 0);
        assert!(is_guest_id(a.id) && is_guest_id(b.id));
        assert_eq!(a.id, fnv1a(b"guest-sessabc") | GUEST_ID_BIT);
    }

    #[test]
    fn platform_ids_are_not_guests() {
        assert!(!UserIdentity::new(7, "alice").unwrap().is_guest());
        assert!(!is_guest_id(u64::from(u32::MAX)));
        assert!(is_guest_id(GUEST_ID_BIT));
    }

    #[test]
    fn display_includes_id() {
        let user = UserIdentity::new(7, "alice").unwrap();
        assert_eq!(user.to_string(), "alice#7");
    }
}
