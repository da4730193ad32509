//! Caller identity and project read access.
//!
//! Authentication happens upstream. The hosting platform forwards the
//! authenticated user in `x-labrun-user-id` / `x-labrun-username`, or an
//! anonymous visitor's session key in `x-labrun-session`.

use std::collections::HashMap;

use {
    async_trait::async_trait,
    axum::http::HeaderMap,
    labrun_common::{ProjectRef, UserIdentity},
    labrun_config::ProjectEntry,
};

use crate::error::{Error, Result};

pub const USER_ID_HEADER: &str = "x-labrun-user-id";
pub const USERNAME_HEADER: &str = "x-labrun-username";
pub const SESSION_HEADER: &str = "x-labrun-session";

/// Who opened the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    User(UserIdentity),
    Guest {
        identity: UserIdentity,
        session_key: String,
    },
}

impl Caller {
    /// Read the caller from forwarded identity headers.
    ///
    /// A user id of `0` or one in the guest range is rejected.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let (Some(id), Some(username)) = (header(USER_ID_HEADER), header(USERNAME_HEADER)) {
            let id: u64 = id.parse().map_err(|_| Error::Unauthenticated)?;
            if id == 0 || labrun_common::is_guest_id(id) {
                return Err(Error::Unauthenticated);
            }
            return Ok(Self::User(UserIdentity::new(id, username)?));
        }
        if let Some(session_key) = header(SESSION_HEADER) {
            return Ok(Self::Guest {
                identity: UserIdentity::guest(session_key)?,
                session_key: session_key.to_string(),
            });
        }
        Err(Error::Unauthenticated)
    }

    pub fn identity(&self) -> &UserIdentity {
        match self {
            Self::User(identity) | Self::Guest { identity, .. } => identity,
        }
    }
}

/// Project metadata needed to decide read access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectRecord {
    pub project: ProjectRef,
    pub collaborators: Vec<String>,
    pub guest_sessions: Vec<String>,
}

impl ProjectRecord {
    pub fn can_read(&self, caller: &Caller) -> bool {
        match caller {
            Caller::User(user) => {
                self.project.owner == user.username
                    || self.collaborators.iter().any(|c| *c == user.username)
            },
            Caller::Guest { session_key, .. } => self.guest_sessions.iter().any(|s| s == session_key),
        }
    }
}

/// Source of project metadata.
#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn project(&self, id: u64) -> Result<Option<ProjectRecord>>;
}

/// Projects listed under `[[projects]]` in the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticProjectDirectory {
    projects: HashMap<u64, ProjectRecord>,
}

impl StaticProjectDirectory {
    pub fn from_entries(entries: &[ProjectEntry]) -> Result<Self> {
        let mut projects = HashMap::with_capacity(entries.len());
        for entry in entries {
            let record = ProjectRecord {
                project: ProjectRef::new(entry.id, &entry.slug, &entry.owner)?,
                collaborators: entry.collaborators.clone(),
                guest_sessions: entry.guest_sessions.clone(),
            };
            projects.insert(entry.id, record);
        }
        Ok(Self { projects })
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

#[async_trait]
impl ProjectDirectory for StaticProjectDirectory {
    async fn project(&self, id: u64) -> Result<Option<ProjectRecord>> {
        Ok(self.projects.get(&id).cloned())
    }
}

/// Resolve the `project` query value to a project the caller may read.
pub async fn authorize(
    directory: &dyn ProjectDirectory,
    caller: &Caller,
    project: Option<&str>,
) -> Result<ProjectRef> {
    let id: u64 = project
        .and_then(|raw| raw.trim().parse().ok())
        .ok_or(Error::InvalidProject)?;
    let record = directory
        .project(id)
        .await?
        .ok_or(Error::ProjectNotFound(id))?;
    if !record.can_read(caller) {
        return Err(Error::AccessDenied { project_id: id });
    }
    Ok(record.project)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, axum::http::HeaderValue, rstest::rstest};

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn directory() -> StaticProjectDirectory {
        StaticProjectDirectory::from_entries(&[ProjectEntry {
            id: 1,
            slug: "thesis".into(),
            owner: "alice".into(),
            collaborators: vec!["bob".into()],
            guest_sessions: vec!["sess-abc".into()],
        }])
        .unwrap()
    }

    #[test]
    fn user_headers_win_over_session() {
        let caller = Caller::from_headers(&headers(&[
            (USER_ID_HEADER, "42"),
            (USERNAME_HEADER, "alice"),
            (SESSION_HEADER, "sess-abc"),
        ]))
        .unwrap();
        assert_eq!(caller, Caller::User(UserIdentity::new(42, "alice").unwrap()));
    }

    #[test]
    fn session_header_yields_guest() {
        let caller = Caller::from_headers(&headers(&[(SESSION_HEADER, "sess-abc")])).unwrap();
        assert!(caller.identity().is_guest());
        assert_eq!(caller.identity().username, "guest-sessabc");
        assert_ne!(caller.identity().id, 0);
    }

    #[rstest]
    #[case(&[])]
    #[case(&[(USER_ID_HEADER, "42")])]
    #[case(&[(USER_ID_HEADER, "abc"), (USERNAME_HEADER, "alice")])]
    #[case(&[(USER_ID_HEADER, "0"), (USERNAME_HEADER, "alice")])]
    #[case(&[(USER_ID_HEADER, "9223372036854775808"), (USERNAME_HEADER, "alice")])]
    fn incomplete_headers_are_rejected(#[case] pairs: &[(&'static str, &str)]) {
        assert!(matches!(
            Caller::from_headers(&headers(pairs)),
            Err(Error::Unauthenticated)
        ));
    }

    #[test]
    fn traversal_in_username_is_rejected() {
        let err = Caller::from_headers(&headers(&[
            (USER_ID_HEADER, "42"),
            (USERNAME_HEADER, "../root"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Common(_)));
    }

    #[rstest]
    #[case("alice", true)]
    #[case("bob", true)]
    #[case("mallory", false)]
    fn user_access(#[case] username: &str, #[case] allowed: bool) {
        let caller = Caller::User(UserIdentity::new(9, username).unwrap());
        let record = ProjectRecord {
            project: ProjectRef::new(1, "thesis", "alice").unwrap(),
            collaborators: vec!["bob".into()],
            guest_sessions: Vec::new(),
        };
        assert_eq!(record.can_read(&caller), allowed);
    }

    #[tokio::test]
    async fn authorize_checks_id_existence_and_access() {
        let dir = directory();
        let owner = Caller::User(UserIdentity::new(5, "alice").unwrap());
        let guest = Caller::Guest {
            identity: UserIdentity::guest("sess-abc").unwrap(),
            session_key: "sess-abc".into(),
        };
        let stranger = Caller::Guest {
            identity: UserIdentity::guest("sess-zzz").unwrap(),
            session_key: "sess-zzz".into(),
        };

        assert_eq!(authorize(&dir, &owner, Some("1")).await.unwrap().slug, "thesis");
        assert!(authorize(&dir, &guest, Some(" 1 ")).await.is_ok());
        assert!(matches!(
            authorize(&dir, &stranger, Some("1")).await,
            Err(Error::AccessDenied { project_id: 1 })
        ));
        assert!(matches!(
            authorize(&dir, &owner, Some("2")).await,
            Err(Error::ProjectNotFound(2))
        ));
        assert!(matches!(
            authorize(&dir, &owner, Some("one")).await,
            Err(Error::InvalidProject)
        ));
        assert!(matches!(
            authorize(&dir, &owner, None).await,
            Err(Error::InvalidProject)
        ));
    }
}
