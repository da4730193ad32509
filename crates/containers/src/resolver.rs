//! Workspace paths and container image selection.

use std::path::{Path, PathBuf};

use {
    labrun_common::{ProjectRef, UserIdentity},
    labrun_config::LabrunConfig,
    serde::Serialize,
    tracing::debug,
};

use crate::error::{Error, Result};

const CONTAINER_DIR: &str = ".container";
const PROJECT_IMAGE: &str = "custom.sif";
const USER_IMAGE: &str = "default.sif";

/// Every host path derived from a user or project.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
    storage_root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            storage_root: storage_root.into(),
        }
    }

    pub fn from_config(config: &LabrunConfig) -> Self {
        Self::new(&config.workspace.root, &config.containers.storage_root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// `{root}/{username}`, also the user's home inside terminals.
    pub fn user_root(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    pub fn projects_dir(&self, username: &str) -> PathBuf {
        self.user_root(username).join("projects")
    }

    pub fn project_dir(&self, username: &str, slug: &str) -> PathBuf {
        self.projects_dir(username).join(slug)
    }

    pub fn user_container_dir(&self, username: &str) -> PathBuf {
        self.user_root(username).join(CONTAINER_DIR)
    }

    /// The user's custom image, produced by the build pipeline.
    pub fn user_image(&self, username: &str) -> PathBuf {
        self.user_container_dir(username).join(USER_IMAGE)
    }

    /// A project-specific image, provisioned outside this crate.
    pub fn project_image(&self, username: &str, slug: &str) -> PathBuf {
        self.project_dir(username, slug)
            .join(CONTAINER_DIR)
            .join(PROJECT_IMAGE)
    }

    pub fn dotfiles_dir(&self, username: &str) -> PathBuf {
        self.projects_dir(username).join("dotfiles")
    }

    pub fn sandbox_dir(&self, user_id: u64) -> PathBuf {
        self.storage_root
            .join("sandboxes")
            .join(format!("user_{user_id}"))
    }

    pub fn lock_file(&self, user_id: u64) -> PathBuf {
        self.storage_root
            .join("locks")
            .join(format!("user_{user_id}.lock"))
    }

    pub fn cgroups_dir(&self) -> PathBuf {
        self.storage_root.join("cgroups")
    }
}

/// Which rung of the priority ladder produced an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageScope {
    Project,
    User,
    Base,
}

impl std::fmt::Display for ImageScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Project => "project",
            Self::User => "user",
            Self::Base => "base",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedImage {
    pub path: PathBuf,
    pub scope: ImageScope,
}

/// Picks the image a user's code runs in.
///
/// Priority: project custom image, then the user's custom image, then the
/// base image. The base image is checked once, at construction.
#[derive(Debug, Clone)]
pub struct ContainerResolver {
    layout: WorkspaceLayout,
    base_image: PathBuf,
}

impl ContainerResolver {
    pub fn new(layout: WorkspaceLayout, base_image: impl Into<PathBuf>) -> Result<Self> {
        let base_image = base_image.into();
        if !base_image.is_file() {
            return Err(Error::base_image_missing(base_image));
        }
        Ok(Self { layout, base_image })
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn base_image(&self) -> &Path {
        &self.base_image
    }

    pub fn resolve(&self, user: &UserIdentity, project: Option<&ProjectRef>) -> PathBuf {
        self.resolve_scoped(user, project).path
    }

    pub fn resolve_scoped(&self, user: &UserIdentity, project: Option<&ProjectRef>) -> ResolvedImage {
        let candidates = project
            .map(|p| {
                (
                    self.layout.project_image(&user.username, &p.slug),
                    ImageScope::Project,
                )
            })
            .into_iter()
            .chain(std::iter::once((
                self.layout.user_image(&user.username),
                ImageScope::User,
            )));

        for (path, scope) in candidates {
            if path.is_file() {
                debug!(user = %user, scope = %scope, path = %path.display(), "resolved container");
                return ResolvedImage { path, scope };
            }
        }

        ResolvedImage {
            path: self.base_image.clone(),
            scope: ImageScope::Base,
        }
    }
}
