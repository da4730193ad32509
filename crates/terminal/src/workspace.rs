//! Per-user workspace directories and the starter dotfiles bundle.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    labrun_common::{ProjectRef, UserIdentity},
    labrun_containers::{
        WorkspaceLayout,
        runner::{CommandRunner, CommandSpec},
    },
    tracing::{debug, info, warn},
};

use crate::error::{Error, Result};

const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Files linked from the dotfiles repository into the user's home.
pub const DOTFILES: &[&str] = &[".bashrc", ".profile", ".vimrc", ".gitconfig", ".tmux.conf"];

/// Directories a terminal session runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub user_root: PathBuf,
    pub project_dir: PathBuf,
}

/// Creates workspaces on first use.
pub struct WorkspaceManager {
    layout: WorkspaceLayout,
    git_email_domain: String,
    runner: Arc<dyn CommandRunner>,
}

impl WorkspaceManager {
    pub fn new(
        layout: WorkspaceLayout,
        git_email_domain: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            layout,
            git_email_domain: git_email_domain.into(),
            runner,
        }
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    /// Create the user root, `projects/`, `.container/` and the project
    /// directory. The dotfiles bundle is written once per user; failing to
    /// write it is logged and does not fail the session.
    pub async fn ensure_workspace(
        &self,
        user: &UserIdentity,
        project: &ProjectRef,
    ) -> Result<WorkspacePaths> {
        let user_root = self.layout.user_root(&user.username);
        let project_dir = self.layout.project_dir(&user.username, &project.slug);
        for dir in [
            self.layout.projects_dir(&user.username),
            self.layout.user_container_dir(&user.username),
            project_dir.clone(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::workspace(format!("{}: {e}", dir.display())))?;
        }

        let dotfiles_dir = self.layout.dotfiles_dir(&user.username);
        if !tokio::fs::try_exists(&dotfiles_dir).await.unwrap_or(false) {
            match self.materialize_dotfiles(user, &user_root, &dotfiles_dir).await {
                Ok(()) => info!(user = %user, "dotfiles bundle created"),
                Err(e) => warn!(user = %user, error = %e, "dotfiles setup failed"),
            }
        }

        Ok(WorkspacePaths {
            user_root,
            project_dir,
        })
    }

    async fn materialize_dotfiles(
        &self,
        user: &UserIdentity,
        user_root: &Path,
        dotfiles_dir: &Path,
    ) -> Result<()> {
        tokio::fs::create_dir_all(dotfiles_dir).await?;
        let email = format!("{}@{}", user.username, self.git_email_domain);
        for (name, body) in dotfile_contents(&user.username, &email) {
            tokio::fs::write(dotfiles_dir.join(name), body).await?;
        }

        if let Err(e) = self.commit_dotfiles(user, &email, dotfiles_dir).await {
            warn!(user = %user, error = %e, "dotfiles left without git history");
        }

        for name in DOTFILES {
            let link = user_root.join(name);
            if tokio::fs::symlink_metadata(&link).await.is_ok() {
                debug!(path = %link.display(), "dotfile already present, not linking");
                continue;
            }
            link_dotfile(&dotfiles_dir.join(name), &link).await?;
        }
        Ok(())
    }

    async fn commit_dotfiles(&self, user: &UserIdentity, email: &str, dir: &Path) -> Result<()> {
        let git = which::which("git").map_err(|e| Error::workspace(format!("git: {e}")))?;
        let git = git.display().to_string();
        let steps: [Vec<String>; 3] = [
            vec!["init".into(), "-q".into()],
            vec!["add".into(), "-A".into()],
            vec![
                "-c".into(),
                format!("user.name={}", user.username),
                "-c".into(),
                format!("user.email={email}"),
                "commit".into(),
                "-q".into(),
                "-m".into(),
                "Initial dotfiles".into(),
            ],
        ];
        for args in steps {
            let spec = CommandSpec::new(&git, GIT_TIMEOUT)
                .args(args)
                .current_dir(dir);
            let output = self.runner.run(&spec).await?;
            if !output.success() {
                return Err(Error::workspace(format!(
                    "`{}` exited with {}: {}",
                    spec.display(),
                    output.exit_code(),
                    output.stderr.trim()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn link_dotfile(target: &Path, link: &Path) -> Result<()> {
    tokio::fs::symlink(target, link).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn link_dotfile(target: &Path, link: &Path) -> Result<()> {
    tokio::fs::copy(target, link).await?;
    Ok(())
}

fn dotfile_contents(username: &str, email: &str) -> [(&'static str, String); 5] {
    [
        (
            ".bashrc",
            format!(
                "# labrun shell defaults\n\
                 [ -z \"$PS1\" ] && return\n\
                 export HISTCONTROL=ignoredups:erasedups\n\
                 export HISTSIZE=5000\n\
                 shopt -s histappend checkwinsize\n\
                 PS1='\\[\\e[1;32m\\]{username}\\[\\e[0m\\]:\\[\\e[1;34m\\]\\w\\[\\e[0m\\]\\$ '\n\
                 alias ll='ls -alF'\n\
                 alias la='ls -A'\n"
            ),
        ),
        (
            ".profile",
            "if [ -n \"$BASH_VERSION\" ] && [ -f \"$HOME/.bashrc\" ]; then\n    . \"$HOME/.bashrc\"\nfi\nexport PATH=\"$HOME/.local/bin:$PATH\"\n".to_string(),
        ),
        (
            ".vimrc",
            "set nocompatible\nsyntax on\nset number\nset expandtab\nset shiftwidth=4\nset tabstop=4\nset backspace=indent,eol,start\n".to_string(),
        ),
        (
            ".gitconfig",
            format!(
                "[user]\n\tname = {username}\n\temail = {email}\n[init]\n\tdefaultBranch = main\n[pull]\n\trebase = false\n"
            ),
        ),
        (
            ".tmux.conf",
            "set -g mouse on\nset -g history-limit 10000\nset -g default-terminal \"screen-256color\"\n".to_string(),
        ),
    ]
}
