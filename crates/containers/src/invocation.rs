//! Argument vectors for the container runtime.

use std::path::{Path, PathBuf};

/// Directory inside the container where out-of-workspace scripts are mounted.
pub const SCRIPT_MOUNT_DIR: &str = "/opt/labrun";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    ReadOnly,
    ReadWrite,
}

/// One `--bind host:container:mode` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub host: PathBuf,
    pub container: String,
    pub mode: BindMode,
}

impl Bind {
    fn to_arg(&self) -> String {
        let mode = match self.mode {
            BindMode::ReadOnly => "ro",
            BindMode::ReadWrite => "rw",
        };
        format!("{}:{}:{mode}", self.host.display(), self.container)
    }
}

/// An isolated `exec` or `shell` invocation of one image.
///
/// Every invocation runs with `--contain --cleanenv --no-home`: no host
/// environment, no host home directory, and only the explicit binds.
#[derive(Debug, Clone)]
pub struct ContainerInvocation {
    runtime: String,
    image: PathBuf,
    binds: Vec<Bind>,
    pwd: Option<String>,
    cgroups: Option<PathBuf>,
}

impl ContainerInvocation {
    pub fn new(runtime: impl Into<String>, image: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
            binds: Vec::new(),
            pwd: None,
            cgroups: None,
        }
    }

    #[must_use]
    pub fn bind(mut self, host: impl Into<PathBuf>, container: impl Into<String>, mode: BindMode) -> Self {
        self.binds.push(Bind {
            host: host.into(),
            container: container.into(),
            mode,
        });
        self
    }

    /// Bind `host` read-write at `mount` and start there.
    #[must_use]
    pub fn workspace(self, host: impl Into<PathBuf>, mount: &str) -> Self {
        let mut this = self.bind(host, mount, BindMode::ReadWrite);
        this.pwd = Some(mount.to_string());
        this
    }

    #[must_use]
    pub fn apply_cgroups(mut self, path: impl Into<PathBuf>) -> Self {
        self.cgroups = Some(path.into());
        self
    }

    /// Rewrite every host path (image, binds, cgroups file) through `map`.
    #[must_use]
    pub fn map_host_paths(mut self, map: impl Fn(&Path) -> PathBuf) -> Self {
        self.image = map(&self.image);
        for bind in &mut self.binds {
            bind.host = map(&bind.host);
        }
        self.cgroups = self.cgroups.map(|p| map(&p));
        self
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn binds(&self) -> &[Bind] {
        &self.binds
    }

    /// Arguments for `<runtime> exec ... <image> <command...>`.
    pub fn exec_args(&self, command: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        self.push_common(&mut args);
        args.push(self.image.display().to_string());
        args.extend(command.iter().cloned());
        args
    }

    /// Arguments for `<runtime> shell ... <image>`.
    pub fn shell_args(&self, shell: &str) -> Vec<String> {
        let mut args = vec!["shell".to_string()];
        self.push_common(&mut args);
        args.extend(["--shell".to_string(), shell.to_string()]);
        args.push(self.image.display().to_string());
        args
    }

    fn push_common(&self, args: &mut Vec<String>) {
        args.extend(["--contain", "--cleanenv", "--no-home"].map(String::from));
        for bind in &self.binds {
            args.extend(["--bind".to_string(), bind.to_arg()]);
        }
        if let Some(ref pwd) = self.pwd {
            args.extend(["--pwd".to_string(), pwd.clone()]);
        }
        if let Some(ref cgroups) = self.cgroups {
            args.extend(["--apply-cgroups".to_string(), cgroups.display().to_string()]);
        }
    }
}

/// Interpreter for a script, chosen by extension.
///
/// `None` means the script is executed directly.
pub fn interpreter_for(script: &Path) -> Option<&'static str> {
    match script.extension().and_then(|e| e.to_str()) {
        Some("py") => Some("python3"),
        Some("R" | "r") => Some("Rscript"),
        Some("jl") => Some("julia"),
        Some("sh") => Some("bash"),
        _ => None,
    }
}

/// Quote `arg` for a POSIX shell if it needs it.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[test]
    fn exec_args_isolate_and_bind() {
        let inv = ContainerInvocation::new("singularity", "/img/base.sif")
            .workspace("/ws/alice/projects/p", "/workspace")
            .bind("/tmp/s.py", "/opt/labrun/s.py", BindMode::ReadOnly)
            .apply_cgroups("/store/cgroups/x.toml");
        let args = inv.exec_args(&["python3".into(), "/opt/labrun/s.py".into()]);
        assert_eq!(args, [
            "exec",
            "--contain",
            "--cleanenv",
            "--no-home",
            "--bind",
            "/ws/alice/projects/p:/workspace:rw",
            "--bind",
            "/tmp/s.py:/opt/labrun/s.py:ro",
            "--pwd",
            "/workspace",
            "--apply-cgroups",
            "/store/cgroups/x.toml",
            "/img/base.sif",
            "python3",
            "/opt/labrun/s.py",
        ]);
    }

    #[test]
    fn shell_args_end_with_image() {
        let inv = ContainerInvocation::new("apptainer", "/img/custom.sif");
        let args = inv.shell_args("/bin/bash");
        assert_eq!(args.first().map(String::as_str), Some("shell"));
        assert_eq!(args.last().map(String::as_str), Some("/img/custom.sif"));
        assert!(args.windows(2).any(|w| w[0] == "--shell" && w[1] == "/bin/bash"));
    }

    #[test]
    fn host_paths_are_remapped() {
        let inv = ContainerInvocation::new("singularity", "/srv/img.sif")
            .workspace("/srv/ws", "/workspace")
            .map_host_paths(|p| Path::new("/cluster").join(p.strip_prefix("/").unwrap_or(p)));
        assert_eq!(inv.image(), Path::new("/cluster/srv/img.sif"));
        assert_eq!(inv.binds()[0].host, PathBuf::from("/cluster/srv/ws"));
        assert_eq!(inv.binds()[0].container, "/workspace");
    }

    #[rstest]
    #[case("run.py", Some("python3"))]
    #[case("analysis.R", Some("Rscript"))]
    #[case("model.jl", Some("julia"))]
    #[case("setup.sh", Some("bash"))]
    #[case("binary", None)]
    #[case("notes.txt", None)]
    fn picks_interpreter(#[case] name: &str, #[case] expected: Option<&str>) {
        assert_eq!(interpreter_for(Path::new(name)), expected);
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("/srv/ws/a.py"), "/srv/ws/a.py");
        assert_eq!(shell_quote("my script.py"), "'my script.py'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
