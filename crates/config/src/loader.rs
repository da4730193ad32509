use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::LabrunConfig};

/// File stem shared by every supported format.
const CONFIG_STEM: &str = "labrun";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Yaml,
    Json,
}

impl Format {
    /// Probe order within one directory.
    const ALL: [(Self, &'static str); 4] = [
        (Self::Toml, "toml"),
        (Self::Yaml, "yaml"),
        (Self::Yaml, "yml"),
        (Self::Json, "json"),
    ];

    fn of(path: &Path) -> anyhow::Result<Self> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        Self::ALL
            .iter()
            .find(|(_, e)| *e == ext)
            .map(|(f, _)| *f)
            .ok_or_else(|| anyhow::anyhow!("unsupported config format: .{ext}"))
    }

    fn parse(self, raw: &str) -> anyhow::Result<LabrunConfig> {
        Ok(match self {
            Self::Toml => toml::from_str(raw)?,
            Self::Yaml => serde_yaml::from_str(raw)?,
            Self::Json => serde_json::from_str(raw)?,
        })
    }
}

/// Load one config file; the format follows the extension.
pub fn load_config(path: &Path) -> anyhow::Result<LabrunConfig> {
    let format = Format::of(path)?;
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    format
        .parse(&substitute_env(&raw))
        .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))
}

/// Load the first discovered config file, falling back to defaults when
/// none exists or it does not parse.
pub fn discover_and_load() -> LabrunConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return LabrunConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        LabrunConfig::default()
    })
}

/// First `labrun.{toml,yaml,yml,json}` in `./`, then in [`config_dir`].
pub fn find_config_file() -> Option<PathBuf> {
    let dirs = std::iter::once(PathBuf::from(".")).chain(config_dir());
    find_in(dirs)
}

fn find_in(dirs: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    dirs.into_iter().find_map(|dir| {
        Format::ALL
            .iter()
            .map(|(_, ext)| dir.join(format!("{CONFIG_STEM}.{ext}")))
            .find(|p| p.is_file())
    })
}

/// The user-global config directory (`~/.config/labrun/` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", CONFIG_STEM).map(|d| d.config_dir().to_path_buf())
}

pub fn render_toml(config: &LabrunConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))
}
