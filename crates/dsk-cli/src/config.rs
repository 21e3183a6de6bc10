use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Operator defaults read from `config.toml`. Every field is optional and
/// command-line flags always win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DskConfig {
    /// Platform triple used when `dsk request` is given no `--platform`.
    #[serde(default)]
    pub default_platform: Option<String>,
    /// Run every command against `<sandbox>/<scope>/{install,state}`.
    #[serde(default)]
    pub sandbox: Option<PathBuf>,
    /// Directory that holds portable-scope installs.
    #[serde(default)]
    pub portable_dir: Option<PathBuf>,
    /// `tracing` filter directive, overridden by `DSK_LOG`.
    #[serde(default)]
    pub log: Option<String>,
}

impl DskConfig {
    /// Load `explicit` if given (it must exist), otherwise the default path
    /// if present, otherwise an empty config.
    pub fn load(explicit: Option<&Path>) -> Result<Self, String> {
        match explicit {
            Some(path) => Self::load_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::load_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn load_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("invalid config {}: {e}", path.display()))
    }
}

fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".config/dsk/config.toml"))
}
