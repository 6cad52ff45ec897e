pub mod model;
pub mod resolve;
pub mod validate;

use std::path::{Path, PathBuf};

use model::WardenConfig;

use crate::platform::expand_home;

pub const CONFIG_FILENAME: &str = "warden.toml";

pub fn load_config(path: &Path) -> anyhow::Result<WardenConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let config: WardenConfig = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
    Ok(config)
}

/// Expand `~`/`$HOME` and anchor relative paths at `base_dir`.
pub fn resolve_path(base_dir: &Path, path: &str) -> PathBuf {
    let expanded = PathBuf::from(expand_home(path));
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

/// A parsed config file together with its text (for diagnostics) and the
/// directory its relative paths are resolved against.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: WardenConfig,
    pub source: String,
    pub path: PathBuf,
    pub base_dir: PathBuf,
}

impl LoadedConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: WardenConfig = toml::from_str(&source)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            config,
            source,
            path: path.to_path_buf(),
            base_dir,
        })
    }

    pub fn validate(&self) -> Result<(), Vec<validate::ConfigDiagnostic>> {
        let filename = self
            .path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| CONFIG_FILENAME.to_string());
        validate::validate(&self.config, &self.source, &filename)
    }

    pub fn state_dir(&self) -> PathBuf {
        resolve_path(&self.base_dir, &self.config.engine.state_dir)
    }
}
