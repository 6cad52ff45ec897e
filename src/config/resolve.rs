use std::path::{Path, PathBuf};

use super::CONFIG_FILENAME;

/// First `filename` found in `start` or one of its ancestors.
pub fn find_config(start: &Path, filename: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(filename))
        .find(|candidate| candidate.is_file())
}

/// Resolve the config file path. An explicit `cli_file` must exist; otherwise
/// search upward from the current directory for `warden.toml`.
pub fn resolve_config(cli_file: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = cli_file {
        if path.is_file() {
            return Ok(path.canonicalize()?);
        }
        anyhow::bail!("Config file not found: {}", path.display());
    }

    let cwd = std::env::current_dir()?;
    find_config(&cwd, CONFIG_FILENAME).ok_or_else(|| {
        anyhow::anyhow!(
            "No {} found in {} or any parent directory",
            CONFIG_FILENAME,
            cwd.display()
        )
    })
}
