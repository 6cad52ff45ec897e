use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};

use crate::config::model::WardenConfig;
use crate::config::resolve_path;

/// Turns a deploy request into the path of a compiled artifact.
pub trait ArtifactResolver: Send + Sync {
    fn resolve(&self, instance: &str, request: &str) -> anyhow::Result<PathBuf>;
}

/// Deploy requests name an entry under the instance's `artifacts_dir`.
#[derive(Debug, Clone, Default)]
pub struct DirectoryResolver {
    roots: BTreeMap<String, PathBuf>,
}

impl DirectoryResolver {
    pub fn from_config(config: &WardenConfig, base_dir: &Path) -> Self {
        let roots = config
            .instances
            .iter()
            .filter_map(|(id, inst)| {
                inst.artifacts_dir
                    .as_deref()
                    .map(|dir| (id.clone(), resolve_path(base_dir, dir)))
            })
            .collect();
        Self { roots }
    }

    pub fn with_root(mut self, instance: &str, dir: impl Into<PathBuf>) -> Self {
        self.roots.insert(instance.to_string(), dir.into());
        self
    }
}

impl ArtifactResolver for DirectoryResolver {
    fn resolve(&self, instance: &str, request: &str) -> anyhow::Result<PathBuf> {
        let root = self
            .roots
            .get(instance)
            .with_context(|| format!("instance '{}' has no artifacts_dir", instance))?;
        let relative = Path::new(request);
        if request.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("'{}' is not a plain path inside the artifacts directory", request);
        }
        let path = root.join(relative);
        if !path.exists() {
            bail!("artifact {} does not exist", path.display());
        }
        Ok(path)
    }
}
