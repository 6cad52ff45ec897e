use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Write `content` to `path` via a sibling tmp file and rename, so readers
/// never observe a half-written file.
pub fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Acquire an exclusive lock on `<path>.lock`. The lock is released when
/// the returned handle is dropped.
pub fn lock_exclusive(path: &Path) -> Option<std::fs::File> {
    let mut lock_name = path.as_os_str().to_owned();
    lock_name.push(".lock");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    let lock_file = std::fs::File::create(PathBuf::from(lock_name)).ok()?;

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is valid for the lifetime of lock_file
        unsafe {
            libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX);
        }
    }

    Some(lock_file)
}

/// The live session of one instance, recorded so a later run of the server
/// can adopt it instead of relaunching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub instance: String,
    pub pid: u32,
    pub port: u16,
    pub artifact: PathBuf,
    pub launched_at: DateTime<Utc>,
}

impl SessionRecord {
    fn path(state_dir: &Path, instance: &str) -> PathBuf {
        state_dir.join("instances").join(format!("{}.json", instance))
    }

    pub fn save(&self, state_dir: &Path) -> anyhow::Result<()> {
        let path = Self::path(state_dir, &self.instance);
        let _lock = lock_exclusive(&path);
        write_atomic(&path, &serde_json::to_string_pretty(self)?)
    }

    pub fn load(state_dir: &Path, instance: &str) -> Option<Self> {
        let content = std::fs::read_to_string(Self::path(state_dir, instance)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn remove(state_dir: &Path, instance: &str) -> anyhow::Result<()> {
        let path = Self::path(state_dir, instance);
        let _lock = lock_exclusive(&path);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record() -> SessionRecord {
        SessionRecord {
            instance: "main".to_string(),
            pid: 4242,
            port: 1337,
            artifact: PathBuf::from("builds/current/game.dmb"),
            launched_at: Utc::now(),
        }
    }

    #[test]
    fn save_load_remove() {
        let dir = tempdir().unwrap();
        let rec = record();
        rec.save(dir.path()).unwrap();

        assert!(dir.path().join("instances/main.json").is_file());
        assert!(!dir.path().join("instances/main.json.tmp").exists());
        assert_eq!(SessionRecord::load(dir.path(), "main"), Some(rec));

        SessionRecord::remove(dir.path(), "main").unwrap();
        assert!(SessionRecord::load(dir.path(), "main").is_none());
        // Removing twice is fine.
        SessionRecord::remove(dir.path(), "main").unwrap();
    }

    #[test]
    fn corrupt_record_loads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instances/main.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(SessionRecord::load(dir.path(), "main").is_none());
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/file.json");
        write_atomic(&path, "one").unwrap();
        write_atomic(&path, "two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
    }
}
