//! Locations of pomo's on-disk state under `~/.pomo`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const BASE_DIR_NAME: &str = ".pomo";

/// Returns the base directory: `~/.pomo`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(BASE_DIR_NAME))
}

/// Returns the network config file path: `~/.pomo/config.json`
pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("config.json"))
}

/// Returns the node key file path: `~/.pomo/node_priv.key`
pub fn key_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("node_priv.key"))
}

/// Returns the logs directory: `~/.pomo/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

/// Create `dir` (and parents) if missing and return it.
pub fn ensure_dir(dir: &Path) -> Result<&Path> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_live_under_base_dir() {
        let base = base_dir().unwrap();
        assert!(base.ends_with(".pomo"));
        assert_eq!(config_path().unwrap(), base.join("config.json"));
        assert_eq!(key_path().unwrap(), base.join("node_priv.key"));
        assert_eq!(logs_dir().unwrap(), base.join("logs"));
    }

    #[test]
    fn test_ensure_dir_creates_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a").join("b");
        assert_eq!(ensure_dir(&nested).unwrap(), nested.as_path());
        assert!(nested.is_dir());
        // Existing directories are fine.
        assert!(ensure_dir(&nested).is_ok());
    }

    #[test]
    fn test_ensure_dir_fails_on_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("taken");
        std::fs::write(&file, "x").unwrap();
        let err = ensure_dir(&file).unwrap_err();
        assert!(err.to_string().contains("Failed to create directory"));
    }
}
