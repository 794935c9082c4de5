use directories::ProjectDirs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Where the gateway keeps its config, database and logs.
#[derive(Debug, Clone)]
pub struct AppPaths {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("dev", "llm-gateway", "LlmGateway")
            .ok_or_else(|| Error::platform("Failed to determine application directories"))?;

        Ok(Self {
            config_dir: project_dirs.config_dir().to_path_buf(),
            data_dir: project_dirs.data_dir().to_path_buf(),
        })
    }

    /// Everything under one root. The directories are created immediately.
    pub fn with_data_dir(root: &Path) -> Result<Self> {
        let paths = Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
        };
        paths.ensure_dirs_exist()?;
        Ok(paths)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn database_file(&self) -> PathBuf {
        self.data_dir.join("gateway.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn ensure_dirs_exist(&self) -> Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_with_data_dir_creates_layout() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();

        assert!(paths.config_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
        assert_eq!(paths.database_file(), temp_dir.path().join("data").join("gateway.db"));
        assert_eq!(paths.config_file().file_name().unwrap(), "config.toml");
    }
}
