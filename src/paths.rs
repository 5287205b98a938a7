use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("engine.json")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.base_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("gallery.sqlite")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn job_logs_dir(&self) -> PathBuf {
        self.logs_dir().join("jobs")
    }

    /// Where the last non-200 page body is written for inspection.
    pub fn last_response_path(&self) -> PathBuf {
        self.logs_dir().join("last_response.html")
    }

    pub fn default_download_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    pub fn effective_download_dir(&self, override_dir: Option<&str>) -> PathBuf {
        match override_dir.map(str::trim) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => self.default_download_dir(),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.db_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.job_logs_dir())?;
        Ok(())
    }

    /// Relative base dirs are anchored at the current directory so stored
    /// file paths stay valid when the process is started elsewhere.
    pub fn normalize_base_dir(base_dir: &Path) -> PathBuf {
        if base_dir.is_absolute() {
            return base_dir.to_path_buf();
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(base_dir),
            Err(_) => base_dir.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_dir_override_ignores_blank_values() {
        let paths = AppPaths::new(PathBuf::from("/srv/rip"));
        assert_eq!(
            paths.effective_download_dir(None),
            PathBuf::from("/srv/rip/downloads")
        );
        assert_eq!(
            paths.effective_download_dir(Some("   ")),
            PathBuf::from("/srv/rip/downloads")
        );
        assert_eq!(
            paths.effective_download_dir(Some("/mnt/galleries")),
            PathBuf::from("/mnt/galleries")
        );
    }

    #[test]
    fn relative_base_dirs_become_absolute() {
        assert!(AppPaths::normalize_base_dir(Path::new("data")).is_absolute());
        assert_eq!(
            AppPaths::normalize_base_dir(Path::new("/srv/rip")),
            PathBuf::from("/srv/rip")
        );
    }
}
