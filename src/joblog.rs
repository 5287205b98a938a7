use crate::store::now_ms;
use crate::Result;
use std::io::Write;
use std::path::{Path, PathBuf};

const DEFAULT_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_BACKUPS: usize = 3;

/// Append-only JSONL event log, one file per job. Write failures are
/// reported through `log` and otherwise ignored.
#[derive(Debug, Clone)]
pub struct JobLog {
    dir: PathBuf,
    rotate_bytes: u64,
    max_backups: usize,
}

impl JobLog {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            rotate_bytes: DEFAULT_ROTATE_BYTES,
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }

    pub fn with_rotation(mut self, rotate_bytes: u64, max_backups: usize) -> Self {
        self.rotate_bytes = rotate_bytes;
        self.max_backups = max_backups;
        self
    }

    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.jsonl"))
    }

    pub fn line(&self, job_id: &str, level: &str, event: &str, data: serde_json::Value) {
        let lvl = match level {
            "error" => log::Level::Error,
            "warn" => log::Level::Warn,
            "debug" => log::Level::Debug,
            _ => log::Level::Info,
        };
        log::log!(target: "galleryrip::job", lvl, "[{job_id}] {event} {data}");

        if let Err(err) = self.append(job_id, level, event, data) {
            log::debug!("job log write failed for {job_id}: {err}");
        }
    }

    fn append(&self, job_id: &str, level: &str, event: &str, data: serde_json::Value) -> Result<()> {
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "job_id": job_id,
            "level": level,
            "event": event,
            "data": data
        })
        .to_string();

        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(job_id);
        self.rotate_if_needed(&path)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }

    /// `<job>.jsonl.<n>` for the n-th most recent rotated file.
    pub fn backup_path(&self, job_id: &str, n: usize) -> PathBuf {
        numbered(&self.path_for(job_id), n)
    }

    /// Shifts `.1..max` up by one, dropping the oldest, and moves the live
    /// file to `.1` once it has reached the size threshold.
    fn rotate_if_needed(&self, path: &Path) -> Result<()> {
        let len = match std::fs::metadata(path) {
            Ok(m) => m.len(),
            Err(_) => return Ok(()),
        };
        if len < self.rotate_bytes {
            return Ok(());
        }
        if self.max_backups == 0 {
            std::fs::remove_file(path)?;
            return Ok(());
        }

        let oldest = numbered(path, self.max_backups);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        for n in (1..self.max_backups).rev() {
            let from = numbered(path, n);
            if from.exists() {
                std::fs::rename(&from, numbered(path, n + 1))?;
            }
        }
        std::fs::rename(path, numbered(path, 1))?;
        Ok(())
    }

    /// Events of the current (unrotated) file, oldest first. Unparseable
    /// lines are skipped.
    pub fn read(&self, job_id: &str) -> Result<Vec<serde_json::Value>> {
        let path = self.path_for(job_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(path)?;
        Ok(text
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

fn numbered(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}
