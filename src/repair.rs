use crate::downloader::Downloader;
use crate::jobs::sleep_unless_stopped;
use crate::store::{JobStore, PhotoRow};
use crate::{EngineError, Result};
use crossbeam_channel::unbounded;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairSummary {
    pub scanned: usize,
    pub missing: usize,
    pub restored: usize,
}

/// One pass over every recorded photo. Missing files are re-fetched from the
/// stored direct URL by at most `width` threads at once, favorites first.
/// Individual failures do not stop the sweep; they are returned together as
/// `RepairIncomplete`.
pub fn run_repair_sweep(
    store: &dyn JobStore,
    downloader: &Downloader,
    width: usize,
) -> Result<RepairSummary> {
    let candidates = store.repair_candidates()?;
    let scanned = candidates.len();

    let mut seen = HashSet::new();
    let missing: Vec<PhotoRow> = candidates
        .into_iter()
        .filter(|p| seen.insert(p.file_path.clone()))
        .filter(|p| !Path::new(&p.file_path).exists())
        .collect();
    let mut summary = RepairSummary {
        scanned,
        missing: missing.len(),
        restored: 0,
    };
    if missing.is_empty() {
        return Ok(summary);
    }

    let workers = width.max(1).min(missing.len());
    let pending_paths: Vec<String> = missing.iter().map(|p| p.file_path.clone()).collect();
    let (tx, rx) = unbounded::<PhotoRow>();
    for photo in missing {
        // The receiver is alive in this scope.
        let _ = tx.send(photo);
    }
    drop(tx);

    let results: Vec<(String, Result<bool>)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                scope.spawn(move || {
                    rx.iter()
                        .map(|photo| {
                            let outcome = downloader.restore(&photo);
                            (photo.file_path, outcome)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(part) => results.extend(part),
                Err(_) => log::error!("repair worker panicked"),
            }
        }
        results
    });

    let mut failures = Vec::new();
    let reported: HashSet<&str> = results.iter().map(|(path, _)| path.as_str()).collect();
    for path in &pending_paths {
        if !reported.contains(path.as_str()) {
            failures.push(format!("{path}: repair worker panicked"));
        }
    }
    for (file_path, outcome) in &results {
        match outcome {
            Ok(true) => summary.restored += 1,
            Ok(false) => {}
            Err(err) => failures.push(format!("{file_path}: {err}")),
        }
    }

    if failures.is_empty() {
        log::info!(
            "repair sweep restored {} of {} missing files",
            summary.restored,
            summary.missing
        );
        Ok(summary)
    } else {
        Err(EngineError::RepairIncomplete {
            attempted: summary.missing,
            failures,
        })
    }
}

#[derive(Debug)]
pub struct RepairScannerHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl RepairScannerHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn wait(self) {
        if self.thread.join().is_err() {
            log::error!("repair scanner panicked");
        }
    }
}

/// Sweeps immediately and then every `interval` until stopped.
pub fn start_repair_scanner(
    store: Arc<dyn JobStore>,
    downloader: Arc<Downloader>,
    width: usize,
    interval: Duration,
) -> Result<RepairScannerHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();
    let thread = thread::Builder::new()
        .name("galleryrip-repair".to_string())
        .spawn(move || {
            while !stop_thread.load(Ordering::SeqCst) {
                match run_repair_sweep(store.as_ref(), &downloader, width) {
                    Ok(summary) if summary.missing > 0 => {
                        log::info!("repair: {summary:?}");
                    }
                    Ok(_) => log::debug!("repair: nothing missing"),
                    Err(err) => log::warn!("repair: {err}"),
                }
                sleep_unless_stopped(interval, &stop_thread);
            }
        })?;
    Ok(RepairScannerHandle { stop, thread })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::FileDownloader;
    use crate::memory_store::MemoryStore;
    use crate::store::{NewJob, NewPhoto};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Counts how many downloads are in flight at once.
    #[derive(Default)]
    struct Instrumented {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl FileDownloader for Instrumented {
        fn download_to(&self, url: &str, dest: &Path) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.order.lock().expect("lock").push(url.to_string());
            thread::sleep(Duration::from_millis(15));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if url.contains("boom") {
                panic!("decoder exploded on {url}");
            }
            if url.contains("bad") {
                return Err(EngineError::HttpStatus {
                    url: url.to_string(),
                    status: 410,
                    body_excerpt: String::new(),
                });
            }
            std::fs::write(dest, b"restored")?;
            Ok(())
        }
    }

    fn seed(store: &MemoryStore, dir: &Path, names: &[&str]) -> Vec<PhotoRow> {
        let (job, _) = store
            .enqueue(NewJob::new("https://forum.example/threads/1#post1"))
            .expect("job");
        names
            .iter()
            .map(|name| {
                store
                    .insert_photo(NewPhoto {
                        job_id: job.id.clone(),
                        url: format!("https://img.example/{name}"),
                        file_path: dir.join(name).to_string_lossy().to_string(),
                        thumbnail_path: None,
                    })
                    .expect("photo")
            })
            .collect()
    }

    #[test]
    fn sweep_never_exceeds_its_width() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let names: Vec<String> = (0..20).map(|i| format!("p{i}.jpg")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        seed(&store, dir.path(), &refs);

        let files = Arc::new(Instrumented::default());
        let downloader = Downloader::new(store.clone(), files.clone(), 200);
        let summary = run_repair_sweep(store.as_ref(), &downloader, 5).expect("sweep");

        assert_eq!(summary.missing, 20);
        assert_eq!(summary.restored, 20);
        let peak = files.peak.load(Ordering::SeqCst);
        assert!(peak <= 5, "peak={peak}");
        assert!(peak >= 1);
        assert!(names.iter().all(|n| dir.path().join(n).exists()));
    }

    #[test]
    fn failures_are_aggregated_without_stopping_the_sweep() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        seed(&store, dir.path(), &["ok1.jpg", "bad1.jpg", "ok2.jpg", "bad2.jpg"]);
        std::fs::write(dir.path().join("ok2.jpg"), b"present").expect("present");

        let files = Arc::new(Instrumented::default());
        let downloader = Downloader::new(store.clone(), files.clone(), 200);
        let err = run_repair_sweep(store.as_ref(), &downloader, 2).expect_err("failures");
        match err {
            EngineError::RepairIncomplete {
                attempted,
                failures,
            } => {
                assert_eq!(attempted, 3);
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(dir.path().join("ok1.jpg").exists());
        assert_eq!(files.order.lock().expect("lock").len(), 3);
    }

    #[test]
    fn favorites_are_restored_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let photos = seed(&store, dir.path(), &["a.jpg", "b.jpg", "c.jpg"]);
        store.mark_favorite(&photos[1].id).expect("favorite");

        let files = Arc::new(Instrumented::default());
        let downloader = Downloader::new(store.clone(), files.clone(), 200);
        run_repair_sweep(store.as_ref(), &downloader, 1).expect("sweep");

        let order = files.order.lock().expect("lock").clone();
        assert_eq!(
            order,
            vec![
                "https://img.example/b.jpg",
                "https://img.example/c.jpg",
                "https://img.example/a.jpg",
            ]
        );
    }

    #[test]
    fn nothing_missing_means_no_downloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        seed(&store, dir.path(), &["a.jpg"]);
        std::fs::write(dir.path().join("a.jpg"), b"x").expect("write");

        let files = Arc::new(Instrumented::default());
        let downloader = Downloader::new(store.clone(), files.clone(), 200);
        let summary = run_repair_sweep(store.as_ref(), &downloader, 5).expect("sweep");
        assert_eq!(summary, RepairSummary { scanned: 1, missing: 0, restored: 0 });
        assert!(files.order.lock().expect("lock").is_empty());
    }

    #[test]
    fn panicking_worker_reports_every_unconfirmed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        seed(&store, dir.path(), &["ok.jpg", "boom.jpg"]);

        let files = Arc::new(Instrumented::default());
        let downloader = Downloader::new(store.clone(), files.clone(), 200);
        // Newest first: boom.jpg is taken before ok.jpg, and the only worker dies on it.
        let err = run_repair_sweep(store.as_ref(), &downloader, 1).expect_err("incomplete");
        match err {
            EngineError::RepairIncomplete {
                attempted,
                failures,
            } => {
                assert_eq!(attempted, 2);
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().all(|f| f.contains("panicked")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!dir.path().join("ok.jpg").exists());
    }
}
