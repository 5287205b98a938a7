use crate::config::FetchSettings;
use crate::fetch::build_http_agent;
use crate::gallery::sanitize_folder_name;
use crate::store::{JobStore, NewPhoto, PhotoRow};
use crate::{EngineError, Result};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

pub const THUMBNAILS_DIR: &str = "thumbnails";
const THUMBNAIL_PREFIX: &str = "thumb_";
const FALLBACK_FILE_NAME: &str = "image.jpg";

/// Streams a URL to a file. Implementations must not leave anything at
/// `dest` when they fail.
pub trait FileDownloader: Send + Sync {
    fn download_to(&self, url: &str, dest: &Path) -> Result<()>;
}

pub struct HttpFileDownloader {
    agent: ureq::Agent,
}

impl HttpFileDownloader {
    pub fn new(settings: &FetchSettings) -> Self {
        Self {
            agent: build_http_agent(settings),
        }
    }
}

/// Temp name unique to one call, so concurrent downloads of the same
/// destination never write to or rename each other's file.
fn part_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
    dest.with_file_name(format!(".{name}.{}.part", uuid::Uuid::new_v4().simple()))
}

impl FileDownloader for HttpFileDownloader {
    fn download_to(&self, url: &str, dest: &Path) -> Result<()> {
        let mut response = self
            .agent
            .get(url)
            .call()
            .map_err(|err| EngineError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(EngineError::HttpStatus {
                url: url.to_string(),
                status,
                body_excerpt: String::new(),
            });
        }

        let temp_path = part_path(dest);
        let mut output = std::fs::File::create(&temp_path)?;
        let mut body_reader = response.body_mut().as_reader();
        let mut buf = [0_u8; 64 * 1024];
        let mut bytes_written: u64 = 0;

        loop {
            let read = body_reader.read(&mut buf).map_err(|err| {
                let _ = std::fs::remove_file(&temp_path);
                EngineError::Transport {
                    url: url.to_string(),
                    message: format!("failed reading response body: {err}"),
                }
            })?;
            if read == 0 {
                break;
            }
            output.write_all(&buf[..read]).map_err(|err| {
                let _ = std::fs::remove_file(&temp_path);
                EngineError::Io(err)
            })?;
            bytes_written = bytes_written.saturating_add(read as u64);
        }
        output.flush()?;
        drop(output);

        if bytes_written == 0 {
            let _ = std::fs::remove_file(&temp_path);
            return Err(EngineError::EmptyDownload {
                url: url.to_string(),
            });
        }

        if let Err(err) = std::fs::rename(&temp_path, dest) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Stored(PhotoRow),
    /// The destination already existed; nothing was fetched or recorded.
    AlreadyPresent(PathBuf),
}

/// File name for an image URL: the sanitized last path segment.
pub fn file_name_for(image_url: &str) -> String {
    let segment = Url::parse(image_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .unwrap_or_default();
    let name = sanitize_folder_name(&segment);
    if name.is_empty() || name == "." || name == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        name
    }
}

pub fn thumbnail_path_for(file_path: &Path) -> PathBuf {
    let name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
    let parent = file_path.parent().unwrap_or_else(|| Path::new("."));
    parent
        .join(THUMBNAILS_DIR)
        .join(format!("{THUMBNAIL_PREFIX}{name}"))
}

/// Fixed width, proportional height, Lanczos resampling. JPEG output drops
/// the alpha channel.
pub fn generate_thumbnail(src: &Path, dest: &Path, width: u32) -> Result<()> {
    let img = image::open(src)?;
    let thumb = img.resize(width.max(1), u32::MAX, FilterType::Lanczos3);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let format = ImageFormat::from_path(dest).unwrap_or(ImageFormat::Jpeg);
    let thumb = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(thumb.to_rgb8()),
        _ => thumb,
    };
    thumb.save_with_format(dest, format)?;
    Ok(())
}

pub struct Downloader {
    store: Arc<dyn JobStore>,
    files: Arc<dyn FileDownloader>,
    thumbnail_width: u32,
}

impl Downloader {
    pub fn new(store: Arc<dyn JobStore>, files: Arc<dyn FileDownloader>, thumbnail_width: u32) -> Self {
        Self {
            store,
            files,
            thumbnail_width,
        }
    }

    /// Downloads `image_url` into `gallery_dir` unless the file is already
    /// there, then writes a thumbnail and records the photo.
    pub fn download_and_store(
        &self,
        job_id: &str,
        image_url: &str,
        gallery_dir: &Path,
    ) -> Result<DownloadOutcome> {
        let dest = gallery_dir.join(file_name_for(image_url));
        if dest.exists() {
            log::debug!("skip existing {}", dest.display());
            return Ok(DownloadOutcome::AlreadyPresent(dest));
        }

        std::fs::create_dir_all(gallery_dir)?;
        self.files.download_to(image_url, &dest)?;

        let thumb = thumbnail_path_for(&dest);
        let thumbnail_path = match generate_thumbnail(&dest, &thumb, self.thumbnail_width) {
            Ok(()) => Some(thumb.to_string_lossy().to_string()),
            Err(err) => {
                log::warn!("thumbnail failed for {}: {err}", dest.display());
                None
            }
        };

        let recorded = self.store.insert_photo(NewPhoto {
            job_id: job_id.to_string(),
            url: image_url.to_string(),
            file_path: dest.to_string_lossy().to_string(),
            thumbnail_path: thumbnail_path.clone(),
        });
        match recorded {
            Ok(row) => Ok(DownloadOutcome::Stored(row)),
            Err(err) => {
                // Without a row the next run must be able to fetch again.
                let _ = std::fs::remove_file(&dest);
                if let Some(thumb) = thumbnail_path {
                    let _ = std::fs::remove_file(thumb);
                }
                Err(err)
            }
        }
    }

    /// Re-fetches a recorded photo whose file is gone. `Ok(false)` when the
    /// file is still present.
    pub fn restore(&self, photo: &PhotoRow) -> Result<bool> {
        let dest = PathBuf::from(&photo.file_path);
        if dest.exists() {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.files.download_to(&photo.url, &dest)?;

        let thumb = photo
            .thumbnail_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| thumbnail_path_for(&dest));
        if !thumb.exists() {
            if let Err(err) = generate_thumbnail(&dest, &thumb, self.thumbnail_width) {
                log::warn!("thumbnail failed for {}: {err}", dest.display());
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::store::NewJob;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves fixed bytes for every URL.
    struct FixedBytes {
        bytes: Option<Vec<u8>>,
        calls: AtomicUsize,
    }

    impl FixedBytes {
        fn new(bytes: Option<Vec<u8>>) -> Self {
            Self {
                bytes,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FileDownloader for FixedBytes {
        fn download_to(&self, url: &str, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.bytes {
                Some(bytes) => {
                    std::fs::write(dest, bytes)?;
                    Ok(())
                }
                None => Err(EngineError::Transport {
                    url: url.to_string(),
                    message: "connection refused".to_string(),
                }),
            }
        }
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            w,
            h,
            image::Rgba([200, 10, 10, 128]),
        ));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).expect("encode png");
        out.into_inner()
    }

    fn setup(bytes: Option<Vec<u8>>) -> (Arc<MemoryStore>, Arc<FixedBytes>, Downloader, String) {
        let store = Arc::new(MemoryStore::new());
        let (job, _) = store
            .enqueue(NewJob::new("https://forum.example/threads/1#post2"))
            .expect("job");
        let files = Arc::new(FixedBytes::new(bytes));
        let downloader = Downloader::new(store.clone(), files.clone(), 200);
        (store, files, downloader, job.id)
    }

    #[test]
    fn second_download_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, files, downloader, job_id) = setup(Some(png_bytes(400, 300)));
        let url = "https://img1.pixhost.to/images/1/a.png";

        let first = downloader
            .download_and_store(&job_id, url, dir.path())
            .expect("first");
        let DownloadOutcome::Stored(photo) = first else {
            panic!("expected a stored photo");
        };
        assert_eq!(photo.file_path, dir.path().join("a.png").to_string_lossy());
        let thumb = PathBuf::from(photo.thumbnail_path.expect("thumbnail"));
        assert_eq!(thumb, dir.path().join("thumbnails").join("thumb_a.png"));
        let (w, h) = image::image_dimensions(&thumb).expect("thumb dims");
        assert_eq!((w, h), (200, 150));

        let second = downloader
            .download_and_store(&job_id, url, dir.path())
            .expect("second");
        assert!(matches!(second, DownloadOutcome::AlreadyPresent(_)));
        assert_eq!(files.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.photos_for_job(&job_id).expect("photos").len(), 1);
    }

    #[test]
    fn jpeg_thumbnails_drop_alpha() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("a.png");
        std::fs::write(&src, png_bytes(100, 50)).expect("write");
        let dest = dir.path().join("thumbnails").join("thumb_a.jpg");
        generate_thumbnail(&src, &dest, 40).expect("thumbnail");
        let (w, h) = image::image_dimensions(&dest).expect("dims");
        assert_eq!((w, h), (40, 20));
    }

    #[test]
    fn broken_image_still_records_photo_without_thumbnail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, _files, downloader, job_id) = setup(Some(b"not an image".to_vec()));
        let outcome = downloader
            .download_and_store(&job_id, "https://host.example/x/b.jpg", dir.path())
            .expect("download");
        let DownloadOutcome::Stored(photo) = outcome else {
            panic!("expected a stored photo");
        };
        assert!(photo.thumbnail_path.is_none());
        assert!(dir.path().join("b.jpg").exists());
        assert_eq!(store.photos_for_job(&job_id).expect("photos").len(), 1);
    }

    #[test]
    fn failed_download_leaves_no_file_and_no_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, _files, downloader, job_id) = setup(None);
        downloader
            .download_and_store(&job_id, "https://host.example/x/c.jpg", dir.path())
            .expect_err("should fail");
        assert!(!dir.path().join("c.jpg").exists());
        assert!(store.photos_for_job(&job_id).expect("photos").is_empty());
    }

    #[test]
    fn file_names_come_from_the_last_path_segment() {
        assert_eq!(file_name_for("https://h.example/a/b/pic.jpg?x=1"), "pic.jpg");
        assert_eq!(file_name_for("https://h.example/"), FALLBACK_FILE_NAME);
        assert_eq!(file_name_for("not a url"), FALLBACK_FILE_NAME);
        assert_eq!(file_name_for("https://h.example/a/we%3Fird.jpg"), "we%3Fird.jpg");
    }

    #[test]
    fn restore_refetches_only_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_store, files, downloader, job_id) = setup(Some(png_bytes(10, 10)));
        let photo = PhotoRow {
            id: "p1".to_string(),
            job_id,
            url: "https://host.example/d.png".to_string(),
            file_path: dir.path().join("g").join("d.png").to_string_lossy().to_string(),
            thumbnail_path: None,
            created_at_ms: 0,
        };
        assert!(downloader.restore(&photo).expect("restore"));
        assert!(!downloader.restore(&photo).expect("restore again"));
        assert_eq!(files.calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("g").join("thumbnails").join("thumb_d.png").exists());
    }

    /// Answers `/full` with a slow complete body and `/cut` with a few bytes
    /// before hanging up.
    fn serve_full_and_cut(listener: std::net::TcpListener) {
        use std::io::BufRead;
        for stream in listener.incoming().take(2) {
            let Ok(mut stream) = stream else { continue };
            std::thread::spawn(move || {
                let mut reader = std::io::BufReader::new(stream.try_clone().expect("clone"));
                let mut request_line = String::new();
                reader.read_line(&mut request_line).expect("request line");
                loop {
                    let mut header = String::new();
                    if reader.read_line(&mut header).expect("header") == 0 || header == "\r\n" {
                        break;
                    }
                }
                let head = "HTTP/1.1 200 OK\r\nContent-Length: 20\r\nConnection: close\r\n\r\n";
                stream.write_all(head.as_bytes()).expect("head");
                if request_line.contains("/full") {
                    std::thread::sleep(std::time::Duration::from_millis(400));
                    stream.write_all(&[b'A'; 20]).expect("body");
                } else {
                    stream.write_all(&[b'B'; 5]).expect("partial body");
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                }
            });
        }
    }

    #[test]
    fn concurrent_downloads_to_one_destination_never_leave_a_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || serve_full_and_cut(listener));

        let files = Arc::new(HttpFileDownloader::new(&FetchSettings::default()));
        let dest = dir.path().join("same.jpg");

        let full = {
            let files = files.clone();
            let dest = dest.clone();
            std::thread::spawn(move || files.download_to(&format!("http://{addr}/full"), &dest))
        };
        std::thread::sleep(std::time::Duration::from_millis(100));
        let cut = files.download_to(&format!("http://{addr}/cut"), &dest);
        let full = full.join().expect("join");

        assert!(cut.is_err(), "truncated body must fail");
        full.expect("complete body succeeds");
        assert_eq!(std::fs::read(&dest).expect("dest"), vec![b'A'; 20]);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");
    }
}
