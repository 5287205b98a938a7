use std::path::PathBuf;

use galleryrip_engine::paths::AppPaths;
use galleryrip_engine::Engine;
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut submit_urls: Vec<String> = Vec::new();
    let mut title: Option<String> = None;
    let mut status_ids: Vec<String> = Vec::new();
    let mut list = false;
    let mut run = false;
    let mut repair_once = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--base-dir requires a value".to_string())?;
                base_dir = Some(PathBuf::from(v));
            }
            "--submit" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--submit requires a URL".to_string())?;
                submit_urls.push(v.to_string());
            }
            "--title" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--title requires a value".to_string())?;
                title = Some(v.to_string());
            }
            "--status" => {
                i += 1;
                let v = args
                    .get(i)
                    .ok_or_else(|| "--status requires a job id".to_string())?;
                status_ids.push(v.to_string());
            }
            "--list" => list = true,
            "--run" => run = true,
            "--repair-once" => repair_once = true,
            other => return Err(format!("unknown arg: {other} (try --help)")),
        }
        i += 1;
    }

    if submit_urls.is_empty() && status_ids.is_empty() && !list && !run && !repair_once {
        return Err("nothing to do (pass --submit, --status, --list, --run or --repair-once)".to_string());
    }

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(AppPaths::normalize_base_dir(&base_dir));
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    initialize_logger(&paths);

    let engine = Engine::open(paths).map_err(|e| e.to_string())?;
    println!("Base dir: {}", engine.paths().base_dir.to_string_lossy());

    for url in &submit_urls {
        let ids = engine
            .submit(url, title.as_deref())
            .map_err(|e| e.to_string())?;
        println!("Submitted {url}: {} job(s)", ids.len());
        for id in ids {
            println!("  {id}");
        }
    }

    for id in &status_ids {
        let job = engine.job(id).map_err(|e| e.to_string())?;
        match &job.error {
            Some(err) => println!("{} {} ({err})", job.id, job.status),
            None => println!("{} {}", job.id, job.status),
        }
    }

    if list {
        for job in engine.list_active_jobs().map_err(|e| e.to_string())? {
            println!("{:<10} {} {}", job.status, job.id, job.url);
        }
    }

    if repair_once {
        match engine.repair_once() {
            Ok(summary) => println!(
                "Repair: scanned {}, missing {}, restored {}",
                summary.scanned, summary.missing, summary.restored
            ),
            Err(e) => eprintln!("Repair: {e}"),
        }
    }

    if run {
        let repair = engine.start_repair().map_err(|e| e.to_string())?;
        let workers = engine.start_workers().map_err(|e| e.to_string())?;
        println!(
            "Running with {} workers (Ctrl+C to exit)",
            engine.config().workers
        );
        workers.wait();
        repair.stop();
        repair.wait();
    }

    Ok(())
}

fn initialize_logger(paths: &AppPaths) {
    let level = log_level_from_env();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.logs_dir().join("galleryrip.log"))
    {
        Ok(file) => loggers.push(WriteLogger::new(LevelFilter::Debug, Config::default(), file)),
        Err(e) => eprintln!("Failed to open log file: {e}. Logging to terminal only."),
    }
    if let Err(e) = CombinedLogger::init(loggers) {
        eprintln!("Failed to initialize logger: {e}");
    }
}

fn log_level_from_env() -> LevelFilter {
    match std::env::var("GALLERYRIP_LOG")
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("GALLERYRIP_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }
    std::env::current_dir().ok().map(|d| d.join("galleryrip-data"))
}

fn print_help() {
    println!(
        r#"galleryrip

Queues forum gallery threads and downloads their images.

Usage:
  galleryrip --submit "https://forum.example/threads/123-name[range]" --title "Name"
  galleryrip --run
  galleryrip --status <job id>

Options:
  --base-dir <path>   Data directory (default: $GALLERYRIP_BASE_DIR or ./galleryrip-data)
  --submit <url>      Queue a thread or post URL; append [range] for every post (repeatable)
  --title <text>      Folder title suffix for submitted URLs
  --status <id>       Print a job's status (repeatable)
  --list              List processing and pending jobs
  --run               Start workers and the repair scanner, block forever
  --repair-once       Run one repair sweep and exit

Environment:
  GALLERYRIP_LOG      debug | info | warn | error (default: info)
"#
    );
}
