use crate::cm::asyncutil::TaskTracker;
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl Level {
    pub fn name(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    fn from_u8(v: u8) -> Level {
        match v {
            0 => Level::Debug,
            2 => Level::Warn,
            3 => Level::Error,
            _ => Level::Info,
        }
    }
}

pub fn parse_level(s: &str) -> Level {
    match s {
        "DEBUG" => Level::Debug,
        "WARN" => Level::Warn,
        "ERROR" => Level::Error,
        _ => Level::Info,
    }
}

enum SinkMsg {
    Line(String),
    Reopen { path: PathBuf, max_size: u64 },
}

/// Leveled daemon logger. Lines go to stderr immediately (journald picks
/// them up) and through an unbounded channel to a size-rotated log file.
/// The handle is cheap to clone; level changes are visible on the next
/// log call.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    level: AtomicU8,
    tx: Mutex<Option<mpsc::UnboundedSender<SinkMsg>>>,
}

impl Logger {
    /// A logger with no file sink yet (early boot, tests).
    pub fn stderr_only(level: Level) -> Logger {
        Logger {
            inner: Arc::new(LoggerInner {
                level: AtomicU8::new(level as u8),
                tx: Mutex::new(None),
            }),
        }
    }

    /// Start the file writer task. Replaces any previous sink.
    pub fn attach_file(
        &self,
        tasks: &TaskTracker,
        path: PathBuf,
        max_size: u64,
    ) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.tx.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        tasks.spawn(run_file_sink(path, max_size, rx))
    }

    /// Drop the file sink sender so the writer task drains and exits.
    pub fn close_sink(&self) {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }

    pub fn set_level(&self, level: Level) {
        self.inner.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self) -> Level {
        Level::from_u8(self.inner.level.load(Ordering::Relaxed))
    }

    /// Point the file sink at a new path/size without restarting the task.
    pub fn reopen(&self, path: PathBuf, max_size: u64) {
        if let Some(tx) = self
            .inner
            .tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            let _ = tx.send(SinkMsg::Reopen { path, max_size });
        }
    }

    pub fn should_log(&self, level: Level) -> bool {
        level >= self.level()
    }

    pub fn log(&self, level: Level, component: &str, msg: impl AsRef<str>) {
        if !self.should_log(level) {
            return;
        }
        let line = format_line(level, component, msg.as_ref());
        eprintln!("{line}");
        if let Some(tx) = self
            .inner
            .tx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            let _ = tx.send(SinkMsg::Line(line));
        }
    }

    pub fn debug(&self, component: &str, msg: impl AsRef<str>) {
        self.log(Level::Debug, component, msg);
    }

    pub fn info(&self, component: &str, msg: impl AsRef<str>) {
        self.log(Level::Info, component, msg);
    }

    pub fn warn(&self, component: &str, msg: impl AsRef<str>) {
        self.log(Level::Warn, component, msg);
    }

    pub fn error(&self, component: &str, msg: impl AsRef<str>) {
        self.log(Level::Error, component, msg);
    }
}

fn format_line(level: Level, component: &str, msg: &str) -> String {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    format!("{ts} {} [{component}] {msg}", level.name())
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        let _ = tokio::fs::create_dir_all(dir).await;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Rename the full log aside (single `.1` backup) and reopen a fresh file.
async fn rotate_reopen(path: &Path) -> std::io::Result<File> {
    let mut backup = path.as_os_str().to_owned();
    backup.push(".1");
    let backup = PathBuf::from(backup);
    let _ = tokio::fs::remove_file(&backup).await;
    let _ = tokio::fs::rename(path, &backup).await;
    open_append(path).await
}

async fn run_file_sink(
    mut path: PathBuf,
    mut max_size: u64,
    mut rx: mpsc::UnboundedReceiver<SinkMsg>,
) {
    let mut file = match open_append(&path).await {
        Ok(f) => f,
        Err(e) => {
            eprintln!(
                "{} ERROR [log] failed to open log file {} err={e}",
                Local::now().format("%Y-%m-%d_%H:%M:%S%.3f"),
                path.display()
            );
            // Keep draining so senders never block on a dead sink.
            while rx.recv().await.is_some() {}
            return;
        }
    };

    let mut written: u64 = tokio::fs::metadata(&path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    while let Some(msg) = rx.recv().await {
        match msg {
            SinkMsg::Reopen {
                path: new_path,
                max_size: new_max,
            } => {
                let _ = file.flush().await;
                match open_append(&new_path).await {
                    Ok(f) => {
                        file = f;
                        written = tokio::fs::metadata(&new_path)
                            .await
                            .map(|m| m.len())
                            .unwrap_or(0);
                        path = new_path;
                        max_size = new_max;
                    }
                    Err(e) => {
                        eprintln!(
                            "{} ERROR [log] failed to reopen log file {} err={e}",
                            Local::now().format("%Y-%m-%d_%H:%M:%S%.3f"),
                            new_path.display()
                        );
                    }
                }
            }
            SinkMsg::Line(mut line) => {
                if max_size > 0 && written >= max_size {
                    let _ = file.flush().await;
                    if let Ok(f) = rotate_reopen(&path).await {
                        file = f;
                        written = 0;
                    }
                }
                if !line.ends_with('\n') {
                    line.push('\n');
                }
                if file.write_all(line.as_bytes()).await.is_ok() {
                    written = written.saturating_add(line.len() as u64);
                }
            }
        }
    }
    let _ = file.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::Debug);
        assert_eq!(parse_level("WARN"), Level::Warn);
        assert_eq!(parse_level("ERROR"), Level::Error);
        assert_eq!(parse_level("INFO"), Level::Info);
        assert_eq!(parse_level("bogus"), Level::Info);
    }

    #[test]
    fn test_level_filtering() {
        let log = Logger::stderr_only(Level::Warn);
        assert!(!log.should_log(Level::Debug));
        assert!(!log.should_log(Level::Info));
        assert!(log.should_log(Level::Warn));
        assert!(log.should_log(Level::Error));
        log.set_level(Level::Debug);
        assert!(log.should_log(Level::Debug));
    }

    #[test]
    fn test_format_line_shape() {
        let line = format_line(Level::Info, "cycle", "decision=MAINTAIN");
        assert!(line.contains(" INFO [cycle] decision=MAINTAIN"), "{line}");
    }

    #[tokio::test]
    async fn test_file_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.log");
        let tasks = TaskTracker::new();
        let log = Logger::stderr_only(Level::Info);
        let handle = log.attach_file(&tasks, path.clone(), 0);

        log.info("test", "first line");
        log.debug("test", "filtered out");
        log.error("test", "second line");
        log.close_sink();
        handle.await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("first line"));
        assert!(contents.contains("second line"));
        assert!(!contents.contains("filtered out"));
    }

    #[tokio::test]
    async fn test_rotation_keeps_single_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu-manager.log");
        let tasks = TaskTracker::new();
        let log = Logger::stderr_only(Level::Info);
        // Tiny cap so every line after the first forces a rotation.
        let handle = log.attach_file(&tasks, path.clone(), 16);

        for i in 0..5 {
            log.info("test", format!("line number {i} with some padding"));
        }
        log.close_sink();
        handle.await.unwrap();

        let backup: PathBuf = {
            let mut s = path.as_os_str().to_owned();
            s.push(".1");
            s.into()
        };
        assert!(path.exists());
        assert!(backup.exists());
    }
}
