//! Logging setup for the changeflow server and CLI.
//!
//! Two layers: a size-rotated file under `<home>/logs/<app>.log` (no ANSI)
//! and stderr. `RUST_LOG` overrides [`DEFAULT_LOG_FILTER`] for both.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str = "changeflow=info,changeflow_sentinel=info,changeflow_db=warn";
const KEEP_FILES: usize = 5;
const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "CHANGEFLOW_HOME";

pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Console at `debug` regardless of `RUST_LOG`.
    pub verbose: bool,
    /// Console at `warn`; the file layer is unaffected.
    pub quiet: bool,
    /// Log directory; defaults to `<home>/logs`.
    pub log_dir: Option<PathBuf>,
}

pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let dir = match config.log_dir {
        Some(dir) => dir,
        None => logs_dir()?,
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;
    let writer = SharedLogWriter::open(&dir, config.app_name)?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.quiet {
        EnvFilter::new("warn")
    } else if config.verbose {
        EnvFilter::new(DEFAULT_LOG_FILTER.replace("=info", "=debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))?;

    Ok(())
}

/// `$CHANGEFLOW_HOME`, else `~/.changeflow`.
pub fn changeflow_home() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(HOME_ENV) {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join(".changeflow"))
        .ok_or_else(|| anyhow!("Could not determine home directory; set {}", HOME_ENV))
}

pub fn logs_dir() -> Result<PathBuf> {
    Ok(changeflow_home()?.join("logs"))
}

/// Append-only file that shifts `<app>.log` to `<app>.log.1` once it would
/// grow past the size limit, keeping at most `keep` files in total.
struct RotatingFile {
    dir: PathBuf,
    stem: String,
    keep: usize,
    limit: u64,
    file: Option<File>,
    written: u64,
}

impl RotatingFile {
    fn open(dir: &Path, app_name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        let mut rotating = Self {
            dir: dir.to_path_buf(),
            stem: file_stem(app_name),
            keep: keep.max(1),
            limit,
            file: None,
            written: 0,
        };
        rotating.reopen()?;
        if rotating.written > rotating.limit {
            rotating.rotate()?;
        }
        Ok(rotating)
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    fn numbered_path(&self, n: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.stem, n))
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        let last = self.keep - 1;
        if last > 0 {
            let oldest = self.numbered_path(last);
            if oldest.exists() {
                fs::remove_file(oldest)?;
            }
            for n in (1..last).rev() {
                let from = self.numbered_path(n);
                if from.exists() {
                    fs::rename(from, self.numbered_path(n + 1))?;
                }
            }
            let active = self.active_path();
            if active.exists() {
                fs::rename(active, self.numbered_path(1))?;
            }
        } else {
            // Single-file mode truncates in place.
            File::create(self.active_path())?;
        }
        self.reopen()
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            self.rotate()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("log file unavailable"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
struct SharedLogWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl SharedLogWriter {
    fn open(dir: &Path, app_name: &str) -> Result<Self> {
        let file = RotatingFile::open(dir, app_name, KEEP_FILES, ROTATE_AT_BYTES)
            .with_context(|| format!("Failed to open log file for {}", app_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

struct SharedLogGuard {
    inner: Arc<Mutex<RotatingFile>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogWriter {
    type Writer = SharedLogGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedLogGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedLogGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?
            .flush()
    }
}

fn file_stem(app_name: &str) -> String {
    app_name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_replaces_separators() {
        assert_eq!(file_stem("changeflow"), "changeflow");
        assert_eq!(file_stem("change flow/cli"), "change_flow_cli");
    }

    #[test]
    fn test_rotation_keeps_bounded_file_count() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut file = RotatingFile::open(dir.path(), "app", 3, 16).unwrap();
        for _ in 0..10 {
            file.write_all(b"0123456789abcdef").unwrap();
        }
        file.flush().unwrap();

        assert!(dir.path().join("app.log").exists());
        assert!(dir.path().join("app.log.1").exists());
        assert!(dir.path().join("app.log.2").exists());
        assert!(!dir.path().join("app.log.3").exists());
        let active = fs::metadata(dir.path().join("app.log")).unwrap().len();
        assert!(active <= 16);
    }

    #[test]
    fn test_reopen_appends_to_existing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut file = RotatingFile::open(dir.path(), "app", 2, 1024).unwrap();
            file.write_all(b"first\n").unwrap();
        }
        let mut file = RotatingFile::open(dir.path(), "app", 2, 1024).unwrap();
        file.write_all(b"second\n").unwrap();
        file.flush().unwrap();
        let content = fs::read_to_string(dir.path().join("app.log")).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
