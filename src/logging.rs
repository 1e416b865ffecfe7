//! Tracing subscriber setup.
//!
//! Logs go to stderr by default, or to a file when one is configured. A log
//! file is rotated on every start (`hub.log` → `hub.log.1` → … → `.{keep}`)
//! and flushed after every write.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default filter when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_FILTER: &str = "toolhub=info,warn";

/// Number of rotated log files kept by default.
const DEFAULT_KEEP: u32 = 3;

/// The `logging` section of the hub config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogSettings {
    /// `EnvFilter` directives. `RUST_LOG` takes precedence when set.
    #[serde(default)]
    pub filter: Option<String>,
    /// Log file path. Unset means stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_keep")]
    pub keep: u32,
}

fn default_keep() -> u32 {
    DEFAULT_KEEP
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: None,
            file: None,
            json: false,
            keep: DEFAULT_KEEP,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Fails if the log file cannot be opened or a subscriber is already set.
pub fn init_tracing(settings: &LogSettings) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(settings.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });

    let result = match &settings.file {
        Some(path) => {
            let writer = open_log_file(path, settings.keep)?;
            let builder = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            if settings.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        None => {
            let builder = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true);
            if settings.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
    };
    result.map_err(|e| std::io::Error::other(format!("tracing init failed: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?settings.file,
        pid = std::process::id(),
        "=== toolhub starting ==="
    );
    Ok(())
}

/// Rotate existing logs and open a fresh file for appending.
fn open_log_file(path: &Path, keep: u32) -> std::io::Result<FlushingWriter> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    rotate_log_file(path, keep);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(FlushingWriter::new(file))
}

/// Rotate log files: `hub.log` → `hub.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer around a shared file that flushes after every write, so log
/// lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<parking_lot::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(parking_lot::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self.file.lock();
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::Write::flush(&mut *self.file.lock())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
