//! Event Logger (spec §4.6): one structured record per terminal
//! transaction, serialized to a single append-only UTF-8 text file.
//!
//! Ground: the blocking-work-off-the-executor discipline already used by
//! the teacher's `httproxy::start::forward_via_ureq` (`smol::unblock`),
//! applied here to file writes instead of an HTTP client call, serialized
//! under `mea::mutex::Mutex` the same way the teacher serializes its
//! shutdown gate.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use mea::mutex::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed { status: u16, bytes: u64 },
    Blocked,
    Error { reason: String },
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub severity: Severity,
    pub verdict: Verdict,
    pub client: SocketAddr,
    pub destination: (String, u16),
    pub method: String,
    pub target: String,
    pub version: String,
}

impl LogRecord {
    pub fn allowed(
        client: SocketAddr,
        destination: (String, u16),
        method: impl Into<String>,
        target: impl Into<String>,
        version: impl Into<String>,
        status: u16,
        bytes: u64,
    ) -> Self {
        LogRecord {
            severity: Severity::Info,
            verdict: Verdict::Allowed { status, bytes },
            client,
            destination,
            method: method.into(),
            target: target.into(),
            version: version.into(),
        }
    }

    pub fn blocked(
        client: SocketAddr,
        destination: (String, u16),
        method: impl Into<String>,
        target: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        LogRecord {
            severity: Severity::Warning,
            verdict: Verdict::Blocked,
            client,
            destination,
            method: method.into(),
            target: target.into(),
            version: version.into(),
        }
    }

    pub fn error(
        client: SocketAddr,
        destination: (String, u16),
        method: impl Into<String>,
        target: impl Into<String>,
        version: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        LogRecord {
            severity: Severity::Error,
            verdict: Verdict::Error {
                reason: reason.into(),
            },
            client,
            destination,
            method: method.into(),
            target: target.into(),
            version: version.into(),
        }
    }

    /// Renders the fixed textual schema of spec §6.
    pub fn render(&self) -> String {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let verdict_name = match &self.verdict {
            Verdict::Allowed { .. } => "ALLOWED",
            Verdict::Blocked => "BLOCKED",
            Verdict::Error { .. } => "ERROR",
        };
        let mut line = format!(
            "{ts} - {} - {verdict_name} | {} -> {}:{} | {} {} {}",
            self.severity.as_str(),
            self.client,
            self.destination.0,
            self.destination.1,
            self.method,
            self.target,
            self.version,
        );
        match &self.verdict {
            Verdict::Allowed { status, bytes } => {
                line.push_str(&format!(" | {status} | {bytes} bytes"));
            }
            Verdict::Blocked => {}
            Verdict::Error { reason } => {
                line.push_str(&format!(" | {reason}"));
            }
        }
        line
    }
}

/// Append-only sink for `LogRecord`s. Tolerates I/O errors by dropping the
/// record and logging through the diagnostic logger instead of blocking or
/// propagating failure into the connection path (spec §4.6).
#[derive(Clone)]
pub struct EventLogger {
    path: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl EventLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        EventLogger {
            path: Arc::new(path.into()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn log(&self, record: LogRecord) {
        let line = record.render();
        let path = self.path.clone();

        // Only one writer at a time; callers never interleave partial
        // lines (spec §4.6).
        let _guard = self.write_lock.lock().await;
        let result = smol::unblock(move || append_line(&path, &line)).await;
        if let Err(e) = result {
            log::error!("dropping transaction log record, I/O error: {e}");
        }
    }
}

fn append_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    file.flush()
}
