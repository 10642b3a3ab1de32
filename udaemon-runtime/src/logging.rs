//! Logging backend: `tracing` to stderr in the foreground, to syslog once
//! running as a daemon.
//!
//! The subscriber is process-global and installed at most once; later calls
//! to [`setup_logging`] only adjust the level. `RUST_LOG` overrides the
//! initial level when set.

use std::ffi::CString;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use tracing::{Level, Metadata};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

const FALLBACK_IDENT: &str = "udaemon";

/// Verbosity of the logging backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn from_debug(debug: bool) -> Self {
        if debug {
            Self::Debug
        } else {
            Self::Info
        }
    }

    fn directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();
/// openlog(3) keeps the ident pointer, so it must live for the process.
static SYSLOG_IDENT: OnceLock<CString> = OnceLock::new();
static SYSLOG_OPEN: AtomicBool = AtomicBool::new(false);

/// Install the subscriber for `program_name`.
pub fn setup_logging(program_name: &str, foreground: bool, level: LogLevel) {
    if !foreground {
        open_syslog(program_name);
    }
    if FILTER.get().is_some() {
        set_log_level(level);
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let (filter, handle) = reload::Layer::new(filter);

    let stderr = foreground.then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(io::stderr)
    });
    let syslog = (!foreground).then(|| {
        fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .with_level(false)
            .without_time()
            .with_writer(SyslogMakeWriter)
    });

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(syslog)
        .try_init()
        .is_ok();
    if installed {
        let _ = FILTER.set(handle);
    }
}

/// Change the active level; a no-op before [`setup_logging`].
pub fn set_log_level(level: LogLevel) {
    let Some(handle) = FILTER.get() else {
        return;
    };
    if let Err(err) = handle.reload(EnvFilter::new(level.directive())) {
        tracing::warn!(error = %err, "cannot change log level");
    } else {
        tracing::debug!(?level, "log level changed");
    }
}

/// Close the syslog connection, if one is open.
pub fn shutdown_logging() {
    if SYSLOG_OPEN.swap(false, Ordering::SeqCst) {
        // SAFETY: closelog has no preconditions.
        unsafe { libc::closelog() };
    }
}

fn open_syslog(program_name: &str) {
    if SYSLOG_OPEN.swap(true, Ordering::SeqCst) {
        return;
    }
    let ident = SYSLOG_IDENT.get_or_init(|| {
        CString::new(program_name)
            .or_else(|_| CString::new(FALLBACK_IDENT))
            .unwrap_or_default()
    });
    openlog(ident);
}

/// Drop the syslog socket without losing the ident; the next record
/// reconnects. Called before inherited descriptors are closed, so syslog
/// never writes to (or closes) a recycled descriptor number.
pub(crate) fn reset_syslog() {
    if !SYSLOG_OPEN.load(Ordering::SeqCst) {
        return;
    }
    if let Some(ident) = SYSLOG_IDENT.get() {
        // SAFETY: closelog has no preconditions.
        unsafe { libc::closelog() };
        openlog(ident);
    }
}

fn openlog(ident: &'static CString) {
    // SAFETY: `ident` is a static C string that outlives the connection.
    unsafe {
        libc::openlog(
            ident.as_ptr(),
            libc::LOG_PID | libc::LOG_CONS | libc::LOG_ODELAY,
            libc::LOG_DAEMON,
        )
    };
}

fn syslog_priority(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        _ => libc::LOG_DEBUG,
    }
}

struct SyslogMakeWriter;

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter::new(syslog_priority(meta.level()))
    }
}

/// Buffers one formatted event and submits it as a single syslog record.
struct SyslogWriter {
    priority: libc::c_int,
    buf: Vec<u8>,
}

impl SyslogWriter {
    fn new(priority: libc::c_int) -> Self {
        Self {
            priority,
            buf: Vec::with_capacity(256),
        }
    }
}

impl io::Write for SyslogWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        let line = String::from_utf8_lossy(&self.buf);
        let line = line.trim_end().replace('\0', " ");
        if line.is_empty() {
            return;
        }
        let Ok(message) = CString::new(line) else {
            return;
        };
        // SAFETY: constant "%s" format with one NUL-terminated argument.
        unsafe { libc::syslog(self.priority, b"%s\0".as_ptr().cast(), message.as_ptr()) };
    }
}
