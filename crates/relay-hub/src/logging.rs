use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::info;
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

/// Held by `main` so the log file stays open until the relay exits.
pub struct LogGuard {
    _sink: LogSink,
}

pub fn init_logging(debug: bool, log_dir: Option<&Path>, server_id: &str) -> Option<LogGuard> {
    let directive = level_directive(debug, std::env::var("RELAY_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let path = log_dir.map(|dir| log_file_path(dir, server_id));
    let sink = match &path {
        Some(path) => LogSink::with_file(path).unwrap_or_else(|err| {
            eprintln!("log_file_error: {}: {err}", path.display());
            LogSink::stdout_only()
        }),
        None => LogSink::stdout_only(),
    };
    let has_file = sink.file.is_some();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(sink.clone())
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    if let (true, Some(path)) = (has_file, &path) {
        info!(event = "relay_log_file", path = %path.display());
    }
    Some(LogGuard { _sink: sink })
}

/// `--debug` wins, then `RELAY_LOG_LEVEL`, then `info`.
fn level_directive(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    env_level
        .map(|level| level.trim().to_string())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// One file per relay instance. Characters that do not belong in a file
/// name are replaced, so any server id maps to a path inside `dir`.
fn log_file_path(dir: &Path, server_id: &str) -> PathBuf {
    let stem: String = server_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("relay-{stem}.log"))
}

/// Tees formatted records to stdout and, when configured, an append-only
/// file shared by every writer the subscriber makes.
#[derive(Clone)]
struct LogSink {
    file: Option<Arc<Mutex<File>>>,
}

impl LogSink {
    fn stdout_only() -> Self {
        Self { file: None }
    }

    fn with_file(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
        })
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().lock().write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().lock().flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            file.flush()?;
        }
        Ok(())
    }
}
