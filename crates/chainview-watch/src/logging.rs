use crate::config::WatchConfig;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

/// Keeps the log file open for the lifetime of the process.
pub struct LogGuard {
    path: Option<PathBuf>,
    _file: Option<Arc<File>>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Installs the global subscriber. Stdout is left to the report, so log
/// lines only go to stderr (when enabled) and the optional log file.
pub fn init_logging(config: &WatchConfig) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file, path) = match open_log_file(&config.log_dir) {
        Ok(Some((file, path))) => (Some(Arc::new(file)), Some(path)),
        Ok(None) => (None, None),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            (None, None)
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log_writer(config.log_stderr, file.clone()))
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(LogGuard { path, _file: file })
}

fn log_writer(stderr: bool, file: Option<Arc<File>>) -> BoxMakeWriter {
    let console = if stderr {
        BoxMakeWriter::new(io::stderr)
    } else {
        BoxMakeWriter::new(io::sink)
    };
    match file {
        Some(file) => BoxMakeWriter::new(console.and(file)),
        None => console,
    }
}

fn open_log_file(log_dir: &str) -> io::Result<Option<(File, PathBuf)>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("chainview-watch-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((file, path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn empty_log_dir_means_no_file() {
        assert!(open_log_file("  ").expect("open").is_none());
    }

    #[test]
    fn log_lines_reach_the_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let nested = dir.path().join("logs");
        let (file, path) = open_log_file(&nested.to_string_lossy())
            .expect("open")
            .expect("log file");
        assert_eq!(path.parent(), Some(nested.as_path()));

        let make_writer = log_writer(false, Some(Arc::new(file)));
        let mut writer = make_writer.make_writer();
        writer.write_all(b"stream_opened\n").expect("write");
        writer.flush().expect("flush");

        let contents = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(contents, "stream_opened\n");
    }
}
