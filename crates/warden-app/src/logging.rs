use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/// Keeps the optional log file alive for the life of the process.
pub struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Installs the global subscriber. `RUST_LOG` wins, then `--debug`, then
/// `WARDEN_LOG_LEVEL`, then `info`.
pub fn init_logging(debug: bool, log_dir: &str, file_stem: &str) -> Option<LogGuard> {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("WARDEN_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(log_dir, file_stem) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Mirrors every log line to stderr and the log file. Stdout is left to the
/// console front-end.
struct MultiWriter {
    stderr: io::Stderr,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stderr: io::stderr(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, file_stem: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{file_stem}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_true_accepts_common_spellings() {
        for (idx, value) in ["1", "true", "YES", " on "].iter().enumerate() {
            let key = format!("WARDEN_TEST_ENV_TRUE_{idx}");
            std::env::set_var(&key, value);
            assert!(env_true(&key), "{value}");
            std::env::remove_var(&key);
        }
        std::env::set_var("WARDEN_TEST_ENV_FALSE", "0");
        assert!(!env_true("WARDEN_TEST_ENV_FALSE"));
        std::env::remove_var("WARDEN_TEST_ENV_FALSE");
        assert!(!env_true("WARDEN_TEST_ENV_UNSET"));
    }

    #[test]
    fn log_file_is_created_and_appended() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("logs");
        let guard = open_log_file(dir.to_str().expect("utf8 dir"), "warden").expect("open");
        let mut writer = MultiWriter::new(guard.file.clone());
        writer.write_all(b"first\n").expect("write");
        writer.write_all(b"second\n").expect("write");
        writer.flush().expect("flush");

        let raw = std::fs::read_to_string(dir.join("warden.log")).expect("read");
        assert_eq!(raw, "first\nsecond\n");
    }

    #[test]
    fn empty_log_dir_disables_file() {
        let guard = open_log_file("  ", "warden").expect("open");
        assert!(guard.file.is_none());
    }
}
