//! Single-instance guard for the desktop app.
//!
//! The first process to take the lock file becomes the primary. Later
//! launches send one `open` event to the service, which relays it to every
//! connected app, and then exit.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::client::send_one_shot;
use crate::protocol::Event;
use crate::transport::Endpoint;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance lock io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive advisory lock held for the lifetime of the primary instance.
/// Not reentrant: a second acquire from the same process also fails.
#[derive(Debug)]
pub struct InstanceLock {
    file: Option<File>,
    path: PathBuf,
}

impl InstanceLock {
    /// Returns `Ok(None)` when another holder already owns the lock.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>, InstanceError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| InstanceError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if is_contended(&err) => return Ok(None),
            Err(err) => return Err(io_err(err)),
        }

        file.set_len(0).map_err(io_err)?;
        file.write_all(format!("pid={}\n", std::process::id()).as_bytes())
            .map_err(io_err)?;
        file.flush().map_err(io_err)?;

        Ok(Some(Self {
            file: Some(file),
            path,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

/// True when a lock attempt failed only because another holder owns it.
fn is_contended(err: &io::Error) -> bool {
    let contended = fs2::lock_contended_error();
    contended.raw_os_error().is_some() && err.raw_os_error() == contended.raw_os_error()
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[derive(Debug)]
pub enum GuardOutcome {
    /// This process owns the lock and should run the app.
    Primary(InstanceLock),
    /// Another instance is running. `delivered` reports whether the `open`
    /// signal reached the service.
    Secondary { delivered: bool },
}

/// Takes the instance lock, or signals the running instance through the
/// service when the lock is already held.
pub async fn acquire_or_signal(
    lock_path: impl AsRef<Path>,
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<GuardOutcome, InstanceError> {
    let lock_path = lock_path.as_ref();
    if let Some(lock) = InstanceLock::try_acquire(lock_path)? {
        info!(event = "instance_primary", lock = %lock_path.display());
        return Ok(GuardOutcome::Primary(lock));
    }

    let delivered = match send_one_shot(endpoint, &Event::open(), timeout).await {
        Ok(()) => {
            info!(event = "instance_open_signalled", endpoint = %endpoint);
            true
        }
        Err(err) => {
            warn!(event = "instance_open_signal_failed", endpoint = %endpoint, error = %err);
            false
        }
    };
    Ok(GuardOutcome::Secondary { delivered })
}
