//! Coordinated HDF5 file access.
//!
//! `CoordinatedFile` wraps the native HDF5 open so that the cluster-wide
//! coordination lock is always held while the file is open, and the process
//! cannot be quietly terminated in between. Read-only opens take a shared
//! lock; every writable variant takes the exclusive lock.
//!
//! Teardown order is load-bearing: the native handle closes first, then the
//! coordination lock is released, then termination-signal suppression ends.
//! The lock release is a non-blocking channel send, so the HDF5 library's
//! global lock is never held across a coordination round-trip.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::client::{CoordClient, LockGuard};
use crate::error::{CoordError, CoordResult};
use crate::kill_guard::{KillGuard, KillGuardHandle};
use crate::net::protocol::LockMode;
use crate::path_map::PathMap;

/// How the file is opened, mirroring the native HDF5 open variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read-only.
    Read,
    /// Existing file, read-write.
    ReadWrite,
    /// New file; fails if it exists.
    Create,
    /// Open read-write, creating the file if needed.
    Append,
}

impl OpenMode {
    /// The coordination lock mode implied by the open mode.
    pub fn lock_mode(self) -> LockMode {
        match self {
            OpenMode::Read => LockMode::Read,
            OpenMode::ReadWrite | OpenMode::Create | OpenMode::Append => LockMode::Write,
        }
    }
}

/// An open HDF5 file holding its coordination lock and a kill-guard handle.
///
/// Acts as the native handle via `Deref`; closing (explicitly or on drop)
/// releases the lock and the guard.
#[must_use]
pub struct CoordinatedFile {
    // Field order is the drop order the protocol requires: native close,
    // then lock release, then the kill guard.
    file: Option<hdf5::File>,
    lock: Option<LockGuard>,
    kill: Option<KillGuardHandle>,
    path: PathBuf,
}

impl CoordinatedFile {
    /// Open `path`, taking the coordination lock first.
    ///
    /// If the native open fails the lock and the kill guard are released
    /// before the error propagates.
    pub async fn open(
        client: &CoordClient,
        map: &PathMap,
        path: impl AsRef<Path>,
        mode: OpenMode,
    ) -> CoordResult<Self> {
        let path = path.as_ref();
        let key = map.lock_key(path);

        let kill = KillGuard::acquire();
        let lock = client.acquire(key, mode.lock_mode()).await?;

        let opened = match mode {
            OpenMode::Read => hdf5::File::open(path),
            OpenMode::ReadWrite => hdf5::File::open_rw(path),
            OpenMode::Create => hdf5::File::create_excl(path),
            OpenMode::Append => hdf5::File::append(path),
        };

        match opened {
            Ok(file) => {
                debug!(path = %path.display(), ?mode, "coordinated open");
                Ok(Self {
                    file: Some(file),
                    lock: Some(lock),
                    kill: Some(kill),
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                let _ = lock.release().await;
                drop(kill);
                Err(CoordError::Hdf5(e))
            }
        }
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The lock token guarding this file, for log correlation.
    pub fn lock_token(&self) -> Option<&str> {
        self.lock.as_ref().map(LockGuard::token)
    }

    /// Close the file and wait for the server to acknowledge the release.
    ///
    /// Dropping the value instead performs the same sequence with the
    /// release handed to the client's background task.
    pub async fn close(mut self) -> CoordResult<()> {
        if let Some(file) = self.file.take() {
            drop(file);
        }
        let result = match self.lock.take() {
            Some(lock) => lock.release().await,
            None => Ok(()),
        };
        self.kill.take();
        result
    }
}

impl Deref for CoordinatedFile {
    type Target = hdf5::File;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Self::Target {
        // Present from open until close(), which consumes self.
        self.file.as_ref().expect("file handle already closed")
    }
}

impl std::fmt::Debug for CoordinatedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatedFile")
            .field("path", &self.path)
            .field("token", &self.lock_token())
            .finish()
    }
}
