//! Host-agnostic path translation and lock keys.
//!
//! Every host mounts the shared store somewhere different (`/mnt/lab` on the
//! control PC, `/home/user/lab` on an analysis box, a drive letter on
//! Windows). Locks must nevertheless be keyed identically everywhere, so
//! paths under the local mount point are rewritten to a fixed agnostic form
//! before they are used as lock keys, and back again when a remote path is
//! handed to this host.
//!
//! Both translations are pure and deterministic. A path that does not live
//! under the configured mount point passes through unchanged; locking still
//! works for such paths, but only between processes on one host.

use std::path::{Path, PathBuf};

use crate::config::StorageConfig;

/// Separator used in the agnostic form and in lock keys.
const AGNOSTIC_SEP: char = '\\';

/// Translator between per-host paths and the agnostic form of the shared
/// store.
#[derive(Debug, Clone)]
pub struct PathMap {
    shared_root: PathBuf,
    agnostic_prefix: String,
}

impl PathMap {
    /// Build a translator for a local mount point and agnostic prefix.
    pub fn new(shared_root: impl Into<PathBuf>, agnostic_prefix: impl Into<String>) -> Self {
        Self {
            shared_root: shared_root.into(),
            agnostic_prefix: agnostic_prefix.into(),
        }
    }

    /// Build a translator from the storage section of the configuration.
    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(&storage.shared_root, &storage.agnostic_prefix)
    }

    /// Convert a per-host path to the host-agnostic form.
    ///
    /// Paths outside the shared root are returned unchanged.
    pub fn to_agnostic(&self, path: &Path) -> String {
        match path.strip_prefix(&self.shared_root) {
            Ok(rel) => {
                let mut out = self.agnostic_prefix.clone();
                let mut first = true;
                for component in rel.components() {
                    if !first {
                        out.push(AGNOSTIC_SEP);
                    }
                    out.push_str(&component.as_os_str().to_string_lossy());
                    first = false;
                }
                out
            }
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    /// Convert an agnostic path back to this host's local form.
    ///
    /// Strings that do not start with the agnostic prefix are returned
    /// unchanged.
    pub fn from_agnostic(&self, agnostic: &str) -> PathBuf {
        match agnostic.strip_prefix(&self.agnostic_prefix) {
            Some(rel) => {
                let mut out = self.shared_root.clone();
                for part in rel.split(AGNOSTIC_SEP).filter(|p| !p.is_empty()) {
                    out.push(part);
                }
                out
            }
            None => PathBuf::from(agnostic),
        }
    }

    /// Produce the lock key for a per-host path.
    pub fn lock_key(&self, path: &Path) -> LockKey {
        LockKey::new(&self.to_agnostic(path))
    }
}

/// A canonical, host-independent identifier for a shared resource.
///
/// Keys are case-folded and use a single fixed separator, so two hosts that
/// refer to the same shared file always produce byte-identical keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    /// Canonicalize an agnostic path (or any resource name) into a key.
    pub fn new(raw: &str) -> Self {
        let folded: String = raw
            .chars()
            .map(|c| if c == '/' { AGNOSTIC_SEP } else { c })
            .collect::<String>()
            .to_lowercase();
        Self(folded)
    }

    /// The canonical key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key, yielding the canonical string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_agnostic_under_root() {
        let map = PathMap::new("/mnt/lab", "Z:\\");
        let agnostic = map.to_agnostic(Path::new("/mnt/lab/experiments/2025/shot.h5"));
        assert_eq!(agnostic, "Z:\\experiments\\2025\\shot.h5");
    }

    #[test]
    fn test_cross_host_translation() {
        // S6: host A with /mnt/lab, host B with /home/user/lab
        let host_a = PathMap::new("/mnt/lab", "Z:\\");
        let host_b = PathMap::new("/home/user/lab", "Z:\\");

        let agnostic = host_a.to_agnostic(Path::new("/mnt/lab/experiments/2025/shot.h5"));
        let local_b = host_b.from_agnostic(&agnostic);
        assert_eq!(local_b, PathBuf::from("/home/user/lab/experiments/2025/shot.h5"));
    }

    #[test]
    fn test_round_trip_under_root() {
        let map = PathMap::new("/mnt/lab", "Z:\\");
        let original = Path::new("/mnt/lab/runs/run_0042.h5");
        let round = map.from_agnostic(&map.to_agnostic(original));
        assert_eq!(round, original);
    }

    #[test]
    fn test_outside_root_is_identity() {
        let map = PathMap::new("/mnt/lab", "Z:\\");
        let outside = Path::new("/tmp/scratch.h5");
        assert_eq!(map.to_agnostic(outside), "/tmp/scratch.h5");
        assert_eq!(map.from_agnostic("/tmp/scratch.h5"), PathBuf::from("/tmp/scratch.h5"));
    }

    #[test]
    fn test_lock_key_case_folds() {
        let a = LockKey::new("Z:\\Experiments\\Shot.h5");
        let b = LockKey::new("z:\\experiments\\shot.h5");
        assert_eq!(a, b);
    }

    #[test]
    fn test_lock_key_fixes_separators() {
        let a = LockKey::new("z:/experiments/shot.h5");
        assert_eq!(a.as_str(), "z:\\experiments\\shot.h5");
    }

    #[test]
    fn test_same_file_two_hosts_same_key() {
        let host_a = PathMap::new("/mnt/lab", "Z:\\");
        let host_b = PathMap::new("/home/user/lab", "Z:\\");
        let key_a = host_a.lock_key(Path::new("/mnt/lab/Experiments/shot.h5"));
        let key_b = host_b.lock_key(Path::new("/home/user/lab/experiments/Shot.h5"));
        assert_eq!(key_a, key_b);
    }
}
