//! On-disk cache with atomic materialization.
//!
//! Entries live directly under the storage root, named by their cache key.
//! Existence of the final entry directory is the authoritative "present"
//! signal: producers fill a `<key>.partial` sibling which is renamed into
//! place only on success, so a crashed or failed producer never leaves a
//! half-populated entry visible to probes.

use std::fs;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Error;

/// A producer that populates one cache entry.
///
/// One implementation exists per key family (release-bundle extraction,
/// installer pull, …); the store decides where the output lands and whether
/// it becomes visible.
#[async_trait]
pub trait Produce: Send + Sync + 'static {
    /// Fill `dest` with the entry's content. `dest` exists and is empty.
    async fn produce(&self, dest: &Path) -> Result<(), Error>;
}

/// Cache rooted at a single exclusively-owned directory.
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path of the entry for `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Cheap presence check: a stat of the entry directory.
    pub fn probe(&self, key: &str) -> bool {
        self.entry_path(key).exists()
    }

    /// Run `producer` into a temporary path and atomically publish the
    /// result under `key`. On failure the partial output is removed and the
    /// final path stays absent.
    pub async fn materialize<P: Produce>(&self, key: &str, producer: P) -> Result<(), Error> {
        let final_path = self.entry_path(key);
        if final_path.exists() {
            // A previous generation completed between the caller's probe and
            // this call.
            return Ok(());
        }

        let partial = self.root.join(format!("{key}.partial"));
        if partial.exists() {
            fs::remove_dir_all(&partial)
                .map_err(|err| Error::io("failed to clear stale partial entry", &err))?;
        }
        fs::create_dir_all(&partial)
            .map_err(|err| Error::io("failed to create partial entry", &err))?;

        debug!(key, "materializing cache entry");

        match producer.produce(&partial).await {
            Ok(()) => {
                fs::rename(&partial, &final_path)
                    .map_err(|err| Error::io("failed to publish cache entry", &err))?;
                debug!(key, "cache entry published");
                Ok(())
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_dir_all(&partial) {
                    warn!(key, error = %cleanup, "failed to remove partial entry");
                }
                Err(err)
            }
        }
    }

    /// Resolve `subpath` inside the entry for `key`, stat'ing the result.
    pub fn read(&self, key: &str, subpath: &str) -> Result<PathBuf, Error> {
        let relative = Path::new(subpath);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir));
        if escapes {
            return Err(Error::not_found(format!(
                "{subpath:?} is not inside cache entry {key:?}"
            )));
        }

        let path = self.entry_path(key).join(relative);
        if !path.exists() {
            return Err(Error::not_found(format!(
                "no {subpath:?} in cache entry {key:?}"
            )));
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WriteFile {
        name: &'static str,
        contents: &'static str,
    }

    #[async_trait]
    impl Produce for WriteFile {
        async fn produce(&self, dest: &Path) -> Result<(), Error> {
            fs::write(dest.join(self.name), self.contents)
                .map_err(|err| Error::io("write failed", &err))
        }
    }

    struct FailAfterWrite;

    #[async_trait]
    impl Produce for FailAfterWrite {
        async fn produce(&self, dest: &Path) -> Result<(), Error> {
            fs::write(dest.join("leftover"), b"junk").map_err(|err| Error::io("write", &err))?;
            Err(Error::transport("registry went away"))
        }
    }

    #[tokio::test]
    async fn test_materialize_publishes_entry() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::new(root.path());

        assert!(!store.probe("v1.7.0"));
        store
            .materialize(
                "v1.7.0",
                WriteFile {
                    name: "vmlinuz",
                    contents: "kernel",
                },
            )
            .await
            .unwrap();

        assert!(store.probe("v1.7.0"));
        let path = store.read("v1.7.0", "vmlinuz").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "kernel");
    }

    #[tokio::test]
    async fn test_failed_producer_leaves_no_entry() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::new(root.path());

        let err = store.materialize("key", FailAfterWrite).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));

        assert!(!store.probe("key"));
        // The partial path must be gone as well.
        assert!(!root.path().join("key.partial").exists());

        // A later, successful producer recovers the entry.
        store
            .materialize(
                "key",
                WriteFile {
                    name: "file",
                    contents: "ok",
                },
            )
            .await
            .unwrap();
        assert!(store.probe("key"));
    }

    #[tokio::test]
    async fn test_materialize_is_idempotent_for_existing_entries() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::new(root.path());

        store
            .materialize(
                "key",
                WriteFile {
                    name: "file",
                    contents: "first",
                },
            )
            .await
            .unwrap();

        // Second materialization is a no-op; the failing producer never runs.
        store.materialize("key", FailAfterWrite).await.unwrap();
        let path = store.read("key", "file").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "first");
    }

    #[tokio::test]
    async fn test_read_rejects_traversal() {
        let root = tempfile::tempdir().unwrap();
        let store = Store::new(root.path());

        store
            .materialize(
                "key",
                WriteFile {
                    name: "file",
                    contents: "data",
                },
            )
            .await
            .unwrap();

        assert!(store.read("key", "../key/file").unwrap_err().is_not_found());
        assert!(store.read("key", "/etc/passwd").unwrap_err().is_not_found());
        assert!(store.read("key", "missing").unwrap_err().is_not_found());
    }
}
