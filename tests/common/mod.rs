//! Shared test fixtures: a programmable fake registry and manager builders.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use imageforge_artifacts::registry::{ImageRef, Platform, RegistryError, RemoteRegistry};
use imageforge_artifacts::{Config, Manager};

/// In-memory registry double.
///
/// Pull/unpack calls write small marker trees so cache entries are real
/// directories; counters and recorded references let tests assert on the
/// amount and target of remote I/O.
#[derive(Default)]
pub struct FakeRegistry {
    tags: Mutex<Vec<String>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    missing_repos: Mutex<Vec<String>>,
    pull_delay: Mutex<Duration>,
    failing_pulls: AtomicUsize,

    pub tag_list_calls: AtomicUsize,
    pub pull_calls: AtomicUsize,
    pub unpack_calls: AtomicUsize,
    pub read_calls: AtomicUsize,
    pub pulled: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn with_tags(tags: &[&str]) -> Arc<Self> {
        let registry = Self::default();
        registry.set_tags(tags);
        Arc::new(registry)
    }

    pub fn set_tags(&self, tags: &[&str]) {
        *self.tags.lock().unwrap() = tags.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_file(&self, path: &str, contents: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
    }

    /// Make every pull of `repository` respond as a registry 404.
    pub fn set_missing(&self, repository: &str) {
        self.missing_repos.lock().unwrap().push(repository.to_string());
    }

    /// Delay every pull/unpack, so tests can observe in-flight dedup.
    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock().unwrap() = delay;
    }

    /// Fail the next `n` pulls after they have written partial output.
    pub fn fail_next_pulls(&self, n: usize) {
        self.failing_pulls.store(n, Ordering::SeqCst);
    }

    pub fn pulled_references(&self) -> Vec<String> {
        self.pulled.lock().unwrap().clone()
    }

    async fn start_remote_call(&self, image: &ImageRef) -> Result<(), RegistryError> {
        let delay = *self.pull_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let is_missing = self
            .missing_repos
            .lock()
            .unwrap()
            .iter()
            .any(|repo| image.repository == *repo);
        if is_missing {
            return Err(RegistryError::NotFound(image.to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl RemoteRegistry for FakeRegistry {
    async fn pull_to_layout(
        &self,
        image: &ImageRef,
        _platform: Platform,
        dest: &Path,
    ) -> Result<(), RegistryError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.pulled.lock().unwrap().push(image.to_string());

        self.start_remote_call(image).await?;

        if self.failing_pulls.load(Ordering::SeqCst) > 0 {
            self.failing_pulls.fetch_sub(1, Ordering::SeqCst);
            // Leave partial output behind, as an interrupted pull would.
            fs::write(dest.join("half-written-blob"), b"junk")?;
            return Err(RegistryError::Unavailable("connection reset".to_string()));
        }

        let blob_dir = dest.join("blobs").join("sha256");
        fs::create_dir_all(&blob_dir)?;
        fs::write(blob_dir.join("fake"), image.to_string())?;
        fs::write(dest.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#)?;
        fs::write(dest.join("index.json"), b"{}")?;

        Ok(())
    }

    async fn unpack(
        &self,
        image: &ImageRef,
        platform: Platform,
        dest: &Path,
    ) -> Result<(), RegistryError> {
        self.unpack_calls.fetch_add(1, Ordering::SeqCst);
        self.pulled.lock().unwrap().push(image.to_string());

        self.start_remote_call(image).await?;

        // Release-bundle artifact tree.
        let install = dest.join("usr/install").join(platform.arch.as_str());
        fs::create_dir_all(&install)?;
        fs::write(install.join("vmlinuz"), format!("kernel-{}", platform.arch))?;
        fs::write(install.join("initramfs.xz"), b"initramfs")?;

        // Overlay asset tree.
        fs::write(dest.join("installer"), b"overlay-installer")?;
        fs::create_dir_all(dest.join("artifacts"))?;
        fs::write(dest.join("artifacts/u-boot.bin"), b"u-boot")?;

        Ok(())
    }

    async fn list_tags(
        &self,
        _registry: &str,
        _repository: &str,
    ) -> Result<Vec<String>, RegistryError> {
        self.tag_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tags.lock().unwrap().clone())
    }

    async fn read_file(
        &self,
        image: &ImageRef,
        _platform: Platform,
        path: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);

        self.files.lock().unwrap().get(path).cloned().ok_or_else(|| {
            RegistryError::FileNotFound {
                reference: image.to_string(),
                path: path.to_string(),
            }
        })
    }
}

pub fn manager(registry: &Arc<FakeRegistry>) -> Manager {
    manager_with_config(Config::default(), registry)
}

pub fn manager_with_config(config: Config, registry: &Arc<FakeRegistry>) -> Manager {
    Manager::with_client(config, Arc::clone(registry) as Arc<dyn RemoteRegistry>)
        .expect("manager construction")
}
