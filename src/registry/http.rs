//! OCI distribution client over HTTP.
//!
//! Speaks the registry v2 API directly: manifest resolution (including
//! platform selection through image indexes), blob pulls with digest
//! verification, tag listing, OCI image-layout writing, and file resolution
//! across an image's layers. The underlying HTTP client is rebuilt once it
//! is older than the configured refresh interval so long-lived processes do
//! not accumulate stale session state.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use super::unpack::{self, LayerHit};
use super::{ImageRef, Platform, Reference, RegistryError, RemoteRegistry};
use crate::config::RemoteOptions;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json";

const OCI_LAYOUT_MARKER: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const CREATED_ANNOTATION: &str = "org.opencontainers.image.created";

/// Content descriptor as it appears in manifests and indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformDescriptor>,
}

/// Platform fields of an index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformDescriptor {
    pub architecture: String,
    pub os: String,
}

/// Single-platform image manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Multi-platform image index; also the shape written to `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[allow(dead_code)]
    name: String,
    tags: Vec<String>,
}

struct Session {
    client: Client,
    established: Instant,
}

/// Production registry client.
pub struct HttpRegistry {
    insecure: bool,
    refresh_interval: Duration,
    options: RemoteOptions,
    session: Mutex<Session>,
}

impl HttpRegistry {
    pub fn new(
        insecure: bool,
        refresh_interval: Duration,
        options: RemoteOptions,
    ) -> Result<Self, RegistryError> {
        let client = build_client(&options)?;

        Ok(Self {
            insecure,
            refresh_interval,
            options,
            session: Mutex::new(Session {
                client,
                established: Instant::now(),
            }),
        })
    }

    /// Current HTTP client, rebuilt when the session has aged out.
    fn client(&self) -> Result<Client, RegistryError> {
        let mut session = self.session.lock().expect("registry session poisoned");

        if session.established.elapsed() >= self.refresh_interval {
            session.client = build_client(&self.options)?;
            session.established = Instant::now();
            debug!("registry session refreshed");
        }

        Ok(session.client.clone())
    }

    fn base_url(&self, registry: &str) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{scheme}://{registry}")
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.options.auth_token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    /// Resolve the reference to a single-platform manifest, following one
    /// level of image index if the registry serves one.
    async fn resolve_manifest(
        &self,
        image: &ImageRef,
        platform: Platform,
    ) -> Result<(Vec<u8>, Descriptor), RegistryError> {
        let reference = match &image.reference {
            Reference::Tag(tag) => tag.clone(),
            Reference::Digest(digest) => digest.clone(),
        };

        let body = self.fetch_manifest_bytes(image, &reference).await?;

        if let Ok(index) = serde_json::from_slice::<ImageIndex>(&body) {
            if !index.manifests.is_empty() {
                let chosen = select_platform_manifest(&index, platform).ok_or_else(|| {
                    RegistryError::NoPlatformManifest {
                        reference: image.to_string(),
                        platform: platform.to_string(),
                    }
                })?;

                let digest = chosen.digest.clone();
                let body = self.fetch_manifest_bytes(image, &digest).await?;
                let descriptor = descriptor_for(&body, platform);
                return Ok((body, descriptor));
            }
        }

        let descriptor = descriptor_for(&body, platform);
        Ok((body, descriptor))
    }

    async fn fetch_manifest_bytes(
        &self,
        image: &ImageRef,
        reference: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(&image.registry),
            image.repository,
            reference
        );

        debug!(url = %url, "fetching manifest");

        let request = self.client()?.get(&url).header("Accept", MANIFEST_ACCEPT);
        let response = self.authorize(request).send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?.to_vec();

                if self.options.verify_digests && reference.starts_with("sha256:") {
                    let computed = sha256_digest(&body);
                    if computed != reference {
                        return Err(RegistryError::DigestMismatch {
                            reference: image.to_string(),
                            expected: reference.to_string(),
                            actual: computed,
                        });
                    }
                }

                Ok(body)
            }
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(image.to_string())),
            status => Err(RegistryError::Unavailable(format!(
                "unexpected status {status} for {url}"
            ))),
        }
    }

    async fn fetch_blob(&self, image: &ImageRef, digest: &str) -> Result<Vec<u8>, RegistryError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(&image.registry),
            image.repository,
            digest
        );

        debug!(url = %url, "fetching blob");

        let response = self.authorize(self.client()?.get(&url)).send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?.to_vec();

                if self.options.verify_digests {
                    let computed = sha256_digest(&body);
                    if computed != digest {
                        return Err(RegistryError::DigestMismatch {
                            reference: image.to_string(),
                            expected: digest.to_string(),
                            actual: computed,
                        });
                    }
                }

                Ok(body)
            }
            StatusCode::NOT_FOUND => {
                Err(RegistryError::NotFound(format!("{image} blob {digest}")))
            }
            status => Err(RegistryError::Unavailable(format!(
                "unexpected status {status} for {url}"
            ))),
        }
    }

    /// Fetch all layer blobs into `scratch`, returning their paths in layer
    /// order.
    async fn fetch_layers(
        &self,
        image: &ImageRef,
        manifest: &Manifest,
        scratch: &Path,
    ) -> Result<Vec<std::path::PathBuf>, RegistryError> {
        let mut paths = Vec::with_capacity(manifest.layers.len());

        for (i, layer) in manifest.layers.iter().enumerate() {
            let bytes = self.fetch_blob(image, &layer.digest).await?;
            let path = scratch.join(format!("layer-{i}"));
            fs::write(&path, &bytes)?;
            paths.push(path);
        }

        Ok(paths)
    }
}

#[async_trait]
impl RemoteRegistry for HttpRegistry {
    async fn pull_to_layout(
        &self,
        image: &ImageRef,
        platform: Platform,
        dest: &Path,
    ) -> Result<(), RegistryError> {
        let (manifest_bytes, manifest_desc) = self.resolve_manifest(image, platform).await?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

        let blob_dir = dest.join("blobs").join("sha256");
        fs::create_dir_all(&blob_dir)?;
        fs::write(blob_dir.join(digest_hex(&manifest_desc.digest)), &manifest_bytes)?;

        let config_bytes = self.fetch_blob(image, &manifest.config.digest).await?;
        fs::write(blob_dir.join(digest_hex(&manifest.config.digest)), &config_bytes)?;

        for layer in &manifest.layers {
            let bytes = self.fetch_blob(image, &layer.digest).await?;
            fs::write(blob_dir.join(digest_hex(&layer.digest)), &bytes)?;
        }

        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(INDEX_MEDIA_TYPE.to_string()),
            manifests: vec![manifest_desc],
            annotations: Some(BTreeMap::from([(
                CREATED_ANNOTATION.to_string(),
                chrono::Utc::now().to_rfc3339(),
            )])),
        };
        fs::write(dest.join("index.json"), serde_json::to_vec(&index)?)?;
        fs::write(dest.join("oci-layout"), OCI_LAYOUT_MARKER)?;

        info!(
            image = %image,
            platform = %platform,
            layers = manifest.layers.len(),
            "image written as OCI layout"
        );

        Ok(())
    }

    async fn unpack(
        &self,
        image: &ImageRef,
        platform: Platform,
        dest: &Path,
    ) -> Result<(), RegistryError> {
        let (manifest_bytes, _) = self.resolve_manifest(image, platform).await?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

        let scratch = tempfile::tempdir()?;
        let layers = self.fetch_layers(image, &manifest, scratch.path()).await?;

        for layer in &layers {
            unpack::apply_layer(layer, dest)?;
        }

        info!(image = %image, layers = layers.len(), "image unpacked");

        Ok(())
    }

    async fn list_tags(
        &self,
        registry: &str,
        repository: &str,
    ) -> Result<Vec<String>, RegistryError> {
        let url = format!("{}/v2/{}/tags/list", self.base_url(registry), repository);

        debug!(url = %url, "listing tags");

        let response = self
            .authorize(self.client()?.get(&url))
            .send()
            .await
            .map_err(|err| RegistryError::Unavailable(err.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let list: TagList = response
                    .json()
                    .await
                    .map_err(|err| RegistryError::Unavailable(err.to_string()))?;
                Ok(list.tags)
            }
            StatusCode::NOT_FOUND => {
                Err(RegistryError::NotFound(format!("{registry}/{repository}")))
            }
            status => Err(RegistryError::Unavailable(format!(
                "unexpected status {status} for {url}"
            ))),
        }
    }

    async fn read_file(
        &self,
        image: &ImageRef,
        platform: Platform,
        path: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let (manifest_bytes, _) = self.resolve_manifest(image, platform).await?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

        let scratch = tempfile::tempdir()?;
        let layers = self.fetch_layers(image, &manifest, scratch.path()).await?;

        // Topmost layer wins, whether it carries the file or deletes it.
        for layer in layers.iter().rev() {
            match unpack::find_in_layer(layer, path)? {
                Some(LayerHit::Found(bytes)) => return Ok(bytes),
                Some(LayerHit::Whiteout) => break,
                None => {}
            }
        }

        Err(RegistryError::FileNotFound {
            reference: image.to_string(),
            path: path.to_string(),
        })
    }
}

fn build_client(options: &RemoteOptions) -> Result<Client, RegistryError> {
    Ok(Client::builder()
        .connect_timeout(options.connect_timeout)
        .timeout(options.total_timeout)
        .build()?)
}

fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// Descriptor for raw manifest bytes, carrying the platform it was selected
/// for.
fn descriptor_for(manifest_bytes: &[u8], platform: Platform) -> Descriptor {
    let media_type = serde_json::from_slice::<Manifest>(manifest_bytes)
        .ok()
        .and_then(|m| m.media_type)
        .unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_string());

    Descriptor {
        media_type,
        digest: sha256_digest(manifest_bytes),
        size: manifest_bytes.len() as u64,
        platform: Some(PlatformDescriptor {
            architecture: platform.arch.as_str().to_string(),
            os: platform.os.to_string(),
        }),
    }
}

fn select_platform_manifest(index: &ImageIndex, platform: Platform) -> Option<&Descriptor> {
    index.manifests.iter().find(|descriptor| {
        descriptor
            .platform
            .as_ref()
            .is_some_and(|p| p.architecture == platform.arch.as_str() && p.os == platform.os)
    })
}
