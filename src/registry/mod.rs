//! Registry access: image references, the remote-client seam, and the
//! platform-fixed puller adapter.
//!
//! The `RemoteRegistry` trait is the boundary to the actual OCI registry;
//! `http::HttpRegistry` is the production implementation and tests plug in
//! fakes. `Puller` narrows a client to one target platform so pull sites
//! never carry architecture plumbing.

pub mod http;
pub mod unpack;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::Error;
use crate::types::Arch;

/// Repository publishing the imager image; its tags are the release list.
pub const IMAGER_REPOSITORY: &str = "siderolabs/imager";
/// Installer repository for releases before the installer-base split.
pub const INSTALLER_REPOSITORY: &str = "siderolabs/installer";
/// Installer repository from the installer-base split on.
pub const INSTALLER_BASE_REPOSITORY: &str = "siderolabs/installer-base";
/// Repository of the os/arch-spanning talosctl image.
pub const TALOSCTL_ALL_REPOSITORY: &str = "siderolabs/talosctl-all";

/// Metadata manifests shipped inside the imager image.
pub const EXTENSIONS_MANIFEST_PATH: &str = "usr/share/imageforge/extensions.json";
pub const OVERLAYS_MANIFEST_PATH: &str = "usr/share/imageforge/overlays.json";
pub const TALOSCTL_MANIFEST_PATH: &str = "usr/share/imageforge/talosctl.json";

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0} not found in registry")]
    NotFound(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("digest mismatch for {reference}: expected {expected}, got {actual}")]
    DigestMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("no manifest for platform {platform} in {reference}")]
    NoPlatformManifest { reference: String, platform: String },

    #[error("file {path:?} not present in image {reference}")]
    FileNotFound { reference: String, path: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("layer unpack failed: {0}")]
    Unpack(#[from] unpack::UnpackError),
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) | RegistryError::FileNotFound { .. } => {
                Error::not_found(err.to_string())
            }
            RegistryError::Unavailable(_) | RegistryError::Http(_) => {
                Error::transport(err.to_string())
            }
            other => Error::internal(other.to_string()),
        }
    }
}

/// Tag or digest part of an image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => write!(f, ":{tag}"),
            Self::Digest(digest) => write!(f, "@{digest}"),
        }
    }
}

/// A fully-qualified image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub reference: Reference,
}

impl ImageRef {
    pub fn tagged(registry: &str, repository: &str, tag: &str) -> Self {
        Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference: Reference::Tag(tag.to_string()),
        }
    }

    pub fn digested(registry: &str, repository: &str, digest: &str) -> Self {
        Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference: Reference::Digest(digest.to_string()),
        }
    }

    /// The same reference redirected at another registry host; the
    /// repository path is preserved.
    pub fn with_registry(&self, registry: &str) -> Self {
        Self {
            registry: registry.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.registry, self.repository, self.reference)
    }
}

/// Parse a tagged or digested reference, e.g.
/// `ghcr.io/siderolabs/amd-ucode:20240115` or `ghcr.io/org/img@sha256:…`.
pub fn parse_reference(input: &str) -> Result<ImageRef, RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidReference {
        reference: input.to_string(),
        reason: reason.to_string(),
    };

    let (name, reference) = if let Some((name, digest)) = input.rsplit_once('@') {
        (name, Reference::Digest(digest.to_string()))
    } else if let Some((name, tag)) = input.rsplit_once(':') {
        if tag.contains('/') {
            // The colon belonged to a registry port, not a tag.
            (input, Reference::Tag("latest".to_string()))
        } else {
            (name, Reference::Tag(tag.to_string()))
        }
    } else {
        (input, Reference::Tag("latest".to_string()))
    };

    let (registry, repository) = name
        .split_once('/')
        .ok_or_else(|| invalid("missing registry host"))?;
    if !(registry.contains('.') || registry.contains(':') || registry == "localhost") {
        return Err(invalid("first path component is not a registry host"));
    }
    if repository.is_empty() {
        return Err(invalid("empty repository"));
    }

    Ok(ImageRef {
        registry: registry.to_string(),
        repository: repository.to_string(),
        reference,
    })
}

/// Target platform for a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub arch: Arch,
    pub os: &'static str,
}

impl Platform {
    pub fn linux(arch: Arch) -> Self {
        Self { arch, os: "linux" }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// Remote OCI registry operations.
///
/// Implemented by the production HTTP client and by test fakes.
#[async_trait]
pub trait RemoteRegistry: Send + Sync {
    /// Acquire the image for `platform` and write an OCI image layout at
    /// `dest`. Fails with [`RegistryError::NotFound`] when the registry has
    /// no manifest for the reference.
    async fn pull_to_layout(
        &self,
        image: &ImageRef,
        platform: Platform,
        dest: &Path,
    ) -> Result<(), RegistryError>;

    /// Extract the image's layered filesystem into `dest`.
    async fn unpack(
        &self,
        image: &ImageRef,
        platform: Platform,
        dest: &Path,
    ) -> Result<(), RegistryError>;

    /// All tag strings of a repository. Fails with
    /// [`RegistryError::Unavailable`] on transport errors.
    async fn list_tags(&self, registry: &str, repository: &str)
        -> Result<Vec<String>, RegistryError>;

    /// Bytes of a single file resolved across the image's layers.
    async fn read_file(
        &self,
        image: &ImageRef,
        platform: Platform,
        path: &str,
    ) -> Result<Vec<u8>, RegistryError>;
}

/// A registry client narrowed to one target platform.
#[derive(Clone)]
pub struct Puller {
    client: Arc<dyn RemoteRegistry>,
    platform: Platform,
}

impl Puller {
    pub fn new(client: Arc<dyn RemoteRegistry>, arch: Arch) -> Self {
        Self {
            client,
            platform: Platform::linux(arch),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub async fn pull_to_layout(&self, image: &ImageRef, dest: &Path) -> Result<(), RegistryError> {
        self.client.pull_to_layout(image, self.platform, dest).await
    }

    pub async fn unpack(&self, image: &ImageRef, dest: &Path) -> Result<(), RegistryError> {
        self.client.unpack(image, self.platform, dest).await
    }

    pub async fn read_file(&self, image: &ImageRef, path: &str) -> Result<Vec<u8>, RegistryError> {
        self.client.read_file(image, self.platform, path).await
    }
}
