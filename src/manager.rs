//! Artifact manager: the façade over registry pulls, the on-disk cache,
//! single-flight coordination and the metadata caches.
//!
//! Every operation follows the same lifecycle: parse and validate the
//! version against the current release snapshot, probe the cache, and only
//! on a miss run a producer behind the single-flight key for the entry.
//! Producers are detached from their callers, so abandoning a wait never
//! cancels a pull other callers are sharing.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use serde::de::DeserializeOwned;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Error;
use crate::flight::Group;
use crate::metadata::{TagIndex, VersionsCache};
use crate::registry::{
    http::HttpRegistry, parse_reference, ImageRef, Puller, Reference, RemoteRegistry,
    EXTENSIONS_MANIFEST_PATH, IMAGER_REPOSITORY, OVERLAYS_MANIFEST_PATH,
    TALOSCTL_ALL_REPOSITORY, TALOSCTL_MANIFEST_PATH,
};
use crate::store::{Produce, Store};
use crate::types::{Arch, ExtensionRef, Kind, OverlayKind, OverlayRef, TalosctlTuple};
use crate::version;

const VERSIONS_FLIGHT_KEY: &str = "talos-versions";

/// One puller per supported architecture.
struct Pullers {
    amd64: Puller,
    arm64: Puller,
}

impl Pullers {
    fn new(client: &Arc<dyn RemoteRegistry>) -> Self {
        Self {
            amd64: Puller::new(Arc::clone(client), Arch::Amd64),
            arm64: Puller::new(Arc::clone(client), Arch::Arm64),
        }
    }

    fn get(&self, arch: Arch) -> &Puller {
        match arch {
            Arch::Amd64 => &self.amd64,
            Arch::Arm64 => &self.arm64,
        }
    }

    fn all(&self) -> Vec<(Arch, Puller)> {
        vec![
            (Arch::Amd64, self.amd64.clone()),
            (Arch::Arm64, self.arm64.clone()),
        ]
    }
}

/// Loads, caches and serves release artifacts.
///
/// The storage root is created fresh at initialization and removed when the
/// manager is dropped (or [`Manager::close`] is called), so no reconciliation
/// with previous process lifetimes is ever needed.
pub struct Manager {
    config: Config,
    root: TempDir,
    schematics_path: PathBuf,
    store: Arc<Store>,
    client: Arc<dyn RemoteRegistry>,
    pullers: Pullers,
    flights: Group<()>,
    versions: Arc<VersionsCache>,
    extensions: Arc<TagIndex<ExtensionRef>>,
    overlays: Arc<TagIndex<OverlayRef>>,
    tuples: Arc<TagIndex<TalosctlTuple>>,
}

impl Manager {
    /// Create a manager backed by the production registry client.
    pub fn new(config: Config) -> Result<Self, Error> {
        let client = HttpRegistry::new(
            config.insecure_image_registry,
            config.registry_refresh_interval,
            config.remote.clone(),
        )?;

        Self::with_client(config, Arc::new(client))
    }

    /// Create a manager with an explicit registry client (tests plug in
    /// fakes here).
    pub fn with_client(config: Config, client: Arc<dyn RemoteRegistry>) -> Result<Self, Error> {
        let root = tempfile::Builder::new()
            .prefix("imageforge-")
            .tempdir()
            .map_err(|err| Error::io("failed to create storage root", &err))?;

        // Reserved for the schematic storage subsystem.
        let schematics_path = root.path().join("schematics");
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(&schematics_path)
            .map_err(|err| Error::io("failed to create schematics directory", &err))?;

        info!(root = %root.path().display(), "artifact storage initialized");

        Ok(Self {
            store: Arc::new(Store::new(root.path())),
            pullers: Pullers::new(&client),
            versions: Arc::new(VersionsCache::new(config.talos_version_recheck_interval)),
            extensions: Arc::new(TagIndex::new()),
            overlays: Arc::new(TagIndex::new()),
            tuples: Arc::new(TagIndex::new()),
            flights: Group::new(),
            schematics_path,
            config,
            client,
            root,
        })
    }

    /// Root directory all returned paths live under.
    pub fn storage_path(&self) -> &Path {
        self.root.path()
    }

    /// The reserved `schematics/` subdirectory.
    pub fn schematics_path(&self) -> &Path {
        &self.schematics_path
    }

    /// Remove the storage root now instead of at drop time.
    pub fn close(self) -> Result<(), Error> {
        self.root
            .close()
            .map_err(|err| Error::io("failed to remove storage root", &err))
    }

    /// Path of one artifact inside the extracted release bundle.
    pub async fn artifact(&self, version: &str, arch: Arch, kind: Kind) -> Result<PathBuf, Error> {
        let tag = self.validated_tag(version).await?;

        let producer = BundleExtract {
            pullers: self.pullers.all(),
            image: self.source_image(IMAGER_REPOSITORY, Reference::Tag(tag.clone())),
        };
        self.ensure_entry(&tag, producer).await?;

        self.store
            .read(&tag, &format!("{}/{}", arch.as_str(), kind.file_name()))
    }

    /// OCI layout of the installer(-base) image for a version.
    pub async fn installer_image(&self, arch: Arch, version: &str) -> Result<PathBuf, Error> {
        let parsed = version::parse(version)?;
        self.validate_version(&parsed).await?;
        let tag = version::tag(&parsed);

        let key = format!("{arch}-installer-{tag}");
        let repository = version::installer_repository(&parsed);
        let producer = LayoutPull {
            puller: self.pullers.get(arch).clone(),
            image: self.source_image(repository, Reference::Tag(tag)),
        };

        self.ensure_entry(&key, producer).await
    }

    /// OCI layout of a system extension image, pulled by digest.
    pub async fn extension_image(
        &self,
        arch: Arch,
        extension: &ExtensionRef,
    ) -> Result<PathBuf, Error> {
        let key = format!("{arch}-{}", extension.digest);
        let producer = LayoutPull {
            puller: self.pullers.get(arch).clone(),
            image: self.source_ref(&extension.tagged_reference, &extension.digest)?,
        };

        self.ensure_entry(&key, producer).await
    }

    /// OCI layout of an overlay image, pulled by digest.
    pub async fn overlay_image(&self, arch: Arch, overlay: &OverlayRef) -> Result<PathBuf, Error> {
        let key = format!("{arch}-{}", overlay.digest);
        let producer = LayoutPull {
            puller: self.pullers.get(arch).clone(),
            image: self.source_ref(&overlay.tagged_reference, &overlay.digest)?,
        };

        self.ensure_entry(&key, producer).await
    }

    /// Path of one asset inside an extracted overlay image.
    pub async fn overlay_artifact(
        &self,
        arch: Arch,
        overlay: &OverlayRef,
        kind: OverlayKind,
    ) -> Result<PathBuf, Error> {
        let key = format!("{arch}-{}-overlay", overlay.digest);
        let producer = OverlayExtract {
            puller: self.pullers.get(arch).clone(),
            image: self.source_ref(&overlay.tagged_reference, &overlay.digest)?,
        };
        self.ensure_entry(&key, producer).await?;

        self.store.read(&key, kind.file_name())
    }

    /// OCI layout of the talosctl-all image for a version.
    ///
    /// A registry 404 surfaces as `NotFound` for the version: not every
    /// release publishes this image.
    pub async fn talosctl_image(&self, version: &str) -> Result<PathBuf, Error> {
        let parsed = version::parse(version)?;
        self.validate_version(&parsed).await?;
        let tag = version::tag(&parsed);

        let key = format!("talosctl-all-{tag}");
        // The image content spans every os/arch; the platform only drives
        // index resolution.
        let producer = LayoutPull {
            puller: self.pullers.get(Arch::Amd64).clone(),
            image: self.source_image(TALOSCTL_ALL_REPOSITORY, Reference::Tag(tag)),
        };

        match self.ensure_entry(&key, producer).await {
            Err(err) if err.is_not_found() => {
                Err(Error::not_found(format!("version {parsed} is not available")))
            }
            other => other,
        }
    }

    /// All release versions, refreshed when the snapshot ages out of the
    /// recheck window.
    pub async fn talos_versions(&self) -> Result<Vec<Version>, Error> {
        if let Some(versions) = self.versions.fresh() {
            return Ok(versions);
        }

        let client = Arc::clone(&self.client);
        let registry = self.config.image_registry.clone();
        let cache = Arc::clone(&self.versions);

        self.flights
            .run(VERSIONS_FLIGHT_KEY, async move {
                let tags = client.list_tags(&registry, IMAGER_REPOSITORY).await?;

                let mut versions: Vec<Version> = tags
                    .iter()
                    .filter_map(|tag| version::parse(tag).ok())
                    .collect();
                versions.sort();

                debug!(count = versions.len(), "release versions refreshed");
                cache.publish(versions);
                Ok(())
            })
            .await?;

        self.versions
            .current()
            .ok_or_else(|| Error::internal("versions snapshot missing after refresh"))
    }

    /// Official system extensions for a version.
    pub async fn official_extensions(&self, version: &str) -> Result<Vec<ExtensionRef>, Error> {
        self.tag_metadata(version, &self.extensions, "extensions", EXTENSIONS_MANIFEST_PATH)
            .await
    }

    /// Official overlays for a version.
    pub async fn official_overlays(&self, version: &str) -> Result<Vec<OverlayRef>, Error> {
        self.tag_metadata(version, &self.overlays, "overlays", OVERLAYS_MANIFEST_PATH)
            .await
    }

    /// talosctl binaries shipped for a version.
    pub async fn talosctl_tuples(&self, version: &str) -> Result<Vec<TalosctlTuple>, Error> {
        self.tag_metadata(version, &self.tuples, "tuples", TALOSCTL_MANIFEST_PATH)
            .await
    }

    async fn validate_version(&self, version: &Version) -> Result<(), Error> {
        let available = self.talos_versions().await?;

        if available.contains(version) {
            Ok(())
        } else {
            Err(Error::not_found(format!(
                "version {version} is not available"
            )))
        }
    }

    async fn validated_tag(&self, input: &str) -> Result<String, Error> {
        let parsed = version::parse(input)?;
        self.validate_version(&parsed).await?;
        Ok(version::tag(&parsed))
    }

    /// Registry host pulls are redirected to, when an override is set.
    fn pull_registry<'a>(&'a self, nominal: &'a str) -> &'a str {
        self.config
            .override_source_image_registry
            .as_deref()
            .unwrap_or(nominal)
    }

    /// Reference to an image published under the configured base registry.
    fn source_image(&self, repository: &str, reference: Reference) -> ImageRef {
        ImageRef {
            registry: self.pull_registry(&self.config.image_registry).to_string(),
            repository: repository.to_string(),
            reference,
        }
    }

    /// Digest-pinned reference derived from an enumerated tagged reference,
    /// with the registry portion rewritten for mirrored pulls.
    fn source_ref(&self, tagged: &str, digest: &str) -> Result<ImageRef, Error> {
        let parsed = parse_reference(tagged)?;
        Ok(ImageRef::digested(
            self.pull_registry(&parsed.registry),
            &parsed.repository,
            digest,
        ))
    }

    /// Probe-then-produce for one on-disk entry.
    async fn ensure_entry<P: Produce>(&self, key: &str, producer: P) -> Result<PathBuf, Error> {
        let path = self.store.entry_path(key);

        if !self.store.probe(key) {
            let store = Arc::clone(&self.store);
            let owned = key.to_string();

            self.flights
                .run(key, async move { store.materialize(&owned, producer).await })
                .await?;
        }

        Ok(path)
    }

    /// Tag-keyed metadata lookup: serve from the index, or fetch the JSON
    /// manifest out of the imager image exactly once per tag.
    async fn tag_metadata<T>(
        &self,
        version: &str,
        index: &Arc<TagIndex<T>>,
        flight_prefix: &str,
        manifest_path: &'static str,
    ) -> Result<Vec<T>, Error>
    where
        T: Clone + DeserializeOwned + Send + Sync + 'static,
    {
        let tag = self.validated_tag(version).await?;

        if let Some(items) = index.get(&tag) {
            return Ok(items);
        }

        let key = format!("{flight_prefix}-{tag}");
        // The manifests are architecture-independent; read them through the
        // amd64 puller.
        let puller = self.pullers.get(Arch::Amd64).clone();
        let image = self.source_image(IMAGER_REPOSITORY, Reference::Tag(tag.clone()));
        let index_ref = Arc::clone(index);
        let index_tag = tag.clone();

        self.flights
            .run(&key, async move {
                // A previous flight may have finished between the index miss
                // and this producer starting.
                if index_ref.get(&index_tag).is_some() {
                    return Ok(());
                }

                let bytes = puller.read_file(&image, manifest_path).await?;

                let items: Vec<T> = serde_json::from_slice(&bytes)
                    .map_err(|err| Error::internal(format!("malformed {manifest_path}: {err}")))?;

                debug!(tag = %index_tag, count = items.len(), path = manifest_path, "metadata fetched");
                index_ref.insert(&index_tag, items);
                Ok(())
            })
            .await?;

        index
            .get(&tag)
            .ok_or_else(|| Error::internal(format!("metadata for {tag} missing after fetch")))
    }
}

/// Pulls one image and writes it as an OCI layout.
struct LayoutPull {
    puller: Puller,
    image: ImageRef,
}

#[async_trait]
impl Produce for LayoutPull {
    async fn produce(&self, dest: &Path) -> Result<(), Error> {
        info!(image = %self.image, platform = %self.puller.platform(), "pulling image");
        self.puller.pull_to_layout(&self.image, dest).await?;
        Ok(())
    }
}

/// Unpacks the imager image for every architecture and keeps the per-arch
/// artifact trees (`usr/install/<arch>`) as the bundle content.
struct BundleExtract {
    pullers: Vec<(Arch, Puller)>,
    image: ImageRef,
}

#[async_trait]
impl Produce for BundleExtract {
    async fn produce(&self, dest: &Path) -> Result<(), Error> {
        for (arch, puller) in &self.pullers {
            info!(image = %self.image, %arch, "extracting release bundle");

            let scratch = dest.join(format!(".unpack-{arch}"));
            fs::create_dir_all(&scratch)
                .map_err(|err| Error::io("failed to create unpack scratch", &err))?;

            puller.unpack(&self.image, &scratch).await?;

            let artifacts = scratch.join("usr/install").join(arch.as_str());
            if !artifacts.exists() {
                return Err(Error::internal(format!(
                    "image {} carries no artifacts for {arch}",
                    self.image
                )));
            }

            fs::rename(&artifacts, dest.join(arch.as_str()))
                .map_err(|err| Error::io("failed to place bundle artifacts", &err))?;
            fs::remove_dir_all(&scratch)
                .map_err(|err| Error::io("failed to remove unpack scratch", &err))?;
        }

        Ok(())
    }
}

/// Unpacks an overlay image; its root tree is the asset set.
struct OverlayExtract {
    puller: Puller,
    image: ImageRef,
}

#[async_trait]
impl Produce for OverlayExtract {
    async fn produce(&self, dest: &Path) -> Result<(), Error> {
        info!(image = %self.image, "extracting overlay");
        self.puller.unpack(&self.image, dest).await?;
        Ok(())
    }
}
