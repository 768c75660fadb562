//! Artifact fetching and caching for the imageforge machine-image build
//! service.
//!
//! The manager sits between a build pipeline and remote OCI registries and
//! materializes the inputs a downstream imager needs: extracted release
//! bundles, installer base images, extension and overlay images, talosctl
//! binaries, and version/capability metadata derived from registry tags.
//!
//! Remote pulls are expensive, so the manager is built around three caching
//! layers:
//!
//! - an on-disk cache keyed by deterministic entry names, populated through
//!   atomic temp-then-rename materialization (`store`)
//! - a single-flight table collapsing concurrent callers for the same entry
//!   onto one producer (`flight`)
//! - time-bounded and insert-once in-memory caches for registry-enumerated
//!   metadata (`metadata`)
//!
//! ## Modules
//!
//! - `manager`: the façade composing the layers below
//! - `registry`: image references, the remote-client seam, the HTTP client
//! - `store`: on-disk cache with atomic materialization
//! - `flight`: single-flight coordination
//! - `metadata`: versions snapshot and per-tag indices

pub mod config;
pub mod error;
pub mod flight;
pub mod manager;
pub mod metadata;
pub mod registry;
pub mod store;
pub mod types;
pub mod version;

pub use config::{Config, RemoteOptions};
pub use error::Error;
pub use manager::Manager;
pub use types::{Arch, ExtensionRef, Kind, OverlayKind, OverlayRef, TalosctlTuple};
