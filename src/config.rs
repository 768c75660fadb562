//! Manager configuration.

use std::time::Duration;

use anyhow::Result;

/// Configuration for the artifact manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base registry all nominal image references point at.
    pub image_registry: String,
    /// Optional mirror; when set, the registry portion of every pulled
    /// reference is rewritten to it, preserving repository paths.
    pub override_source_image_registry: Option<String>,
    /// Permit plaintext HTTP to the registry.
    pub insecure_image_registry: bool,
    /// How often the registry client refreshes its session state.
    pub registry_refresh_interval: Duration,
    /// Freshness window for the cached list of release versions.
    pub talos_version_recheck_interval: Duration,
    /// Knobs forwarded to the registry client.
    pub remote: RemoteOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_registry: "ghcr.io".to_string(),
            override_source_image_registry: None,
            insecure_image_registry: false,
            registry_refresh_interval: Duration::from_secs(3600), // 1 hour
            talos_version_recheck_interval: Duration::from_secs(900), // 15 minutes
            remote: RemoteOptions::default(),
        }
    }
}

/// Options forwarded to the registry client.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Optional bearer token for registry authentication.
    pub auth_token: Option<String>,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
    /// Per-request timeout covering the whole body.
    pub total_timeout: Duration,
    /// Verify blob contents against their declared digests.
    pub verify_digests: bool,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            auth_token: None,
            connect_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(1800), // 30 minutes
            verify_digests: true,
        }
    }
}

impl Config {
    /// Load configuration from `FORGE_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let image_registry =
            std::env::var("FORGE_IMAGE_REGISTRY").unwrap_or(defaults.image_registry);

        let override_source_image_registry = std::env::var("FORGE_OVERRIDE_SOURCE_IMAGE_REGISTRY")
            .ok()
            .filter(|s| !s.is_empty());

        let insecure_image_registry = std::env::var("FORGE_INSECURE_IMAGE_REGISTRY")
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let registry_refresh_interval = env_secs(
            "FORGE_REGISTRY_REFRESH_INTERVAL",
            defaults.registry_refresh_interval,
        )?;

        let talos_version_recheck_interval = env_secs(
            "FORGE_TALOS_VERSION_RECHECK_INTERVAL",
            defaults.talos_version_recheck_interval,
        )?;

        let remote = RemoteOptions {
            auth_token: std::env::var("FORGE_REGISTRY_AUTH_TOKEN")
                .ok()
                .filter(|s| !s.is_empty()),
            ..RemoteOptions::default()
        };

        Ok(Self {
            image_registry,
            override_source_image_registry,
            insecure_image_registry,
            registry_refresh_interval,
            talos_version_recheck_interval,
            remote,
        })
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(value) => {
            let secs: u64 = value
                .parse()
                .map_err(|err| anyhow::anyhow!("invalid {name}={value:?}: {err}"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}
