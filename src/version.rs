//! Version parsing and tag rendering.
//!
//! Registry tags are `"v" + semver`. Input parsing is tolerant: a leading
//! `v` is accepted and missing minor/patch components are padded with zeros,
//! so `v1.7`, `1.7` and `1.7.0` all resolve to the same tag.

use semver::Version;

use crate::error::Error;
use crate::registry::{INSTALLER_BASE_REPOSITORY, INSTALLER_REPOSITORY};

/// Parse a version string, tolerating a leading `v` and missing components.
pub fn parse(input: &str) -> Result<Version, Error> {
    let trimmed = input.trim();
    let bare = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    if bare.is_empty() {
        return Err(Error::invalid_version(input, "empty version"));
    }

    // Pad missing minor/patch, but only when the core is purely numeric
    // dot-separated components (pre-release/build metadata keeps its shape).
    let padded;
    let candidate = if bare.contains(['-', '+']) {
        bare
    } else {
        match bare.split('.').count() {
            1 => {
                padded = format!("{bare}.0.0");
                &padded
            }
            2 => {
                padded = format!("{bare}.0");
                &padded
            }
            _ => bare,
        }
    };

    Version::parse(candidate).map_err(|err| Error::invalid_version(input, err))
}

/// Render the registry tag for a version.
pub fn tag(version: &Version) -> String {
    format!("v{version}")
}

/// Select the installer repository for a version.
///
/// The installer image was split out as `installer-base` starting with
/// 1.10.0; earlier releases publish the self-contained `installer` image.
pub fn installer_repository(version: &Version) -> &'static str {
    if *version >= Version::new(1, 10, 0) {
        INSTALLER_BASE_REPOSITORY
    } else {
        INSTALLER_REPOSITORY
    }
}
