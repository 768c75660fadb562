//! Artifact vocabulary: architectures, artifact kinds, and the reference
//! types produced by registry enumeration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Target machine architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    /// Both supported architectures, in a stable order.
    pub const ALL: [Arch; 2] = [Arch::Amd64, Arch::Arm64];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "amd64" => Some(Self::Amd64),
            "arm64" => Some(Self::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact kind inside an extracted release bundle.
///
/// Each kind maps to the file name the imager image ships under
/// `usr/install/<arch>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Kernel,
    Initramfs,
    SystemdBoot,
    SystemdStub,
    Dtb,
    UBoot,
    RpiFirmware,
}

impl Kind {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Kernel => "vmlinuz",
            Self::Initramfs => "initramfs.xz",
            Self::SystemdBoot => "systemd-boot.efi",
            Self::SystemdStub => "systemd-stub.efi",
            Self::Dtb => "dtb",
            Self::UBoot => "u-boot",
            Self::RpiFirmware => "raspberrypi-firmware",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Artifact kind inside an extracted overlay image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayKind {
    /// The overlay installer binary.
    Installer,
    /// The overlay's firmware/bootloader artifact tree.
    Artifacts,
}

impl OverlayKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Installer => "installer",
            Self::Artifacts => "artifacts",
        }
    }
}

impl fmt::Display for OverlayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// A system extension image enumerated for a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRef {
    /// Extension name, e.g. `siderolabs/amd-ucode`.
    pub name: String,
    /// Content digest of the extension image, `sha256:…`.
    pub digest: String,
    /// Full tagged reference the digest was resolved from.
    pub tagged_reference: String,
}

/// An overlay image enumerated for a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayRef {
    /// Overlay name, e.g. `rpi_generic`.
    pub name: String,
    /// Content digest of the overlay image, `sha256:…`.
    pub digest: String,
    /// Full tagged reference the digest was resolved from.
    pub tagged_reference: String,
}

/// One talosctl binary shipped in the talosctl-all image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalosctlTuple {
    /// Target operating system, e.g. `linux`, `darwin`, `windows`.
    pub os: String,
    /// Target architecture, e.g. `amd64`, `arm64`.
    pub arch: String,
    /// Binary name inside the image, e.g. `talosctl-linux-amd64`.
    pub name: String,
}
