//! OCI layer application.
//!
//! Layers are (optionally gzipped) tar streams applied in order. Whiteout
//! entries (`.wh.<name>`, opaque `.wh..wh..opq`) delete content introduced
//! by lower layers; entries that would escape the destination are skipped.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::warn;

/// Errors from layer application.
#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Apply one layer blob onto `dest`.
pub fn apply_layer(blob: &Path, dest: &Path) -> Result<(), UnpackError> {
    let reader = BufReader::new(File::open(blob)?);

    if is_gzip(blob)? {
        apply_archive(&mut Archive::new(GzDecoder::new(reader)), dest)
    } else {
        apply_archive(&mut Archive::new(reader), dest)
    }
}

fn apply_archive<R: Read>(archive: &mut Archive<R>, dest: &Path) -> Result<(), UnpackError> {
    for entry in archive.entries()? {
        let mut entry = entry?;

        let path = match normalize(&entry.path()?) {
            Some(path) => path,
            None => {
                warn!(path = %entry.path()?.display(), "skipping entry escaping the layer root");
                continue;
            }
        };

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if let Some(target) = file_name.strip_prefix(".wh.") {
            remove_whiteout_target(&path, target, dest)?;
            continue;
        }

        entry.unpack(dest.join(&path))?;
    }

    Ok(())
}

/// Delete whatever a whiteout entry covers.
fn remove_whiteout_target(entry_path: &Path, target: &str, dest: &Path) -> Result<(), UnpackError> {
    let parent = entry_path.parent().unwrap_or(Path::new(""));

    if target == ".wh..opq" {
        // Opaque whiteout: the directory keeps only content from this layer
        // up, so drop everything beneath it.
        let dir = dest.join(parent);
        if dir.exists() {
            for child in fs::read_dir(&dir)? {
                let child = child?;
                let _ = fs::remove_file(child.path());
                let _ = fs::remove_dir_all(child.path());
            }
        }
    } else {
        let covered = dest.join(parent).join(target);
        let _ = fs::remove_file(&covered);
        let _ = fs::remove_dir_all(&covered);
    }

    Ok(())
}

/// What a single layer says about one file path.
#[derive(Debug)]
pub enum LayerHit {
    /// The layer contains the file; these are its bytes.
    Found(Vec<u8>),
    /// The layer deletes the file via a whiteout.
    Whiteout,
}

/// Scan one layer blob for `wanted` (a normalized relative path).
///
/// Used for topmost-first file resolution: the first layer returning a hit
/// decides whether the file exists in the composed filesystem.
pub fn find_in_layer(blob: &Path, wanted: &str) -> Result<Option<LayerHit>, UnpackError> {
    let reader = BufReader::new(File::open(blob)?);

    if is_gzip(blob)? {
        scan_archive(&mut Archive::new(GzDecoder::new(reader)), wanted)
    } else {
        scan_archive(&mut Archive::new(reader), wanted)
    }
}

fn scan_archive<R: Read>(
    archive: &mut Archive<R>,
    wanted: &str,
) -> Result<Option<LayerHit>, UnpackError> {
    let wanted = Path::new(wanted);
    let wanted_parent = wanted.parent().unwrap_or(Path::new(""));
    let wanted_name = wanted.file_name().and_then(|n| n.to_str()).unwrap_or("");

    for entry in archive.entries()? {
        let mut entry = entry?;

        let path = match normalize(&entry.path()?) {
            Some(path) => path,
            None => continue,
        };

        if path == wanted {
            let mut contents = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut contents)?;
            return Ok(Some(LayerHit::Found(contents)));
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let parent = path.parent().unwrap_or(Path::new(""));

        if let Some(target) = file_name.strip_prefix(".wh.") {
            let opaque_covers = target == ".wh..opq" && wanted_parent.starts_with(parent);
            let direct_covers = target == wanted_name && parent == wanted_parent;
            if opaque_covers || direct_covers {
                return Ok(Some(LayerHit::Whiteout));
            }
        }
    }

    Ok(None)
}

/// Strip `./` prefixes and reject paths reaching outside the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == [0x1f, 0x8b]),
        Err(_) => Ok(false),
    }
}
