//! Same-basename `.json` / `.txt` files next to an image.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde_json::Value;

use crate::lift;
use crate::metadata::{Generator, ImageMetadata, MetadataSource};
use crate::text::{decode_candidate, parse_json_object};
use crate::writer::atomic_write;

/// Lookup order.
pub const SIDECAR_EXTENSIONS: &[&str] = &["json", "txt"];

/// Existing sidecar files for `image`, in lookup order.
pub fn find_sidecars(image: &Path) -> Vec<PathBuf> {
    SIDECAR_EXTENSIONS
        .iter()
        .map(|ext| image.with_extension(ext))
        .filter(|p| p.is_file())
        .collect()
}

/// Where [`write_sidecar`] puts the JSON for `image`.
pub fn sidecar_path(image: &Path) -> PathBuf {
    image.with_extension("json")
}

/// Lift the first usable sidecar. Unreadable files are skipped with a warning.
pub fn read_sidecar(image: &Path) -> Option<ImageMetadata> {
    find_sidecars(image).into_iter().find_map(|path| {
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read sidecar {}: {e}", path.display());
                return None;
            }
        };
        let text = decode_candidate(&bytes)?;
        let lifted = if path.extension().is_some_and(|e| e == "json") {
            parse_json_object(&text).and_then(|json| lift::lift_json(&json, ""))
        } else {
            lift::lift_text(&text, "")
        };
        let Some(mut meta) = lifted else {
            debug!("sidecar {} holds no usable metadata", path.display());
            return None;
        };
        if meta.generator.is_unknown() {
            meta.generator = Generator::SidecarText;
        }
        meta.source = MetadataSource::Sidecar;
        meta.set_raw("sidecar", Value::String(path.display().to_string()));
        Some(meta)
    })
}

/// Pretty-printed sidecar JSON for `meta`.
pub fn sidecar_contents(meta: &ImageMetadata) -> Result<Vec<u8>> {
    let json =
        serde_json::to_string_pretty(&meta.to_sidecar_json()).context("Failed to serialize sidecar")?;
    Ok(json.into_bytes())
}

/// Write `meta` as sidecar JSON next to `image`, atomically.
pub fn write_sidecar(image: &Path, meta: &ImageMetadata, preserve_permissions: bool) -> Result<PathBuf> {
    let path = sidecar_path(image);
    atomic_write(&path, &sidecar_contents(meta)?, preserve_permissions)?;
    Ok(path)
}
