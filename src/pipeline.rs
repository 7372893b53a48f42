use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::codec::jpeg::SOI;
use crate::codec::png::SIGNATURE;
use crate::config::Config;
use crate::export;
use crate::metadata::{ImageMetadata, MetadataPatch};
use crate::reader::read_metadata_with;
use crate::writer::{self, plan};

/// Supported image extensions.
const IMAGE_EXTENSIONS: &[&str] = &[
    // Embedded read/write
    "png", "jpg", "jpeg",
    // Raw scan read, sidecar write
    "webp", "gif", "bmp", "tif", "tiff", "avif", "heic", "heif",
];

/// How metadata is stored for a given image file, determined by its format.
///
/// - **Png** and **Jpeg** carry metadata inside the file (text chunks, XMP).
/// - **WebP** is read by scanning raw bytes; writes go to a `.json` sidecar.
/// - **Sidecar** formats are only ever described by a `.json`/`.txt` file
///   next to the image.
///
/// # Example
///
/// ```rust
/// use sdmeta::pipeline::ImageKind;
/// use std::path::Path;
///
/// assert_eq!(ImageKind::from_path(Path::new("out.PNG")), Some(ImageKind::Png));
/// assert_eq!(ImageKind::from_path(Path::new("scan.tiff")), Some(ImageKind::Sidecar));
/// assert_eq!(ImageKind::from_path(Path::new("notes.md")), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// PNG: `parameters` + `sd-metadata` iTXt chunks
    Png,
    /// JPEG: XMP APP1 segment
    Jpeg,
    /// WebP: raw scan, sidecar write
    WebP,
    /// Everything else: sidecar only
    Sidecar,
}

impl ImageKind {
    /// Determine the image kind from a file path extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::WebP),
            "gif" | "bmp" | "tif" | "tiff" | "avif" | "heic" | "heif" => Some(Self::Sidecar),
            _ => None,
        }
    }

    /// Determine the kind from the leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&SIGNATURE) {
            Some(Self::Png)
        } else if bytes.starts_with(&SOI) {
            Some(Self::Jpeg)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(Self::WebP)
        } else {
            None
        }
    }

    /// Extension first, then content; anything unrecognized is sidecar-only.
    pub fn detect(path: &Path, bytes: &[u8]) -> Self {
        Self::from_path(path)
            .or_else(|| Self::sniff(bytes))
            .unwrap_or(Self::Sidecar)
    }

    /// True when metadata is written into the file itself.
    pub fn embeds(&self) -> bool {
        matches!(self, Self::Png | Self::Jpeg)
    }
}

/// The result of running one image through the pipeline.
///
/// `metadata` is the resolved record (after the write when a patch was
/// applied, or the would-be record in dry-run mode).
#[derive(Debug)]
pub struct ProcessResult {
    pub path: PathBuf,
    pub image_kind: Option<ImageKind>,
    pub metadata: Option<ImageMetadata>,
    /// File that received the new metadata (the image or its sidecar).
    pub written_to: Option<PathBuf>,
    /// `<file>.metadata.txt`, if a report was exported.
    pub report_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// Collect supported image files from the given paths.
///
/// Accepts a mix of file paths and directory paths. Directories are walked
/// recursively (following symlinks). Only files with supported image extensions
/// are included (see [`ImageKind`]).
///
/// # Example
///
/// ```rust,no_run
/// use sdmeta::pipeline::collect_images;
/// use std::path::PathBuf;
///
/// let images = collect_images(&[
///     PathBuf::from("render.png"),   // single file
///     PathBuf::from("./outputs/"),   // entire directory
/// ]);
/// println!("Found {} images", images.len());
/// ```
pub fn collect_images(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for path in paths {
        if path.is_file() {
            if is_supported_image(path) {
                images.push(path.clone());
            } else {
                log::warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            for entry in WalkDir::new(path)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let p = entry.path();
                if p.is_file() && is_supported_image(p) {
                    images.push(p.to_path_buf());
                }
            }
        } else {
            log::warn!("Path does not exist: {}", path.display());
        }
    }

    images
}

/// Check if a file has a supported image extension.
fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Parse a patch given inline as JSON or as `@path/to/patch.json`.
pub fn load_patch(arg: &str) -> Result<MetadataPatch> {
    let text = match arg.strip_prefix('@') {
        Some(file) => std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read patch file {file}"))?,
        None => arg.to_string(),
    };
    serde_json::from_str(&text).context("Failed to parse patch JSON")
}

/// Process a single image.
///
/// 1. **Read**: resolve the current metadata (no patch), or
/// 2. **Write**: merge `patch` and write it back atomically (or only plan
///    the merge when `output.dry_run` is set), then
/// 3. **Export**: write a `.metadata.txt` report if `output.export_reports`
///    is set.
///
/// Errors are captured in [`ProcessResult::error`] so a batch keeps going.
///
/// # Example
///
/// ```rust,no_run
/// use sdmeta::config::Config;
/// use sdmeta::pipeline::process_image;
/// use std::path::Path;
///
/// let result = process_image(Path::new("render.png"), None, &Config::default());
/// if let Some(meta) = &result.metadata {
///     println!("{}: {:?}", meta.generator, meta.prompt);
/// }
/// ```
pub fn process_image(path: &Path, patch: Option<&MetadataPatch>, config: &Config) -> ProcessResult {
    let mut result = ProcessResult {
        path: path.to_path_buf(),
        image_kind: ImageKind::from_path(path),
        metadata: None,
        written_to: None,
        report_path: None,
        error: None,
    };

    let resolved = match patch.map(|patch| plan(path, patch, &config.reader)) {
        None => read_metadata_with(path, &config.reader),
        Some(Ok(planned)) if config.output.dry_run => {
            log::info!("  Would write {}", planned.target.display());
            Ok(planned.merged)
        }
        Some(Ok(planned)) => {
            let target = planned.target.clone();
            writer::apply(planned, &config.reader, &config.writer).map(|meta| {
                result.written_to = Some(target);
                meta
            })
        }
        Some(Err(e)) => Err(e),
    };

    match resolved {
        Ok(meta) => result.metadata = Some(meta),
        Err(e) => {
            result.error = Some(format!("{e:#}"));
            return result;
        }
    }

    if config.output.export_reports && !config.output.dry_run {
        match export::export_report(path, config) {
            Ok(report) => result.report_path = Some(report),
            Err(e) => result.error = Some(format!("Failed to export report: {e:#}")),
        }
    }

    result
}
