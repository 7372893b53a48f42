//! Resolution pipeline: find the best generation metadata for one file.
//!
//! Candidates are tried in a fixed order per container and the first lifter
//! to produce a non-empty record wins. Falling back to a sidecar and finally
//! to an `Unknown` record are both successful outcomes; only a container
//! that does not match its claimed format is an error.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use serde_json::{Map, Value, json};

use crate::codec::exif::{ExifText, read_exif_text};
use crate::codec::jpeg::JpegFile;
use crate::codec::png::{self, TextChunks};
use crate::config::ReaderConfig;
use crate::lift::{self, SCAN_PRIORITY, Shape};
use crate::metadata::{Generator, ImageMetadata, MetadataSource};
use crate::pipeline::ImageKind;
use crate::sidecar;
use crate::text::xmp::{description_strings, has_sdx_fields, scrape_field};
use crate::text::{
    has_generation_markers, is_interesting, json_objects, parse_json_object, scan_text_runs,
};

/// PNG text keywords holding JSON, in priority order, with the shapes each
/// may carry.
const PNG_JSON_KEYWORDS: &[(&str, &[Shape])] = &[
    ("sd-metadata", &[Shape::OwnRecord, Shape::InvokeLegacy]),
    ("invokeai_metadata", &[Shape::InvokeCore, Shape::GenericJson]),
    ("invokeai_graph", &[Shape::InvokeGraph]),
    ("prompt", &[Shape::PromptMap]),
    ("workflow", &[Shape::NodeGraph]),
];

/// PNG text keywords holding an A1111 block (or NovelAI JSON in `Comment`).
const PNG_TEXT_KEYWORDS: &[&str] = &["parameters", "Comment", "Description"];

/// Keywords that only ever feed the fingerprint hint.
const PNG_HINT_KEYWORDS: &[&str] = &["Software", "Source"];

const MIN_SCAN_RUN: usize = 12;
const JSON_PER_CANDIDATE: usize = 8;

/// Resolve metadata with default reader settings.
pub fn read_metadata(path: &Path) -> Result<ImageMetadata> {
    read_metadata_with(path, &ReaderConfig::default())
}

/// Resolve metadata for `path`.
///
/// Fails only when the file cannot be read or does not match the container
/// its extension claims ([`crate::FormatError`] inside the `anyhow::Error`).
pub fn read_metadata_with(path: &Path, config: &ReaderConfig) -> Result<ImageMetadata> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let kind = ImageKind::detect(path, &bytes);
    let mut debug_info = Map::new();

    let embedded = match kind {
        ImageKind::Png => resolve_png(&bytes, &mut debug_info)
            .with_context(|| format!("Failed to parse {}", path.display()))?,
        ImageKind::Jpeg => resolve_jpeg(path, &bytes, config, &mut debug_info)
            .with_context(|| format!("Failed to parse {}", path.display()))?,
        ImageKind::WebP | ImageKind::Sidecar => resolve_raw(path, &bytes, config, &mut debug_info),
    };
    debug_info.insert("container".into(), json!(format!("{kind:?}").to_lowercase()));

    let needs_sidecar = embedded.as_ref().is_none_or(|m| !m.has_prompt_text());
    let from_sidecar = if config.sidecar_fallback && needs_sidecar {
        sidecar::read_sidecar(path)
    } else {
        None
    };

    let mut meta = match (from_sidecar, embedded) {
        (Some(mut side), embedded) => {
            if let Some(embedded) = &embedded {
                side.fill_missing_from(embedded);
            }
            side
        }
        (None, Some(mut embedded)) => {
            embedded.source = MetadataSource::Embedded;
            embedded
        }
        (None, None) => {
            debug!("no generation metadata found for {}", path.display());
            ImageMetadata::for_generator(Generator::Unknown)
        }
    };
    for (key, value) in debug_info {
        meta.raw.entry(key).or_insert(value);
    }
    Ok(meta)
}

// ============================================================================
// PNG
// ============================================================================

fn resolve_png(
    bytes: &[u8],
    debug_info: &mut Map<String, Value>,
) -> Result<Option<ImageMetadata>, crate::FormatError> {
    let chunks = png::decode(bytes)?;
    let text = TextChunks::from_chunks(&chunks);

    let kinds: Vec<String> = chunks.iter().map(|c| c.kind_str()).collect();
    debug_info.insert("png_chunks".into(), json!(kinds));
    let keywords: Vec<&str> = text.iter().map(|(k, _)| k).collect();
    debug_info.insert("png_text".into(), json!(keywords));

    let hint = PNG_HINT_KEYWORDS
        .iter()
        .flat_map(|k| text.get(k))
        .collect::<Vec<_>>()
        .join(" ");

    for (keyword, shapes) in PNG_JSON_KEYWORDS {
        for value in text.get(keyword) {
            let Some(json) = parse_json_object(value) else {
                debug!("PNG {keyword:?} chunk is not a JSON object");
                continue;
            };
            if let Some(meta) = lift::lift_json_with(&json, shapes, &hint) {
                return Ok(Some(tagged(meta, keyword)));
            }
        }
    }

    for keyword in PNG_TEXT_KEYWORDS {
        for value in text.get(keyword) {
            if let Some(meta) = lift::lift_text(value, &hint) {
                return Ok(Some(tagged(meta, keyword)));
            }
        }
    }

    // Brute force over everything not already tried.
    let tried = |k: &str| {
        PNG_JSON_KEYWORDS.iter().any(|(t, _)| t.eq_ignore_ascii_case(k))
            || PNG_TEXT_KEYWORDS.iter().any(|t| t.eq_ignore_ascii_case(k))
    };
    for (keyword, values) in text.iter().filter(|(k, _)| !tried(*k)) {
        for value in values {
            if let Some(meta) = lift_scanned(value, &hint) {
                return Ok(Some(tagged(meta, keyword)));
            }
        }
    }
    Ok(None)
}

/// Embedded JSON through the scan shapes, then the A1111 grammar.
fn lift_scanned(text: &str, hint: &str) -> Option<ImageMetadata> {
    if !is_interesting(text) {
        return None;
    }
    json_objects(text, JSON_PER_CANDIDATE)
        .iter()
        .find_map(|json| lift::lift_json_with(json, SCAN_PRIORITY, hint))
        .or_else(|| {
            has_generation_markers(text)
                .then(|| lift::lift_text_block(text, hint))
                .flatten()
        })
}

fn tagged(mut meta: ImageMetadata, origin: &str) -> ImageMetadata {
    debug!("resolved metadata from {origin:?}");
    meta.set_raw("origin", Value::String(origin.to_string()));
    meta
}

// ============================================================================
// JPEG
// ============================================================================

fn resolve_jpeg(
    path: &Path,
    bytes: &[u8],
    config: &ReaderConfig,
    debug_info: &mut Map<String, Value>,
) -> Result<Option<ImageMetadata>> {
    let jpeg = JpegFile::parse(bytes)?;
    let exif = load_exif(path, debug_info);
    let xmp = jpeg
        .xmp()
        .map(|packet| String::from_utf8_lossy(&packet).into_owned());
    debug_info.insert("xmp".into(), json!(xmp.is_some()));

    let hint = exif.software().unwrap_or_default().to_string();

    if let Some(xml) = xmp.as_deref().filter(|x| has_sdx_fields(x)) {
        if let Some(meta) = lift::sdx::lift(xml, &hint) {
            return Ok(Some(tagged(meta, "xmp")));
        }
    }

    let mut candidates = CandidateSet::new(config.max_candidates);
    candidates.extend("exif", exif.candidates());
    candidates.extend("com", jpeg.comments());
    candidates.extend("iptc", jpeg.iptc_captions());
    if let Some(xml) = &xmp {
        candidates.extend("xmp", description_strings(xml));
    }
    if config.scan_whole_file {
        candidates.extend("scan", scan_prefix(bytes, config.max_scan_bytes));
    }
    debug_info.insert("candidates".into(), json!(candidates.len()));

    let hint = match xmp.as_deref().and_then(|x| scrape_field(x, "xmp:CreatorTool")) {
        Some(tool) => format!("{hint} {tool}"),
        None => hint,
    };
    Ok(candidates.resolve(&hint))
}

fn load_exif(path: &Path, debug_info: &mut Map<String, Value>) -> ExifText {
    match read_exif_text(path) {
        Ok(exif) => {
            if !exif.is_empty() {
                debug_info.insert("exif".into(), exif.to_json());
            }
            exif
        }
        Err(e) => {
            warn!("Failed to read EXIF from {}: {e:#}", path.display());
            ExifText::default()
        }
    }
}

fn scan_prefix(bytes: &[u8], limit: usize) -> Vec<String> {
    let prefix = &bytes[..bytes.len().min(limit)];
    scan_text_runs(prefix, MIN_SCAN_RUN)
}

// ============================================================================
// Other formats
// ============================================================================

/// WebP and anything else: EXIF when the parser understands the file, then
/// a raw byte scan.
fn resolve_raw(
    path: &Path,
    bytes: &[u8],
    config: &ReaderConfig,
    debug_info: &mut Map<String, Value>,
) -> Option<ImageMetadata> {
    let exif = match read_exif_text(path) {
        Ok(exif) => exif,
        Err(e) => {
            debug!("no EXIF for {}: {e:#}", path.display());
            ExifText::default()
        }
    };
    if !exif.is_empty() {
        debug_info.insert("exif".into(), exif.to_json());
    }

    let mut candidates = CandidateSet::new(config.max_candidates);
    candidates.extend("exif", exif.candidates());
    if config.scan_whole_file {
        candidates.extend("scan", scan_prefix(bytes, config.max_scan_bytes));
    }
    debug_info.insert("candidates".into(), json!(candidates.len()));
    candidates.resolve(exif.software().unwrap_or_default())
}

// ============================================================================
// Candidate set
// ============================================================================

/// Deduplicated candidate strings in discovery order, capped.
struct CandidateSet {
    items: Vec<(&'static str, String)>,
    seen: HashSet<String>,
    cap: usize,
}

impl CandidateSet {
    fn new(cap: usize) -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
            cap,
        }
    }

    fn extend<I, S>(&mut self, origin: &'static str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for value in values {
            if self.items.len() >= self.cap {
                debug!("candidate cap of {} reached", self.cap);
                return;
            }
            let value = value.as_ref().trim();
            if value.is_empty() || !self.seen.insert(value.to_string()) {
                continue;
            }
            self.items.push((origin, value.to_string()));
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    /// JSON candidates go through the full shape list, text through the
    /// A1111 grammar; first success wins.
    fn resolve(&self, hint: &str) -> Option<ImageMetadata> {
        self.items.iter().find_map(|(origin, text)| {
            let meta = match parse_json_object(text) {
                Some(json) => lift::lift_json(&json, hint),
                None if has_generation_markers(text) => lift::lift_text_block(text, hint),
                None => None,
            }?;
            Some(tagged(meta, origin))
        })
    }
}
