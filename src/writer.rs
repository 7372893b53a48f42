//! Atomic writer: merge a patch over the current metadata and put it back.
//!
//! PNG files get two `iTXt` chunks (`parameters`, `sd-metadata`), JPEG files
//! an XMP packet, everything else a `.json` sidecar. New bytes go to a
//! hidden temporary file in the target's directory which is then renamed
//! over the target; a failed write leaves the original untouched and the
//! temporary file removed.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};

use crate::codec::jpeg::JpegFile;
use crate::codec::png::{self, itxt_chunk};
use crate::config::{ReaderConfig, WriterConfig};
use crate::metadata::{ImageMetadata, MetadataPatch, MetadataSource};
use crate::pipeline::ImageKind;
use crate::reader::read_metadata_with;
use crate::sidecar;
use crate::text::compose_parameters;
use crate::text::xmp::{build_packet, inject_into_packet};

/// PNG text keywords owned by the writer.
pub const RESERVED_KEYWORDS: [&str; 2] = ["parameters", "sd-metadata"];

/// A computed but not yet applied write.
#[derive(Debug, Clone)]
pub struct WritePlan {
    pub path: PathBuf,
    pub kind: ImageKind,
    /// The file that will be replaced: the image itself or its sidecar.
    pub target: PathBuf,
    pub current: ImageMetadata,
    pub merged: ImageMetadata,
    /// Full new contents of `target`.
    pub contents: Vec<u8>,
}

/// Merge and write with default settings.
pub fn write_metadata(path: &Path, patch: &MetadataPatch) -> Result<ImageMetadata> {
    write_metadata_with(path, patch, &ReaderConfig::default(), &WriterConfig::default())
}

/// Merge `patch` over the current metadata of `path`, write it back and
/// return the metadata re-read from the written file.
pub fn write_metadata_with(
    path: &Path,
    patch: &MetadataPatch,
    reader: &ReaderConfig,
    writer: &WriterConfig,
) -> Result<ImageMetadata> {
    let planned = plan(path, patch, reader)?;
    apply(planned, reader, writer)
}

/// Resolve, merge and encode without touching the filesystem.
pub fn plan(path: &Path, patch: &MetadataPatch, reader: &ReaderConfig) -> Result<WritePlan> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let kind = ImageKind::detect(path, &bytes);
    let current = read_metadata_with(path, reader)?;
    let merged = current.merged(patch);

    let (target, contents) = match kind {
        ImageKind::Png => (path.to_path_buf(), encode_png(&bytes, &merged)?),
        ImageKind::Jpeg => (path.to_path_buf(), encode_jpeg(&bytes, &merged)?),
        ImageKind::WebP | ImageKind::Sidecar => {
            (sidecar::sidecar_path(path), sidecar::sidecar_contents(&merged)?)
        }
    };

    Ok(WritePlan {
        path: path.to_path_buf(),
        kind,
        target,
        current,
        merged,
        contents,
    })
}

/// Perform a planned write and re-read the result.
pub fn apply(plan: WritePlan, reader: &ReaderConfig, writer: &WriterConfig) -> Result<ImageMetadata> {
    if writer.backup_originals && plan.kind.embeds() {
        backup_file(&plan.path)?;
    }
    atomic_write(&plan.target, &plan.contents, writer.preserve_permissions)?;
    info!("Wrote metadata to {}", plan.target.display());

    if plan.kind.embeds() {
        return read_metadata_with(&plan.path, reader);
    }
    // Re-read the sidecar directly so `reader.sidecar_fallback` cannot hide it.
    // A record with nothing in it lifts to nothing; the write still happened.
    Ok(sidecar::read_sidecar(&plan.path).unwrap_or_else(|| {
        debug!("{} holds an empty record", plan.target.display());
        let mut meta = plan.merged;
        meta.source = MetadataSource::Sidecar;
        meta
    }))
}

fn encode_png(bytes: &[u8], meta: &ImageMetadata) -> Result<Vec<u8>> {
    let chunks = png::decode(bytes)?;
    let fresh = vec![
        itxt_chunk("parameters", &compose_parameters(meta)),
        itxt_chunk("sd-metadata", &meta.to_stored_json().to_string()),
    ];
    let rewritten = png::replace_text_chunks(&chunks, &RESERVED_KEYWORDS, fresh)?;
    Ok(png::encode(&rewritten))
}

fn encode_jpeg(bytes: &[u8], meta: &ImageMetadata) -> Result<Vec<u8>> {
    let jpeg = JpegFile::parse(bytes)?;
    let packet = match jpeg.xmp() {
        Some(existing) => inject_into_packet(&String::from_utf8_lossy(&existing), meta),
        None => build_packet(meta),
    };
    Ok(jpeg.with_xmp(packet.as_bytes())?)
}

/// Replace `target` with `contents` through a same-directory temporary file.
///
/// The temporary file is named `.<target name>.<random>.tmp` and is removed
/// on every failure path.
pub(crate) fn atomic_write(target: &Path, contents: &[u8], preserve_permissions: bool) -> Result<()> {
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("Invalid target path {}", target.display()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{name}."))
        .suffix(".tmp")
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(contents)
        .context("Failed to write temporary file")?;

    if preserve_permissions {
        if let Ok(existing) = std::fs::metadata(target) {
            std::fs::set_permissions(tmp.path(), existing.permissions())
                .context("Failed to copy permissions")?;
        }
    }
    tmp.as_file()
        .sync_all()
        .context("Failed to flush temporary file")?;

    tmp.persist(target)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", target.display()))?;
    debug!("replaced {}", target.display());
    Ok(())
}

/// Copy the original to `<name>.<ext>.bak`, once.
fn backup_file(path: &Path) -> Result<PathBuf> {
    let backup_path = path.with_extension(format!(
        "{}.bak",
        path.extension().unwrap_or_default().to_string_lossy()
    ));

    if !backup_path.exists() {
        std::fs::copy(path, &backup_path).context("Failed to create backup")?;
        debug!("Backup created: {}", backup_path.display());
    }

    Ok(backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FormatError;
    use crate::codec::jpeg::tests::{jpeg_with, minimal_jpeg, scan_tail, xmp_segment};
    use crate::codec::png::tests::{assert_valid_png, minimal_chunks, minimal_png, png_with, text_chunk, ztxt_chunk};
    use crate::codec::png::TextChunks;
    use crate::metadata::{Generator, Seed};
    use std::fs;
    use tempfile::TempDir;

    fn full_patch() -> MetadataPatch {
        MetadataPatch {
            generator: Some(Generator::ComfyUI),
            prompt: Some("a red  cube,\tstudio light".into()),
            negative: Some("blurry".into()),
            model: Some("models/Stable-diffusion/dream.safetensors".into()),
            sampler: Some("dpmpp_2m".into()),
            scheduler: Some("karras".into()),
            steps: Some(28),
            cfg: Some(6.5),
            seed: Some(Seed::Text("18446744073709551615".into())),
            size: Some("832 x 1216".into()),
        }
    }

    fn assert_fields_match(read: &ImageMetadata, expected: &ImageMetadata) {
        assert_eq!(read.generator, expected.generator);
        assert_eq!(read.prompt, expected.prompt);
        assert_eq!(read.negative, expected.negative);
        assert_eq!(read.model, expected.model);
        assert_eq!(read.sampler, expected.sampler);
        assert_eq!(read.scheduler, expected.scheduler);
        assert_eq!(read.steps, expected.steps);
        assert_eq!(read.cfg, expected.cfg);
        assert_eq!(read.seed, expected.seed);
        assert_eq!(read.size, expected.size);
    }

    fn file(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    // ── PNG ──────────────────────────────────────────────────────────

    #[test]
    fn png_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.png", &png_with(vec![text_chunk("Software", "ComfyUI")]));
        let current = crate::reader::read_metadata(&path).unwrap();

        let written = write_metadata(&path, &full_patch()).unwrap();
        let expected = current.merged(&full_patch());
        assert_fields_match(&written, &expected);
        assert_eq!(written.prompt.as_deref(), Some("a red cube, studio light"));
        assert_eq!(written.model.as_deref(), Some("dream.safetensors"));
        assert_eq!(written.size.as_deref(), Some("832x1216"));
        assert_eq!(written.source, MetadataSource::Embedded);

        let bytes = fs::read(&path).unwrap();
        assert_valid_png(&bytes);
        let chunks = png::decode(&bytes).unwrap();
        assert_eq!(chunks.first().map(|c| c.kind_str()).as_deref(), Some("IHDR"));
        let text = TextChunks::from_chunks(&chunks);
        assert_eq!(text.get("parameters").len(), 1);
        assert_eq!(text.get("sd-metadata").len(), 1);
        assert_eq!(text.first("Software"), Some("ComfyUI"));
        assert!(text.first("parameters").unwrap().contains("Negative prompt: blurry"));
    }

    #[test]
    fn png_write_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.png", &minimal_png());
        write_metadata(&path, &full_patch()).unwrap();
        let first = fs::read(&path).unwrap();
        write_metadata(&path, &full_patch()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn png_patch_is_sparse() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.png", &minimal_png());
        write_metadata(&path, &full_patch()).unwrap();

        let patch = MetadataPatch {
            steps: Some(40),
            ..Default::default()
        };
        let written = write_metadata(&path, &patch).unwrap();
        assert_eq!(written.steps, Some(40));
        assert_eq!(written.negative.as_deref(), Some("blurry"));
        assert_eq!(written.seed, Some(Seed::Text("18446744073709551615".into())));
    }

    #[test]
    fn png_replaces_legacy_chunks() {
        let dir = TempDir::new().unwrap();
        let legacy = "old prompt\nSteps: 5, Seed: 1";
        let path = file(
            &dir,
            "a.png",
            &png_with(vec![text_chunk("parameters", legacy), text_chunk("parameters", legacy)]),
        );
        let patch = MetadataPatch {
            prompt: Some("new prompt".into()),
            ..Default::default()
        };
        let written = write_metadata(&path, &patch).unwrap();
        assert_eq!(written.prompt.as_deref(), Some("new prompt"));
        assert_eq!(written.steps, Some(5));

        let chunks = png::decode(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(TextChunks::from_chunks(&chunks).get("parameters").len(), 1);
        // IHDR, IDAT, parameters, sd-metadata, IEND
        assert_eq!(chunks.len(), minimal_chunks().len() + 2);
    }

    #[test]
    fn png_with_corrupt_ztxt_still_writes() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.png", &png_with(vec![ztxt_chunk("Comment", b"\x78\x9c\x00\x01")]));
        let written = write_metadata(&path, &full_patch()).unwrap();
        assert_eq!(written.steps, Some(28));
        assert_valid_png(&fs::read(&path).unwrap());
    }

    #[test]
    fn png_without_iend_fails_and_leaves_file() {
        let dir = TempDir::new().unwrap();
        let mut chunks = minimal_chunks();
        chunks.pop();
        let original = png::encode(&chunks);
        let path = file(&dir, "a.png", &original);

        let err = write_metadata(&path, &full_patch()).unwrap_err();
        assert!(matches!(err.downcast_ref::<FormatError>(), Some(FormatError::MissingEnd)));
        assert_eq!(fs::read(&path).unwrap(), original);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    // ── JPEG ─────────────────────────────────────────────────────────

    #[test]
    fn jpeg_round_trip_preserves_scan() {
        let dir = TempDir::new().unwrap();
        let original = minimal_jpeg();
        let path = file(&dir, "a.jpg", &original);

        let written = write_metadata(&path, &full_patch()).unwrap();
        let expected = ImageMetadata::default().merged(&full_patch());
        assert_fields_match(&written, &expected);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(scan_tail(&bytes), scan_tail(&original));
        assert!(bytes.starts_with(&[0xFF, 0xD8]));
    }

    #[test]
    fn jpeg_write_is_idempotent_and_keeps_one_packet() {
        let dir = TempDir::new().unwrap();
        let foreign = r#"<x:xmpmeta xmlns:x="adobe:ns:meta/"><rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#">
<rdf:Description rdf:about="" xmlns:xmp="http://ns.adobe.com/xap/1.0/" xmp:CreatorTool="Photoshop"/>
</rdf:RDF></x:xmpmeta>"#;
        let path = file(&dir, "a.jpg", &jpeg_with(&[xmp_segment(foreign), xmp_segment(foreign)]));

        write_metadata(&path, &full_patch()).unwrap();
        let first = fs::read(&path).unwrap();
        write_metadata(&path, &full_patch()).unwrap();
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);

        let packets = second
            .windows(crate::codec::jpeg::XMP_HEADER.len())
            .filter(|w| *w == crate::codec::jpeg::XMP_HEADER)
            .count();
        assert_eq!(packets, 1);
        let xmp = String::from_utf8(crate::codec::jpeg::find_xmp(&second).unwrap().unwrap()).unwrap();
        assert!(xmp.contains("xmp:CreatorTool=\"Photoshop\""));
        assert!(xmp.contains("<sdx:steps>28</sdx:steps>"));
    }

    #[test]
    fn jpeg_foreign_caption_is_not_read_as_prompt() {
        let dir = TempDir::new().unwrap();
        let caption = r#"<x:xmpmeta xmlns:x="adobe:ns:meta/"><rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#">
<rdf:Description rdf:about="" xmlns:dc="http://purl.org/dc/elements/1.1/">
<dc:description><rdf:Alt><rdf:li xml:lang="x-default">Sunset over the bay</rdf:li></rdf:Alt></dc:description>
</rdf:Description>
</rdf:RDF></x:xmpmeta>"#;
        let path = file(&dir, "a.jpg", &jpeg_with(&[xmp_segment(caption)]));
        let current = crate::reader::read_metadata(&path).unwrap();
        assert!(current.prompt.is_none());

        let patch = MetadataPatch {
            steps: Some(5),
            ..Default::default()
        };
        let written = write_metadata(&path, &patch).unwrap();
        assert_fields_match(&written, &current.merged(&patch));
        assert!(written.prompt.is_none());

        let xmp = crate::codec::jpeg::find_xmp(&fs::read(&path).unwrap()).unwrap().unwrap();
        assert!(String::from_utf8(xmp).unwrap().contains("Sunset over the bay"));
    }

    #[test]
    fn jpeg_empty_strings_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.jpg", &minimal_jpeg());
        let patch = MetadataPatch {
            prompt: Some("a cat".into()),
            negative: Some(String::new()),
            ..Default::default()
        };

        let written = write_metadata(&path, &patch).unwrap();
        assert_eq!(written.prompt.as_deref(), Some("a cat"));
        assert_eq!(written.negative.as_deref(), Some(""));
        assert_fields_match(&written, &ImageMetadata::default().merged(&patch));
    }

    // ── generator-only records ───────────────────────────────────────

    fn generator_patch() -> MetadataPatch {
        MetadataPatch {
            generator: Some(Generator::ComfyUI),
            ..Default::default()
        }
    }

    #[test]
    fn png_generator_alone_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.png", &minimal_png());
        let written = write_metadata(&path, &generator_patch()).unwrap();
        assert_eq!(written.generator, Generator::ComfyUI);
        assert!(written.is_empty());
    }

    #[test]
    fn jpeg_generator_alone_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.jpg", &minimal_jpeg());
        let written = write_metadata(&path, &generator_patch()).unwrap();
        assert_eq!(written.generator, Generator::ComfyUI);
    }

    #[test]
    fn sidecar_generator_alone_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.webp", b"RIFF\0\0\0\0WEBPVP8 ");
        let written = write_metadata(&path, &generator_patch()).unwrap();
        assert_eq!(written.generator, Generator::ComfyUI);
        assert_eq!(written.source, MetadataSource::Sidecar);
        assert!(dir.path().join("a.json").is_file());
    }

    #[test]
    fn empty_sidecar_write_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.gif", b"GIF89a");
        let written = write_metadata(&path, &MetadataPatch::default()).unwrap();
        assert!(written.is_empty());
        assert_eq!(written.source, MetadataSource::Sidecar);
        assert!(dir.path().join("a.json").is_file());
    }

    // ── sidecar route ────────────────────────────────────────────────

    #[test]
    fn other_formats_get_a_json_sidecar() {
        let dir = TempDir::new().unwrap();
        let original = b"RIFF\0\0\0\0WEBPVP8 ".to_vec();
        let path = file(&dir, "a.webp", &original);

        let written = write_metadata(&path, &full_patch()).unwrap();
        assert_eq!(written.prompt.as_deref(), Some("a red cube, studio light"));
        assert_eq!(written.source, MetadataSource::Sidecar);
        assert_eq!(fs::read(&path).unwrap(), original);
        assert!(dir.path().join("a.json").is_file());
    }

    // ── plan / backups / atomicity ───────────────────────────────────

    #[test]
    fn plan_does_not_touch_the_file() {
        let dir = TempDir::new().unwrap();
        let original = minimal_png();
        let path = file(&dir, "a.png", &original);

        let planned = plan(&path, &full_patch(), &ReaderConfig::default()).unwrap();
        assert_eq!(planned.target, path);
        assert_eq!(planned.merged.steps, Some(28));
        assert!(planned.current.is_empty());
        assert_eq!(fs::read(&path).unwrap(), original);
        assert_valid_png(&planned.contents);
    }

    #[test]
    fn backup_is_made_once() {
        let dir = TempDir::new().unwrap();
        let original = minimal_png();
        let path = file(&dir, "a.png", &original);
        let writer = WriterConfig {
            backup_originals: true,
            ..Default::default()
        };
        let reader = ReaderConfig::default();

        write_metadata_with(&path, &full_patch(), &reader, &writer).unwrap();
        write_metadata_with(&path, &MetadataPatch { steps: Some(1), ..Default::default() }, &reader, &writer).unwrap();
        assert_eq!(fs::read(dir.path().join("a.png.bak")).unwrap(), original);
    }

    #[test]
    fn no_temporary_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.png", &minimal_png());
        write_metadata(&path, &full_patch()).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn permissions_are_preserved() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = file(&dir, "a.png", &minimal_png());
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();

        write_metadata(&path, &full_patch()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn concurrent_writes_to_different_files() {
        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = (0..8)
            .map(|i| file(&dir, &format!("img{i}.png"), &minimal_png()))
            .collect();

        std::thread::scope(|s| {
            for (i, path) in paths.iter().enumerate() {
                s.spawn(move || {
                    let patch = MetadataPatch {
                        prompt: Some(format!("image {i}")),
                        steps: Some(i as u32 + 1),
                        ..Default::default()
                    };
                    write_metadata(path, &patch).unwrap();
                });
            }
        });

        for (i, path) in paths.iter().enumerate() {
            let meta = crate::reader::read_metadata(path).unwrap();
            assert_eq!(meta.prompt, Some(format!("image {i}")));
            assert_eq!(meta.steps, Some(i as u32 + 1));
            assert_valid_png(&fs::read(path).unwrap());
        }
    }
}
