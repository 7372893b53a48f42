//! XMP packets: this engine's `sdx:` leaves, or a caption holding an
//! A1111-style block.

use serde_json::Value;

use crate::metadata::{Generator, ImageMetadata, Seed};
use crate::text::has_generation_markers;
use crate::text::xmp::{NO_PROMPT, description_strings, has_sdx_fields, scrape_field, scrape_field_exact};

use super::{a1111, fingerprint};

fn sdx(xml: &str, field: &str) -> Option<String> {
    scrape_field_exact(xml, &format!("sdx:{field}"))
}

/// Non-blank `sdx:` leaf, for fields that never hold free text.
fn sdx_value(xml: &str, field: &str) -> Option<String> {
    sdx(xml, field).filter(|v| !v.is_empty())
}

pub fn lift(xml: &str, hint: &str) -> Option<ImageMetadata> {
    let creator = scrape_field(xml, "xmp:CreatorTool").unwrap_or_default();
    let hint = format!("{creator} {hint}");

    if has_sdx_fields(xml) {
        let mut meta = lift_sdx(xml, &hint);
        meta.set_raw("shape", Value::String("xmp-sdx".into()));
        meta.normalize();
        // A known generator alone is still a record this engine wrote.
        return meta.has_content().then_some(meta);
    }

    let caption = description_strings(xml)
        .into_iter()
        .find(|s| has_generation_markers(s))?;
    let mut meta = a1111::lift(&caption, &hint)?;
    meta.set_raw("shape", Value::String("xmp-caption".into()));
    meta.normalize();
    (!meta.is_empty()).then_some(meta)
}

fn lift_sdx(xml: &str, hint: &str) -> ImageMetadata {
    let generator = match sdx_value(xml, "generator") {
        Some(label) => Generator::from_label(&label),
        None => Generator::Unknown,
    };
    let generator = match generator {
        Generator::Unknown => fingerprint("", hint),
        found => found,
    };

    let mut meta = ImageMetadata::for_generator(generator);
    let no_prompt = sdx_value(xml, NO_PROMPT).is_some_and(|v| v == "true");
    if !no_prompt {
        meta.prompt = scrape_field_exact(xml, "dc:description");
    }
    meta.negative = sdx(xml, "negative");
    meta.model = sdx_value(xml, "model");
    meta.steps = sdx_value(xml, "steps").and_then(|s| s.parse().ok());
    meta.cfg = sdx_value(xml, "cfg").and_then(|s| s.parse().ok());
    meta.seed = sdx_value(xml, "seed").and_then(|s| Seed::parse(&s));
    meta.sampler = sdx_value(xml, "sampler");
    meta.scheduler = sdx_value(xml, "scheduler");
    meta.size = sdx_value(xml, "size");

    // A packet from another tool may keep the whole block in the description.
    let bare = meta.negative.is_none()
        && meta.steps.is_none()
        && meta.cfg.is_none()
        && meta.seed.is_none()
        && meta.sampler.is_none()
        && meta.size.is_none();
    if bare {
        if let Some(block) = meta.prompt.as_deref().and_then(|p| a1111::lift(p, hint)) {
            meta.prompt = block.prompt.clone();
            meta.fill_missing_from(&block);
        }
    }
    meta
}
