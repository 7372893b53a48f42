//! A1111-style parameters text.

use crate::metadata::{ImageMetadata, Seed};
use crate::text::parse_generation_block;

use super::fingerprint;

/// Lift a parameters block. Any non-blank text qualifies; text without a
/// settings line becomes a bare prompt. The generator is `Unknown` unless a
/// tool fingerprint shows up in the block or in `hint`.
pub fn lift(text: &str, hint: &str) -> Option<ImageMetadata> {
    let block = parse_generation_block(text)?;

    let mut meta = ImageMetadata::for_generator(fingerprint(text, hint));
    meta.prompt = Some(block.positive.clone()).filter(|p| !p.is_empty());
    meta.negative = block.negative.clone();
    meta.steps = block.setting("Steps").and_then(|s| s.parse().ok());
    meta.sampler = block.setting("Sampler").map(str::to_string);
    meta.scheduler = block
        .any_setting(&["Schedule type", "Scheduler"])
        .map(str::to_string);
    meta.cfg = block
        .any_setting(&["CFG scale", "CFG"])
        .and_then(|s| s.parse().ok());
    meta.seed = block.setting("Seed").and_then(Seed::parse);
    meta.size = block.setting("Size").map(str::to_string);
    meta.model = block
        .any_setting(&["Model", "Checkpoint", "Model name"])
        .map(str::to_string);
    Some(meta)
}
