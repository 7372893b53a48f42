//! This engine's own record and the last-resort alias mapping.

use serde_json::{Map, Value};

use crate::metadata::{Generator, ImageMetadata, normalize_size, size_from_dimensions};

use super::{
    a1111, as_text, dimension, f64_field, fingerprint, get_ci, seed_field, str_field, u32_field,
};

const PROMPT_KEYS: &[&str] = &["prompt", "positive", "positive_prompt", "text"];
const NEGATIVE_KEYS: &[&str] = &["negative", "negative_prompt", "negativeprompt", "uc"];
const CFG_KEYS: &[&str] = &["cfg_scale", "cfg", "scale", "guidance_scale", "cfgscale"];
const STEPS_KEYS: &[&str] = &["steps", "num_inference_steps"];
const SEED_KEYS: &[&str] = &["seed", "noise_seed"];
const SAMPLER_KEYS: &[&str] = &["sampler", "sampler_name"];
const SIZE_KEYS: &[&str] = &["size", "resolution"];
const MODEL_KEYS: &[&str] = &[
    "model",
    "model_name",
    "sd_model",
    "sd_model_name",
    "sd_model_checkpoint",
    "checkpoint",
    "ckpt",
    "ckpt_name",
    "base_model",
];
const NESTED_MODEL_KEYS: &[&str] = &["name", "title", "file", "hash"];
const RECORD_KEYS: &[&str] = &["prompt", "negative", "steps", "cfg", "seed", "size", "model"];

/// The `sd-metadata` record: an explicit `generator` label plus at least one
/// record field, and no nested `image` object (InvokeAI 2.x uses the same
/// chunk keyword).
pub fn is_own_record(json: &Map<String, Value>) -> bool {
    json.get("generator").is_some_and(Value::is_string)
        && !json.get("image").is_some_and(Value::is_object)
        && !json.contains_key("nodes")
        && RECORD_KEYS.iter().any(|k| json.contains_key(*k))
}

/// Direct field mapping. Also accepts the sidecar spelling (`cfg_scale`,
/// `model.name`).
pub fn lift_own_record(json: &Map<String, Value>) -> Option<ImageMetadata> {
    let label = json.get("generator").and_then(Value::as_str)?;
    let mut meta = ImageMetadata::for_generator(Generator::from_label(label));
    meta.prompt = json.get("prompt").and_then(Value::as_str).map(str::to_string);
    meta.negative = json.get("negative").and_then(Value::as_str).map(str::to_string);
    meta.steps = u32_field(json, &["steps"]);
    meta.cfg = f64_field(json, &["cfg", "cfg_scale"]);
    meta.seed = seed_field(json, &["seed"]);
    meta.size = str_field(json, &["size"]);
    meta.model = model_field(json);
    meta.sampler = str_field(json, &["sampler"]);
    meta.scheduler = str_field(json, &["scheduler"]);
    Some(meta)
}

fn model_field(json: &Map<String, Value>) -> Option<String> {
    if let Some(model) = str_field(json, MODEL_KEYS) {
        return Some(model);
    }
    match get_ci(json, "model") {
        Some(Value::Object(nested)) => str_field(nested, NESTED_MODEL_KEYS),
        _ => None,
    }
}

/// Alias-table mapping for JSON from tools without a dedicated lifter
/// (NovelAI, Fooocus, sidecar exports, ...).
pub fn lift(json: &Map<String, Value>, hint: &str) -> Option<ImageMetadata> {
    let generator = match str_field(json, &["generator"]) {
        Some(label) => Generator::from_label(&label),
        None => {
            let software = str_field(json, &["software", "source"]).unwrap_or_default();
            let serialized = Value::Object(json.clone()).to_string();
            match fingerprint(&software, &serialized) {
                Generator::Unknown => fingerprint("", hint),
                found => found,
            }
        }
    };

    let mut meta = ImageMetadata::for_generator(generator);
    meta.prompt = str_field(json, PROMPT_KEYS);
    meta.negative = str_field(json, NEGATIVE_KEYS);
    meta.cfg = f64_field(json, CFG_KEYS);
    meta.steps = u32_field(json, STEPS_KEYS);
    meta.seed = seed_field(json, SEED_KEYS);
    meta.sampler = str_field(json, SAMPLER_KEYS);
    meta.scheduler = str_field(json, &["scheduler"]);
    meta.size = str_field(json, SIZE_KEYS)
        .and_then(|s| normalize_size(&s))
        .or_else(|| {
            size_from_dimensions(
                get_ci(json, "width").and_then(dimension),
                get_ci(json, "height").and_then(dimension),
            )
        });
    meta.model = model_field(json);

    // Some exporters wrap an A1111 block in JSON.
    if let Some(block) = get_ci(json, "parameters").and_then(as_text) {
        if let Some(from_block) = a1111::lift(&block, hint) {
            meta.fill_missing_from(&from_block);
        }
    }
    Some(meta)
}
