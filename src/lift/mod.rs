//! Generator lifters: map one candidate payload onto an [`ImageMetadata`].
//!
//! JSON payloads are classified into a closed set of [`Shape`]s, each with a
//! structural recognizer, and tried in [`JSON_PRIORITY`] order. Text payloads
//! either parse as JSON or go through the A1111 grammar. Every lifter returns
//! `None` when the payload is not its shape.

pub mod a1111;
pub mod comfy;
pub mod generic;
pub mod invoke;
pub mod sdx;

use log::debug;
use serde_json::{Map, Value};

use crate::metadata::{Generator, ImageMetadata, Seed};
use crate::text::{detect_generator, parse_json_object};

/// Structural classes of JSON metadata payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// This engine's own `sd-metadata` record.
    OwnRecord,
    /// InvokeAI flat core metadata (v3+).
    InvokeCore,
    /// InvokeAI 2.x `sd-metadata` (`model_weights` + `image`).
    InvokeLegacy,
    /// InvokeAI graph with a `core_metadata` node.
    InvokeGraph,
    /// ComfyUI API prompt: node id -> `{class_type, inputs}`.
    PromptMap,
    /// ComfyUI UI workflow: `{nodes, links}`.
    NodeGraph,
    /// Anything else with recognizable field names.
    GenericJson,
}

pub const JSON_PRIORITY: &[Shape] = &[
    Shape::OwnRecord,
    Shape::InvokeCore,
    Shape::InvokeLegacy,
    Shape::InvokeGraph,
    Shape::PromptMap,
    Shape::NodeGraph,
    Shape::GenericJson,
];

/// Shapes worth trying on JSON found by brute-force scans and sidecars.
pub const SCAN_PRIORITY: &[Shape] = &[Shape::PromptMap, Shape::NodeGraph, Shape::GenericJson];

impl Shape {
    pub fn name(self) -> &'static str {
        match self {
            Shape::OwnRecord => "own-record",
            Shape::InvokeCore => "invokeai-core",
            Shape::InvokeLegacy => "invokeai-legacy",
            Shape::InvokeGraph => "invokeai-graph",
            Shape::PromptMap => "comfyui-prompt",
            Shape::NodeGraph => "comfyui-workflow",
            Shape::GenericJson => "generic-json",
        }
    }

    pub fn recognizes(self, json: &Map<String, Value>) -> bool {
        match self {
            Shape::OwnRecord => generic::is_own_record(json),
            Shape::InvokeCore => invoke::is_core(json),
            Shape::InvokeLegacy => invoke::is_legacy(json),
            Shape::InvokeGraph => invoke::is_graph(json),
            Shape::PromptMap => comfy::is_prompt_map(json),
            Shape::NodeGraph => comfy::is_node_graph(json),
            Shape::GenericJson => true,
        }
    }

    fn lift(self, json: &Map<String, Value>, hint: &str) -> Option<ImageMetadata> {
        match self {
            Shape::OwnRecord => generic::lift_own_record(json),
            Shape::InvokeCore => invoke::lift_core(json),
            Shape::InvokeLegacy => invoke::lift_legacy(json),
            Shape::InvokeGraph => invoke::lift_graph(json),
            Shape::PromptMap => comfy::lift_prompt_map(json),
            Shape::NodeGraph => comfy::lift_node_graph(json),
            Shape::GenericJson => generic::lift(json, hint),
        }
    }
}

/// Try `shapes` in order; the first recognized shape whose lift yields a
/// non-empty record wins. `hint` is adjacent text (software tags) used for
/// generator fingerprinting.
pub fn lift_json_with(
    json: &Map<String, Value>,
    shapes: &[Shape],
    hint: &str,
) -> Option<ImageMetadata> {
    for &shape in shapes {
        if !shape.recognizes(json) {
            continue;
        }
        match shape.lift(json, hint) {
            Some(mut meta) => {
                meta.normalize();
                // Own records may carry nothing but the generator.
                let empty = match shape {
                    Shape::OwnRecord => !meta.has_content(),
                    _ => meta.is_empty(),
                };
                if empty {
                    debug!("{} lifter produced an empty record", shape.name());
                    continue;
                }
                meta.set_raw("shape", Value::String(shape.name().to_string()));
                return Some(meta);
            }
            None => debug!("{} lifter declined", shape.name()),
        }
    }
    None
}

pub fn lift_json(json: &Map<String, Value>, hint: &str) -> Option<ImageMetadata> {
    lift_json_with(json, JSON_PRIORITY, hint)
}

/// Lift free text: embedded JSON first, then the A1111 grammar.
pub fn lift_text(text: &str, hint: &str) -> Option<ImageMetadata> {
    if let Some(json) = parse_json_object(text) {
        if let Some(meta) = lift_json(&json, hint) {
            return Some(meta);
        }
    }
    lift_text_block(text, hint)
}

/// A1111 grammar only.
pub fn lift_text_block(text: &str, hint: &str) -> Option<ImageMetadata> {
    let mut meta = a1111::lift(text, hint)?;
    meta.normalize();
    if meta.is_empty() {
        return None;
    }
    meta.set_raw("shape", Value::String("text-block".into()));
    Some(meta)
}

/// Generator from the payload text, then from adjacent hints.
pub fn fingerprint(primary: &str, hint: &str) -> Generator {
    match detect_generator(primary) {
        Generator::Unknown => detect_generator(hint),
        found => found,
    }
}

// ============================================================================
// JSON value helpers
// ============================================================================

/// Case- and separator-insensitive key form: `Negative Prompt` -> `negative_prompt`.
pub(crate) fn key_form(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Look a key up by its normalized form.
pub(crate) fn get_ci<'a>(json: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    json.get(key).or_else(|| {
        let wanted = key_form(key);
        json.iter()
            .find(|(k, _)| key_form(k) == wanted)
            .map(|(_, v)| v)
    })
}

/// First non-blank string value among `keys`.
pub(crate) fn str_field(json: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| get_ci(json, k))
        .find_map(as_text)
}

pub(crate) fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn as_f64(value: &Value) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

pub(crate) fn u32_field(json: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    keys.iter().filter_map(|k| get_ci(json, k)).find_map(as_u32)
}

pub(crate) fn f64_field(json: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| get_ci(json, k)).find_map(as_f64)
}

pub(crate) fn seed_field(json: &Map<String, Value>, keys: &[&str]) -> Option<Seed> {
    keys.iter()
        .filter_map(|k| get_ci(json, k))
        .find_map(Seed::from_json)
}

pub(crate) fn dimension(value: &Value) -> Option<u64> {
    as_u32(value).map(u64::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    // ── helpers ──────────────────────────────────────────────────────

    #[test]
    fn keys_match_loosely() {
        let m = obj(json!({"Negative Prompt": "x", "CFG-Scale": "6.5", "Steps": 20.0}));
        assert_eq!(str_field(&m, &["negative_prompt"]).as_deref(), Some("x"));
        assert_eq!(f64_field(&m, &["cfg_scale"]), Some(6.5));
        assert_eq!(u32_field(&m, &["steps"]), Some(20));
    }

    #[test]
    fn numeric_parsing_is_strict() {
        assert_eq!(as_u32(&json!(-3)), None);
        assert_eq!(as_u32(&json!(2.5)), None);
        assert_eq!(as_u32(&json!(" 12 ")), Some(12));
        assert_eq!(as_f64(&json!("nan")), None);
        assert_eq!(as_f64(&json!(["6", 0])), None);
    }

    // ── dispatch ─────────────────────────────────────────────────────

    #[test]
    fn dispatch_follows_priority() {
        let own = obj(json!({"prompt": "p", "generator": "ComfyUI", "steps": 5}));
        let meta = lift_json(&own, "").unwrap();
        assert_eq!(meta.raw["shape"], json!("own-record"));
        assert_eq!(meta.generator, Generator::ComfyUI);

        let prompt_map = obj(json!({
            "3": {"class_type": "KSampler", "inputs": {"seed": 1, "steps": 2, "cfg": 3.0,
                  "sampler_name": "euler", "scheduler": "normal", "positive": ["6", 0]}},
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "a fox"}}
        }));
        let meta = lift_json(&prompt_map, "").unwrap();
        assert_eq!(meta.raw["shape"], json!("comfyui-prompt"));
        assert_eq!(meta.prompt.as_deref(), Some("a fox"));
    }

    #[test]
    fn unrecognizable_json_is_none() {
        assert!(lift_json(&obj(json!({"foo": 1, "bar": [1, 2]})), "").is_none());
    }

    #[test]
    fn text_dispatches_to_json_or_block() {
        let meta = lift_text(r#"{"prompt": "from json", "seed": 3}"#, "").unwrap();
        assert_eq!(meta.prompt.as_deref(), Some("from json"));

        let meta = lift_text("from text\nSteps: 4, Seed: 5", "made by sd.next").unwrap();
        assert_eq!(meta.prompt.as_deref(), Some("from text"));
        assert_eq!(meta.generator, Generator::SDNext);
        assert_eq!(meta.raw["shape"], json!("text-block"));
    }

    #[test]
    fn fingerprint_prefers_primary() {
        assert_eq!(fingerprint("novelai", "comfyui"), Generator::NovelAI);
        assert_eq!(fingerprint("nothing", "Fooocus"), Generator::Fooocus);
        assert_eq!(fingerprint("", ""), Generator::Unknown);
    }
}
