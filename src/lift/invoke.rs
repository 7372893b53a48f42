//! InvokeAI payloads: flat core metadata, graph form, and the 2.x record.

use serde_json::{Map, Value};

use crate::metadata::{Generator, ImageMetadata, size_from_dimensions};

use super::{as_text, dimension, f64_field, get_ci, seed_field, str_field, u32_field};

const CORE_MARKERS: &[&str] = &[
    "positive_prompt",
    "positive_style_prompt",
    "generation_mode",
    "app_version",
];
const CORE_NODE_TYPES: &[&str] = &["core_metadata", "metadata_accumulator"];

/// Flat core metadata: carries one of the InvokeAI-specific field names and
/// is not itself a graph.
pub fn is_core(json: &Map<String, Value>) -> bool {
    !json.contains_key("nodes") && CORE_MARKERS.iter().any(|k| json.contains_key(*k))
}

pub fn lift_core(json: &Map<String, Value>) -> Option<ImageMetadata> {
    let mut meta = ImageMetadata::for_generator(Generator::InvokeAI);
    meta.prompt = str_field(json, &["positive_prompt", "positive_style_prompt"]);
    meta.negative = str_field(json, &["negative_prompt", "negative_style_prompt"]);
    // InvokeAI calls the sampler a scheduler.
    meta.sampler = str_field(json, &["scheduler"]);
    meta.cfg = f64_field(json, &["cfg_scale"]);
    meta.steps = u32_field(json, &["steps"]);
    meta.seed = seed_field(json, &["seed"]);
    meta.size = size_from_dimensions(
        json.get("width").and_then(dimension),
        json.get("height").and_then(dimension),
    );
    meta.model = model_name(json.get("model"));
    Some(meta)
}

fn model_name(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(model) => str_field(model, &["model_name", "name"]),
        _ => None,
    }
}

fn graph_nodes(json: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    match json.get("nodes") {
        Some(Value::Array(nodes)) => nodes.iter().filter_map(Value::as_object).collect(),
        Some(Value::Object(nodes)) => nodes.values().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

fn core_node(json: &Map<String, Value>) -> Option<&Map<String, Value>> {
    graph_nodes(json).into_iter().find(|node| {
        node.get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| CORE_NODE_TYPES.contains(&t))
    })
}

/// A graph with a `core_metadata` (or `metadata_accumulator`) node.
pub fn is_graph(json: &Map<String, Value>) -> bool {
    core_node(json).is_some()
}

pub fn lift_graph(json: &Map<String, Value>) -> Option<ImageMetadata> {
    let node = core_node(json)?;
    let mut meta = lift_core(node)?;

    // Older graphs keep the prompt on the compel node only.
    if meta.prompt.is_none() {
        meta.prompt = graph_nodes(json)
            .into_iter()
            .filter(|n| {
                n.get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.contains("compel"))
            })
            .find_map(|n| str_field(n, &["prompt"]));
    }
    Some(meta)
}

/// InvokeAI 2.x: `{model_weights, image: {prompt: [{prompt, weight}], ...}}`.
pub fn is_legacy(json: &Map<String, Value>) -> bool {
    json.contains_key("model_weights") && json.get("image").is_some_and(Value::is_object)
}

pub fn lift_legacy(json: &Map<String, Value>) -> Option<ImageMetadata> {
    let image = json.get("image")?.as_object()?;
    let mut meta = ImageMetadata::for_generator(Generator::InvokeAI);

    let prompt = match image.get("prompt") {
        Some(Value::Array(parts)) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("prompt").and_then(Value::as_str))
                .collect();
            Some(texts.join(" "))
        }
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };
    if let Some(prompt) = prompt {
        let (positive, negative) = split_bracketed_negative(&prompt);
        meta.prompt = Some(positive).filter(|p| !p.trim().is_empty());
        meta.negative = negative;
    }

    meta.steps = u32_field(image, &["steps"]);
    meta.cfg = f64_field(image, &["cfg_scale"]);
    meta.seed = seed_field(image, &["seed"]);
    meta.sampler = str_field(image, &["sampler"]);
    meta.size = size_from_dimensions(
        image.get("width").and_then(dimension),
        image.get("height").and_then(dimension),
    );
    meta.model = get_ci(json, "model_weights").and_then(as_text);
    Some(meta)
}

/// InvokeAI 2.x writes the negative prompt inside square brackets.
fn split_bracketed_negative(prompt: &str) -> (String, Option<String>) {
    let mut positive = String::new();
    let mut negatives: Vec<String> = Vec::new();
    let mut rest = prompt;
    while let Some(open) = rest.find('[') {
        let Some(close) = rest[open..].find(']') else {
            break;
        };
        positive.push_str(&rest[..open]);
        let inner = rest[open + 1..open + close].trim();
        if !inner.is_empty() {
            negatives.push(inner.to_string());
        }
        rest = &rest[open + close + 1..];
    }
    positive.push_str(rest);
    let negative = if negatives.is_empty() {
        None
    } else {
        Some(negatives.join(", "))
    };
    (positive.trim().to_string(), negative)
}
