//! ComfyUI payloads: the API prompt map and the UI workflow graph.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::metadata::{Generator, ImageMetadata, Seed, size_from_dimensions};

use super::{as_f64, as_text, as_u32, dimension, f64_field, seed_field, str_field, u32_field};

/// Values of the `control_after_generate` widget ComfyUI inserts after a seed.
const CONTROL_VALUES: &[&str] = &["fixed", "randomize", "increment", "decrement"];
const LINK_DEPTH: usize = 8;
const TEXT_KEYS: &[&str] = &["text", "text_g", "text_l", "string", "value", "prompt"];
const MODEL_KEYS: &[&str] = &["ckpt_name", "unet_name", "model_name"];

fn is_negative_title(title: &str) -> bool {
    title.to_lowercase().contains("neg")
}

fn dedup_join(parts: Vec<String>, sep: &str) -> Option<String> {
    let mut unique: Vec<String> = Vec::new();
    for part in parts {
        if !part.trim().is_empty() && !unique.contains(&part) {
            unique.push(part);
        }
    }
    if unique.is_empty() {
        None
    } else {
        Some(unique.join(sep))
    }
}

fn longest(candidates: impl IntoIterator<Item = String>) -> Option<String> {
    candidates
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .fold(None, |best: Option<String>, s| match best {
            Some(b) if b.len() >= s.len() => Some(b),
            _ => Some(s),
        })
}

// ============================================================================
// Prompt map
// ============================================================================

/// The first node of the map has an `inputs` object.
pub fn is_prompt_map(json: &Map<String, Value>) -> bool {
    json.values()
        .next()
        .and_then(Value::as_object)
        .is_some_and(|node| node.get("inputs").is_some_and(Value::is_object))
}

pub fn lift_prompt_map(json: &Map<String, Value>) -> Option<ImageMetadata> {
    let mut meta = ImageMetadata::for_generator(Generator::ComfyUI);
    let mut positives: Vec<String> = Vec::new();
    let mut negatives: Vec<String> = Vec::new();
    let mut encoder_texts: Vec<(String, String)> = Vec::new();

    for node in json.values().filter_map(Value::as_object) {
        let Some(inputs) = node.get("inputs").and_then(Value::as_object) else {
            continue;
        };
        let class = node
            .get("class_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase();

        if let Some(v) = inputs.get("positive") {
            positives.extend(dedup_join(resolve_text(json, v, 0), " "));
        }
        if let Some(v) = inputs.get("negative") {
            negatives.extend(dedup_join(resolve_text(json, v, 0), " "));
        }

        if class.contains("ksampler") {
            if meta.seed.is_none() {
                meta.seed = seed_field(inputs, &["seed", "noise_seed"]);
            }
            if meta.steps.is_none() {
                meta.steps = u32_field(inputs, &["steps"]);
            }
            if meta.cfg.is_none() {
                meta.cfg = f64_field(inputs, &["cfg"]);
            }
            if meta.sampler.is_none() {
                meta.sampler = str_field(inputs, &["sampler_name"]);
            }
            if meta.scheduler.is_none() {
                meta.scheduler = str_field(inputs, &["scheduler"]);
            }
        }

        if meta.size.is_none() {
            meta.size = size_from_dimensions(
                inputs.get("width").and_then(dimension),
                inputs.get("height").and_then(dimension),
            );
        }
        if meta.model.is_none() {
            meta.model = str_field(inputs, MODEL_KEYS);
        }

        if class.contains("cliptextencode") {
            if let Some(text) = inputs.get("text").and_then(as_text) {
                let title = node
                    .get("_meta")
                    .and_then(|m| m.get("title"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                encoder_texts.push((title, text));
            }
        }
    }

    // Without sampler links, fall back to titled text encoders.
    if positives.is_empty() {
        for (title, text) in encoder_texts {
            if is_negative_title(&title) {
                negatives.push(text);
            } else {
                positives.push(text);
            }
        }
    }

    meta.prompt = longest(positives);
    meta.negative = dedup_join(negatives, ", ");
    Some(meta)
}

/// Resolve an input to text, following `["<node id>", <slot>]` links through
/// text and conditioning inputs.
fn resolve_text(graph: &Map<String, Value>, value: &Value, depth: usize) -> Vec<String> {
    if depth > LINK_DEPTH {
        return Vec::new();
    }
    match value {
        Value::String(s) if !s.trim().is_empty() => vec![s.clone()],
        Value::Array(link) if link.len() == 2 => {
            let id = match &link[0] {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return Vec::new(),
            };
            let Some(inputs) = graph
                .get(&id)
                .and_then(|n| n.get("inputs"))
                .and_then(Value::as_object)
            else {
                return Vec::new();
            };

            let mut out: Vec<String> = TEXT_KEYS
                .iter()
                .filter_map(|k| inputs.get(*k))
                .flat_map(|v| resolve_text(graph, v, depth + 1))
                .collect();
            if out.is_empty() {
                out = inputs
                    .iter()
                    .filter(|(k, _)| k.starts_with("conditioning"))
                    .flat_map(|(_, v)| resolve_text(graph, v, depth + 1))
                    .collect();
            }
            out
        }
        _ => Vec::new(),
    }
}

// ============================================================================
// Node graph
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Slot {
    Seed,
    Steps,
    Cfg,
    Sampler,
    Scheduler,
    Model,
    Width,
    Height,
    Positive,
    Negative,
}

/// Positional meaning of a node's `widgets_values`.
///
/// These layouts are inferred from ComfyUI and custom-node releases; widget
/// order is not part of any contract and shifts between versions, so the
/// table is best-effort. Add a new entry rather than editing an old one when
/// a release changes an order.
struct WidgetLayout {
    name: &'static str,
    slots: &'static [(Slot, usize)],
}

static KSAMPLER_WITH_CONTROL: WidgetLayout = WidgetLayout {
    name: "KSampler/control",
    slots: &[
        (Slot::Seed, 0),
        (Slot::Steps, 2),
        (Slot::Cfg, 3),
        (Slot::Sampler, 4),
        (Slot::Scheduler, 5),
    ],
};

static KSAMPLER: WidgetLayout = WidgetLayout {
    name: "KSampler",
    slots: &[
        (Slot::Seed, 0),
        (Slot::Steps, 1),
        (Slot::Cfg, 2),
        (Slot::Sampler, 3),
        (Slot::Scheduler, 4),
    ],
};

static KSAMPLER_ADVANCED_WITH_CONTROL: WidgetLayout = WidgetLayout {
    name: "KSamplerAdvanced/control",
    slots: &[
        (Slot::Seed, 1),
        (Slot::Steps, 3),
        (Slot::Cfg, 4),
        (Slot::Sampler, 5),
        (Slot::Scheduler, 6),
    ],
};

static KSAMPLER_ADVANCED: WidgetLayout = WidgetLayout {
    name: "KSamplerAdvanced",
    slots: &[
        (Slot::Seed, 1),
        (Slot::Steps, 2),
        (Slot::Cfg, 3),
        (Slot::Sampler, 4),
        (Slot::Scheduler, 5),
    ],
};

static EFFICIENT_LOADER: WidgetLayout = WidgetLayout {
    name: "Efficient Loader",
    slots: &[
        (Slot::Model, 0),
        (Slot::Positive, 6),
        (Slot::Negative, 7),
        (Slot::Width, 10),
        (Slot::Height, 11),
    ],
};

static CHECKPOINT_LOADER: WidgetLayout = WidgetLayout {
    name: "CheckpointLoaderSimple",
    slots: &[(Slot::Model, 0)],
};

static EMPTY_LATENT: WidgetLayout = WidgetLayout {
    name: "EmptyLatentImage",
    slots: &[(Slot::Width, 0), (Slot::Height, 1)],
};

fn layout_for(kind: &str, widgets: &[Value]) -> Option<&'static WidgetLayout> {
    let has_control = |slot: usize| {
        widgets
            .get(slot)
            .and_then(Value::as_str)
            .is_some_and(|s| CONTROL_VALUES.contains(&s.to_lowercase().as_str()))
    };

    if kind.contains("ksampleradvanced") {
        Some(if has_control(2) { &KSAMPLER_ADVANCED_WITH_CONTROL } else { &KSAMPLER_ADVANCED })
    } else if kind.contains("ksampler") {
        Some(if has_control(1) { &KSAMPLER_WITH_CONTROL } else { &KSAMPLER })
    } else if kind.contains("efficient loader") {
        Some(&EFFICIENT_LOADER)
    } else if kind.contains("checkpointloader") {
        Some(&CHECKPOINT_LOADER)
    } else if kind.contains("emptylatentimage") {
        Some(&EMPTY_LATENT)
    } else {
        None
    }
}

/// Fields read out of widget values, first writer wins.
#[derive(Default)]
struct GraphFields {
    width: Option<u64>,
    height: Option<u64>,
    positives: Vec<String>,
    negatives: Vec<String>,
}

fn apply_slot(meta: &mut ImageMetadata, fields: &mut GraphFields, slot: Slot, value: &Value) {
    match slot {
        Slot::Seed if meta.seed.is_none() => meta.seed = Seed::from_json(value),
        Slot::Steps if meta.steps.is_none() => meta.steps = as_u32(value),
        Slot::Cfg if meta.cfg.is_none() => meta.cfg = as_f64(value),
        Slot::Sampler if meta.sampler.is_none() => meta.sampler = as_text(value),
        Slot::Scheduler if meta.scheduler.is_none() => meta.scheduler = as_text(value),
        Slot::Model if meta.model.is_none() => meta.model = as_text(value),
        Slot::Width if fields.width.is_none() => fields.width = dimension(value),
        Slot::Height if fields.height.is_none() => fields.height = dimension(value),
        Slot::Positive => fields.positives.extend(as_text(value)),
        Slot::Negative => fields.negatives.extend(as_text(value)),
        _ => {}
    }
}

/// Widgets stored as a name -> value object (newer frontends).
fn apply_named_widgets(meta: &mut ImageMetadata, fields: &mut GraphFields, widgets: &Map<String, Value>) {
    let named: &[(&str, Slot)] = &[
        ("seed", Slot::Seed),
        ("noise_seed", Slot::Seed),
        ("steps", Slot::Steps),
        ("cfg", Slot::Cfg),
        ("sampler_name", Slot::Sampler),
        ("scheduler", Slot::Scheduler),
        ("ckpt_name", Slot::Model),
        ("unet_name", Slot::Model),
        ("width", Slot::Width),
        ("height", Slot::Height),
    ];
    for (key, slot) in named {
        if let Some(value) = widgets.get(*key) {
            apply_slot(meta, fields, *slot, value);
        }
    }
}

/// `nodes` is a non-empty array or object.
pub fn is_node_graph(json: &Map<String, Value>) -> bool {
    match json.get("nodes") {
        Some(Value::Array(nodes)) => !nodes.is_empty(),
        Some(Value::Object(nodes)) => !nodes.is_empty(),
        _ => false,
    }
}

fn graph_nodes(json: &Map<String, Value>) -> Vec<&Map<String, Value>> {
    match json.get("nodes") {
        Some(Value::Array(nodes)) => nodes.iter().filter_map(Value::as_object).collect(),
        Some(Value::Object(nodes)) => nodes.values().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

fn node_kind(node: &Map<String, Value>) -> String {
    node.get("type")
        .or_else(|| node.get("class_type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase()
}

fn node_title(node: &Map<String, Value>) -> String {
    node.get("title")
        .and_then(Value::as_str)
        .or_else(|| node.get("_meta").and_then(|m| m.get("title")).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn node_id(node: &Map<String, Value>) -> Option<i64> {
    match node.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn node_text(node: &Map<String, Value>, kind: &str) -> Option<String> {
    if let Some(text) = node
        .get("inputs")
        .and_then(Value::as_object)
        .and_then(|inputs| inputs.get("text"))
        .and_then(as_text)
    {
        return Some(text);
    }
    if kind.contains("cliptextencode") {
        return match node.get("widgets_values")? {
            Value::Array(widgets) => widgets.iter().find_map(as_text),
            Value::Object(widgets) => widgets.get("text").and_then(as_text),
            _ => None,
        };
    }
    None
}

/// Link id -> origin node id, from either link serialization.
fn link_origins(json: &Map<String, Value>) -> HashMap<i64, i64> {
    let Some(Value::Array(links)) = json.get("links") else {
        return HashMap::new();
    };
    links
        .iter()
        .filter_map(|link| match link {
            // [id, origin_id, origin_slot, target_id, target_slot, type]
            Value::Array(parts) => Some((parts.first()?.as_i64()?, parts.get(1)?.as_i64()?)),
            Value::Object(obj) => Some((obj.get("id")?.as_i64()?, obj.get("origin_id")?.as_i64()?)),
            _ => None,
        })
        .collect()
}

/// Input link ids of a UI node, keyed by input name.
fn input_links(node: &Map<String, Value>) -> Vec<(String, i64)> {
    let Some(Value::Array(inputs)) = node.get("inputs") else {
        return Vec::new();
    };
    inputs
        .iter()
        .filter_map(|input| {
            let name = input.get("name")?.as_str()?.to_string();
            let link = input.get("link")?.as_i64()?;
            Some((name, link))
        })
        .collect()
}

struct Graph<'a> {
    by_id: HashMap<i64, &'a Map<String, Value>>,
    texts: HashMap<i64, String>,
    origins: HashMap<i64, i64>,
}

impl Graph<'_> {
    /// Text reaching `link`, following conditioning pass-through nodes.
    fn text_via_link(&self, link: i64, depth: usize) -> Option<String> {
        if depth > LINK_DEPTH {
            return None;
        }
        let origin = *self.origins.get(&link)?;
        if let Some(text) = self.texts.get(&origin) {
            return Some(text.clone());
        }
        let node = self.by_id.get(&origin)?;
        input_links(node)
            .into_iter()
            .filter(|(name, _)| name.starts_with("conditioning"))
            .find_map(|(_, next)| self.text_via_link(next, depth + 1))
    }
}

pub fn lift_node_graph(json: &Map<String, Value>) -> Option<ImageMetadata> {
    let nodes = graph_nodes(json);
    if nodes.is_empty() {
        return None;
    }

    let mut meta = ImageMetadata::for_generator(Generator::ComfyUI);
    let mut fields = GraphFields::default();
    let mut graph = Graph {
        by_id: HashMap::new(),
        texts: HashMap::new(),
        origins: link_origins(json),
    };
    // (title, text) in node order
    let mut encoder_texts: Vec<(String, String)> = Vec::new();

    for node in &nodes {
        let kind = node_kind(node);
        let id = node_id(node);
        if let Some(id) = id {
            graph.by_id.insert(id, *node);
        }

        if let Some(text) = node_text(node, &kind) {
            if let Some(id) = id {
                graph.texts.insert(id, text.clone());
            }
            encoder_texts.push((node_title(node), text));
        }

        match node.get("widgets_values") {
            Some(Value::Array(widgets)) => {
                if let Some(layout) = layout_for(&kind, widgets) {
                    log::debug!("reading {} widgets with the {} layout", kind, layout.name);
                    for &(slot, index) in layout.slots {
                        if let Some(value) = widgets.get(index) {
                            apply_slot(&mut meta, &mut fields, slot, value);
                        }
                    }
                }
            }
            Some(Value::Object(widgets)) => apply_named_widgets(&mut meta, &mut fields, widgets),
            _ => {}
        }
    }

    // Sampler inputs say exactly which encoder is which.
    for node in nodes.iter().filter(|n| node_kind(n).contains("ksampler")) {
        for (name, link) in input_links(node) {
            let Some(text) = graph.text_via_link(link, 0) else {
                continue;
            };
            match name.as_str() {
                "positive" => fields.positives.push(text),
                "negative" => fields.negatives.push(text),
                _ => {}
            }
        }
    }

    if fields.positives.is_empty() {
        let mut unlabeled: Vec<String> = Vec::new();
        for (title, text) in encoder_texts {
            if is_negative_title(&title) {
                fields.negatives.push(text);
            } else {
                unlabeled.push(text);
            }
        }
        // Longer text is the positive prompt; the runner-up is the negative
        // when no encoder was titled as one.
        unlabeled.sort_by_key(|t| std::cmp::Reverse(t.len()));
        let mut unlabeled = unlabeled.into_iter();
        fields.positives.extend(unlabeled.next());
        if fields.negatives.is_empty() {
            fields.negatives.extend(unlabeled.next());
        }
    }

    meta.prompt = longest(fields.positives);
    meta.negative = dedup_join(fields.negatives, ", ");
    meta.size = size_from_dimensions(fields.width, fields.height);
    Some(meta)
}
