//! The normalized metadata record every lifter produces and the writer embeds.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::text::sanitize_text;

/// The tool that produced an image.
///
/// Unrecognized labels are kept verbatim in [`Generator::Other`] so a value
/// written by some other tool survives a read/write round trip.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Generator {
    A1111,
    ComfyUI,
    InvokeAI,
    NovelAI,
    SDNext,
    Fooocus,
    SidecarText,
    #[default]
    Unknown,
    Other(String),
}

impl Generator {
    pub fn label(&self) -> &str {
        match self {
            Generator::A1111 => "AUTOMATIC1111",
            Generator::ComfyUI => "ComfyUI",
            Generator::InvokeAI => "InvokeAI",
            Generator::NovelAI => "NovelAI",
            Generator::SDNext => "SD.Next",
            Generator::Fooocus => "Fooocus",
            Generator::SidecarText => "Sidecar",
            Generator::Unknown => "Unknown",
            Generator::Other(label) => label,
        }
    }

    /// Map a label back to a tag. Accepts the short aliases other tools use.
    pub fn from_label(label: &str) -> Self {
        let trimmed = label.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "automatic1111" | "a1111" => Generator::A1111,
            "comfyui" => Generator::ComfyUI,
            "invokeai" => Generator::InvokeAI,
            "novelai" => Generator::NovelAI,
            "sd.next" | "sdnext" => Generator::SDNext,
            "fooocus" => Generator::Fooocus,
            "sidecar" | "sidecartext" => Generator::SidecarText,
            "" | "unknown" => Generator::Unknown,
            _ => Generator::Other(trimmed.to_string()),
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Generator::Unknown)
    }
}

impl From<String> for Generator {
    fn from(label: String) -> Self {
        Generator::from_label(&label)
    }
}

impl From<Generator> for String {
    fn from(generator: Generator) -> Self {
        generator.label().to_string()
    }
}

impl std::fmt::Display for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A generation seed.
///
/// Some tools emit seeds that overflow 64-bit integers, so a seed is kept as
/// text whenever it is not a plain `i64`. Equality compares the textual form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Seed {
    Int(i64),
    Text(String),
}

impl Seed {
    /// Parse a seed from free text. Returns `None` for blank input.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim().trim_matches('"').trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(match trimmed.parse::<i64>() {
            Ok(n) => Seed::Int(n),
            Err(_) => Seed::Text(trimmed.to_string()),
        })
    }

    /// Read a seed from a JSON number or string.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Seed::Int(i),
                None => Seed::Text(n.to_string()),
            }),
            Value::String(s) => Seed::parse(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Seed::Int(n) => write!(f, "{n}"),
            Seed::Text(s) => f.write_str(s),
        }
    }
}

impl PartialEq for Seed {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

/// Where the resolved record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataSource {
    Embedded,
    Sidecar,
    #[default]
    None,
}

/// Normalized generation metadata for one image.
///
/// Built fresh on every read. `raw` holds origin-specific debug data keyed by
/// pipeline stage and is never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub generator: Generator,
    pub source: MetadataSource,
    pub prompt: Option<String>,
    pub negative: Option<String>,
    pub model: Option<String>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub seed: Option<Seed>,
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub raw: Map<String, Value>,
}

/// A sparse update. `None` fields leave the current value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataPatch {
    pub generator: Option<Generator>,
    pub prompt: Option<String>,
    pub negative: Option<String>,
    pub model: Option<String>,
    pub sampler: Option<String>,
    pub scheduler: Option<String>,
    pub steps: Option<u32>,
    pub cfg: Option<f64>,
    pub seed: Option<Seed>,
    pub size: Option<String>,
}

impl ImageMetadata {
    /// An empty record tagged with a generator.
    pub fn for_generator(generator: Generator) -> Self {
        Self {
            generator,
            ..Default::default()
        }
    }

    /// True when no generation field is set (generator, source and raw ignored).
    pub fn is_empty(&self) -> bool {
        self.prompt.is_none()
            && self.negative.is_none()
            && self.model.is_none()
            && self.sampler.is_none()
            && self.scheduler.is_none()
            && self.steps.is_none()
            && self.cfg.is_none()
            && self.seed.is_none()
            && self.size.is_none()
    }

    /// True when any generation field is set or the generator is known.
    pub fn has_content(&self) -> bool {
        !self.is_empty() || !self.generator.is_unknown()
    }

    pub fn has_prompt_text(&self) -> bool {
        self.prompt.is_some() || self.negative.is_some()
    }

    /// Apply field normalization in place: sanitized prompt text, model
    /// basename, canonical size.
    pub fn normalize(&mut self) {
        self.prompt = self.prompt.as_deref().map(sanitize_text);
        self.negative = self.negative.as_deref().map(sanitize_text);
        self.model = self.model.as_deref().and_then(normalize_model);
        self.sampler = self.sampler.as_deref().and_then(non_blank);
        self.scheduler = self.scheduler.as_deref().and_then(non_blank);
        self.size = self.size.as_deref().and_then(normalize_size);
        if self.cfg.is_some_and(|c| !c.is_finite()) {
            self.cfg = None;
        }
    }

    /// Sparse merge of `patch` over `self`. The patch is normalized the same
    /// way lifted fields are, so a write followed by a read compares equal.
    pub fn merged(&self, patch: &MetadataPatch) -> ImageMetadata {
        let mut out = self.clone();
        if let Some(generator) = &patch.generator {
            out.generator = generator.clone();
        }
        if let Some(prompt) = &patch.prompt {
            out.prompt = Some(sanitize_text(prompt));
        }
        if let Some(negative) = &patch.negative {
            out.negative = Some(sanitize_text(negative));
        }
        if let Some(model) = patch.model.as_deref().and_then(normalize_model) {
            out.model = Some(model);
        }
        if let Some(sampler) = patch.sampler.as_deref().and_then(non_blank) {
            out.sampler = Some(sampler);
        }
        if let Some(scheduler) = patch.scheduler.as_deref().and_then(non_blank) {
            out.scheduler = Some(scheduler);
        }
        if patch.steps.is_some() {
            out.steps = patch.steps;
        }
        if let Some(cfg) = patch.cfg.filter(|c| c.is_finite()) {
            out.cfg = Some(cfg);
        }
        if let Some(seed) = &patch.seed {
            out.seed = Some(seed.clone());
        }
        if let Some(size) = patch.size.as_deref().and_then(normalize_size) {
            out.size = Some(size);
        }
        out
    }

    /// Fill fields that are still empty from `other`. Used when a second
    /// source (sidecar, adjacent chunk) complements the primary result.
    pub fn fill_missing_from(&mut self, other: &ImageMetadata) {
        macro_rules! fill {
            ($($field:ident),*) => {
                $(if self.$field.is_none() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        fill!(prompt, negative, model, sampler, scheduler, steps, cfg, seed, size);
        if self.generator.is_unknown() {
            self.generator = other.generator.clone();
        }
    }

    /// Attach a debug value under a stage key.
    pub fn set_raw(&mut self, key: &str, value: Value) {
        self.raw.insert(key.to_string(), value);
    }

    /// This engine's own lossless schema, stored in the PNG `sd-metadata` chunk.
    pub fn to_stored_json(&self) -> Value {
        json!({
            "prompt": self.prompt,
            "negative": self.negative,
            "steps": self.steps,
            "cfg": self.cfg,
            "seed": self.seed,
            "size": self.size,
            "model": self.model,
            "sampler": self.sampler,
            "scheduler": self.scheduler,
            "generator": self.generator.label(),
        })
    }

    /// The sidecar JSON schema written for formats that cannot embed metadata.
    pub fn to_sidecar_json(&self) -> Value {
        json!({
            "prompt": self.prompt,
            "negative": self.negative,
            "steps": self.steps,
            "cfg_scale": self.cfg,
            "seed": self.seed,
            "size": self.size,
            "model": { "name": self.model },
            "sampler": self.sampler,
            "scheduler": self.scheduler,
            "generator": self.generator.label(),
        })
    }
}

fn non_blank(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Strip directory components from a model reference, keeping the extension.
pub fn normalize_model(model: &str) -> Option<String> {
    let base = model.trim().rsplit(['/', '\\']).next().unwrap_or("").trim();
    non_blank(base)
}

/// Canonicalize a size to `"<width>x<height>"`.
///
/// Accepts `512x768`, `512 x 768`, `512×768` and tuple forms like `(1024, 1024)`.
pub fn normalize_size(size: &str) -> Option<String> {
    let numbers: Vec<u32> = size
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect();
    match numbers.as_slice() {
        [w, h] if *w > 0 && *h > 0 => Some(format!("{w}x{h}")),
        _ => None,
    }
}

/// Compose a size string from separate dimensions.
pub fn size_from_dimensions(width: Option<u64>, height: Option<u64>) -> Option<String> {
    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Some(format!("{w}x{h}")),
        _ => None,
    }
}
