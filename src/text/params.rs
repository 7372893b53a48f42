//! The A1111 "parameters" text grammar:
//!
//! ```text
//! <prompt>
//! Negative prompt: <negative>
//! Steps: 20, Sampler: Euler a, CFG scale: 7, Seed: 42, Size: 512x512, Model: foo
//! ```

use crate::metadata::ImageMetadata;

const NEGATIVE_MARKER: &str = "Negative prompt:";

/// Keys whose `Key:` occurrence starts the settings line.
const SETTINGS_KEYS: &[&str] = &[
    "Steps:",
    "Sampler:",
    "CFG scale:",
    "CFG:",
    "Seed:",
    "Size:",
    "Model:",
    "Model hash:",
    "Checkpoint:",
];

/// A parsed parameters block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationBlock {
    pub positive: String,
    pub negative: Option<String>,
    /// Settings in declaration order; keys keep their original spelling.
    pub settings: Vec<(String, String)>,
}

impl GenerationBlock {
    /// Case-insensitive lookup of the first setting named `key`.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// First setting matching any of `keys`.
    pub fn any_setting(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.setting(k))
    }
}

/// Split a parameters block into prompt, negative prompt and settings.
///
/// The split is on the literal `Negative prompt:` marker, so a prompt that
/// itself contains that phrase is mis-split. Returns `None` for blank input.
pub fn parse_generation_block(text: &str) -> Option<GenerationBlock> {
    let text = text.replace("\r\n", "\n");
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let (positive, negative, settings) = match text.find(NEGATIVE_MARKER) {
        Some(idx) => {
            let tail = &text[idx + NEGATIVE_MARKER.len()..];
            let boundary = settings_boundary(tail, false).unwrap_or(tail.len());
            (&text[..idx], Some(&tail[..boundary]), &tail[boundary..])
        }
        None => {
            let boundary = settings_boundary(text, true).unwrap_or(text.len());
            (&text[..boundary], None, &text[boundary..])
        }
    };

    let block = GenerationBlock {
        positive: positive.trim().to_string(),
        negative: negative.map(|n| n.trim().to_string()),
        settings: tokenize_settings(settings),
    };
    if block.positive.is_empty() && block.negative.is_none() && block.settings.is_empty() {
        return None;
    }
    Some(block)
}

/// Byte offset where the settings portion of `text` begins.
///
/// A key at the start of a line wins. Without one, the earliest key anywhere
/// is used unless `line_start_only` is set.
fn settings_boundary(text: &str, line_start_only: bool) -> Option<usize> {
    let mut at_line_start: Option<usize> = None;
    let mut anywhere: Option<usize> = None;

    for key in SETTINGS_KEYS {
        for (idx, _) in text.match_indices(key) {
            let line_start = idx == 0 || text[..idx].ends_with('\n');
            if line_start {
                at_line_start = Some(at_line_start.map_or(idx, |cur| cur.min(idx)));
            } else {
                anywhere = Some(anywhere.map_or(idx, |cur| cur.min(idx)));
            }
        }
    }

    match at_line_start {
        Some(idx) => Some(idx),
        None if line_start_only => None,
        None => anywhere,
    }
}

/// Split a settings line on top-level commas and newlines, then each token on
/// its first colon. Commas inside parentheses, brackets or quotes do not split.
fn tokenize_settings(settings: &str) -> Vec<(String, String)> {
    let mut tokens = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut current = String::new();

    for c in settings.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' | '[' | '{' if !in_quotes => depth += 1,
            ')' | ']' | '}' if !in_quotes => depth = (depth - 1).max(0),
            ',' | '\n' if !in_quotes && depth == 0 => {
                tokens.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    tokens.push(current);

    tokens
        .iter()
        .filter_map(|token| {
            let (key, value) = token.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Compose an A1111-compatible parameters block from a record.
pub fn compose_parameters(meta: &ImageMetadata) -> String {
    let mut out = meta.prompt.clone().unwrap_or_default();

    if let Some(negative) = &meta.negative {
        out.push('\n');
        out.push_str(NEGATIVE_MARKER);
        out.push(' ');
        out.push_str(negative);
    }

    let mut settings: Vec<String> = Vec::new();
    if let Some(steps) = meta.steps {
        settings.push(format!("Steps: {steps}"));
    }
    if let Some(sampler) = &meta.sampler {
        settings.push(format!("Sampler: {sampler}"));
    }
    if let Some(scheduler) = &meta.scheduler {
        settings.push(format!("Schedule type: {scheduler}"));
    }
    if let Some(cfg) = meta.cfg {
        settings.push(format!("CFG scale: {cfg}"));
    }
    if let Some(seed) = &meta.seed {
        settings.push(format!("Seed: {seed}"));
    }
    if let Some(size) = &meta.size {
        settings.push(format!("Size: {size}"));
    }
    if let Some(model) = &meta.model {
        settings.push(format!("Model: {model}"));
    }

    if !settings.is_empty() {
        out.push('\n');
        out.push_str(&settings.join(", "));
    }
    out
}
