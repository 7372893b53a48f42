//! Stateless text and JSON heuristics shared by the codecs, lifters and reader.
//!
//! Nothing here fails: a missing or malformed input yields `None` or an empty
//! collection.

pub mod params;
pub mod xmp;

use serde_json::{Map, Value};

use crate::metadata::Generator;

pub use params::{GenerationBlock, compose_parameters, parse_generation_block};

/// Strip control characters, collapse runs of whitespace to one space, trim.
pub fn sanitize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if c.is_control() || c == '\u{feff}' {
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    }
    out
}

/// Byte-level text encoding guessed for a candidate run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

/// Guess whether `bytes` hold UTF-16 or UTF-8 text.
///
/// A byte-order mark wins. Otherwise NUL bytes are counted separately at odd
/// and even offsets: ASCII-heavy UTF-16LE puts its zero high bytes on odd
/// offsets, UTF-16BE on even ones.
pub fn detect_encoding(bytes: &[u8]) -> Encoding {
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return Encoding::Utf16Le;
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return Encoding::Utf16Be;
    }
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) || bytes.len() < 4 {
        return Encoding::Utf8;
    }

    let sample = &bytes[..bytes.len().min(4096)];
    let pairs = sample.len() / 2;
    let odd_nulls = sample.iter().skip(1).step_by(2).filter(|&&b| b == 0).count();
    let even_nulls = sample.iter().step_by(2).filter(|&&b| b == 0).count();

    // Ratio threshold, in tenths.
    if odd_nulls * 10 >= pairs * 3 && odd_nulls > even_nulls * 2 {
        Encoding::Utf16Le
    } else if even_nulls * 10 >= pairs * 3 && even_nulls > odd_nulls * 2 {
        Encoding::Utf16Be
    } else {
        Encoding::Utf8
    }
}

/// Decode a candidate byte run into text using [`detect_encoding`].
///
/// BOMs and NUL padding are stripped; blank results are `None`.
pub fn decode_candidate(bytes: &[u8]) -> Option<String> {
    let text = match detect_encoding(bytes) {
        Encoding::Utf8 => {
            let body = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
            String::from_utf8_lossy(body).into_owned()
        }
        Encoding::Utf16Le => decode_utf16(bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes), false),
        Encoding::Utf16Be => decode_utf16(bytes.strip_prefix(&[0xFE, 0xFF]).unwrap_or(bytes), true),
    };
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Decode UTF-16 code units of a fixed byte order; a trailing odd byte is dropped.
pub fn decode_utf16(bytes: &[u8], big_endian: bool) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if big_endian {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_le_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

/// Return the balanced `{...}` substring starting at the first `{` at or after
/// `start`. Braces inside quoted strings (with backslash escapes) are ignored.
pub fn extract_balanced_json(text: &str, start: usize) -> Option<&str> {
    let open = start + text.get(start..)?.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[open..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open..=open + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse `text` as a JSON object, either directly or from the first balanced
/// object embedded in it.
pub fn parse_json_object(text: &str) -> Option<Map<String, Value>> {
    let trimmed = text.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        return Some(map);
    }
    // Some tools store the JSON document as a JSON string.
    if let Ok(Value::String(inner)) = serde_json::from_str::<Value>(trimmed) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(inner.trim()) {
            return Some(map);
        }
    }
    let candidate = extract_balanced_json(trimmed, 0)?;
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Every top-level JSON object embedded in `text`, up to `limit` objects.
pub fn json_objects(text: &str, limit: usize) -> Vec<Map<String, Value>> {
    let mut found = Vec::new();
    let mut cursor = 0;
    while found.len() < limit {
        let Some(rel) = text.get(cursor..).and_then(|rest| rest.find('{')) else {
            break;
        };
        let open = cursor + rel;
        match extract_balanced_json(text, open) {
            Some(candidate) => match serde_json::from_str::<Value>(candidate) {
                Ok(Value::Object(map)) => {
                    found.push(map);
                    cursor = open + candidate.len();
                }
                _ => cursor = open + 1,
            },
            None => break,
        }
    }
    found
}

/// Case-insensitive tool fingerprint over arbitrary text.
pub fn detect_generator(text: &str) -> Generator {
    const FINGERPRINTS: &[(&[&str], Generator)] = &[
        (&["comfyui"], Generator::ComfyUI),
        (&["invokeai"], Generator::InvokeAI),
        (&["sd.next", "sdnext"], Generator::SDNext),
        (&["fooocus"], Generator::Fooocus),
        (&["novelai"], Generator::NovelAI),
        (&["automatic1111", "a1111"], Generator::A1111),
    ];

    let lower = text.to_lowercase();
    FINGERPRINTS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, generator)| generator.clone())
        .unwrap_or(Generator::Unknown)
}

/// True when `text` looks like an A1111-style parameters block.
pub fn has_generation_markers(text: &str) -> bool {
    if text.contains("Negative prompt:") {
        return true;
    }
    let lower = text.to_lowercase();
    lower.contains("steps:")
        && (lower.contains("sampler:") || lower.contains("cfg scale:") || lower.contains("seed:"))
}

/// True when `text` could carry generation metadata worth lifting.
pub fn is_interesting(text: &str) -> bool {
    text.contains('{') || has_generation_markers(text)
}

/// Scan raw bytes for printable text runs (UTF-8 and both UTF-16LE
/// alignments) that contain JSON or a parameters block.
pub fn scan_text_runs(bytes: &[u8], min_len: usize) -> Vec<String> {
    let mut runs = Vec::new();

    for segment in bytes.split(|&b| is_binary_byte(b)) {
        if segment.len() >= min_len {
            let text = String::from_utf8_lossy(segment);
            if is_interesting(&text) {
                runs.push(text.trim().to_string());
            }
        }
    }

    for alignment in 0..2 {
        let mut current: Vec<u16> = Vec::new();
        let units = bytes
            .get(alignment..)
            .unwrap_or_default()
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
        for unit in units.chain(std::iter::once(0)) {
            if is_text_unit(unit) {
                current.push(unit);
                continue;
            }
            if current.len() >= min_len {
                let text = String::from_utf16_lossy(&current);
                if is_interesting(&text) {
                    runs.push(text.trim().to_string());
                }
            }
            current.clear();
        }
    }

    runs
}

fn is_binary_byte(b: u8) -> bool {
    (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r')) || b == 0x7F
}

// A wide char that is plausibly text. High bytes are limited to Latin and CJK
// blocks so random binary does not decode as one endless run.
fn is_text_unit(unit: u16) -> bool {
    matches!(unit, 0x09 | 0x0A | 0x0D | 0x20..=0x7E | 0xA0..=0xFF | 0x3000..=0x9FFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── sanitize_text ────────────────────────────────────────────────

    #[test]
    fn sanitize_strips_controls_and_collapses_whitespace() {
        assert_eq!(sanitize_text("  a\u{0}\u{7} cat,\r\n\t  sitting  "), "a cat, sitting");
        assert_eq!(sanitize_text("\u{feff}hello"), "hello");
        assert_eq!(sanitize_text("   "), "");
    }

    // ── encoding ─────────────────────────────────────────────────────

    #[test]
    fn detects_utf16le_without_bom() {
        let bytes: Vec<u8> = "masterpiece, 1girl"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(detect_encoding(&bytes), Encoding::Utf16Le);
        assert_eq!(decode_candidate(&bytes).as_deref(), Some("masterpiece, 1girl"));
    }

    #[test]
    fn detects_utf16be_with_bom() {
        let mut bytes = vec![0xFE, 0xFF];
        bytes.extend("seed".encode_utf16().flat_map(|u| u.to_be_bytes()));
        assert_eq!(detect_encoding(&bytes), Encoding::Utf16Be);
        assert_eq!(decode_candidate(&bytes).as_deref(), Some("seed"));
    }

    #[test]
    fn plain_utf8_is_left_alone() {
        let text = "a cat, ünïcödé";
        assert_eq!(detect_encoding(text.as_bytes()), Encoding::Utf8);
        assert_eq!(decode_candidate(text.as_bytes()).as_deref(), Some(text));
        assert!(decode_candidate(b"\0\0\0\0").is_none());
    }

    // ── JSON extraction ──────────────────────────────────────────────

    #[test]
    fn balanced_json_respects_strings() {
        let text = r#"prefix {"a": "}{", "b": {"c": "\"}"}} trailing }"#;
        let got = extract_balanced_json(text, 0).unwrap();
        assert_eq!(got, r#"{"a": "}{", "b": {"c": "\"}"}}"#);
        assert!(extract_balanced_json("{ unterminated", 0).is_none());
        assert!(extract_balanced_json("no braces", 0).is_none());
    }

    #[test]
    fn parse_json_object_variants() {
        assert!(parse_json_object(r#"{"prompt": "x"}"#).is_some());
        assert!(parse_json_object(r#"Workflow: {"nodes": []}"#).is_some());
        assert!(parse_json_object(r#""{\"prompt\": \"x\"}""#).is_some());
        assert!(parse_json_object("[1, 2]").is_none());
        assert!(parse_json_object("{not json}").is_none());
    }

    #[test]
    fn json_objects_skips_garbage() {
        let text = r#"{bad} junk {"a":1} more {"b":{"c":2}}"#;
        let found = json_objects(text, 10);
        assert_eq!(found.len(), 2);
        assert!(found[0].contains_key("a"));
        assert!(found[1].contains_key("b"));
        assert_eq!(json_objects(text, 1).len(), 1);
    }

    // ── fingerprints ─────────────────────────────────────────────────

    #[test]
    fn fingerprint_table_order() {
        assert_eq!(detect_generator("made with ComfyUI"), Generator::ComfyUI);
        assert_eq!(detect_generator("SDNext 2024"), Generator::SDNext);
        assert_eq!(detect_generator("Version: v1.9.0 (A1111)"), Generator::A1111);
        assert_eq!(detect_generator("NovelAI"), Generator::NovelAI);
        assert_eq!(detect_generator("fooocus v2"), Generator::Fooocus);
        assert_eq!(detect_generator("InvokeAI 3.0"), Generator::InvokeAI);
        assert_eq!(detect_generator("comfyui and invokeai"), Generator::ComfyUI);
        assert_eq!(detect_generator("photoshop"), Generator::Unknown);
    }

    #[test]
    fn generation_markers() {
        assert!(has_generation_markers("x\nNegative prompt: y"));
        assert!(has_generation_markers("Steps: 20, Sampler: Euler"));
        assert!(!has_generation_markers("Steps: take the stairs"));
    }

    // ── raw scans ────────────────────────────────────────────────────

    #[test]
    fn scans_find_utf8_and_utf16_runs() {
        let mut bytes = vec![0xFF, 0xD8, 0x00, 0x01];
        bytes.extend_from_slice(br#"{"prompt":"a cat"}"#);
        bytes.extend_from_slice(&[0x00, 0x02, 0x03]);
        bytes.push(0x00);
        bytes.extend("Steps: 20, Seed: 4".encode_utf16().flat_map(|u| u.to_le_bytes()));
        bytes.extend_from_slice(&[0x01, 0x02]);

        let runs = scan_text_runs(&bytes, 8);
        assert!(runs.iter().any(|r| r == r#"{"prompt":"a cat"}"#));
        assert!(runs.iter().any(|r| r == "Steps: 20, Seed: 4"));
    }
}
