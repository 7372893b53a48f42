//! EXIF tag sets for the JPEG route, read with `nom-exif`.

use std::path::Path;

use anyhow::{Context, Result};
use nom_exif::{EntryValue, Exif, ExifIter, ExifTag, MediaParser, MediaSource};
use serde_json::{Map, Value};

use crate::text::{Encoding, decode_candidate, decode_utf16, detect_encoding};

// IFD0 / Exif sub-IFD tags that can carry free text.
const TAG_IMAGE_DESCRIPTION: u16 = 0x010E;
const TAG_MAKE: u16 = 0x010F;
const TAG_SOFTWARE: u16 = 0x0131;
const TAG_ARTIST: u16 = 0x013B;
const TAG_XP_TITLE: u16 = 0x9C9B;
const TAG_XP_COMMENT: u16 = 0x9C9C;
const TAG_XP_KEYWORDS: u16 = 0x9C9E;
const TAG_XP_SUBJECT: u16 = 0x9C9F;

/// Text-valued EXIF entries, keyed by tag name, in file order.
#[derive(Debug, Clone, Default)]
pub struct ExifText {
    pub entries: Vec<(&'static str, String)>,
}

impl ExifText {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn software(&self) -> Option<&str> {
        self.get("Software")
    }

    /// Values worth handing to the lifters. `Make`, `Software` and `Artist`
    /// are fingerprint hints, not payloads.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(n, _)| !matches!(*n, "Make" | "Software" | "Artist"))
            .map(|(_, v)| v.as_str())
    }

    /// Debug dump for the metadata `raw` bag.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(n, v)| (n.to_string(), Value::String(v.clone())))
            .collect();
        Value::Object(map)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// IFD0 tags looked up by code.
const IFD0_TAGS: &[(&str, u16)] = &[
    ("ImageDescription", TAG_IMAGE_DESCRIPTION),
    ("Make", TAG_MAKE),
    ("Software", TAG_SOFTWARE),
    ("Artist", TAG_ARTIST),
    ("XPTitle", TAG_XP_TITLE),
    ("XPComment", TAG_XP_COMMENT),
    ("XPKeywords", TAG_XP_KEYWORDS),
    ("XPSubject", TAG_XP_SUBJECT),
];

/// Read the text-bearing EXIF tags of an image file.
///
/// A file without EXIF yields an empty set; only failing to open the file
/// is an error.
pub fn read_exif_text(path: &Path) -> Result<ExifText> {
    let mut parser = MediaParser::new();
    let ms = MediaSource::file_path(path).context("Failed to open image file")?;

    let iter: ExifIter = match parser.parse(ms) {
        Ok(iter) => iter,
        Err(_) => {
            log::debug!("No EXIF data found in {}", path.display());
            return Ok(ExifText::default());
        }
    };
    let exif: Exif = iter.into();

    let mut text = ExifText::default();
    for &(name, code) in IFD0_TAGS {
        if let Some(s) = exif.get_by_ifd_tag_code(0, code).and_then(|v| entry_value_text(name, v)) {
            text.entries.push((name, s));
        }
    }
    // UserComment lives in the Exif sub-IFD.
    if let Some(s) = exif
        .get(ExifTag::UserComment)
        .and_then(|v| entry_value_text("UserComment", v))
    {
        text.entries.push(("UserComment", s));
    }
    Ok(text)
}

/// Text of one entry. `XP*` tags are UTF-16LE byte arrays; UNDEFINED
/// payloads carry an 8-byte charset header.
fn entry_value_text(name: &str, value: &EntryValue) -> Option<String> {
    match value {
        EntryValue::Text(s) => clean(s),
        EntryValue::Undefined(bytes) | EntryValue::U8Array(bytes) if name.starts_with("XP") => {
            clean(&decode_utf16(bytes, false))
        }
        EntryValue::Undefined(bytes) | EntryValue::U8Array(bytes) => user_comment_text(bytes),
        _ => None,
    }
}

const CHARSET_LEN: usize = 8;

/// Decode an EXIF UserComment-style payload by its charset header.
fn user_comment_text(bytes: &[u8]) -> Option<String> {
    let Some((header, payload)) = bytes.split_at_checked(CHARSET_LEN) else {
        return decode_candidate(bytes);
    };
    match header {
        b"UNICODE\0" => {
            let payload = payload
                .strip_prefix(&[0xFF, 0xFE])
                .or_else(|| payload.strip_prefix(&[0xFE, 0xFF]))
                .unwrap_or(payload);
            let big_endian = match detect_encoding(payload) {
                Encoding::Utf16Be => true,
                Encoding::Utf16Le => false,
                // No NUL pattern to go on: a BOM decides, else little-endian.
                Encoding::Utf8 => bytes[CHARSET_LEN..].starts_with(&[0xFE, 0xFF]),
            };
            clean(&decode_utf16(payload, big_endian))
        }
        b"ASCII\0\0\0" | b"JIS\0\0\0\0\0" => decode_candidate(payload),
        _ if header.iter().all(|&b| b == 0) => decode_candidate(payload),
        _ => decode_candidate(bytes),
    }
}

/// Trim NUL padding and whitespace; blank is `None`.
fn clean(s: &str) -> Option<String> {
    let s = s.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if s.is_empty() { None } else { Some(s.to_string()) }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    // ── entry values ─────────────────────────────────────────────────

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_le_bytes).collect()
    }

    fn utf16be(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(u16::to_be_bytes).collect()
    }

    #[test]
    fn user_comment_charset_headers() {
        let ascii = [b"ASCII\0\0\0".to_vec(), b"a cat\0\0".to_vec()].concat();
        assert_eq!(user_comment_text(&ascii).as_deref(), Some("a cat"));

        let le = [b"UNICODE\0".to_vec(), utf16le("Steps: 20")].concat();
        assert_eq!(user_comment_text(&le).as_deref(), Some("Steps: 20"));

        let be = [b"UNICODE\0".to_vec(), utf16be("Steps: 20")].concat();
        assert_eq!(user_comment_text(&be).as_deref(), Some("Steps: 20"));

        let undefined = [vec![0u8; 8], b"raw text".to_vec()].concat();
        assert_eq!(user_comment_text(&undefined).as_deref(), Some("raw text"));

        assert_eq!(user_comment_text(b"short").as_deref(), Some("short"));
        assert!(user_comment_text(b"ASCII\0\0\0\0\0").is_none());
    }

    #[test]
    fn entry_values_by_type() {
        let xp = EntryValue::U8Array([utf16le("a dog"), vec![0, 0]].concat());
        assert_eq!(entry_value_text("XPComment", &xp).as_deref(), Some("a dog"));

        let comment = EntryValue::Undefined([b"ASCII\0\0\0".to_vec(), b"hi".to_vec()].concat());
        assert_eq!(entry_value_text("UserComment", &comment).as_deref(), Some("hi"));

        let text = EntryValue::Text("ComfyUI\0".into());
        assert_eq!(entry_value_text("Software", &text).as_deref(), Some("ComfyUI"));

        assert!(entry_value_text("Make", &EntryValue::U16(3)).is_none());
    }

    // ── ExifText ─────────────────────────────────────────────────────

    #[test]
    fn candidates_skip_fingerprint_tags() {
        let text = ExifText {
            entries: vec![
                ("Software", "ComfyUI".into()),
                ("UserComment", "{\"prompt\":\"x\"}".into()),
                ("Make", "Canon".into()),
            ],
        };
        assert_eq!(text.software(), Some("ComfyUI"));
        assert_eq!(text.candidates().collect::<Vec<_>>(), vec!["{\"prompt\":\"x\"}"]);
        assert_eq!(text.to_json()["Make"], Value::String("Canon".into()));
    }

    // ── read_exif_text ───────────────────────────────────────────────

    #[test]
    fn file_without_exif_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.jpg");
        std::fs::write(&path, crate::codec::jpeg::tests::jpeg_with(&[])).unwrap();
        assert!(read_exif_text(&path).map(|t| t.is_empty()).unwrap_or(true));
    }

    /// Little-endian TIFF with IFD0 {XPComment, ExifOffset} and an Exif
    /// sub-IFD {UserComment}, wrapped in an APP1 segment.
    pub(crate) fn exif_segment(user_comment: &[u8], xp_comment: &str) -> Vec<u8> {
        let xp = [utf16le(xp_comment), vec![0, 0]].concat();
        let entry = |tag: u16, kind: u16, count: u32, value: u32| {
            let mut e = Vec::with_capacity(12);
            e.extend_from_slice(&tag.to_le_bytes());
            e.extend_from_slice(&kind.to_le_bytes());
            e.extend_from_slice(&count.to_le_bytes());
            e.extend_from_slice(&value.to_le_bytes());
            e
        };
        // header 8, IFD0 2+2*12+4 = 30, Exif IFD 2+12+4 = 18
        let exif_ifd: u32 = 8 + 30;
        let data: u32 = exif_ifd + 18;

        let mut tiff = b"II*\0".to_vec();
        tiff.extend_from_slice(&8u32.to_le_bytes());
        tiff.extend_from_slice(&2u16.to_le_bytes());
        tiff.extend(entry(0x8769, 4, 1, exif_ifd));
        tiff.extend(entry(0x9C9C, 1, xp.len() as u32, data));
        tiff.extend_from_slice(&0u32.to_le_bytes());
        tiff.extend_from_slice(&1u16.to_le_bytes());
        tiff.extend(entry(0x9286, 7, user_comment.len() as u32, data + xp.len() as u32));
        tiff.extend_from_slice(&0u32.to_le_bytes());
        tiff.extend(xp);
        tiff.extend_from_slice(user_comment);

        let contents = [b"Exif\0\0".to_vec(), tiff].concat();
        crate::codec::jpeg::tests::segment(0xE1, &contents)
    }

    #[test]
    fn reads_tiff_encoded_user_comment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.jpg");
        let comment = [
            b"ASCII\0\0\0".to_vec(),
            b"a cat\nNegative prompt: blurry\nSteps: 20, Sampler: Euler a, Seed: 42".to_vec(),
        ]
        .concat();
        let jpeg = crate::codec::jpeg::tests::jpeg_with(&[exif_segment(&comment, "made by hand")]);
        std::fs::write(&path, jpeg).unwrap();

        let text = read_exif_text(&path).unwrap();
        assert_eq!(
            text.get("UserComment"),
            Some("a cat\nNegative prompt: blurry\nSteps: 20, Sampler: Euler a, Seed: 42")
        );
        assert_eq!(text.get("XPComment"), Some("made by hand"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(read_exif_text(&dir.path().join("absent.jpg")).is_err());
    }
}
