//! PNG chunk stream codec.
//!
//! A PNG file is the 8-byte signature followed by `length | type | data | crc`
//! records. Decoding stops at `IEND`; bytes after it are dropped on re-encode.

use std::io::Read;

use crc32fast::Hasher as Crc32;
use flate2::read::ZlibDecoder;
use log::debug;

use crate::error::{Container, FormatError};

pub const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

pub const IEND: [u8; 4] = *b"IEND";
const TEXT: [u8; 4] = *b"tEXt";
const ZTXT: [u8; 4] = *b"zTXt";
const ITXT: [u8; 4] = *b"iTXt";

// length + type + crc
const CHUNK_OVERHEAD: usize = 12;
const MAX_CHUNK_LEN: usize = 0x7FFF_FFFF;

/// One chunk. Length and CRC are derived on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PngChunk {
    pub kind: [u8; 4],
    pub data: Vec<u8>,
}

impl PngChunk {
    pub fn new(kind: [u8; 4], data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    pub fn kind_str(&self) -> String {
        String::from_utf8_lossy(&self.kind).into_owned()
    }

    pub fn is_text(&self) -> bool {
        matches!(self.kind, TEXT | ZTXT | ITXT)
    }

    pub fn is_end(&self) -> bool {
        self.kind == IEND
    }
}

/// CRC32 over chunk type and data, as stored in the chunk trailer.
pub fn crc32(kind: &[u8; 4], data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(kind);
    hasher.update(data);
    hasher.finalize()
}

/// Decode a PNG byte stream into its chunks.
///
/// Chunks with a non-alphabetic type are skipped. A CRC mismatch is logged
/// and the chunk kept, since several tools write stale CRCs into text chunks.
pub fn decode(bytes: &[u8]) -> Result<Vec<PngChunk>, FormatError> {
    if !bytes.starts_with(&SIGNATURE) {
        return Err(FormatError::Signature(Container::Png));
    }

    let mut chunks = Vec::new();
    let mut pos = SIGNATURE.len();

    while pos < bytes.len() {
        let header = bytes
            .get(pos..pos + 8)
            .ok_or(FormatError::Overrun {
                container: Container::Png,
                offset: pos,
                len: bytes.len() - pos,
            })?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let kind = [header[4], header[5], header[6], header[7]];

        let end = pos + CHUNK_OVERHEAD + len;
        if len > MAX_CHUNK_LEN || end > bytes.len() {
            return Err(FormatError::Overrun {
                container: Container::Png,
                offset: pos,
                len,
            });
        }

        let data = &bytes[pos + 8..pos + 8 + len];
        let stored_crc = u32::from_be_bytes([
            bytes[end - 4],
            bytes[end - 3],
            bytes[end - 2],
            bytes[end - 1],
        ]);
        pos = end;

        if !kind.iter().all(u8::is_ascii_alphabetic) {
            debug!("skipping PNG chunk with invalid type {kind:02x?}");
            continue;
        }
        if crc32(&kind, data) != stored_crc {
            debug!(
                "CRC mismatch in PNG chunk {}",
                String::from_utf8_lossy(&kind)
            );
        }

        chunks.push(PngChunk::new(kind, data.to_vec()));
        if kind == IEND {
            break;
        }
    }

    Ok(chunks)
}

/// Encode chunks back into a PNG byte stream with fresh lengths and CRCs.
pub fn encode(chunks: &[PngChunk]) -> Vec<u8> {
    let total = SIGNATURE.len()
        + chunks
            .iter()
            .map(|c| c.data.len() + CHUNK_OVERHEAD)
            .sum::<usize>();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&SIGNATURE);
    for chunk in chunks {
        out.extend_from_slice(&(chunk.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&chunk.kind);
        out.extend_from_slice(&chunk.data);
        out.extend_from_slice(&crc32(&chunk.kind, &chunk.data).to_be_bytes());
    }
    out
}

// ============================================================================
// Text chunks
// ============================================================================

/// Decode a `tEXt`, `zTXt` or `iTXt` chunk into `(keyword, value)`.
///
/// Returns `None` for other chunk types or a body without a keyword
/// terminator. A compressed value that fails to inflate decodes as empty.
pub fn decode_text_chunk(chunk: &PngChunk) -> Option<(String, String)> {
    let data = &chunk.data;
    let nul = data.iter().position(|&b| b == 0)?;
    let keyword = latin1(&data[..nul]);
    let body = &data[nul + 1..];

    let value = match chunk.kind {
        TEXT => utf8_or_latin1(body),
        ZTXT => {
            // compression method byte, then the zlib stream
            inflate(body.get(1..).unwrap_or_default(), &keyword)
        }
        ITXT => {
            let (&flag, rest) = body.split_first()?;
            let rest = rest.get(1..)?; // compression method
            let lang_end = rest.iter().position(|&b| b == 0)?;
            let rest = &rest[lang_end + 1..];
            let translated_end = rest.iter().position(|&b| b == 0)?;
            let text = &rest[translated_end + 1..];
            if flag == 1 {
                inflate(text, &keyword)
            } else {
                String::from_utf8_lossy(text).into_owned()
            }
        }
        _ => return None,
    };
    Some((keyword, value))
}

fn inflate(data: &[u8], keyword: &str) -> String {
    let mut out = Vec::new();
    match ZlibDecoder::new(data).read_to_end(&mut out) {
        Ok(_) => utf8_or_latin1(&out),
        Err(e) => {
            debug!("failed to inflate PNG text chunk {keyword:?}: {e}");
            String::new()
        }
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn utf8_or_latin1(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => latin1(bytes),
    }
}

/// Text chunk values grouped by keyword, in first-appearance order.
#[derive(Debug, Clone, Default)]
pub struct TextChunks {
    entries: Vec<(String, Vec<String>)>,
}

impl TextChunks {
    pub fn from_chunks(chunks: &[PngChunk]) -> Self {
        let mut out = TextChunks::default();
        for chunk in chunks.iter().filter(|c| c.is_text()) {
            match decode_text_chunk(chunk) {
                Some((keyword, value)) => out.push(keyword, value),
                None => debug!("skipping malformed {} chunk", chunk.kind_str()),
            }
        }
        out
    }

    fn push(&mut self, keyword: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == keyword) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((keyword, vec![value])),
        }
    }

    /// All values for a keyword, matched case-insensitively.
    pub fn get(&self, keyword: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(keyword))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
            .collect()
    }

    /// First non-blank value for a keyword.
    pub fn first(&self, keyword: &str) -> Option<&str> {
        self.get(keyword).into_iter().find(|v| !v.trim().is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An uncompressed `iTXt` chunk with empty language and translated keyword.
pub fn itxt_chunk(keyword: &str, text: &str) -> PngChunk {
    let mut data = Vec::with_capacity(keyword.len() + text.len() + 5);
    data.extend_from_slice(keyword.as_bytes());
    data.push(0); // keyword terminator
    data.push(0); // compression flag
    data.push(0); // compression method
    data.push(0); // language tag terminator
    data.push(0); // translated keyword terminator
    data.extend_from_slice(text.as_bytes());
    PngChunk::new(ITXT, data)
}

/// Produce a new chunk list with every text chunk keyed by one of `reserved`
/// removed and `fresh` inserted immediately before `IEND`.
pub fn replace_text_chunks(
    chunks: &[PngChunk],
    reserved: &[&str],
    fresh: Vec<PngChunk>,
) -> Result<Vec<PngChunk>, FormatError> {
    let is_reserved = |chunk: &PngChunk| {
        chunk.is_text()
            && decode_text_chunk(chunk)
                .is_some_and(|(keyword, _)| reserved.iter().any(|r| keyword.eq_ignore_ascii_case(r)))
    };

    let kept: Vec<&PngChunk> = chunks.iter().filter(|c| !is_reserved(c)).collect();
    let end = kept
        .iter()
        .position(|c| c.is_end())
        .ok_or(FormatError::MissingEnd)?;

    let mut out: Vec<PngChunk> = Vec::with_capacity(kept.len() + fresh.len());
    out.extend(kept[..end].iter().map(|c| (*c).clone()));
    out.extend(fresh);
    out.extend(kept[end..].iter().map(|c| (*c).clone()));
    Ok(out)
}
