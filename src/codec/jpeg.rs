//! JPEG marker segment access on top of `img-parts`.
//!
//! Only segments ahead of the first scan are inspected or edited; the scan
//! and its entropy-coded data are carried through untouched.

use img_parts::Bytes;
use img_parts::jpeg::{Jpeg, JpegSegment};
use log::debug;

use crate::error::{Container, FormatError};
use crate::text::decode_candidate;

pub const SOI: [u8; 2] = [0xFF, 0xD8];

const APP1: u8 = 0xE1;
const APP13: u8 = 0xED;
const COM: u8 = 0xFE;
const SOS: u8 = 0xDA;
const EOI: u8 = 0xD9;

pub const XMP_HEADER: &[u8] = b"http://ns.adobe.com/xap/1.0/\0";
const IPTC_HEADER: &[u8] = b"Photoshop 3.0\0";
const IPTC_8BIM: &[u8] = b"8BIM";
const IPTC_RESOURCE: u16 = 0x0404;
// IPTC-IIM record 2, dataset 120
const CAPTION_DATASET: (u8, u8) = (0x02, 0x78);

// Segment length field counts itself.
const MAX_SEGMENT_CONTENTS: usize = 0xFFFF - 2;

/// A parsed JPEG whose header segments can be inspected and rewritten.
pub struct JpegFile {
    jpeg: Jpeg,
}

impl JpegFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, FormatError> {
        if !bytes.starts_with(&SOI) {
            return Err(FormatError::Signature(Container::Jpeg));
        }
        let jpeg = Jpeg::from_bytes(Bytes::copy_from_slice(bytes)).map_err(|e| {
            FormatError::Malformed {
                container: Container::Jpeg,
                reason: e.to_string(),
            }
        })?;
        Ok(Self { jpeg })
    }

    /// Segments before the first Start-Of-Scan or End-Of-Image marker.
    fn header_segments(&self) -> impl Iterator<Item = &JpegSegment> {
        self.jpeg
            .segments()
            .iter()
            .take_while(|s| s.marker() != SOS && s.marker() != EOI)
    }

    fn is_xmp(segment: &JpegSegment) -> bool {
        segment.marker() == APP1 && segment.contents().starts_with(XMP_HEADER)
    }

    /// The XMP packet of the first XMP APP1 segment, header stripped.
    pub fn xmp(&self) -> Option<Vec<u8>> {
        self.header_segments()
            .find(|s| Self::is_xmp(s))
            .map(|s| s.contents()[XMP_HEADER.len()..].to_vec())
    }

    /// Text of every COM segment.
    pub fn comments(&self) -> Vec<String> {
        self.header_segments()
            .filter(|s| s.marker() == COM)
            .filter_map(|s| decode_candidate(s.contents()))
            .collect()
    }

    /// IPTC Caption/Abstract values from Photoshop APP13 segments.
    pub fn iptc_captions(&self) -> Vec<String> {
        self.header_segments()
            .filter(|s| s.marker() == APP13 && s.contents().starts_with(IPTC_HEADER))
            .flat_map(|s| iptc_records(&s.contents()[IPTC_HEADER.len()..], CAPTION_DATASET))
            .filter_map(|bytes| decode_candidate(&bytes))
            .collect()
    }

    /// Replace the XMP packet and re-encode the file.
    ///
    /// The first XMP APP1 segment is replaced in place and any further ones
    /// dropped; without one, a new segment goes right before the scan.
    pub fn with_xmp(mut self, packet: &[u8]) -> Result<Vec<u8>, FormatError> {
        let mut contents = Vec::with_capacity(XMP_HEADER.len() + packet.len());
        contents.extend_from_slice(XMP_HEADER);
        contents.extend_from_slice(packet);
        if contents.len() > MAX_SEGMENT_CONTENTS {
            return Err(FormatError::TooLarge {
                container: Container::Jpeg,
                len: contents.len(),
            });
        }
        let new_segment = JpegSegment::new_with_contents(APP1, Bytes::from(contents));

        let segments = self.jpeg.segments_mut();
        let scan_pos = segments
            .iter()
            .position(|s| s.marker() == SOS || s.marker() == EOI)
            .unwrap_or(segments.len());
        let xmp_positions: Vec<usize> = segments[..scan_pos]
            .iter()
            .enumerate()
            .filter(|(_, s)| Self::is_xmp(s))
            .map(|(i, _)| i)
            .collect();

        match xmp_positions.split_first() {
            Some((&first, rest)) => {
                for &extra in rest.iter().rev() {
                    debug!("dropping duplicate XMP segment at index {extra}");
                    segments.remove(extra);
                }
                segments[first] = new_segment;
            }
            None => segments.insert(scan_pos, new_segment),
        }

        Ok(self.jpeg.encoder().bytes().to_vec())
    }
}

/// XMP packet bytes of a JPEG stream, header stripped.
pub fn find_xmp(bytes: &[u8]) -> Result<Option<Vec<u8>>, FormatError> {
    Ok(JpegFile::parse(bytes)?.xmp())
}

/// Rewrite a JPEG stream with `packet` as its single XMP segment.
pub fn replace_or_insert_xmp(bytes: &[u8], packet: &[u8]) -> Result<Vec<u8>, FormatError> {
    JpegFile::parse(bytes)?.with_xmp(packet)
}

/// Comment text of every COM segment.
pub fn comments(bytes: &[u8]) -> Result<Vec<String>, FormatError> {
    Ok(JpegFile::parse(bytes)?.comments())
}

/// Collect IIM dataset values from the 8BIM resource blocks of an APP13
/// segment body (after the `Photoshop 3.0` header).
fn iptc_records(data: &[u8], wanted: (u8, u8)) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos + 12 <= data.len() && &data[pos..pos + 4] == IPTC_8BIM {
        let resource_id = u16::from_be_bytes([data[pos + 4], data[pos + 5]]);
        // Pascal string name padded to an even length.
        let pascal_len = data[pos + 6] as usize;
        let pascal_padded = (pascal_len + 2) & !1;
        let len_start = pos + 6 + pascal_padded;
        let Some(len_bytes) = data.get(len_start..len_start + 4) else {
            break;
        };
        let data_len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        let body_start = len_start + 4;
        let body_end = (body_start + data_len).min(data.len());

        if resource_id == IPTC_RESOURCE {
            out.extend(iim_datasets(&data[body_start..body_end], wanted));
        }
        pos = body_end + (data_len & 1);
    }
    out
}

fn iim_datasets(data: &[u8], wanted: (u8, u8)) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 5 <= data.len() && data[pos] == 0x1C {
        let record = data[pos + 1];
        let dataset = data[pos + 2];
        let len = u16::from_be_bytes([data[pos + 3], data[pos + 4]]);
        if len & 0x8000 != 0 {
            // Extended-length datasets never carry captions.
            break;
        }
        let start = pos + 5;
        let end = (start + len as usize).min(data.len());
        if (record, dataset) == wanted {
            out.push(data[start..end].to_vec());
        }
        pos = end;
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn segment(marker: u8, contents: &[u8]) -> Vec<u8> {
        let mut out = vec![0xFF, marker];
        out.extend_from_slice(&((contents.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(contents);
        out
    }

    /// A structurally valid baseline JPEG with extra header segments.
    pub(crate) fn jpeg_with(extra: &[Vec<u8>]) -> Vec<u8> {
        let mut out = SOI.to_vec();
        out.extend(segment(0xE0, b"JFIF\0\x01\x01\0\0\x01\0\x01\0\0"));
        out.extend(segment(0xE1, b"Exif\0\0II*\0\x08\0\0\0\0\0"));
        for seg in extra {
            out.extend_from_slice(seg);
        }
        out.extend(segment(0xDB, &[0u8; 65]));
        out.extend(segment(0xC0, &[8, 0, 1, 0, 1, 1, 1, 0x11, 0]));
        out.extend(segment(0xDA, &[1, 1, 0, 0, 0x3F, 0]));
        out.extend_from_slice(&[0x12, 0x34, 0xFF, 0x00, 0x56, 0x78]);
        out.extend_from_slice(&[0xFF, EOI]);
        out
    }

    pub(crate) fn minimal_jpeg() -> Vec<u8> {
        jpeg_with(&[])
    }

    pub(crate) fn com_segment(text: &str) -> Vec<u8> {
        segment(COM, text.as_bytes())
    }

    pub(crate) fn xmp_segment(packet: &str) -> Vec<u8> {
        let mut contents = XMP_HEADER.to_vec();
        contents.extend_from_slice(packet.as_bytes());
        segment(APP1, &contents)
    }

    fn iptc_segment(caption: &str) -> Vec<u8> {
        let mut iim = vec![0x1C, 0x02, 0x00, 0x00, 0x02, 0x00, 0x02];
        iim.extend_from_slice(&[0x1C, 0x02, 0x78]);
        iim.extend_from_slice(&(caption.len() as u16).to_be_bytes());
        iim.extend_from_slice(caption.as_bytes());

        let mut contents = IPTC_HEADER.to_vec();
        contents.extend_from_slice(IPTC_8BIM);
        contents.extend_from_slice(&IPTC_RESOURCE.to_be_bytes());
        contents.extend_from_slice(&[0, 0]);
        contents.extend_from_slice(&(iim.len() as u32).to_be_bytes());
        contents.extend_from_slice(&iim);
        if iim.len() % 2 == 1 {
            contents.push(0);
        }
        segment(APP13, &contents)
    }

    /// Bytes from the first SOS marker onward.
    pub(crate) fn scan_tail(bytes: &[u8]) -> &[u8] {
        let pos = bytes
            .windows(2)
            .position(|w| w == [0xFF, SOS])
            .expect("no SOS");
        &bytes[pos..]
    }

    fn xmp_segment_count(bytes: &[u8]) -> usize {
        let file = JpegFile::parse(bytes).unwrap();
        file.header_segments().filter(|s| JpegFile::is_xmp(s)).count()
    }

    // ── parse ────────────────────────────────────────────────────────

    #[test]
    fn rejects_missing_soi() {
        assert!(matches!(
            JpegFile::parse(b"\x89PNG\r\n\x1a\n"),
            Err(FormatError::Signature(Container::Jpeg))
        ));
        assert!(matches!(
            find_xmp(b"nope"),
            Err(FormatError::Signature(Container::Jpeg))
        ));
    }

    // ── XMP ──────────────────────────────────────────────────────────

    #[test]
    fn finds_xmp_and_strips_header() {
        let bytes = jpeg_with(&[xmp_segment("<x:xmpmeta/>")]);
        assert_eq!(find_xmp(&bytes).unwrap().as_deref(), Some(&b"<x:xmpmeta/>"[..]));
        assert!(find_xmp(&minimal_jpeg()).unwrap().is_none());
    }

    #[test]
    fn inserts_xmp_before_scan() {
        let original = minimal_jpeg();
        let out = replace_or_insert_xmp(&original, b"<packet/>").unwrap();
        assert_eq!(find_xmp(&out).unwrap().as_deref(), Some(&b"<packet/>"[..]));
        assert_eq!(scan_tail(&out), scan_tail(&original));

        // The EXIF APP1 segment is untouched.
        let file = JpegFile::parse(&out).unwrap();
        let markers: Vec<u8> = file.header_segments().map(|s| s.marker()).collect();
        assert_eq!(markers, vec![0xE0, 0xE1, 0xDB, 0xC0, 0xE1]);
        assert!(
            file.header_segments()
                .nth(1)
                .unwrap()
                .contents()
                .starts_with(b"Exif\0\0")
        );
    }

    #[test]
    fn replaces_in_place_and_drops_duplicates() {
        let original = jpeg_with(&[
            xmp_segment("<old/>"),
            com_segment("keep me"),
            xmp_segment("<older/>"),
        ]);
        let out = replace_or_insert_xmp(&original, b"<new/>").unwrap();
        assert_eq!(find_xmp(&out).unwrap().as_deref(), Some(&b"<new/>"[..]));
        assert_eq!(xmp_segment_count(&out), 1);
        assert_eq!(comments(&out).unwrap(), vec!["keep me".to_string()]);
        assert_eq!(scan_tail(&out), scan_tail(&original));

        let again = replace_or_insert_xmp(&out, b"<new/>").unwrap();
        assert_eq!(again, out);
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let packet = vec![b'x'; 70_000];
        assert!(matches!(
            replace_or_insert_xmp(&minimal_jpeg(), &packet),
            Err(FormatError::TooLarge { .. })
        ));
    }

    // ── COM / IPTC ───────────────────────────────────────────────────

    #[test]
    fn collects_comments_and_captions() {
        let bytes = jpeg_with(&[
            com_segment("first"),
            iptc_segment("a cat, Steps: 20"),
            com_segment("second"),
        ]);
        let file = JpegFile::parse(&bytes).unwrap();
        assert_eq!(file.comments(), vec!["first".to_string(), "second".to_string()]);
        assert_eq!(file.iptc_captions(), vec!["a cat, Steps: 20".to_string()]);
    }
}
