//! XMP packet scraping and generation by direct text search.
//!
//! Packets written by other tools come in many serializations (element or
//! attribute form, self-closing descriptions, arbitrary namespace order), so
//! nothing here needs a full XML parser.

use crate::metadata::ImageMetadata;

/// Namespace URI of the private `sdx:` tags.
pub const SDX_NS: &str = "urn:sdmeta:sdx:1.0";
const DC_NS: &str = "http://purl.org/dc/elements/1.1/";

/// Every `sdx:` leaf the writer emits.
pub const SDX_FIELDS: &[&str] = &[
    "negative", "model", "steps", "cfg", "seed", "sampler", "scheduler", "size", "generator",
    NO_PROMPT,
];

/// Marks a record without a prompt. Any `dc:description` next to it belongs
/// to another tool.
pub const NO_PROMPT: &str = "noPrompt";

/// Packet-level elements that commonly hold caption text.
const DESCRIPTION_TAGS: &[&str] = &[
    "dc:description",
    "dc:title",
    "exif:UserComment",
    "tiff:ImageDescription",
    "photoshop:Headline",
    "xmp:Label",
];

const EMPTY_PACKET: &str = concat!(
    "<?xpacket begin=\"\u{feff}\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>\n",
    "<x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\n",
    "<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n",
    "<rdf:Description rdf:about=\"\"\n",
    "  xmlns:dc=\"http://purl.org/dc/elements/1.1/\"\n",
    "  xmlns:sdx=\"urn:sdmeta:sdx:1.0\">\n",
    "</rdf:Description>\n",
    "</rdf:RDF>\n",
    "</x:xmpmeta>\n",
    "<?xpacket end=\"w\"?>",
);

// ============================================================================
// Scraping
// ============================================================================

/// Text content of the first `<tag>` element. For `rdf:Alt`/`rdf:Seq`
/// containers the `x-default` item (or the first item) is returned.
pub fn scrape_tag(xml: &str, tag: &str) -> Option<String> {
    scrape_tag_text(xml, tag).and_then(non_blank)
}

fn scrape_tag_text(xml: &str, tag: &str) -> Option<String> {
    let (_, inner) = element_inner(xml, tag, 0)?;
    let text = if inner.contains("<rdf:li") {
        let items = li_items(inner);
        items
            .iter()
            .find(|(attrs, _)| attrs.contains("x-default"))
            .or_else(|| items.first())
            .map(|(_, text)| text.clone())?
    } else if inner.contains('<') {
        return None;
    } else {
        xml_unescape(inner)
    };
    Some(text.trim().to_string())
}

/// Value of a `name="..."` (or single-quoted) attribute anywhere in the packet.
pub fn scrape_attribute(xml: &str, name: &str) -> Option<String> {
    scrape_attribute_text(xml, name).and_then(non_blank)
}

fn scrape_attribute_text(xml: &str, name: &str) -> Option<String> {
    let needle = format!("{name}=");
    let mut from = 0;
    while let Some(rel) = xml[from..].find(&needle) {
        let idx = from + rel;
        from = idx + needle.len();
        // Must be a whole attribute name, not a suffix of a longer one.
        let boundary_ok = xml[..idx]
            .chars()
            .next_back()
            .is_none_or(|c| c.is_whitespace());
        if !boundary_ok {
            continue;
        }
        let rest = &xml[from..];
        let quote = rest.chars().next()?;
        if quote != '"' && quote != '\'' {
            continue;
        }
        let end = rest[1..].find(quote)?;
        return Some(xml_unescape(&rest[1..1 + end]).trim().to_string());
    }
    None
}

/// Element form first, then attribute form.
pub fn scrape_field(xml: &str, qname: &str) -> Option<String> {
    scrape_tag(xml, qname).or_else(|| scrape_attribute(xml, qname))
}

/// Like [`scrape_field`], but a present empty element yields `Some("")`.
pub fn scrape_field_exact(xml: &str, qname: &str) -> Option<String> {
    scrape_tag_text(xml, qname).or_else(|| scrape_attribute_text(xml, qname))
}

/// Every `rdf:li` text item in the packet.
pub fn li_values(xml: &str) -> Vec<String> {
    li_items(xml)
        .into_iter()
        .filter_map(|(_, text)| non_blank(text))
        .collect()
}

/// Caption-like strings (descriptions, titles, comments, list items),
/// deduplicated in document order.
pub fn description_strings(xml: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in DESCRIPTION_TAGS {
        if let Some(v) = scrape_field(xml, tag) {
            out.push(v);
        }
    }
    out.extend(li_values(xml));
    let mut seen = std::collections::HashSet::new();
    out.retain(|s| seen.insert(s.clone()));
    out
}

/// True when the packet carries at least one `sdx:` field.
pub fn has_sdx_fields(xml: &str) -> bool {
    SDX_FIELDS
        .iter()
        .any(|field| scrape_field(xml, &format!("sdx:{field}")).is_some())
}

/// Find `<tag ...>inner</tag>` at or after `from`; returns the element start
/// and the inner slice.
fn element_inner<'a>(xml: &'a str, tag: &str, from: usize) -> Option<(usize, &'a str)> {
    let (start, inner_start, inner_end) = element_span(xml, tag, from)?;
    Some((start, &xml[inner_start..inner_end]))
}

/// Byte offsets of the element start and of its inner content.
fn element_span(xml: &str, tag: &str, from: usize) -> Option<(usize, usize, usize)> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut cursor = from;
    loop {
        let start = cursor + xml.get(cursor..)?.find(&open)?;
        let after_name = start + open.len();
        let next = xml[after_name..].chars().next()?;
        if !(next == '>' || next == '/' || next.is_whitespace()) {
            cursor = after_name;
            continue;
        }
        let open_end = after_name + xml[after_name..].find('>')?;
        if xml[..open_end].ends_with('/') {
            cursor = open_end;
            continue;
        }
        let inner_start = open_end + 1;
        let inner_end = inner_start + xml[inner_start..].find(&close)?;
        return Some((start, inner_start, inner_end));
    }
}

/// `(attributes, text)` of each `rdf:li` element.
fn li_items(xml: &str) -> Vec<(String, String)> {
    let mut items = Vec::new();
    let mut cursor = 0;
    while let Some(rel) = xml[cursor..].find("<rdf:li") {
        let start = cursor + rel;
        let Some(open_len) = xml[start..].find('>') else {
            break;
        };
        let open_end = start + open_len;
        let attrs = &xml[start + "<rdf:li".len()..open_end];
        if attrs.ends_with('/') {
            cursor = open_end;
            continue;
        }
        let Some(close_len) = xml[open_end..].find("</rdf:li>") else {
            break;
        };
        let inner = &xml[open_end + 1..open_end + close_len];
        if !inner.contains('<') {
            items.push((attrs.to_string(), xml_unescape(inner)));
        }
        cursor = open_end + close_len;
    }
    items
}

fn non_blank(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == s.len() {
        Some(s)
    } else {
        Some(trimmed.to_string())
    }
}

// ============================================================================
// Packet generation
// ============================================================================

/// Build a fresh packet holding `meta`.
pub fn build_packet(meta: &ImageMetadata) -> String {
    inject_into_packet(EMPTY_PACKET, meta)
}

/// Rewrite an existing packet: previous `sdx:` leaves are dropped, the prompt
/// replaces `dc:description`, everything else in the packet is kept. Without
/// a prompt an existing description stays and `sdx:noPrompt` is written.
///
/// Applying the same record twice yields the same packet.
pub fn inject_into_packet(xmp: &str, meta: &ImageMetadata) -> String {
    let mut result = xmp.to_string();

    if !result.contains("<rdf:Description") {
        return build_packet(meta);
    }

    ensure_namespace(&mut result, "dc", DC_NS);
    ensure_namespace(&mut result, "sdx", SDX_NS);

    // Self-closing description: open it up so children can be added.
    if !result.contains("</rdf:Description>") {
        if let Some(desc_start) = result.find("<rdf:Description") {
            if let Some(close_pos) = result[desc_start..].find("/>") {
                let abs_close = desc_start + close_pos;
                result.replace_range(abs_close..abs_close + 2, ">\n</rdf:Description>");
            }
        }
    }

    let mut new_elements = String::new();
    if let Some(prompt) = &meta.prompt {
        remove_xml_element(&mut result, "dc:description");
        new_elements.push_str(&format!(
            "  <dc:description><rdf:Alt><rdf:li xml:lang=\"x-default\">{}</rdf:li></rdf:Alt></dc:description>\n",
            xml_escape(prompt)
        ));
    }

    for field in SDX_FIELDS {
        remove_xml_element(&mut result, &format!("sdx:{field}"));
    }
    for (field, value) in sdx_values(meta) {
        new_elements.push_str(&format!("  <sdx:{field}>{}</sdx:{field}>\n", xml_escape(&value)));
    }

    if let Some(pos) = result.find("</rdf:Description>") {
        result.insert_str(pos, &new_elements);
    }
    result
}

fn sdx_values(meta: &ImageMetadata) -> Vec<(&'static str, String)> {
    let mut out = Vec::new();
    if let Some(v) = &meta.negative {
        out.push(("negative", v.clone()));
    }
    if let Some(v) = &meta.model {
        out.push(("model", v.clone()));
    }
    if let Some(v) = meta.steps {
        out.push(("steps", v.to_string()));
    }
    if let Some(v) = meta.cfg {
        out.push(("cfg", v.to_string()));
    }
    if let Some(v) = &meta.seed {
        out.push(("seed", v.to_string()));
    }
    if let Some(v) = &meta.sampler {
        out.push(("sampler", v.clone()));
    }
    if let Some(v) = &meta.scheduler {
        out.push(("scheduler", v.clone()));
    }
    if let Some(v) = &meta.size {
        out.push(("size", v.clone()));
    }
    if meta.prompt.is_none() {
        out.push((NO_PROMPT, "true".to_string()));
    }
    out.push(("generator", meta.generator.label().to_string()));
    out
}

fn ensure_namespace(xml: &mut String, prefix: &str, uri: &str) {
    if xml.contains(&format!("xmlns:{prefix}=")) {
        return;
    }
    if let Some(pos) = xml.find("<rdf:Description") {
        let insert_at = pos + "<rdf:Description".len();
        xml.insert_str(insert_at, &format!(" xmlns:{prefix}=\"{uri}\""));
    }
}

/// Remove every `<tag>...</tag>` element along with the indentation before it
/// and the newline after it.
fn remove_xml_element(xml: &mut String, tag: &str) {
    let close = format!("</{tag}>");
    while let Some((start, _, inner_end)) = element_span(xml, tag, 0) {
        let mut end = inner_end + close.len();
        if xml.as_bytes().get(end) == Some(&b'\n') {
            end += 1;
        }
        let line_start = xml[..start].trim_end_matches([' ', '\t']).len();
        let start = if line_start == 0 || xml[..line_start].ends_with('\n') {
            line_start
        } else {
            start
        };
        xml.replace_range(start..end, "");
    }
}

/// Escape special XML characters.
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Decode the predefined entities and numeric character references.
pub fn xml_unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let Some(semi) = after.find(';').filter(|&i| i <= 10) else {
            out.push('&');
            rest = &after[1..];
            continue;
        };
        let entity = &after[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Generator, Seed};

    fn sample() -> ImageMetadata {
        ImageMetadata {
            generator: Generator::ComfyUI,
            prompt: Some("a <cat> & \"dog\"".into()),
            negative: Some("blurry".into()),
            steps: Some(20),
            cfg: Some(7.5),
            seed: Some(Seed::Int(42)),
            size: Some("512x768".into()),
            ..Default::default()
        }
    }

    // ── scraping ─────────────────────────────────────────────────────

    #[test]
    fn scrapes_element_and_attribute_forms() {
        let xml = r#"<rdf:Description xmp:CreatorTool="ComfyUI &amp; friends" sdx:seed='7'>
            <dc:description><rdf:Alt><rdf:li xml:lang="de">Katze</rdf:li><rdf:li xml:lang="x-default">cat</rdf:li></rdf:Alt></dc:description>
            <sdx:steps>30</sdx:steps>
            <sdx:stepsExtra>nope</sdx:stepsExtra>
        </rdf:Description>"#;
        assert_eq!(scrape_tag(xml, "dc:description").as_deref(), Some("cat"));
        assert_eq!(scrape_field(xml, "sdx:steps").as_deref(), Some("30"));
        assert_eq!(scrape_field(xml, "sdx:seed").as_deref(), Some("7"));
        assert_eq!(
            scrape_attribute(xml, "xmp:CreatorTool").as_deref(),
            Some("ComfyUI & friends")
        );
        assert!(scrape_field(xml, "sdx:model").is_none());
        assert!(has_sdx_fields(xml));
        assert_eq!(li_values(xml), vec!["Katze".to_string(), "cat".to_string()]);
    }

    #[test]
    fn exact_scrape_keeps_empty_values() {
        let xml = r#"<rdf:Description sdx:model="">
            <sdx:negative></sdx:negative>
            <dc:description><rdf:Alt><rdf:li xml:lang="x-default"></rdf:li></rdf:Alt></dc:description>
        </rdf:Description>"#;
        assert_eq!(scrape_field_exact(xml, "sdx:negative").as_deref(), Some(""));
        assert_eq!(scrape_field_exact(xml, "sdx:model").as_deref(), Some(""));
        assert_eq!(scrape_field_exact(xml, "dc:description").as_deref(), Some(""));
        assert!(scrape_field_exact(xml, "sdx:steps").is_none());
        assert!(scrape_field(xml, "sdx:negative").is_none());
    }

    #[test]
    fn description_strings_are_deduplicated() {
        let xml = "<dc:description><rdf:Alt><rdf:li>x</rdf:li></rdf:Alt></dc:description>\
                   <dc:subject><rdf:Bag><rdf:li>y</rdf:li></rdf:Bag></dc:subject>";
        assert_eq!(description_strings(xml), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn unescape_entities() {
        assert_eq!(xml_unescape("a&lt;b&#x41;&#66;&amp;lt; & c"), "a<bAB&lt; & c");
    }

    // ── packet generation ────────────────────────────────────────────

    #[test]
    fn fresh_packet_round_trips() {
        let packet = build_packet(&sample());
        assert_eq!(packet.matches("xmlns:sdx=").count(), 1);
        assert_eq!(scrape_tag(&packet, "dc:description").as_deref(), Some("a <cat> & \"dog\""));
        assert_eq!(scrape_field(&packet, "sdx:negative").as_deref(), Some("blurry"));
        assert_eq!(scrape_field(&packet, "sdx:cfg").as_deref(), Some("7.5"));
        assert_eq!(scrape_field(&packet, "sdx:generator").as_deref(), Some("ComfyUI"));
        assert!(scrape_field(&packet, "sdx:model").is_none());
    }

    #[test]
    fn injection_is_idempotent() {
        let once = build_packet(&sample());
        let twice = inject_into_packet(&once, &sample());
        assert_eq!(once, twice);
    }

    #[test]
    fn injection_keeps_foreign_content() {
        let foreign = r#"<x:xmpmeta xmlns:x="adobe:ns:meta/"><rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#"><rdf:Description rdf:about="" xmlns:xmp="http://ns.adobe.com/xap/1.0/" xmp:CreatorTool="Photoshop"/></rdf:RDF></x:xmpmeta>"#;
        let out = inject_into_packet(foreign, &sample());
        assert!(out.contains(r#"xmp:CreatorTool="Photoshop""#));
        assert!(out.contains("</rdf:Description>"));
        assert_eq!(out.matches("xmlns:sdx=").count(), 1);
        assert_eq!(scrape_field(&out, "sdx:steps").as_deref(), Some("20"));
        assert_eq!(inject_into_packet(&out, &sample()), out);
    }

    #[test]
    fn missing_prompt_is_marked() {
        assert!(scrape_field(&build_packet(&sample()), "sdx:noPrompt").is_none());

        let mut promptless = sample();
        promptless.prompt = None;
        let packet = build_packet(&promptless);
        assert_eq!(scrape_field(&packet, "sdx:noPrompt").as_deref(), Some("true"));
        assert!(scrape_tag(&packet, "dc:description").is_none());

        // Setting a prompt again drops the marker.
        let out = inject_into_packet(&packet, &sample());
        assert!(scrape_field(&out, "sdx:noPrompt").is_none());
    }

    #[test]
    fn stale_sdx_fields_are_dropped() {
        let first = build_packet(&sample());
        let mut changed = sample();
        changed.negative = None;
        let out = inject_into_packet(&first, &changed);
        assert!(scrape_field(&out, "sdx:negative").is_none());
        assert_eq!(out.matches("<sdx:steps>").count(), 1);
    }
}
