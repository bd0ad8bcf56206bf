//! Combines merged documents into one. The first section's package becomes
//! the container; every later section contributes its body content, its
//! section properties (demoted to a paragraph-level "next page" break so
//! per-section headers and footers survive), and the parts those reference.
//! Parts are carried over as a union, deduplicated by content hash, with
//! relationship ids re-allocated into the container's id space.

use crate::package::{
    DocxPackage, PackageError, CONTENT_TYPES_PART, DOCUMENT_PART, DOCUMENT_RELS_PART,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Section {
    pub bytes: Vec<u8>,
    pub sequence: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConcatError {
    #[error("no sections to concatenate")]
    NoSections,
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error("document part is malformed: {0}")]
    Malformed(String),
}

const EMPTY_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"></Relationships>"#;

/// Concatenates sections in ascending `sequence` order (stable for ties).
/// A single section is returned byte-identical; zero sections fail.
pub fn concatenate(mut sections: Vec<Section>) -> Result<Vec<u8>, ConcatError> {
    if sections.is_empty() {
        return Err(ConcatError::NoSections);
    }
    sections.sort_by_key(|section| section.sequence);
    if sections.len() == 1 {
        return Ok(sections.pop().expect("len checked").bytes);
    }

    let packages = sections
        .iter()
        .map(|section| DocxPackage::read(&section.bytes))
        .collect::<Result<Vec<_>, _>>()?;

    let mut merged = packages[0].clone();
    let mut hashes = part_hashes(&merged);
    let mut rels_xml = merged
        .xml(DOCUMENT_RELS_PART)
        .unwrap_or_else(|_| EMPTY_RELS.to_string());
    let mut next_rel_index = max_rel_index(&rels_xml) + 1;

    // Per-section (content, sectPr) with relationship ids remapped into the
    // container's id space.
    let mut bodies = Vec::with_capacity(packages.len());

    for (index, package) in packages.iter().enumerate() {
        let document = package.document()?;
        let (content, sect_pr) = split_body(&document)?;
        if index == 0 {
            bodies.push((content, sect_pr));
            continue;
        }

        let (content, sect_pr) = remap_section(
            package,
            content,
            sect_pr,
            &mut merged,
            &mut hashes,
            &mut rels_xml,
            &mut next_rel_index,
        )?;
        bodies.push((content, sect_pr));
    }

    // Reassemble the document body: each non-final section's properties are
    // demoted into a trailing paragraph carrying a next-page break.
    let base_document = merged.document()?;
    let (prefix, suffix) = body_envelope(&base_document)?;
    let mut body = String::new();
    let last = bodies.len() - 1;
    for (index, (content, sect_pr)) in bodies.iter().enumerate() {
        body.push_str(content);
        if index < last {
            body.push_str(&demote_sect_pr(sect_pr));
        } else {
            body.push_str(sect_pr);
        }
    }

    merged.set_part(DOCUMENT_PART, format!("{prefix}{body}{suffix}").into_bytes());
    merged.set_part(DOCUMENT_RELS_PART, rels_xml.into_bytes());
    Ok(merged.write()?)
}

/// Copies one later section into the container: every relationship of its
/// document part is re-created under a fresh id (internal targets are copied
/// with hash dedup), and both the body content and sectPr are rewritten to
/// the new ids.
fn remap_section(
    package: &DocxPackage,
    content: String,
    sect_pr: String,
    merged: &mut DocxPackage,
    hashes: &mut BTreeMap<String, String>,
    rels_xml: &mut String,
    next_rel_index: &mut usize,
) -> Result<(String, String), ConcatError> {
    let source_rels = package
        .xml(DOCUMENT_RELS_PART)
        .unwrap_or_else(|_| EMPTY_RELS.to_string());
    let relationships = parse_rels(&source_rels);

    let mut memo = BTreeMap::new();
    let mut content = content;
    let mut sect_pr = sect_pr;
    let mut replacements = Vec::new();

    for (ordinal, rel) in relationships.iter().enumerate() {
        let new_id = format!("rId{}", *next_rel_index);
        *next_rel_index += 1;

        let new_target = if rel.external {
            rel.target.clone()
        } else {
            let source_part = resolve_target("word", &rel.target);
            let new_part = copy_part(package, &source_part, merged, hashes, &mut memo)?;
            new_part
                .strip_prefix("word/")
                .unwrap_or(&new_part)
                .to_string()
        };

        append_rel(rels_xml, &new_id, &rel.rel_type, &new_target, rel.external);

        // Two-phase id rewrite so a fresh id never collides with a source id
        // that is still awaiting replacement.
        let token = format!("\"__rel_{ordinal}__\"");
        let old = format!("\"{}\"", rel.id);
        content = content.replace(&old, &token);
        sect_pr = sect_pr.replace(&old, &token);
        replacements.push((token, format!("\"{new_id}\"")));
    }
    for (token, new_id) in replacements {
        content = content.replace(&token, &new_id);
        sect_pr = sect_pr.replace(&token, &new_id);
    }
    Ok((content, sect_pr))
}

/// Copies a part (and, transitively, the parts its own relationships refer
/// to) into the container. Identical bytes reuse the already-resident part.
fn copy_part(
    source: &DocxPackage,
    source_part: &str,
    merged: &mut DocxPackage,
    hashes: &mut BTreeMap<String, String>,
    memo: &mut BTreeMap<String, String>,
) -> Result<String, ConcatError> {
    if let Some(done) = memo.get(source_part) {
        return Ok(done.clone());
    }
    let bytes = source
        .part(source_part)
        .ok_or_else(|| ConcatError::Malformed(format!("missing part {source_part}")))?
        .to_vec();

    let own_rels_part = rels_part_for(source_part);
    let own_rels = source.xml(&own_rels_part).ok();

    // Leaf parts dedup by hash. Parts with their own relationships are
    // copied fresh, because their dependency targets get rewritten.
    let digest = hex::encode(Sha256::digest(&bytes));
    if own_rels.is_none() {
        if let Some(existing) = hashes.get(&digest) {
            memo.insert(source_part.to_string(), existing.clone());
            return Ok(existing.clone());
        }
    }

    let new_name = allocate_name(merged, source_part);
    memo.insert(source_part.to_string(), new_name.clone());

    if let Some(own_rels) = own_rels {
        let mut rewritten = own_rels;
        for rel in parse_rels(&rewritten.clone()) {
            if rel.external {
                continue;
            }
            let dep_source = resolve_target(parent_dir(source_part), &rel.target);
            let dep_new = copy_part(source, &dep_source, merged, hashes, memo)?;
            let dep_target = relative_target(parent_dir(&new_name), &dep_new);
            rewritten = rewritten.replace(
                &format!("Target=\"{}\"", rel.target),
                &format!("Target=\"{dep_target}\""),
            );
        }
        merged.set_part(&rels_part_for(&new_name), rewritten.into_bytes());
    }

    register_content_type(source, source_part, merged, &new_name)?;
    merged.set_part(&new_name, bytes);
    hashes.insert(digest, new_name.clone());
    Ok(new_name)
}

/// Content hash to part name, for every part already resident under `word/`.
fn part_hashes(package: &DocxPackage) -> BTreeMap<String, String> {
    package
        .part_names()
        .filter(|name| name.starts_with("word/"))
        .map(|name| {
            let digest = hex::encode(Sha256::digest(package.part(name).expect("name is listed")));
            (digest, name.to_string())
        })
        .collect()
}

#[derive(Debug)]
struct Relationship {
    id: String,
    rel_type: String,
    target: String,
    external: bool,
}

fn parse_rels(xml: &str) -> Vec<Relationship> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut out = Vec::new();
    let mut buffer = Vec::new();
    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(quick_xml::events::Event::Empty(e) | quick_xml::events::Event::Start(e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                let mut id = None;
                let mut rel_type = None;
                let mut target = None;
                let mut external = false;
                for attr in e.attributes().flatten() {
                    let value = String::from_utf8_lossy(&attr.value).to_string();
                    match attr.key.as_ref() {
                        b"Id" => id = Some(value),
                        b"Type" => rel_type = Some(value),
                        b"Target" => target = Some(value),
                        b"TargetMode" => external = value == "External",
                        _ => (),
                    }
                }
                if let (Some(id), Some(rel_type), Some(target)) = (id, rel_type, target) {
                    out.push(Relationship {
                        id,
                        rel_type,
                        target,
                        external,
                    });
                }
            }
            Ok(quick_xml::events::Event::Eof) | Err(_) => return out,
            _ => (),
        }
        buffer.clear();
    }
}

fn append_rel(rels_xml: &mut String, id: &str, rel_type: &str, target: &str, external: bool) {
    let mode = if external {
        r#" TargetMode="External""#
    } else {
        ""
    };
    let entry = format!(r#"<Relationship Id="{id}" Type="{rel_type}" Target="{target}"{mode}/>"#);
    *rels_xml = rels_xml.replace("</Relationships>", &format!("{entry}</Relationships>"));
}

fn max_rel_index(rels_xml: &str) -> usize {
    parse_rels(rels_xml)
        .iter()
        .filter_map(|rel| rel.id.strip_prefix("rId")?.parse::<usize>().ok())
        .max()
        .unwrap_or(0)
}

fn rels_part_for(part_name: &str) -> String {
    match part_name.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part_name}.rels"),
    }
}

fn parent_dir(part_name: &str) -> &str {
    part_name.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Resolves a relationship target against its source directory.
fn resolve_target(base_dir: &str, target: &str) -> String {
    let mut segments: Vec<&str> = if base_dir.is_empty() {
        Vec::new()
    } else {
        base_dir.split('/').collect()
    };
    for segment in target.split('/') {
        match segment {
            "." | "" => (),
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn relative_target(base_dir: &str, part_name: &str) -> String {
    match part_name.strip_prefix(&format!("{base_dir}/")) {
        Some(relative) => relative.to_string(),
        None => format!("/{part_name}"),
    }
}

/// Picks a free name for a copied part, counting up from the original stem:
/// `word/header1.xml` becomes `word/header2.xml`, `word/header3.xml`, ...
fn allocate_name(merged: &DocxPackage, desired: &str) -> String {
    if !merged.has_part(desired) {
        return desired.to_string();
    }
    let (stem, extension) = desired.rsplit_once('.').unwrap_or((desired, "bin"));
    let bare = stem.trim_end_matches(|c: char| c.is_ascii_digit());
    for index in 1.. {
        let candidate = format!("{bare}{index}.{extension}");
        if !merged.has_part(&candidate) {
            return candidate;
        }
    }
    unreachable!("some index is always free")
}

fn known_content_type(part_name: &str) -> Option<&'static str> {
    let file = part_name.rsplit_once('/').map(|(_, f)| f).unwrap_or(part_name);
    if file.starts_with("header") {
        Some("application/vnd.openxmlformats-officedocument.wordprocessingml.header+xml")
    } else if file.starts_with("footer") {
        Some("application/vnd.openxmlformats-officedocument.wordprocessingml.footer+xml")
    } else if file.starts_with("styles") {
        Some("application/vnd.openxmlformats-officedocument.wordprocessingml.styles+xml")
    } else if file.starts_with("numbering") {
        Some("application/vnd.openxmlformats-officedocument.wordprocessingml.numbering+xml")
    } else {
        None
    }
}

fn media_default(extension: &str) -> Option<&'static str> {
    match extension {
        "png" => Some("image/png"),
        "jpeg" | "jpg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

/// Carries the copied part's content type into the container: a `Default`
/// entry for media extensions, an `Override` for named XML parts.
fn register_content_type(
    source: &DocxPackage,
    source_part: &str,
    merged: &mut DocxPackage,
    new_name: &str,
) -> Result<(), ConcatError> {
    let mut content_types = merged.xml(CONTENT_TYPES_PART)?;

    let extension = new_name.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    if let Some(content_type) = media_default(extension) {
        if !content_types.contains(&format!(r#"Extension="{extension}""#)) {
            let entry = format!(r#"<Default Extension="{extension}" ContentType="{content_type}"/>"#);
            content_types = content_types.replace("</Types>", &format!("{entry}</Types>"));
            merged.set_part(CONTENT_TYPES_PART, content_types.into_bytes());
        }
        return Ok(());
    }

    let content_type = override_content_type(source, source_part)
        .or_else(|| known_content_type(source_part).map(str::to_string));
    if let Some(content_type) = content_type {
        if !content_types.contains(&format!(r#"PartName="/{new_name}""#)) {
            let entry =
                format!(r#"<Override PartName="/{new_name}" ContentType="{content_type}"/>"#);
            content_types = content_types.replace("</Types>", &format!("{entry}</Types>"));
            merged.set_part(CONTENT_TYPES_PART, content_types.into_bytes());
        }
    }
    Ok(())
}

/// Looks up the source package's `Override` content type for a part.
fn override_content_type(source: &DocxPackage, part_name: &str) -> Option<String> {
    let content_types = source.xml(CONTENT_TYPES_PART).ok()?;
    let needle = format!(r#"PartName="/{part_name}""#);
    let at = content_types.find(&needle)?;
    let rest = &content_types[at..];
    let start = rest.find(r#"ContentType=""#)? + r#"ContentType=""#.len();
    let end = rest[start..].find('"')? + start;
    Some(rest[start..end].to_string())
}

/// Splits a document part into the body's inner content and its trailing
/// body-level `sectPr`.
fn split_body(document_xml: &str) -> Result<(String, String), ConcatError> {
    let (_, inner, _) = body_pieces(document_xml)?;
    let (content, sect_pr) = split_sect_pr(inner);
    Ok((content.to_string(), sect_pr.unwrap_or_default().to_string()))
}

/// The document XML before and after the body's inner content.
fn body_envelope(document_xml: &str) -> Result<(String, String), ConcatError> {
    let (prefix, _, suffix) = body_pieces(document_xml)?;
    Ok((prefix.to_string(), suffix.to_string()))
}

fn body_pieces(document_xml: &str) -> Result<(&str, &str, &str), ConcatError> {
    let open_at = document_xml
        .find("<w:body")
        .ok_or_else(|| ConcatError::Malformed("document has no <w:body>".to_string()))?;
    let open_end = document_xml[open_at..]
        .find('>')
        .map(|p| open_at + p + 1)
        .ok_or_else(|| ConcatError::Malformed("unterminated <w:body> tag".to_string()))?;
    let close_at = document_xml
        .rfind("</w:body>")
        .ok_or_else(|| ConcatError::Malformed("document has no </w:body>".to_string()))?;
    if close_at < open_end {
        return Err(ConcatError::Malformed("mis-nested <w:body>".to_string()));
    }
    Ok((
        &document_xml[..open_end],
        &document_xml[open_end..close_at],
        &document_xml[close_at..],
    ))
}

/// Splits the trailing body-level `sectPr` off the body content, if present.
fn split_sect_pr(inner: &str) -> (&str, Option<&str>) {
    if let Some(at) = inner.rfind("<w:sectPr") {
        let after = &inner[at..];
        let end = if after
            .find('>')
            .map(|p| after[..p].ends_with('/'))
            .unwrap_or(false)
        {
            after.find('>').map(|p| p + 1)
        } else {
            after.find("</w:sectPr>").map(|p| p + "</w:sectPr>".len())
        };
        if let Some(end) = end {
            if after[end..].trim().is_empty() {
                return (&inner[..at], Some(&inner[at..at + end]));
            }
        }
    }
    (inner, None)
}

/// Demotes a body-level `sectPr` into a paragraph-level one carrying a
/// "next page" break, which is what preserves the earlier section's page
/// geometry, headers, and footers at the seam.
fn demote_sect_pr(sect_pr: &str) -> String {
    let inner = sect_pr
        .trim_start_matches(|c| c != '>')
        .trim_start_matches('>')
        .trim_end_matches("</w:sectPr>");
    let inner = if sect_pr.ends_with("/>") { "" } else { inner };

    let with_type = if let Some(at) = inner.find("<w:type") {
        let end = inner[at..]
            .find("/>")
            .map(|p| at + p + 2)
            .unwrap_or(inner.len());
        format!(
            "{}<w:type w:val=\"nextPage\"/>{}",
            &inner[..at],
            &inner[end..]
        )
    } else if let Some(at) = inner.find("<w:pgSz") {
        format!(
            "{}<w:type w:val=\"nextPage\"/>{}",
            &inner[..at],
            &inner[at..]
        )
    } else {
        format!("<w:type w:val=\"nextPage\"/>{inner}")
    };

    format!("<w:p><w:pPr><w:sectPr>{with_type}</w:sectPr></w:pPr></w:p>")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::package::fixtures::{minimal_docx, minimal_docx_with, paragraph};

    fn section(bytes: Vec<u8>, sequence: i64) -> Section {
        Section { bytes, sequence }
    }

    #[test]
    fn test_zero_sections_fails() {
        assert!(matches!(concatenate(Vec::new()), Err(ConcatError::NoSections)));
    }

    #[test]
    fn test_single_section_is_identity() {
        let bytes = minimal_docx(&paragraph("only"));
        let out = concatenate(vec![section(bytes.clone(), 10)]).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn test_two_sections_in_sequence_order() {
        let first = minimal_docx(&paragraph("FIRST"));
        let second = minimal_docx(&paragraph("SECOND"));
        // Deliberately supplied out of order.
        let out = concatenate(vec![section(second, 20), section(first, 10)]).unwrap();

        let document = DocxPackage::read(&out).unwrap().document().unwrap();
        let first_at = document.find("FIRST").unwrap();
        let second_at = document.find("SECOND").unwrap();
        assert!(first_at < second_at, "{document}");

        // The seam carries a paragraph-level next-page section break.
        let seam = &document[first_at..second_at];
        assert!(seam.contains("<w:pPr><w:sectPr>"), "{seam}");
        assert!(seam.contains(r#"<w:type w:val="nextPage"/>"#), "{seam}");
    }

    #[test]
    fn test_stable_for_equal_sequence() {
        let a = minimal_docx(&paragraph("AAA"));
        let b = minimal_docx(&paragraph("BBB"));
        let out = concatenate(vec![section(a, 10), section(b, 10)]).unwrap();
        let document = DocxPackage::read(&out).unwrap().document().unwrap();
        assert!(document.find("AAA").unwrap() < document.find("BBB").unwrap());
    }

    #[test]
    fn test_header_parts_are_carried_and_remapped() {
        let first = minimal_docx(&paragraph("one"));

        let header = r#"<w:hdr xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:p><w:r><w:t>Terms header</w:t></w:r></w:p></w:hdr>"#;
        let second_rels = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/header" Target="header1.xml"/></Relationships>"#;
        let mut second = DocxPackage::read(&minimal_docx_with(
            &paragraph("two"),
            r#"<w:headerReference w:type="default" r:id="rId1"/>"#,
            &[("word/header1.xml", header)],
        ))
        .unwrap();
        second.set_part(DOCUMENT_RELS_PART, second_rels.as_bytes().to_vec());
        let second_bytes = second.write().unwrap();

        let out = concatenate(vec![
            section(first, 10),
            section(second_bytes, 20),
        ])
        .unwrap();
        let merged = DocxPackage::read(&out).unwrap();

        assert!(merged.has_part("word/header1.xml"), "header carried over");
        let rels = merged.xml(DOCUMENT_RELS_PART).unwrap();
        assert!(rels.contains("header1.xml"), "{rels}");

        // The copied header's reference was rewritten to a fresh id which
        // resolves in the merged rels.
        let document = merged.document().unwrap();
        let at = document.find("w:headerReference").unwrap();
        let id_start = document[at..].find("r:id=\"").unwrap() + at + 6;
        let id_end = document[id_start..].find('"').unwrap() + id_start;
        let id = &document[id_start..id_end];
        assert!(rels.contains(&format!(r#"Id="{id}""#)), "{id} in {rels}");
    }

    #[test]
    fn test_header_media_is_copied_transitively() {
        let first = minimal_docx(&paragraph("one"));

        // The second section's header carries its own relationship to a
        // media part, which must follow the header into the container.
        let header = r#"<w:hdr xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><w:p><w:r><w:drawing><a:blip r:embed="rId1"/></w:drawing></w:r></w:p></w:hdr>"#;
        let header_rels = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/image" Target="media/image1.png"/></Relationships>"#;
        let document_rels = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/header" Target="header1.xml"/></Relationships>"#;

        let mut second = DocxPackage::read(&minimal_docx_with(
            &paragraph("two"),
            r#"<w:headerReference w:type="default" r:id="rId1"/>"#,
            &[
                ("word/header1.xml", header),
                ("word/_rels/header1.xml.rels", header_rels),
                ("word/media/image1.png", "\u{89}PNGfake"),
            ],
        ))
        .unwrap();
        second.set_part(DOCUMENT_RELS_PART, document_rels.as_bytes().to_vec());
        let second_bytes = second.write().unwrap();

        let out = concatenate(vec![
            section(first, 10),
            section(second_bytes, 20),
        ])
        .unwrap();
        let merged = DocxPackage::read(&out).unwrap();

        assert!(merged.has_part("word/header1.xml"));
        assert!(merged.has_part("word/_rels/header1.xml.rels"));
        assert!(merged.has_part("word/media/image1.png"));
        assert!(merged
            .xml("word/_rels/header1.xml.rels")
            .unwrap()
            .contains(r#"Target="media/image1.png""#));
        assert!(merged
            .xml(CONTENT_TYPES_PART)
            .unwrap()
            .contains(r#"Extension="png""#));
    }

    #[test]
    fn test_identical_parts_dedup_by_hash() {
        let styles = r#"<w:styles xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"/>"#;
        let rels_with_styles = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/></Relationships>"#;

        let build = |text: &str| {
            let mut package = DocxPackage::read(&minimal_docx_with(
                &paragraph(text),
                "",
                &[("word/styles.xml", styles)],
            ))
            .unwrap();
            package.set_part(DOCUMENT_RELS_PART, rels_with_styles.as_bytes().to_vec());
            package.write().unwrap()
        };

        let out = concatenate(vec![
            section(build("one"), 10),
            section(build("two"), 20),
        ])
        .unwrap();
        let merged = DocxPackage::read(&out).unwrap();

        let style_parts: Vec<&str> = merged
            .part_names()
            .filter(|n| n.starts_with("word/styles"))
            .collect();
        assert_eq!(style_parts, vec!["word/styles.xml"], "identical styles dedup");
    }
}
