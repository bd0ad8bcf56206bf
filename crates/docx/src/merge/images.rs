use super::{MergeError, MergeOptions};
use crate::package::DocxPackage;

/// Fetches the bytes behind an external image URL. The merge engine decides
/// *whether* a URL may be fetched (the host allowlist); the loader decides
/// *how*.
pub trait ImageLoader {
    fn load(&self, url: &str) -> Result<Vec<u8>, String>;
}

const EMU_WIDTH: u32 = 2_743_200; // 3in at 914400 EMU/in.
const EMU_HEIGHT: u32 = 1_828_800; // 2in.

const IMAGE_REL_TYPE: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";

struct AddedImage {
    media_part: String,
    rel_id: String,
    extension: &'static str,
    content_type: &'static str,
    bytes: Vec<u8>,
}

/// Collects images referenced while rendering one text part, then flushes
/// them into the package: media parts, the part's relationships, and
/// content-type defaults.
pub struct MediaSink<'a> {
    part_name: String,
    options: &'a MergeOptions,
    loader: &'a dyn ImageLoader,
    next_media_index: usize,
    next_rel_index: usize,
    added: Vec<AddedImage>,
}

fn rels_part_for(part_name: &str) -> String {
    match part_name.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part_name}.rels"),
    }
}

const EMPTY_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"></Relationships>"#;

/// Scans existing `Id="rIdN"` attributes for the highest allocated index.
fn max_rel_index(rels_xml: &str) -> usize {
    let mut reader = quick_xml::Reader::from_str(rels_xml);
    let mut max = 0;
    let mut buffer = Vec::new();
    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(quick_xml::events::Event::Empty(e) | quick_xml::events::Event::Start(e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"Id" {
                        if let Ok(value) = std::str::from_utf8(&attr.value) {
                            if let Some(n) =
                                value.strip_prefix("rId").and_then(|s| s.parse::<usize>().ok())
                            {
                                max = max.max(n);
                            }
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) | Err(_) => return max,
            _ => (),
        }
        buffer.clear();
    }
}

fn max_media_index(package: &DocxPackage) -> usize {
    package
        .part_names()
        .filter_map(|name| {
            name.strip_prefix("word/media/image")
                .and_then(|rest| rest.split('.').next())
                .and_then(|n| n.parse::<usize>().ok())
        })
        .max()
        .unwrap_or(0)
}

impl<'a> MediaSink<'a> {
    pub fn new(
        part_name: &str,
        package: &DocxPackage,
        options: &'a MergeOptions,
        loader: &'a dyn ImageLoader,
    ) -> Self {
        let rels_xml = package
            .xml(&rels_part_for(part_name))
            .unwrap_or_else(|_| EMPTY_RELS.to_string());
        Self {
            part_name: part_name.to_string(),
            options,
            loader,
            next_media_index: max_media_index(package) + 1,
            next_rel_index: max_rel_index(&rels_xml) + 1,
            added: Vec::new(),
        }
    }

    /// Resolves an image reference (a `data:` URI or an allowlisted
    /// external URL) and returns run-level drawing XML for it. The
    /// placeholder sits inside a `<w:r><w:t>` pair, so the markup closes
    /// the surrounding text run and reopens one after the drawing.
    pub fn embed(&mut self, reference: &str) -> Result<String, MergeError> {
        let (bytes, extension, content_type) = if let Some(rest) = reference.strip_prefix("data:") {
            decode_data_uri(rest)?
        } else if reference.starts_with("http://") || reference.starts_with("https://") {
            let host = url_host(reference)
                .ok_or_else(|| MergeError::ImageLoad("URL has no host".to_string()))?;
            if !self
                .options
                .image_allowlist
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&host))
            {
                return Err(MergeError::ImageBlocked(host));
            }
            let bytes = self
                .loader
                .load(reference)
                .map_err(MergeError::ImageLoad)?;
            let (extension, content_type) = sniff_format(&bytes)?;
            (bytes, extension, content_type)
        } else {
            return Err(MergeError::Template(
                "image reference is neither a data: URI nor an http(s) URL".to_string(),
            ));
        };

        let media_index = self.next_media_index;
        self.next_media_index += 1;
        let rel_id = format!("rId{}", self.next_rel_index);
        self.next_rel_index += 1;
        let media_part = format!("word/media/image{media_index}.{extension}");

        self.added.push(AddedImage {
            media_part: media_part.clone(),
            rel_id: rel_id.clone(),
            extension,
            content_type,
            bytes,
        });

        Ok(format!(
            r#"</w:t></w:r><w:r><w:drawing><wp:inline distT="0" distB="0" distL="0" distR="0" xmlns:wp="http://schemas.openxmlformats.org/drawingml/2006/wordprocessingDrawing"><wp:extent cx="{EMU_WIDTH}" cy="{EMU_HEIGHT}"/><wp:docPr id="{media_index}" name="Picture {media_index}"/><a:graphic xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"><a:graphicData uri="http://schemas.openxmlformats.org/drawingml/2006/picture"><pic:pic xmlns:pic="http://schemas.openxmlformats.org/drawingml/2006/picture"><pic:nvPicPr><pic:cNvPr id="{media_index}" name="Picture {media_index}"/><pic:cNvPicPr/></pic:nvPicPr><pic:blipFill><a:blip r:embed="{rel_id}"/><a:stretch><a:fillRect/></a:stretch></pic:blipFill><pic:spPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="{EMU_WIDTH}" cy="{EMU_HEIGHT}"/></a:xfrm><a:prstGeom prst="rect"><a:avLst/></a:prstGeom></pic:spPr></pic:pic></a:graphicData></a:graphic></wp:inline></w:drawing></w:r><w:r><w:t xml:space="preserve">"#
        ))
    }

    /// Writes collected media parts, relationship entries, and content-type
    /// defaults into the package.
    pub fn flush(&mut self, package: &mut DocxPackage) -> Result<(), MergeError> {
        if self.added.is_empty() {
            return Ok(());
        }

        let rels_part = rels_part_for(&self.part_name);
        let mut rels_xml = package
            .xml(&rels_part)
            .unwrap_or_else(|_| EMPTY_RELS.to_string());
        let mut content_types = package.xml(crate::package::CONTENT_TYPES_PART)?;

        for image in self.added.drain(..) {
            let entry = format!(
                r#"<Relationship Id="{}" Type="{IMAGE_REL_TYPE}" Target="{}"/>"#,
                image.rel_id,
                image.media_part.trim_start_matches("word/"),
            );
            rels_xml = rels_xml.replace("</Relationships>", &format!("{entry}</Relationships>"));

            let default = format!(
                r#"<Default Extension="{}" ContentType="{}"/>"#,
                image.extension, image.content_type,
            );
            if !content_types.contains(&format!(r#"Extension="{}""#, image.extension)) {
                content_types = content_types.replace("</Types>", &format!("{default}</Types>"));
            }

            package.set_part(&image.media_part, image.bytes);
        }

        package.set_part(&rels_part, rels_xml.into_bytes());
        package.set_part(crate::package::CONTENT_TYPES_PART, content_types.into_bytes());
        Ok(())
    }
}

fn decode_data_uri(rest: &str) -> Result<(Vec<u8>, &'static str, &'static str), MergeError> {
    let (header, payload) = rest
        .split_once(",")
        .ok_or_else(|| MergeError::Template("malformed data: URI".to_string()))?;
    let (extension, content_type) = if header.starts_with("image/png") {
        ("png", "image/png")
    } else if header.starts_with("image/jpeg") || header.starts_with("image/jpg") {
        ("jpeg", "image/jpeg")
    } else if header.starts_with("image/gif") {
        ("gif", "image/gif")
    } else {
        return Err(MergeError::Template(
            "data: URI is not a supported image type".to_string(),
        ));
    };
    if !header.ends_with(";base64") {
        return Err(MergeError::Template(
            "data: URI must be base64-encoded".to_string(),
        ));
    }
    let bytes = base64::decode(payload)
        .map_err(|_| MergeError::Template("data: URI payload is not valid base64".to_string()))?;
    Ok((bytes, extension, content_type))
}

fn sniff_format(bytes: &[u8]) -> Result<(&'static str, &'static str), MergeError> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Ok(("png", "image/png"))
    } else if bytes.starts_with(&[0xff, 0xd8]) {
        Ok(("jpeg", "image/jpeg"))
    } else if bytes.starts_with(b"GIF8") {
        Ok(("gif", "image/gif"))
    } else {
        Err(MergeError::ImageLoad(
            "fetched bytes are not a supported image format".to_string(),
        ))
    }
}

/// Extracts the lowercased host of an http(s) URL.
fn url_host(url: &str) -> Option<String> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_url_host_extraction() {
        assert_eq!(
            url_host("https://img.example.com/a/b.png").as_deref(),
            Some("img.example.com")
        );
        assert_eq!(
            url_host("http://img.example.com:8080/x").as_deref(),
            Some("img.example.com")
        );
        assert_eq!(
            url_host("https://user@Evil.EXAMPLE.com/x").as_deref(),
            Some("evil.example.com")
        );
        assert_eq!(url_host("not-a-url"), None);
    }

    #[test]
    fn test_data_uri_decoding() {
        let (bytes, ext, ct) =
            decode_data_uri("image/png;base64,AAEC").unwrap();
        assert_eq!(bytes, vec![0, 1, 2]);
        assert_eq!((ext, ct), ("png", "image/png"));

        assert!(decode_data_uri("image/png;base64").is_err());
        assert!(decode_data_uri("text/plain;base64,AAEC").is_err());
        assert!(decode_data_uri("image/png;base64,???").is_err());
    }

    #[test]
    fn test_format_sniffing() {
        assert_eq!(sniff_format(&[0x89, b'P', b'N', b'G', 0]).unwrap().0, "png");
        assert_eq!(sniff_format(&[0xff, 0xd8, 0xff]).unwrap().0, "jpeg");
        assert!(sniff_format(b"<html>").is_err());
    }
}
