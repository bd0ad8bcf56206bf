use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("not a document package: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io error inside package: {0}")]
    Io(#[from] std::io::Error),
    #[error("package has no {0} part")]
    MissingPart(String),
    #[error("part {part} is not UTF-8 XML")]
    NotXml { part: String },
}

pub const DOCUMENT_PART: &str = "word/document.xml";
pub const DOCUMENT_RELS_PART: &str = "word/_rels/document.xml.rels";
pub const CONTENT_TYPES_PART: &str = "[Content_Types].xml";

/// An opened document package: named parts in a stable order. Parts are
/// byte buffers; XML parts are decoded on demand.
#[derive(Debug, Clone)]
pub struct DocxPackage {
    parts: BTreeMap<String, Vec<u8>>,
}

impl DocxPackage {
    pub fn read(bytes: &[u8]) -> Result<Self, PackageError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut parts = BTreeMap::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let mut buffer = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buffer)?;
            parts.insert(entry.name().to_string(), buffer);
        }
        if !parts.contains_key(DOCUMENT_PART) {
            return Err(PackageError::MissingPart(DOCUMENT_PART.to_string()));
        }
        Ok(Self { parts })
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts.get(name).map(Vec::as_slice)
    }

    /// Reads a part as XML text.
    pub fn xml(&self, name: &str) -> Result<String, PackageError> {
        let bytes = self
            .parts
            .get(name)
            .ok_or_else(|| PackageError::MissingPart(name.to_string()))?;
        String::from_utf8(bytes.clone()).map_err(|_| PackageError::NotXml {
            part: name.to_string(),
        })
    }

    pub fn set_part(&mut self, name: &str, bytes: Vec<u8>) {
        self.parts.insert(name.to_string(), bytes);
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.parts.contains_key(name)
    }

    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.parts.keys().map(String::as_str)
    }

    /// The main document part's XML.
    pub fn document(&self) -> Result<String, PackageError> {
        self.xml(DOCUMENT_PART)
    }

    /// Every part holding renderable WordprocessingML text: the document
    /// body plus headers and footers.
    pub fn text_part_names(&self) -> Vec<String> {
        self.parts
            .keys()
            .filter(|name| {
                name.as_str() == DOCUMENT_PART
                    || (name.starts_with("word/header") && name.ends_with(".xml"))
                    || (name.starts_with("word/footer") && name.ends_with(".xml"))
            })
            .cloned()
            .collect()
    }

    /// Serializes the package back into a zip envelope. `[Content_Types].xml`
    /// is written first, as writers conventionally expect.
    pub fn write(&self) -> Result<Vec<u8>, PackageError> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);

            let ordered = std::iter::once(CONTENT_TYPES_PART)
                .chain(
                    self.parts
                        .keys()
                        .map(String::as_str)
                        .filter(|name| *name != CONTENT_TYPES_PART),
                )
                .filter_map(|name| self.parts.get_key_value(name));

            for (name, bytes) in ordered {
                writer.start_file(name.as_str(), options)?;
                writer.write_all(bytes)?;
            }
            writer.finish()?;
        }
        Ok(cursor.into_inner())
    }
}
