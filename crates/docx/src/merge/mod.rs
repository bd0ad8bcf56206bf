//! Binds a data tree into a template document. Directives are recognized in
//! the document body, headers, and footers:
//!
//! - `{{path.to.leaf}}`: substitution; a missing leaf renders empty.
//! - `{{#each path}} ... {{/each}}`: iteration, binding `this` and `@index`.
//! - `{{#if expr}} ... {{else}} ... {{/if}}`: conditionals.
//! - `{{= expr}}`: inline expressions (see [`expr`]).
//! - `{{image path}}`: embeds a `data:` URI image, or an external URL
//!   whose host is allowlisted.
//!
//! The engine never re-formats values: pre-formatted siblings carry a
//! `__formatted` suffix in the data tree and templates reference them
//! directly. Error messages name template constructs, never data values.

mod coalesce;
mod expr;
mod images;
mod parser;
mod render;

use crate::package::{DocxPackage, PackageError};
use std::time::Duration;

pub use images::ImageLoader;

/// Loader used when external image fetching is not wired; any URL reference
/// fails while `data:` URIs keep working.
pub struct NoExternalImages;

impl ImageLoader for NoExternalImages {
    fn load(&self, _url: &str) -> Result<Vec<u8>, String> {
        Err("external image loading is not enabled".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Hosts from which external template images may be fetched.
    pub image_allowlist: Vec<String>,
    /// BCP-47 locale, exposed to expressions as `@locale`.
    pub locale: String,
    /// IANA timezone, exposed to expressions as `@timezone`.
    pub timezone: String,
    pub correlation_id: uuid::Uuid,
    /// Wall-clock budget for each inline expression.
    pub expression_timeout: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            image_allowlist: Vec::new(),
            locale: "en-US".to_string(),
            timezone: "UTC".to_string(),
            correlation_id: uuid::Uuid::nil(),
            expression_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Package(#[from] PackageError),
    /// The template itself is malformed (unbalanced blocks, bad paths).
    #[error("template is invalid: {0}")]
    Template(String),
    /// An inline expression failed to parse or evaluate.
    #[error("template expression failed: {0}")]
    Expression(String),
    /// An external image host is not in the allowlist.
    #[error("image host {0:?} is not allowlisted")]
    ImageBlocked(String),
    #[error("image could not be loaded: {0}")]
    ImageLoad(String),
}

/// Merges `data` into the template, returning the merged document bytes.
#[tracing::instrument(skip_all, fields(correlation_id = %options.correlation_id))]
pub fn merge(
    template: &[u8],
    data: &serde_json::Value,
    options: &MergeOptions,
    images: &dyn ImageLoader,
) -> Result<Vec<u8>, MergeError> {
    let mut package = DocxPackage::read(template)?;

    for part_name in package.text_part_names() {
        let xml = package.xml(&part_name)?;
        let coalesced = coalesce::coalesce_placeholders(&xml);
        let nodes = parser::parse(&coalesced)?;

        let mut media = images::MediaSink::new(&part_name, &package, options, images);
        let rendered = render::render(&nodes, data, options, &mut media)?;
        media.flush(&mut package)?;

        package.set_part(&part_name, rendered.into_bytes());
    }

    Ok(package.write()?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::package::fixtures::{minimal_docx, paragraph};
    use serde_json::json;

    fn merge_body(body: &str, data: serde_json::Value) -> String {
        let template = minimal_docx(&paragraph(body));
        let merged = merge(&template, &data, &MergeOptions::default(), &NoExternalImages).unwrap();
        DocxPackage::read(&merged).unwrap().document().unwrap()
    }

    #[test]
    fn test_field_substitution() {
        let out = merge_body(
            "Dear {{Account.Name}}, revenue {{Account.AnnualRevenue__formatted}}",
            json!({"Account": {"Name": "Acme", "AnnualRevenue__formatted": "£5,000,000"}}),
        );
        assert!(out.contains("Dear Acme, revenue £5,000,000"), "{out}");
    }

    #[test]
    fn test_missing_leaf_renders_empty() {
        let out = merge_body("[{{Account.Missing.Leaf}}]", json!({"Account": {}}));
        assert!(out.contains("[]"), "{out}");
    }

    #[test]
    fn test_substituted_text_is_escaped() {
        let out = merge_body("{{Name}}", json!({"Name": "a<b>&c"}));
        assert!(out.contains("a&lt;b&gt;&amp;c"), "{out}");
    }

    #[test]
    fn test_iteration_and_index() {
        let out = merge_body(
            "{{#each Items}}({{@index}}:{{this.Name}}){{/each}}",
            json!({"Items": [{"Name": "a"}, {"Name": "b"}]}),
        );
        assert!(out.contains("(0:a)(1:b)"), "{out}");
    }

    #[test]
    fn test_conditional_with_else() {
        let data = json!({"Paid": false, "Name": "Acme"});
        let out = merge_body("{{#if Paid}}paid{{else}}due{{/if}}", data);
        assert!(out.contains("due"), "{out}");
    }

    #[test]
    fn test_inline_expression() {
        let out = merge_body(
            "total: {{= Price * Quantity}}",
            json!({"Price": 2.5, "Quantity": 4}),
        );
        assert!(out.contains("total: 10"), "{out}");
    }

    #[test]
    fn test_placeholder_split_across_runs() {
        let body = "<w:p><w:r><w:t>{{Acc</w:t></w:r><w:r><w:t>ount.Name}}</w:t></w:r></w:p>";
        let template = minimal_docx(body);
        let merged = merge(
            &template,
            &json!({"Account": {"Name": "Acme"}}),
            &MergeOptions::default(),
            &NoExternalImages,
        )
        .unwrap();
        let out = DocxPackage::read(&merged).unwrap().document().unwrap();
        assert!(out.contains("Acme"), "{out}");
    }

    #[test]
    fn test_unbalanced_block_is_template_invalid() {
        let template = minimal_docx(&paragraph("{{#each Items}} unclosed"));
        let err = merge(
            &template,
            &json!({"Items": []}),
            &MergeOptions::default(),
            &NoExternalImages,
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::Template(_)), "{err}");
    }

    #[test]
    fn test_expression_error_does_not_leak_data() {
        let template = minimal_docx(&paragraph("{{= Secret / 'x'}}"));
        let err = merge(
            &template,
            &json!({"Secret": "hunter2"}),
            &MergeOptions::default(),
            &NoExternalImages,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, MergeError::Expression(_)));
        assert!(!message.contains("hunter2"), "{message}");
    }

    #[test]
    fn test_locale_and_timezone_are_visible() {
        let out = merge_body("{{@locale}}/{{@timezone}}", json!({}));
        assert!(out.contains("en-US/UTC"), "{out}");
    }

    #[test]
    fn test_data_uri_image_embeds_media_part() {
        // A 1x1 PNG.
        let png = base64::encode([
            0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0,
        ]);
        let template = minimal_docx(&paragraph("{{image Logo}}"));
        let merged = merge(
            &template,
            &json!({"Logo": format!("data:image/png;base64,{png}")}),
            &MergeOptions::default(),
            &NoExternalImages,
        )
        .unwrap();
        let package = DocxPackage::read(&merged).unwrap();
        assert!(package.has_part("word/media/image1.png"));
        assert!(package.document().unwrap().contains("<w:drawing>"));
        assert!(package
            .xml("word/_rels/document.xml.rels")
            .unwrap()
            .contains("media/image1.png"));
    }

    #[test]
    fn test_external_image_requires_allowlist() {
        let template = minimal_docx(&paragraph("{{image Logo}}"));
        let err = merge(
            &template,
            &json!({"Logo": "https://evil.example.com/x.png"}),
            &MergeOptions::default(),
            &NoExternalImages,
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::ImageBlocked(_)), "{err}");
    }
}
