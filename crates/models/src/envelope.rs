use super::RecordId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// The requested output artifact format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    #[serde(rename = "PDF")]
    Pdf,
    #[serde(rename = "DOCX")]
    Docx,
}

impl OutputFormat {
    /// Stable token used in request-hash computation and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "PDF",
            OutputFormat::Docx => "DOCX",
        }
    }
}

/// How a composite document materializes its templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateStrategy {
    /// The composite has a single master template which is merged with the
    /// full namespaced data map.
    OwnTemplate,
    /// Each slot's template is merged with its namespace's data, and the
    /// merged sections are concatenated in sequence order.
    ConcatenateTemplates,
}

/// One template of a CONCATENATE_TEMPLATES envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TemplateSection {
    pub template_id: RecordId,
    pub namespace: String,
    pub sequence: i64,
}

/// Per-request generation options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnvelopeOptions {
    #[serde(default)]
    pub store_merged_docx: bool,
    #[serde(default)]
    pub return_docx_to_client: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_name: Option<String>,
}

/// Envelope is the structured payload which drives generation end-to-end.
/// It is both the `POST /generate` request body and the payload persisted
/// into a queued tracking record for the batch worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_document_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_strategy: Option<TemplateStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<TemplateSection>,
    pub data: serde_json::Value,
    /// Parent record ids keyed by well-known foreign-key field name.
    /// Keys which are not configured object types are ignored with a
    /// warning rather than rejected.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parents: BTreeMap<String, Option<RecordId>>,
    pub output_format: OutputFormat,
    #[serde(default)]
    pub options: EnvelopeOptions,
    /// BCP-47 locale tag, e.g. `en-GB`.
    pub locale: String,
    /// IANA timezone name, e.g. `Europe/London`.
    pub timezone: String,
    pub correlation_id: uuid::Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_record_id: Option<RecordId>,
}

fn field_error(code: &'static str) -> validator::ValidationError {
    validator::ValidationError::new(code)
}

impl Validate for Envelope {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        let mut errors = validator::ValidationErrors::new();

        match (&self.template_id, &self.composite_document_id) {
            (Some(_), Some(_)) | (None, None) => {
                errors.add(
                    "templateId",
                    field_error("exactly one of templateId or compositeDocumentId must be set"),
                );
            }
            _ => (),
        }
        match self.template_strategy {
            Some(TemplateStrategy::OwnTemplate) if self.template_id.is_none() => {
                errors.add(
                    "templateStrategy",
                    field_error("templateStrategy OWN_TEMPLATE requires a templateId"),
                );
            }
            Some(TemplateStrategy::ConcatenateTemplates) if self.templates.is_empty() => {
                errors.add(
                    "templateStrategy",
                    field_error(
                        "templateStrategy CONCATENATE_TEMPLATES requires a non-empty templates list",
                    ),
                );
            }
            _ => (),
        }

        let mut seen = std::collections::BTreeSet::new();
        for section in &self.templates {
            if !seen.insert(section.namespace.as_str()) {
                errors.add("templates", field_error("template namespaces must be unique"));
            }
        }

        if self.locale.len() < 2 || self.locale.len() > 35 {
            errors.add("locale", field_error("locale must be a BCP-47 tag"));
        }
        if self.timezone.is_empty() || self.timezone.len() > 64 {
            errors.add("timezone", field_error("timezone must be an IANA name"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// The idempotency hash is deliberately not a method here: the composite
// form hashes the caller-supplied record-id seed, which assembly later
// overwrites with the grown variable pool. The assembler captures the seed
// and calls [`single_request_hash`] / [`composite_request_hash`] with the
// right inputs at the right time.
