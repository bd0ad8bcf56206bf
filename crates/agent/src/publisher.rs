//! Uploads generated artifacts, links them to parent records, and commits
//! the tracking row's success transition. Individual link failures are
//! tolerated and accumulated; a publish only fails outright when every
//! link of a parented request fails, in which case the tracking row is
//! compensated to FAILED and the orphaned file is left for the operator
//! dashboard.

use crate::assembler::Prepared;
use crate::supported_objects::SupportedObjectMap;
use crate::{tracking, GenError};
use models::{fields, ErrorKind, OutputFormat, RecordId, TrackingStatus};
use sf_api::{ContentVersionIds, Session};

#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub output_version: ContentVersionIds,
    pub merged_docx_version: Option<ContentVersionIds>,
    pub links_created: usize,
    pub link_errors: Vec<String>,
}

fn upload_error(err: sf_api::Error) -> GenError {
    match err {
        sf_api::Error::Unavailable { .. } => GenError::new(ErrorKind::UploadFailed, err.to_string()),
        other => GenError::from(other),
    }
}

fn output_file_name(prepared: &Prepared) -> String {
    let extension = match prepared.envelope.output_format {
        OutputFormat::Pdf => "pdf",
        OutputFormat::Docx => "docx",
    };
    match &prepared.envelope.options.output_file_name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => format!("document-{}.{extension}", prepared.envelope.correlation_id),
    }
}

#[tracing::instrument(skip_all, fields(correlation_id = %prepared.envelope.correlation_id, tracking = %tracking_id))]
pub async fn publish(
    session: &Session<'_>,
    supported: &SupportedObjectMap,
    prepared: &Prepared,
    tracking_id: &RecordId,
    output_bytes: &[u8],
    merged_docx: Option<&[u8]>,
) -> Result<PublishOutcome, GenError> {
    // Resolve the primary parent's dynamic lookup column up front, before
    // any bytes are uploaded, so an unconfigured primary type never orphans
    // a file.
    let primary_lookup_field = match &prepared.primary_parent_type {
        Some(primary) => match supported.lookup_field(primary) {
            Some(lookup_field) => Some(lookup_field.to_string()),
            None => {
                return Err(GenError::new(
                    ErrorKind::UnsupportedObject,
                    format!("primary parent type {primary:?} is not a configured object type"),
                ));
            }
        },
        None => None,
    };

    let output_version = session
        .upload_content_version(&output_file_name(prepared), output_bytes)
        .await
        .map_err(upload_error)?;

    let merged_docx_version = match merged_docx {
        Some(bytes) => Some(
            session
                .upload_content_version(
                    &format!("document-{}.docx", prepared.envelope.correlation_id),
                    bytes,
                )
                .await
                .map_err(upload_error)?,
        ),
        None => None,
    };

    // Link the artifact to each resolved parent whose object type is
    // configured. Unconfigured parent keys are skipped with a warning;
    // they never fail the request.
    let mut links_created = 0;
    let mut link_errors = Vec::new();
    let mut attempted = 0;
    for (parent_key, record_id) in &prepared.parents {
        let Some(record_id) = record_id else { continue };
        let object_type = match SupportedObjectMap::object_type_of_parent_key(parent_key) {
            Some(object_type) if supported.is_supported(object_type) => object_type,
            _ => {
                tracing::warn!(%parent_key, "skipping link to unconfigured parent object type");
                continue;
            }
        };
        attempted += 1;
        match session
            .create_link(&output_version.content_document_id, record_id)
            .await
        {
            Ok(_) => links_created += 1,
            Err(err) => {
                tracing::warn!(%parent_key, %object_type, error = %err, "link creation failed");
                link_errors.push(format!("{parent_key}: {err}"));
            }
        }
    }

    if attempted > 0 && links_created == 0 {
        let error = GenError::new(
            ErrorKind::LinkFailed,
            format!(
                "uploaded file {} could not be linked to any parent; file retained as orphan",
                output_version.content_version_id,
            ),
        );
        tracking::mark_failed(session, tracking_id, &error)
            .await
            .map_err(GenError::from)?;
        return Err(error);
    }

    // Success transition. The dynamic lookup column selected by the
    // supported-object map for the primary parent type receives the output
    // file's content-version id; the column name is configuration, not code.
    let mut patch = serde_json::json!({
        fields::STATUS: TrackingStatus::Succeeded.as_str(),
        fields::OUTPUT_FILE_ID: output_version.content_version_id,
        fields::ERROR: serde_json::Value::Null,
        fields::LOCKED_UNTIL: serde_json::Value::Null,
    });
    if let Some(docx_version) = &merged_docx_version {
        patch[fields::MERGED_DOCX_FILE_ID] = serde_json::json!(docx_version.content_version_id);
    }
    if let Some(lookup_field) = &primary_lookup_field {
        patch[lookup_field.as_str()] = serde_json::json!(output_version.content_version_id);
    }
    session
        .patch_record(fields::OBJECT, tracking_id, &patch)
        .await
        .map_err(GenError::from)?;

    Ok(PublishOutcome {
        output_version,
        merged_docx_version,
        links_created,
        link_errors,
    })
}
