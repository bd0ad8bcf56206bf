//! Orchestrates one generation end-to-end: template bytes (cache or
//! download), merge, optional concatenation, optional PDF conversion, and
//! publication. Used identically by the interactive endpoint and the batch
//! worker; only failure policy differs, and that lives in the callers.

use crate::assembler::{MergePlan, Prepared};
use crate::metrics::{self, Mode};
use crate::publisher::{self, PublishOutcome};
use crate::supported_objects::SupportedObjectMap;
use crate::{App, GenError};
use bytes::Bytes;
use models::{ErrorKind, OutputFormat, RecordId};
use tokio_util::sync::CancellationToken;

/// Fetches external template images from inside the blocking merge by
/// re-entering the runtime. The allowlist decision was already made by the
/// merge engine; this only performs the fetch.
struct HttpImageLoader {
    handle: tokio::runtime::Handle,
    http: reqwest::Client,
}

impl docx::ImageLoader for HttpImageLoader {
    fn load(&self, url: &str) -> Result<Vec<u8>, String> {
        self.handle.block_on(async {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|err| err.to_string())?;
            if !response.status().is_success() {
                return Err(format!("http status {}", response.status()));
            }
            response
                .bytes()
                .await
                .map(|bytes| bytes.to_vec())
                .map_err(|err| err.to_string())
        })
    }
}

pub struct Pipeline<'a> {
    pub app: &'a App,
}

impl Pipeline<'_> {
    /// Runs steps 1–5 of a prepared generation. On success the tracking
    /// row has been transitioned to SUCCEEDED by the publisher; on failure
    /// the caller decides between FAILED and a retry transition.
    #[tracing::instrument(skip_all, fields(correlation_id = %prepared.envelope.correlation_id, mode = mode.as_str()))]
    pub async fn generate(
        &self,
        prepared: &Prepared,
        tracking_id: &RecordId,
        mode: Mode,
        cancel: &CancellationToken,
    ) -> Result<PublishOutcome, GenError> {
        let started = std::time::Instant::now();
        let session = self.app.sf.session(prepared.envelope.correlation_id);

        let merged = match &prepared.plan {
            MergePlan::Single { binary_id } | MergePlan::CompositeOwn { binary_id } => {
                let template = self.template_bytes(&session, binary_id).await?;
                self.merge(template, prepared.envelope.data.clone(), prepared)
                    .await?
            }
            MergePlan::Concatenate { sections } => {
                let mut merged_sections = Vec::with_capacity(sections.len());
                for section in sections {
                    let template = self.template_bytes(&session, &section.binary_id).await?;
                    let tree = prepared
                        .envelope
                        .data
                        .get(&section.namespace)
                        .cloned()
                        .ok_or_else(|| {
                            GenError::validation(format!(
                                "composite data is missing namespace {:?}",
                                section.namespace
                            ))
                        })?;
                    let bytes = self.merge(template, tree, prepared).await?;
                    merged_sections.push(docx::Section {
                        bytes,
                        sequence: section.sequence,
                    });
                }
                docx::concatenate(merged_sections)?
            }
        };

        let (output_bytes, merged_docx) = match prepared.envelope.output_format {
            OutputFormat::Pdf => {
                let options = convert::ConvertOptions {
                    timeout: self.app.config.conversion_timeout,
                    correlation_id: prepared.envelope.correlation_id,
                };
                let pdf = self.app.pool.convert(&merged, &options, cancel).await?;
                metrics::record_pool(&self.app.pool.stats());
                let stored_docx = prepared.store_merged_docx.then_some(merged);
                (pdf, stored_docx)
            }
            OutputFormat::Docx => (merged, None),
        };

        let supported = SupportedObjectMap::fetch(&session)
            .await
            .map_err(GenError::from)?;
        let outcome = publisher::publish(
            &session,
            &supported,
            prepared,
            tracking_id,
            &output_bytes,
            merged_docx.as_deref(),
        )
        .await?;

        let template_label = prepared
            .envelope
            .template_id
            .as_ref()
            .or(prepared.envelope.composite_document_id.as_ref())
            .map(|id| id.to_string())
            .unwrap_or_default();
        metrics::record_generation(
            &template_label,
            prepared.envelope.output_format.as_str(),
            mode,
            started.elapsed().as_secs_f64() * 1_000.0,
        );

        Ok(outcome)
    }

    /// Template binaries are immutable and content-addressed: serve from
    /// the cache when resident, otherwise download once and admit.
    async fn template_bytes(
        &self,
        session: &sf_api::Session<'_>,
        binary_id: &RecordId,
    ) -> Result<Bytes, GenError> {
        if let Some(bytes) = self.app.cache.get(binary_id.as_str()) {
            metrics::record_cache(&self.app.cache.stats(), true);
            return Ok(bytes);
        }

        let bytes = session.download_binary(binary_id).await.map_err(|err| match err {
            sf_api::Error::NotFound { .. } => GenError::new(
                ErrorKind::TemplateNotFound,
                format!("template binary {binary_id} not found"),
            ),
            other => GenError::from(other),
        })?;
        self.app.cache.put(binary_id.as_str(), bytes.clone());
        metrics::record_cache(&self.app.cache.stats(), false);
        Ok(bytes)
    }

    /// The merge walks zip and XML buffers; run it off the async workers.
    async fn merge(
        &self,
        template: Bytes,
        data: serde_json::Value,
        prepared: &Prepared,
    ) -> Result<Vec<u8>, GenError> {
        let options = docx::MergeOptions {
            image_allowlist: self.app.config.image_allowlist.clone(),
            locale: prepared.envelope.locale.clone(),
            timezone: prepared.envelope.timezone.clone(),
            correlation_id: prepared.envelope.correlation_id,
            ..docx::MergeOptions::default()
        };
        let loader = HttpImageLoader {
            handle: tokio::runtime::Handle::current(),
            http: self.app.http.clone(),
        };

        let merged = tokio::task::spawn_blocking(move || {
            docx::merge(&template, &data, &options, &loader)
        })
        .await
        .map_err(|err| GenError::internal(format!("merge task panicked: {err}")))??;
        Ok(merged)
    }
}
