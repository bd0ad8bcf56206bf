use super::{ApiError, ValidatedJson};
use crate::assembler::{Assembler, Prepared};
use crate::metrics::{self, Mode};
use crate::pipeline::Pipeline;
use crate::{idempotency, tracking, App, GenError};
use models::{Envelope, ErrorKind, RecordId, TrackingRecord};
use std::sync::Arc;

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub download_url: String,
    pub content_version_id: RecordId,
    pub correlation_id: String,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_docx_download_url: Option<String>,
}

fn cached_response(
    app: &App,
    hit: &TrackingRecord,
    correlation_id: uuid::Uuid,
) -> Option<GenerateResponse> {
    let output = hit.output_file_id.clone()?;
    Some(GenerateResponse {
        download_url: app.config.download_url(&output),
        content_version_id: output,
        correlation_id: correlation_id.to_string(),
        cache_hit: true,
        merged_docx_download_url: hit
            .merged_docx_file_id
            .as_ref()
            .map(|id| app.config.download_url(id)),
    })
}

/// `POST /generate`: assemble, consult the idempotency guard, commit the
/// tracking row, and run the pipeline synchronously. A client disconnect
/// cancels the in-flight conversion; the record store's unique request-hash
/// constraint serializes concurrent equivalent requests.
pub async fn handle_generate(
    axum::extract::State(app): axum::extract::State<Arc<App>>,
    ValidatedJson(envelope): ValidatedJson<Envelope>,
) -> Result<axum::Json<GenerateResponse>, ApiError> {
    let correlation_id = envelope.correlation_id;
    let as_api = |err: GenError| ApiError::from_gen(err, correlation_id);

    let tracking_id;
    let prepared;
    {
        let session = app.sf.session(correlation_id);
        let assembler = Assembler {
            session: &session,
            providers: app.providers.as_ref(),
        };
        prepared = assembler.prepare(envelope).await.map_err(as_api)?;

        // Fast path: an equivalent successful artifact inside the window.
        let guard_hit =
            idempotency::lookup(&session, &prepared.request_hash, app.config.idempotency_window)
                .await
                .map_err(|err| as_api(err.into()))?;
        if let Some(response) =
            guard_hit.and_then(|hit| cached_response(&app, &hit, correlation_id))
        {
            return Ok(axum::Json(response));
        }

        tracking_id = match prepared.envelope.tracking_record_id.clone() {
            // Callers which pre-created their tracking row hand us its id;
            // verify it exists rather than inserting a second candidate.
            Some(precreated) => {
                tracking::fetch(&session, &precreated)
                    .await
                    .map_err(|err| as_api(err.into()))?
                    .id
            }
            // Commit our candidate row. Losing the unique-hash insert means
            // another writer is (or was) generating the same request: re-run
            // the lookup and serve the winner's artifact if it has landed.
            None => {
                match tracking::create_processing(
                    &session,
                    &prepared.envelope,
                    &prepared.request_hash,
                )
                .await
                {
                    Ok(id) => id,
                    Err(sf_api::Error::Duplicate(_)) => {
                        let winner = idempotency::lookup(
                            &session,
                            &prepared.request_hash,
                            app.config.idempotency_window,
                        )
                        .await
                        .map_err(|err| as_api(err.into()))?;
                        if let Some(response) =
                            winner.and_then(|hit| cached_response(&app, &hit, correlation_id))
                        {
                            return Ok(axum::Json(response));
                        }
                        return Err(ApiError::new(
                            ErrorKind::RecordStoreConflict,
                            "an equivalent request is already in flight",
                            correlation_id,
                        ));
                    }
                    Err(err) => return Err(as_api(err.into())),
                }
            }
        };
    }

    // Run the pipeline as a task so a client disconnect cancels the
    // conversion stage rather than silently abandoning a live subprocess.
    let cancel = tokio_util::sync::CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let task = {
        let app = app.clone();
        let prepared = prepared.clone();
        let tracking_id = tracking_id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let pipeline = Pipeline { app: &app };
            pipeline
                .generate(&prepared, &tracking_id, Mode::Interactive, &cancel)
                .await
        })
    };

    let result = task
        .await
        .map_err(|err| as_api(GenError::internal(format!("pipeline task failed: {err}"))))?;
    guard.disarm();

    respond(&app, &prepared, &tracking_id, correlation_id, result).await
}

/// Translates the pipeline outcome into the wire response, failing the
/// tracking row on error (conflict rows belong to another writer and are
/// left alone).
async fn respond(
    app: &App,
    prepared: &Prepared,
    tracking_id: &RecordId,
    correlation_id: uuid::Uuid,
    result: Result<crate::publisher::PublishOutcome, GenError>,
) -> Result<axum::Json<GenerateResponse>, ApiError> {
    match result {
        Ok(outcome) => Ok(axum::Json(GenerateResponse {
            download_url: app
                .config
                .download_url(&outcome.output_version.content_version_id),
            content_version_id: outcome.output_version.content_version_id,
            correlation_id: correlation_id.to_string(),
            cache_hit: false,
            merged_docx_download_url: outcome
                .merged_docx_version
                .as_ref()
                .filter(|_| prepared.return_docx_to_client)
                .map(|version| app.config.download_url(&version.content_version_id)),
        })),
        Err(error) => {
            metrics::record_failure(error.kind.code(), Mode::Interactive);
            if error.kind != ErrorKind::RecordStoreConflict {
                let session = app.sf.session(correlation_id);
                if let Err(patch_err) = tracking::mark_failed(&session, tracking_id, &error).await {
                    tracing::warn!(error = %patch_err, "failed to record FAILED transition");
                }
            }
            Err(ApiError::from_gen(error, correlation_id))
        }
    }
}
