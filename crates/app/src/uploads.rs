use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use school_fees_blob::{receipt_pathname, BlobEntry, StoredBlob};
use school_fees_core::validate_receipt_file;

use crate::auth::Actor;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const FILE_FIELD: &str = "file";
const DEFAULT_PREFIX: &str = "receipts/";

/// Accepts a receipt image and stores it, returning its public URL.
pub async fn upload(
    State(state): State<AppState>,
    actor: Actor,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<StoredBlob>), ProblemResponse> {
    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(invalid_multipart)? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await.map_err(invalid_multipart)?;
        file = Some((content_type, file_name, bytes));
        break;
    }

    let Some((content_type, file_name, bytes)) = file else {
        counter!("receipt_uploads_total", "result" => "missing_file").increment(1);
        return Err(ProblemResponse::bad_request(
            "missing_file",
            "multipart field 'file' is required",
        ));
    };

    if let Err(err) = validate_receipt_file(&content_type, bytes.len() as u64, state.receipt_max_bytes())
    {
        counter!("receipt_uploads_total", "result" => err.code()).increment(1);
        warn!(
            stage = "upload",
            subject = %actor.subject,
            content_type = %content_type,
            size = bytes.len(),
            reason = err.code(),
            "receipt rejected"
        );
        return Err(err.into());
    }

    let pathname = receipt_pathname(file_name.as_deref());
    let stored = match state
        .blobs()
        .put(&pathname, &content_type, bytes.to_vec())
        .await
    {
        Ok(stored) => stored,
        Err(err) => {
            counter!("receipt_uploads_total", "result" => "storage_error").increment(1);
            return Err(err.into());
        }
    };

    counter!("receipt_uploads_total", "result" => "stored").increment(1);
    info!(
        stage = "upload",
        subject = %actor.subject,
        pathname = %stored.pathname,
        size = stored.size,
        "receipt stored"
    );
    Ok((StatusCode::CREATED, Json(stored)))
}

#[derive(Debug, Deserialize)]
pub struct UploadListQuery {
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadList {
    blobs: Vec<BlobEntry>,
}

pub async fn list(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<UploadListQuery>,
) -> Result<Json<UploadList>, ProblemResponse> {
    actor.require_staff()?;
    let prefix = query.prefix.as_deref().unwrap_or(DEFAULT_PREFIX);
    let blobs = state.blobs().list(prefix).await?;
    Ok(Json(UploadList { blobs }))
}

pub async fn remove(
    State(state): State<AppState>,
    actor: Actor,
    Path(pathname): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    actor.require_staff()?;
    state.blobs().delete(&pathname).await?;
    info!(stage = "upload", subject = %actor.subject, %pathname, "receipt deleted");
    Ok(StatusCode::NO_CONTENT)
}

fn invalid_multipart(err: MultipartError) -> ProblemResponse {
    ProblemResponse::new(err.status(), "invalid_multipart", err.body_text())
}
