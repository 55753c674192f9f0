//! Prediction endpoint
//!
//! Accepts a multipart CSV upload, runs the prediction pipeline, and
//! streams back the enriched CSV as a download.

use std::path::Path;

use axum::{
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use tracing::error;

use crate::error::{ApiError, ApiResult};
use crate::pipeline::{self, PipelineError};
use crate::AppState;

const DOWNLOAD_SUFFIX: &str = "_with_predictions.csv";

/// UTF-8 byte-order mark, expected by spreadsheet tools that default to
/// UTF-8 with BOM.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// POST /predict
///
/// Reads the uploaded `file` field, runs the pipeline, and returns the
/// enriched CSV. Validation failures map to 400 with a specific message;
/// everything else is logged server-side and reported as an opaque 500.
pub async fn predict(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut upload: Option<(Option<String>, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart upload: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Invalid multipart upload: {e}")))?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }

    let Some((filename, file_bytes)) = upload else {
        return Err(ApiError::BadRequest(
            "Missing multipart field \"file\".".to_string(),
        ));
    };

    if file_bytes.is_empty() {
        return Err(ApiError::BadRequest("Uploaded file is empty.".to_string()));
    }

    let table = match pipeline::predict_from_bytes(&state.model, &file_bytes).await {
        Ok(table) => table,
        Err(PipelineError::MissingColumns(columns)) => {
            return Err(ApiError::BadRequest(format!(
                "Missing required columns: {}",
                columns.join(", ")
            )));
        }
        Err(PipelineError::CsvDecoding) => {
            return Err(ApiError::BadRequest(
                "CSV must be encoded in utf-8 or cp932.".to_string(),
            ));
        }
        Err(err) => {
            error!("Prediction failed: {err:#}");
            return Err(ApiError::Internal("Prediction failed.".to_string()));
        }
    };

    let csv_bytes = table.to_csv_bytes().map_err(|err| {
        error!("Failed to serialize result CSV: {err}");
        ApiError::Internal("Prediction failed.".to_string())
    })?;

    let mut body = Vec::with_capacity(UTF8_BOM.len() + csv_bytes.len());
    body.extend_from_slice(UTF8_BOM);
    body.extend_from_slice(&csv_bytes);

    let download_name = download_name(filename.as_deref());
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&download_name)),
        ],
        body,
    )
        .into_response())
}

/// Derived download filename: original stem plus suffix, defaulting to
/// `predictions` when the upload carried no usable name.
fn download_name(original: Option<&str>) -> String {
    let stem = original
        .map(Path::new)
        .and_then(Path::file_stem)
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("predictions");
    format!("{stem}{DOWNLOAD_SUFFIX}")
}

/// Content-Disposition with an ASCII-sanitized fallback filename plus the
/// percent-encoded UTF-8 variant for clients that support RFC 5987.
fn content_disposition(name: &str) -> String {
    let fallback = ascii_fallback(name);
    let encoded = urlencoding::encode(name);
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

/// Replace every byte that cannot appear in a quoted filename parameter
/// (non-ASCII, control characters, quotes, backslashes) with `_`.
fn ascii_fallback(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build predict routes
pub fn predict_routes() -> Router<AppState> {
    Router::new().route("/predict", post(predict))
}
