//! Serves job artifacts from the shared artifact root.
//!
//! Files are streamed rather than buffered; animations can be large.
//! Single `bytes=` ranges are honored so video players can seek.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tid_core::artifacts::content_type;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Parse a `bytes=start-[end]` range header value.
///
/// Returns `(start, optional_end)`. Suffix and multi-part ranges are not
/// supported.
fn parse_range_header(range: &str) -> Option<(u64, Option<u64>)> {
    let (start, end) = range.strip_prefix("bytes=")?.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = match end.trim() {
        "" => None,
        end => Some(end.parse::<u64>().ok()?),
    };
    Some((start, end))
}

/// GET /api/v1/artifacts/{*path}
///
/// `path` is relative to the artifact root, as listed in a job's
/// `artifacts`. Paths that leave the root are rejected with 400.
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let file_path = state.orchestrator.resolve_artifact(&path)?;
    let content_type = content_type(&file_path);

    let mut file = tokio::fs::File::open(&file_path)
        .await
        .map_err(|e| AppError::InternalError(format!("Failed to open {path}: {e}")))?;
    let file_size = file
        .metadata()
        .await
        .map_err(|e| AppError::InternalError(format!("Failed to stat {path}: {e}")))?
        .len();

    if let Some(range_value) = headers.get(header::RANGE) {
        let range_str = range_value
            .to_str()
            .map_err(|_| AppError::BadRequest("Invalid Range header".into()))?;

        if let Some((start, end)) = parse_range_header(range_str) {
            let end = end.map_or(file_size.saturating_sub(1), |e| {
                e.min(file_size.saturating_sub(1))
            });
            if file_size == 0 || start >= file_size || start > end {
                return Ok((
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{file_size}"))],
                )
                    .into_response());
            }

            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| AppError::InternalError(format!("Failed to seek {path}: {e}")))?;
            let stream = ReaderStream::new(file.take(length));

            tracing::debug!(artifact = %path, start, end, "Serving artifact range");

            return Ok((
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::CONTENT_LENGTH, length.to_string()),
                    (
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{end}/{file_size}"),
                    ),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                Body::from_stream(stream),
            )
                .into_response());
        }
    }

    tracing::debug!(artifact = %path, bytes = file_size, "Serving artifact");

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, file_size.to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_closed_and_open_ranges() {
        assert_eq!(parse_range_header("bytes=0-99"), Some((0, Some(99))));
        assert_eq!(parse_range_header("bytes=100-"), Some((100, None)));
    }

    #[test]
    fn rejects_unsupported_ranges() {
        assert_eq!(parse_range_header("bytes=-500"), None);
        assert_eq!(parse_range_header("items=0-1"), None);
        assert_eq!(parse_range_header("bytes=a-b"), None);
    }
}
