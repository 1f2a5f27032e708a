//! Conditional GET over published cache entries.

use std::sync::Arc;

use async_stream::try_stream;
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{HeaderMap, HeaderName, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::Stream;
use metrics::counter;
use tracing::error;

use crate::{
    application::error::HttpError,
    cache::{Blob, BlobError, BlobReader, CacheEntry, Payload},
};

use super::HttpState;

pub const METRIC_HTTP_RESPONSES: &str = "querycache_http_responses_total";

const SOURCE: &str = "infra::http::serve_endpoint";
const NO_STORE: &str = "no-cache, no-store";
const JSON: &str = "application/json";

/// Serve the current entry for the matched endpoint.
///
/// `HEAD` gets the same headers as `GET` without touching the payload.
pub async fn serve_endpoint(
    State(state): State<HttpState>,
    matched: MatchedPath,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let key = matched.as_str();
    let Some(entry) = state.store.load(key) else {
        return not_found().await;
    };

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok());
    if if_none_match.is_some_and(|value| entry.matches(value)) {
        return record((StatusCode::NOT_MODIFIED, validators(&entry)).into_response());
    }

    let validator_headers = validators(&entry);
    let content_type = [(header::CONTENT_TYPE, JSON)];
    if method == Method::HEAD {
        return record((StatusCode::OK, validator_headers, content_type).into_response());
    }

    let body = match entry.payload() {
        Payload::Memory(bytes) => Body::from(bytes.clone()),
        Payload::Blob(blob) => match open_body(&state, &entry, blob).await {
            Ok(body) => body,
            Err(err) => {
                error!(
                    target = SOURCE,
                    path = key,
                    blob = %blob.path().display(),
                    error = %err,
                    "failed to open cached blob"
                );
                return record(HttpError::from(err).into_response());
            }
        },
    };

    record((StatusCode::OK, validator_headers, content_type, body).into_response())
}

/// 404 for keys without a published entry and for unknown paths.
pub async fn not_found() -> Response {
    record(
        (
            StatusCode::NOT_FOUND,
            [(header::CACHE_CONTROL, NO_STORE)],
            "Not Found",
        )
            .into_response(),
    )
}

fn validators(entry: &CacheEntry) -> [(HeaderName, String); 3] {
    [
        (header::ETAG, entry.etag().to_owned()),
        (header::LAST_MODIFIED, entry.last_modified().to_owned()),
        (header::CACHE_CONTROL, entry.cache_control().to_owned()),
    ]
}

// The first frame is decrypted before the status line is committed, so a
// missing or corrupt blob still turns into a clean 500.
async fn open_body(
    state: &HttpState,
    entry: &Arc<CacheEntry>,
    blob: &Blob,
) -> Result<Body, BlobError> {
    let mut reader = state.blobs.open_blob(blob).await?;
    let first = reader.next_chunk().await?;
    Ok(Body::from_stream(blob_stream(Arc::clone(entry), first, reader)))
}

// Holding the entry keeps the blob on disk until the body is fully sent,
// even if the entry is replaced mid-response.
fn blob_stream(
    entry: Arc<CacheEntry>,
    first: Option<Bytes>,
    mut reader: BlobReader,
) -> impl Stream<Item = Result<Bytes, BlobError>> + Send + 'static {
    try_stream! {
        let _entry = entry;
        if let Some(chunk) = first {
            yield chunk;
        }
        loop {
            let next = reader.next_chunk().await;
            if let Err(err) = &next {
                error!(target = SOURCE, error = %err, "cached blob failed mid-stream");
            }
            match next? {
                Some(chunk) => yield chunk,
                None => break,
            }
        }
    }
}

fn record(response: Response) -> Response {
    counter!(METRIC_HTTP_RESPONSES, "status" => response.status().as_u16().to_string())
        .increment(1);
    response
}
