//! Local file server.
//!
//! Serves a previously persisted audio file as an HTTP response, honoring a
//! single byte-range request or returning the full body. Used by the relay's
//! 403 fallback path and by the `/local-file` endpoint.
//!
//! Behavior:
//! - a failed open reports 404; a failed stat reports 500
//! - content headers are fixed: `audio/mp4`, long public cache control,
//!   `Accept-Ranges: bytes`, open CORS
//! - a valid single range (see [`crate::range`]) yields 206 with exact
//!   `Content-Range`/`Content-Length` and a seek + bounded copy; anything else
//!   falls back to the full body
//! - HEAD responses carry headers only, never a body
//!
//! File handles are scoped to the request; an aborted client connection simply
//! stops the copy with no cleanup obligation.

use std::io::SeekFrom;
use std::path::Path;

use axum::body::Body;
use axum::http::header::{self, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::headers::{AUDIO_CACHE_CONTROL, AUDIO_CONTENT_TYPE};
use crate::range::parse_range_header;

/// Serve `path` with range support and fixed audio content headers.
pub async fn serve_file(path: &Path, method: &Method, range_header: Option<&str>) -> Response {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            debug!("local: open failed path='{}' err='{}'", path.display(), e);
            return (StatusCode::NOT_FOUND, "file not found").into_response();
        }
    };

    let size = match file.metadata().await {
        Ok(m) => m.len(),
        Err(e) => {
            debug!("local: stat failed path='{}' err='{}'", path.display(), e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "stat error").into_response();
        }
    };

    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(AUDIO_CONTENT_TYPE),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(AUDIO_CACHE_CONTROL),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );

    // Only the first validated range is honored; multipart responses are out
    // of scope. An invalid range falls back to the full body.
    let range = range_header
        .and_then(|h| parse_range_header(h, size).ok())
        .and_then(|ranges| ranges.first().copied());

    if let Some(range) = range {
        let content_range = format!("bytes {}-{}/{}", range.start, range.end(), size);
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&content_range)
                .unwrap_or(HeaderValue::from_static("bytes */0")),
        );
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&range.length.to_string())
                .unwrap_or(HeaderValue::from_static("0")),
        );
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;

        if method == Method::HEAD {
            return response;
        }

        if file.seek(SeekFrom::Start(range.start)).await.is_err() {
            return (StatusCode::INTERNAL_SERVER_ERROR, "seek failed").into_response();
        }
        let limited = file.take(range.length);
        *response.body_mut() = Body::from_stream(ReaderStream::new(limited));
        return response;
    }

    response.headers_mut().insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&size.to_string()).unwrap_or(HeaderValue::from_static("0")),
    );

    if method == Method::HEAD {
        return response;
    }

    *response.body_mut() = Body::from_stream(ReaderStream::new(file));
    response
}
