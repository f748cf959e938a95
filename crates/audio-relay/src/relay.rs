//! Request-facing relay handlers.
//!
//! Two routes share the [`RelayState`]:
//! - `/relay?u=<percent-encoded URL>&sid=<optional cache key>` proxies the
//!   upstream byte stream to the client, triggers background population when
//!   `sid` is present, and falls back to a local copy when upstream rejects
//!   the request with 403.
//! - `/local-file?f=<basename>` serves an already persisted file directly.
//!
//! Status-code fallback policy: only an upstream 403 (an expired access token
//! embedded in the stream URL) triggers the local fallback. Every other
//! non-2xx status is passed through unmodified so the client sees the true
//! upstream state.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::error::{RelayError, RelayResult};
use crate::headers::{
    AUDIO_CACHE_CONTROL, apply_cors, copy_upstream_headers, normalize_content_type,
};
use crate::local::serve_file;
use crate::populate::{CachePopulator, resolve_local};
use crate::settings::{RelaySettings, has_media_extension, is_plain_basename};

/// Shared state handed to every request handler.
///
/// Owned by a [`crate::server::RelayServer`] instance; there are no
/// process-wide singletons, so multiple servers never interfere.
#[derive(Clone)]
pub(crate) struct RelayState {
    pub(crate) client: reqwest::Client,
    pub(crate) populator: CachePopulator,
    pub(crate) settings: Arc<RelaySettings>,
}

// ----------------------------
// /relay
// ----------------------------

pub(crate) async fn handle_relay(
    State(state): State<RelayState>,
    method: Method,
    RawQuery(query): RawQuery,
    request_headers: HeaderMap,
) -> Response {
    let mut cors = HeaderMap::new();
    apply_cors(&mut cors, "GET, HEAD, OPTIONS");

    if method == Method::OPTIONS {
        return (StatusCode::OK, cors).into_response();
    }

    let params = match parse_query(query.as_deref().unwrap_or("")) {
        Ok(p) => p,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, cors, "invalid URL encoding").into_response();
        }
    };
    let Some(upstream_url) = params.get("u").filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, cors, "missing u parameter").into_response();
    };

    debug!("relay: fetching upstream url='{}'", upstream_url);

    // Best-effort: a present sid triggers background caching of the full
    // resource; this never blocks the response below.
    if let Some(sid) = params.get("sid") {
        state.populator.ensure_cached(upstream_url, sid).await;
    }

    let range_header = request_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    let upstream = build_upstream_request(&state, &method, upstream_url, range_header);
    let response = match upstream.send().await {
        Ok(r) => r,
        Err(e) => {
            return (StatusCode::BAD_GATEWAY, cors, format!("upstream error: {e}"))
                .into_response();
        }
    };

    let status = response.status();
    debug!(
        "relay: upstream status={} content_type='{}'",
        status,
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    );

    if status == StatusCode::FORBIDDEN {
        return serve_fallback(&state, &method, upstream_url, range_header, cors).await;
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let mut out = Response::new(Body::empty());
    *out.status_mut() = status;
    let headers = out.headers_mut();
    copy_upstream_headers(response.headers(), headers);
    headers.extend(cors);
    let normalized = normalize_content_type(content_type.as_deref());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&normalized)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(AUDIO_CACHE_CONTROL),
    );

    if method == Method::HEAD {
        return out;
    }

    // Stream the body verbatim. A transport error mid-stream truncates the
    // client's response; after headers are sent there is nothing to surface.
    *out.body_mut() = Body::from_stream(response.bytes_stream());
    out
}

/// Upstream request cloning the inbound method, forwarding `Range` verbatim,
/// and impersonating a direct browser request to the source site.
fn build_upstream_request(
    state: &RelayState,
    method: &Method,
    url: &str,
    range_header: Option<&str>,
) -> reqwest::RequestBuilder {
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let settings = &state.settings;

    let mut request = state
        .client
        .request(method, url)
        .header(header::USER_AGENT, &settings.user_agent)
        .header(header::REFERER, &settings.referer)
        .header(header::ORIGIN, &settings.origin)
        .header(header::ACCEPT, "*/*")
        .header(header::ACCEPT_LANGUAGE, "zh-CN,zh;q=0.9,en;q=0.8")
        .header("Sec-Fetch-Dest", "audio")
        .header("Sec-Fetch-Mode", "cors")
        .header("Sec-Fetch-Site", "cross-site")
        .header("Priority", "u=1, i");

    if let Some(range) = range_header {
        request = request.header(header::RANGE, range);
    }
    request
}

/// Local fallback after an upstream 403.
///
/// The filename is derived from the upstream URL path and only honored when it
/// carries a recognized media extension; the cache directory wins over the
/// downloads directory.
async fn serve_fallback(
    state: &RelayState,
    method: &Method,
    upstream_url: &str,
    range_header: Option<&str>,
    cors: HeaderMap,
) -> Response {
    debug!("relay: upstream 403, attempting local fallback");

    if let Some(filename) = fallback_filename(upstream_url) {
        let settings = &state.settings;
        if let Some(path) = resolve_local(
            &settings.cache_dir(),
            &settings.downloads_dir(),
            &filename,
        )
        .await
        {
            debug!("relay: serving fallback path='{}'", path.display());
            let mut response = serve_file(&path, method, range_header).await;
            merge_missing_headers(response.headers_mut(), &cors);
            return response;
        }
        debug!("relay: no local copy for fallback filename='{}'", filename);
    }

    (
        StatusCode::FORBIDDEN,
        cors,
        "upstream forbidden and no local copy available",
    )
        .into_response()
}

/// Derive a local filename from an upstream URL path, if its last segment ends
/// in a recognized media extension.
fn fallback_filename(upstream_url: &str) -> Option<String> {
    let parsed = url::Url::parse(upstream_url).ok()?;
    let basename = parsed.path_segments()?.next_back()?;
    if !has_media_extension(basename) || !is_plain_basename(basename) {
        return None;
    }
    Some(basename.to_string())
}

// ----------------------------
// /local-file
// ----------------------------

pub(crate) async fn handle_local(
    State(state): State<RelayState>,
    method: Method,
    RawQuery(query): RawQuery,
    request_headers: HeaderMap,
) -> Response {
    let mut cors = HeaderMap::new();
    apply_cors(&mut cors, "GET, OPTIONS");

    if method == Method::OPTIONS {
        return (StatusCode::OK, cors).into_response();
    }

    let params = match parse_query(query.as_deref().unwrap_or("")) {
        Ok(p) => p,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, cors, "invalid URL encoding").into_response();
        }
    };
    let Some(filename) = params.get("f").filter(|f| !f.is_empty()) else {
        return (StatusCode::BAD_REQUEST, cors, "missing f parameter").into_response();
    };

    // Traversal protection comes before any filesystem operation.
    if !is_plain_basename(filename) {
        return (StatusCode::BAD_REQUEST, cors, "invalid filename").into_response();
    }

    let settings = &state.settings;
    let Some(path) =
        resolve_local(&settings.cache_dir(), &settings.downloads_dir(), filename).await
    else {
        debug!("local: not found filename='{}'", filename);
        return (StatusCode::NOT_FOUND, cors, "file not found").into_response();
    };

    debug!("local: serving path='{}'", path.display());
    let range_header = request_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    let mut response = serve_file(&path, &method, range_header).await;
    merge_missing_headers(response.headers_mut(), &cors);
    response
}

// ----------------------------
// Query parsing
// ----------------------------

/// Parse a raw query string with strict percent-decoding.
///
/// Unlike lenient form decoders, an invalid escape sequence is an error, so
/// the handler can answer 400 instead of silently forwarding a garbled URL.
/// The first value wins for repeated keys.
fn parse_query(raw: &str) -> RelayResult<HashMap<String, String>> {
    let mut out = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = unescape_component(key)?;
        let value = unescape_component(value)?;
        out.entry(key).or_insert(value);
    }
    Ok(out)
}

fn unescape_component(s: &str) -> RelayResult<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16));
                let lo = bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16));
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return Err(RelayError::InvalidRequest("invalid URL encoding"));
                };
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| RelayError::InvalidRequest("invalid URL encoding"))
}

fn merge_missing_headers(target: &mut HeaderMap, extra: &HeaderMap) {
    for (name, value) in extra {
        if !target.contains_key(name) {
            target.insert(name.clone(), value.clone());
        }
    }
}
