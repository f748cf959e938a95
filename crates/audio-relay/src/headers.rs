//! Pure header-set helpers for the relay surface.
//!
//! Copying upstream headers into a client response is modeled as a pure
//! function of two header sets with an explicit deny list, so the behavior is
//! testable without a live HTTP round-trip.
//!
//! Deny list rationale:
//! - CORS headers are fixed at handler entry; an upstream's CORS policy must
//!   never leak through the relay.
//! - `Content-Type` is recomputed by [`normalize_content_type`] (upstream
//!   frequently mislabels an audio-only DASH track).
//! - `Transfer-Encoding`/`Connection` are hop-by-hop; the client-facing
//!   framing is chosen by our own server.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};

/// Content type used for every audio body produced by this crate.
pub const AUDIO_CONTENT_TYPE: &str = "audio/mp4";

/// Long public cache policy for relayed and locally served audio.
pub const AUDIO_CACHE_CONTROL: &str = "public, max-age=86400";

/// Headers never copied verbatim from an upstream response.
const DENY_LIST: &[HeaderName] = &[
    header::ACCESS_CONTROL_ALLOW_ORIGIN,
    header::ACCESS_CONTROL_ALLOW_METHODS,
    header::ACCESS_CONTROL_ALLOW_HEADERS,
    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
    header::CONTENT_TYPE,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// Copy `upstream` headers into `out`, skipping the deny list.
///
/// Repeated header values are preserved in order.
pub fn copy_upstream_headers(upstream: &HeaderMap, out: &mut HeaderMap) {
    for (name, value) in upstream {
        if DENY_LIST.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
}

/// Normalize an upstream `Content-Type` for audio playback.
///
/// Empty or generic binary types become [`AUDIO_CONTENT_TYPE`]. `video/mp4` is
/// also rewritten: upstream labels audio-only DASH tracks as a video container,
/// which browsers then refuse to play. Any other declared type passes through
/// unchanged.
pub fn normalize_content_type(upstream: Option<&str>) -> String {
    match upstream {
        None | Some("") | Some("application/octet-stream") | Some("video/mp4") => {
            AUDIO_CONTENT_TYPE.to_string()
        }
        Some(other) => other.to_string(),
    }
}

/// Set the fixed CORS policy for a relay route.
///
/// `allow_methods` differs per route (`/relay` also accepts HEAD).
pub fn apply_cors(out: &mut HeaderMap, allow_methods: &'static str) {
    out.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    out.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(allow_methods),
    );
    out.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range"),
    );
}
