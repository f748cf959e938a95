//! Loopback HTTP relay for remote audio streams.
//!
//! A desktop music client cannot always hand a remote stream URL straight to
//! its playback surface: the source site requires impersonation headers, the
//! URL embeds an access token that expires, and already-played audio should
//! survive token expiry. This crate provides the relay-and-cache core that
//! solves those three problems:
//!
//! - proxy a remote audio stream to a local client, preserving
//!   partial-content semantics (`/relay`);
//! - opportunistically persist the stream to disk in the background without
//!   blocking the client response, with single-flight deduplication per
//!   cache key;
//! - transparently fall back to a previously persisted local copy when the
//!   upstream rejects the request with 403 (expired token);
//! - serve persisted files directly by basename (`/local-file`).
//!
//! This crate is composed of several modules:
//! - `server`: `RelayServer` lifecycle (idempotent start/stop, loopback bind).
//! - `relay`: the `/relay` and `/local-file` handlers.
//! - `populate`: `CachePopulator`, the background single-flight cache filler.
//! - `local`: range-aware local file responses.
//! - `range`: `Range` header parsing.
//! - `headers`: pure header-copy and content-type normalization helpers.
//! - `settings`: unified configuration.
//! - `error`: unified error types.
//!
//! This file (`lib.rs`) acts as a facade: it re-exports the main types and
//! functions from the internal modules to form the public API.

mod error;
mod headers;
mod local;
mod populate;
mod range;
mod relay;
mod server;
mod settings;

pub use crate::error::{RelayError, RelayResult};
pub use crate::headers::{
    AUDIO_CACHE_CONTROL, AUDIO_CONTENT_TYPE, copy_upstream_headers, normalize_content_type,
};
pub use crate::local::serve_file;
pub use crate::populate::CachePopulator;
pub use crate::range::{ByteRange, parse_range_header};
pub use crate::server::RelayServer;
pub use crate::settings::{CACHE_SUBDIR, DOWNLOADS_SUBDIR, MEDIA_EXTENSIONS, RelaySettings};
