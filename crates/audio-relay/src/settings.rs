//! Unified configuration for the audio relay.
//!
//! All tunables live in a single flattened [`RelaySettings`] struct with
//! builder-style setters, so construction sites never juggle several config
//! types.
//!
//! Included configuration domains:
//! - server binding (loopback port, base directory for the cache layout)
//! - background population behavior (hard timeout, artifact extension)
//! - upstream impersonation headers (user agent, referer, origin)

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Subdirectory of `base_dir` owned by the cache populator.
pub const CACHE_SUBDIR: &str = "audio_cache";

/// Subdirectory of `base_dir` written by the external download collaborator.
/// This crate only reads from it.
pub const DOWNLOADS_SUBDIR: &str = "downloads";

/// Filename extensions accepted when deriving a local fallback filename from
/// an upstream URL path.
pub const MEDIA_EXTENSIONS: &[&str] = &[".m4s", ".mp4"];

/// Unified settings for the relay server and cache populator.
#[derive(Clone, Debug)]
pub struct RelaySettings {
    /// Loopback TCP port to bind. Use 0 to pick an ephemeral port (tests).
    /// Default: 48100.
    pub port: u16,

    /// Base directory holding `audio_cache/` and `downloads/`.
    pub base_dir: PathBuf,

    /// Hard upper bound on a single background populate attempt, independent
    /// of any inbound request lifetime.
    /// Default: 5 minutes.
    pub populate_timeout: Duration,

    /// Extension (without the dot) for cache artifacts.
    /// Default: "m4s".
    pub cache_extension: String,

    /// `User-Agent` sent upstream.
    pub user_agent: String,

    /// `Referer` sent upstream.
    pub referer: String,

    /// `Origin` sent upstream.
    pub origin: String,
}

impl RelaySettings {
    /// Create settings rooted at `base_dir` with production defaults.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            port: 48100,
            base_dir: base_dir.into(),
            populate_timeout: Duration::from_secs(5 * 60),
            cache_extension: "m4s".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            referer: "https://www.bilibili.com".to_string(),
            origin: "https://www.bilibili.com".to_string(),
        }
    }

    /// Directory holding cache artifacts.
    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join(CACHE_SUBDIR)
    }

    /// Directory holding user-initiated downloads (read-only here).
    pub fn downloads_dir(&self) -> PathBuf {
        self.base_dir.join(DOWNLOADS_SUBDIR)
    }

    // -------------------------
    // Builder-style setters
    // -------------------------

    pub fn port(mut self, v: u16) -> Self {
        self.port = v;
        self
    }

    pub fn populate_timeout(mut self, v: Duration) -> Self {
        self.populate_timeout = v;
        self
    }

    pub fn cache_extension(mut self, v: impl Into<String>) -> Self {
        self.cache_extension = v.into();
        self
    }

    pub fn user_agent(mut self, v: impl Into<String>) -> Self {
        self.user_agent = v.into();
        self
    }

    pub fn referer(mut self, v: impl Into<String>) -> Self {
        self.referer = v.into();
        self
    }

    pub fn origin(mut self, v: impl Into<String>) -> Self {
        self.origin = v.into();
        self
    }
}

/// Returns true if `path` ends with a recognized media extension.
pub(crate) fn has_media_extension(path: &str) -> bool {
    MEDIA_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Returns true if `name` is a plain basename: non-empty, no path separators,
/// and not a traversal component.
pub(crate) fn is_plain_basename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && Path::new(name).file_name().is_some_and(|f| f == name)
}
