//! Background cache population.
//!
//! [`CachePopulator::ensure_cached`] opportunistically persists a remote audio
//! stream to the cache directory without blocking any client-facing response.
//!
//! Guarantees:
//! - **Single-flight**: at most one populate attempt per cache key is in
//!   flight at any instant, enforced by an instance-owned in-flight set (not
//!   by filesystem locking). The key is removed as the terminal step of every
//!   attempt, which is the only way a later request can retry.
//! - **Atomicity**: bytes are written to `<artifact>.part` and promoted via an
//!   atomic rename. Readers either see nothing or a complete artifact; a
//!   failed attempt deletes the part file before releasing the key.
//! - **Best-effort**: every failure (request build, network, non-200 status,
//!   create, copy, sync, rename) abandons the attempt with a debug log and is
//!   never surfaced to a caller.
//!
//! Each attempt carries its own hard timeout and is decoupled from the
//! triggering request: the upstream resource may be fetched twice in parallel
//! (once by the live relay, once here). That double-fetch is deliberate; it
//! keeps the client path free of any cache-fill latency.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderValue};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::error::{RelayError, RelayResult};
use crate::settings::{RelaySettings, is_plain_basename};

/// Best-effort background populator for the audio cache directory.
///
/// Cheap to clone; clones share the in-flight set and task tracker.
#[derive(Clone, Debug)]
pub struct CachePopulator {
    client: reqwest::Client,
    cache_dir: PathBuf,
    extension: String,
    fetch_timeout: Duration,
    headers: HeaderMap,
    in_flight: Arc<Mutex<HashSet<String>>>,
    tracker: TaskTracker,
}

impl CachePopulator {
    /// Create a populator writing into the cache directory of `settings`.
    pub fn new(client: reqwest::Client, settings: &RelaySettings) -> Self {
        Self {
            client,
            cache_dir: settings.cache_dir(),
            extension: settings.cache_extension.clone(),
            fetch_timeout: settings.populate_timeout,
            headers: impersonation_headers(settings),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Final artifact path for `key`.
    pub fn artifact_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", key, self.extension))
    }

    /// Returns true if a populate attempt for `key` is currently in flight.
    pub async fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().await.contains(key)
    }

    /// Trigger a background populate attempt for `key` from `url`.
    ///
    /// No-op when the key is empty or unsafe as a filename, when the artifact
    /// already exists, or when an attempt for the key is already in flight.
    /// Returns quickly in every case; the fetch itself runs detached.
    pub async fn ensure_cached(&self, url: &str, key: &str) {
        if key.is_empty() {
            return;
        }
        if !is_plain_basename(key) {
            debug!("populate: unsafe key rejected key='{}'", key);
            return;
        }

        let final_path = self.artifact_path(key);
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            return;
        }

        // Read-test-and-insert is a single critical section; the matching
        // removal in the spawned task is the only release point.
        {
            let mut guard = self.in_flight.lock().await;
            if !guard.insert(key.to_string()) {
                debug!("populate: already in flight key='{}'", key);
                return;
            }
        }

        let attempt = PopulateAttempt {
            client: self.client.clone(),
            url: url.to_string(),
            key: key.to_string(),
            cache_dir: self.cache_dir.clone(),
            final_path,
            headers: self.headers.clone(),
        };
        let fetch_timeout = self.fetch_timeout;
        let in_flight = Arc::clone(&self.in_flight);

        self.tracker.spawn(async move {
            let key = attempt.key.clone();
            let part_path = attempt.part_path();

            match timeout(fetch_timeout, attempt.run()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("populate: attempt failed key='{}' err='{}'", key, e);
                    let _ = tokio::fs::remove_file(&part_path).await;
                }
                Err(_) => {
                    debug!("populate: attempt timed out key='{}'", key);
                    let _ = tokio::fs::remove_file(&part_path).await;
                }
            }

            in_flight.lock().await.remove(&key);
        });
    }

    /// Stop accepting new attempts and wait for in-flight ones to finish.
    ///
    /// Intended for deterministic test teardown; production shutdown simply
    /// abandons detached attempts.
    pub async fn close_and_wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

struct PopulateAttempt {
    client: reqwest::Client,
    url: String,
    key: String,
    cache_dir: PathBuf,
    final_path: PathBuf,
    headers: HeaderMap,
}

impl PopulateAttempt {
    fn part_path(&self) -> PathBuf {
        let mut os = self.final_path.clone().into_os_string();
        os.push(".part");
        PathBuf::from(os)
    }

    async fn run(&self) -> RelayResult<()> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        // Full non-ranged GET so a success always captures the complete
        // resource.
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| RelayError::UpstreamUnreachable(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            // A 206 reply would be an incomplete resource; never cache it.
            return Err(RelayError::HttpError {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }

        let part_path = self.part_path();
        // A crashed earlier process may have left a stale part file behind.
        let _ = tokio::fs::remove_file(&part_path).await;

        let mut file = tokio::fs::File::create(&part_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RelayError::UpstreamUnreachable(e.to_string()))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&part_path, &self.final_path).await?;
        debug!(
            "populate: cached key='{}' path='{}'",
            self.key,
            self.final_path.display()
        );
        Ok(())
    }
}

/// Headers sent with the populate fetch, matching the source site's
/// expectations for a direct media request.
fn impersonation_headers(settings: &RelaySettings) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, header::USER_AGENT, &settings.user_agent);
    insert_header(&mut headers, header::REFERER, &settings.referer);
    insert_header(&mut headers, header::ORIGIN, &settings.origin);
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    headers
}

fn insert_header(headers: &mut HeaderMap, name: reqwest::header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Fallback search over the cache and downloads directories, in that order.
///
/// Shared by the relay's 403 fallback and the `/local-file` endpoint.
pub(crate) async fn resolve_local(
    cache_dir: &Path,
    downloads_dir: &Path,
    filename: &str,
) -> Option<PathBuf> {
    for dir in [cache_dir, downloads_dir] {
        let candidate = dir.join(filename);
        let is_file = tokio::fs::metadata(&candidate)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if is_file {
            return Some(candidate);
        }
    }
    None
}
