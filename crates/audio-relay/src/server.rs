//! Relay server lifecycle.
//!
//! Binds a loopback-only listener, registers the two relay routes, and serves
//! them on a background task. `start` and `stop` are both idempotent and may
//! be alternated freely; the running state lives in a lock-guarded slot owned
//! by the instance (no process-wide singletons, so test servers never
//! interfere with each other).

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{RelayError, RelayResult};
use crate::populate::CachePopulator;
use crate::relay::{RelayState, handle_local, handle_relay};
use crate::settings::RelaySettings;

/// How long `stop` lets idle connections drain before forcing the close.
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(100);

/// Loopback HTTP relay for remote audio streams.
pub struct RelayServer {
    settings: Arc<RelaySettings>,
    client: reqwest::Client,
    populator: CachePopulator,
    running: Mutex<Option<RunningServer>>,
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayServer {
    /// Create a stopped server from `settings`.
    ///
    /// The HTTP client is shared between the live relay and the populator; it
    /// carries no global timeout (the relay streams indefinitely, and the
    /// populator enforces its own deadline).
    pub fn new(settings: RelaySettings) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::msg(format!("failed to build HTTP client: {e}")))?;
        let populator = CachePopulator::new(client.clone(), &settings);
        Ok(Self {
            settings: Arc::new(settings),
            client,
            populator,
            running: Mutex::new(None),
        })
    }

    /// Start serving. Idempotent: a second call while running returns the
    /// already-bound address. The listener binds to loopback only.
    pub async fn start(&self) -> RelayResult<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            return Ok(server.local_addr);
        }

        let state = RelayState {
            client: self.client.clone(),
            populator: self.populator.clone(),
            settings: Arc::clone(&self.settings),
        };
        let router = Router::new()
            .route("/relay", get(handle_relay).options(handle_relay))
            .route("/local-file", get(handle_local).options(handle_local))
            .with_state(state);

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.settings.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
            {
                error!("relay server exited: {e}");
            }
        });

        debug!("relay: serving addr={}", local_addr);
        *running = Some(RunningServer {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop serving. Idempotent; `start` may be called again afterwards.
    ///
    /// Closes the listener and active connections: idle connections get a
    /// short drain window, then anything still streaming is torn down, so
    /// `stop` returns promptly even with a client mid-stream.
    ///
    /// In-flight populate attempts are detached by design and keep running;
    /// use [`CachePopulator::close_and_wait`] via [`Self::populator`] when a
    /// test needs deterministic draining.
    pub async fn stop(&self) {
        let Some(mut server) = self.running.lock().await.take() else {
            return;
        };
        server.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_DRAIN, &mut server.task)
            .await
            .is_err()
        {
            server.task.abort();
            let _ = server.task.await;
        }
        debug!("relay: stopped addr={}", server.local_addr);
    }

    /// Returns true while the server is bound and serving.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bound address, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|s| s.local_addr)
    }

    /// The populator backing `/relay`'s `sid` handling.
    pub fn populator(&self) -> &CachePopulator {
        &self.populator
    }

    /// Client-facing relay URL for an upstream audio URL.
    pub async fn relay_url_for(&self, upstream_url: &str) -> Option<String> {
        let addr = self.local_addr().await?;
        let encoded: String = url::form_urlencoded::byte_serialize(upstream_url.as_bytes())
            .collect();
        Some(format!("http://{}/relay?u={}", addr, encoded))
    }

    /// Client-facing URL for a persisted local file.
    pub async fn local_url_for(&self, filename: &str) -> Option<String> {
        let addr = self.local_addr().await?;
        let encoded: String = url::form_urlencoded::byte_serialize(filename.as_bytes()).collect();
        Some(format!("http://{}/local-file?f={}", addr, encoded))
    }
}
