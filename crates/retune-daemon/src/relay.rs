/// Local HTTP relay for access-restricted streams.
///
/// Serves `GET /relay/:generation` on a local port (default 9923).  When the
/// recovery policy escalates a candidate to the relay rung, the engine
/// registers the upstream URL under the attempt's generation and hands the
/// backend `http://127.0.0.1:9923/relay/<generation>` instead.  The relay
/// opens **one** upstream HTTP connection and streams the bytes straight
/// through, forwarding the response headers (Content-Type, ICY-*,
/// Transfer-Encoding) so the player sees the stream exactly as if it had
/// connected directly — minus whatever Referer/Origin checks the upstream
/// applies to player connections.
///
/// Design notes
/// ─────────────
/// • Entries are keyed by generation, never by station: a superseded attempt
///   must not be resurrectable through a stale relay URL.  The engine
///   unregisters the old generation before starting a new attempt.
/// • Upstream failure statuses are forwarded as-is (except transport errors,
///   which become 502) so a still-refusing upstream classifies the same
///   through the relay as it did directly.
/// • The relay re-uses one `reqwest::Client` so TLS sessions are shared.
use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

// ── Shared state ──────────────────────────────────────────────────────────────

/// Relay server state — the generation→upstream registry plus a persistent
/// HTTP client.
#[derive(Clone)]
pub struct StreamRelay {
    registry: Arc<RwLock<HashMap<u64, String>>>,
    client: Client,
}

impl StreamRelay {
    pub fn new() -> Self {
        let client = Client::builder()
            // Follow redirects (common for HLS playlists and Icecast streams)
            .redirect(reqwest::redirect::Policy::limited(10))
            // Send ICY metadata request header — many Icecast servers require this
            .default_headers({
                let mut h = reqwest::header::HeaderMap::new();
                h.insert(
                    "Icy-MetaData",
                    reqwest::header::HeaderValue::from_static("1"),
                );
                h
            })
            .build()
            .expect("failed to build reqwest client for relay");

        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            client,
        }
    }

    /// Make `generation` fetchable through the relay.
    pub async fn register(&self, generation: u64, upstream: String) {
        self.registry.write().await.insert(generation, upstream);
    }

    /// Drop a generation's mapping.  Safe to call for generations that were
    /// never registered.
    pub async fn unregister(&self, generation: u64) {
        self.registry.write().await.remove(&generation);
    }

    pub async fn upstream_of(&self, generation: u64) -> Option<String> {
        self.registry.read().await.get(&generation).cloned()
    }
}

impl Default for StreamRelay {
    fn default() -> Self {
        Self::new()
    }
}

// ── Route handler ─────────────────────────────────────────────────────────────

async fn stream_relay(
    Path(generation): Path<u64>,
    State(relay): State<StreamRelay>,
) -> impl IntoResponse {
    let url = match relay.upstream_of(generation).await {
        Some(u) => u,
        None => {
            // Either a stale player connection or a typo; the engine removed
            // the mapping when the attempt ended.
            warn!("relay: no upstream registered for generation {generation}");
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .unwrap();
        }
    };

    info!("relay: opening upstream for generation {generation} → {url}");

    let upstream = match relay.client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            warn!("relay: upstream connect failed for generation {generation}: {e}");
            return Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Body::empty())
                .unwrap();
        }
    };

    let upstream_status = upstream.status();
    if !upstream_status.is_success() {
        warn!("relay: upstream returned {upstream_status} for generation {generation}");
        return Response::builder()
            .status(
                StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            )
            .body(Body::empty())
            .unwrap();
    }

    // Forward relevant headers to the player
    let mut builder = Response::builder().status(200);
    for (name, value) in upstream.headers() {
        let name_str = name.as_str();
        // Forward content-type and all ICY headers; skip hop-by-hop headers
        if name_str.starts_with("icy-")
            || name_str == "content-type"
            || name_str == "transfer-encoding"
        {
            if let Ok(hv) = axum::http::HeaderValue::from_bytes(value.as_bytes()) {
                builder = builder.header(name_str, hv);
            }
        }
    }

    // Stream bytes from upstream directly to the player
    let byte_stream = upstream.bytes_stream();
    let reader = tokio_util::io::StreamReader::new(
        byte_stream.map(|result| result.map_err(std::io::Error::other)),
    );
    let axum_stream = ReaderStream::new(reader);
    let body = Body::from_stream(axum_stream);

    builder.body(body).unwrap()
}

// ── Server startup ────────────────────────────────────────────────────────────

pub fn start_server(
    bind_address: String,
    port: u16,
    relay: StreamRelay,
) -> tokio::task::JoinHandle<()> {
    let app = Router::new()
        .route("/relay/:generation", get(stream_relay))
        .with_state(relay);

    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        info!("Stream relay listening on http://{}", addr);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to bind stream relay on {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Stream relay error: {}", e);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_maps_generations_independently() {
        let relay = StreamRelay::new();
        relay.register(3, "https://a.example/s".to_string()).await;
        relay.register(4, "https://b.example/s".to_string()).await;

        assert_eq!(
            relay.upstream_of(3).await.as_deref(),
            Some("https://a.example/s")
        );
        assert_eq!(
            relay.upstream_of(4).await.as_deref(),
            Some("https://b.example/s")
        );
        assert_eq!(relay.upstream_of(5).await, None);
    }

    #[tokio::test]
    async fn unregister_removes_only_the_named_generation() {
        let relay = StreamRelay::new();
        relay.register(7, "https://a.example/s".to_string()).await;
        relay.register(8, "https://b.example/s".to_string()).await;

        relay.unregister(7).await;
        relay.unregister(99).await; // never registered

        assert_eq!(relay.upstream_of(7).await, None);
        assert_eq!(
            relay.upstream_of(8).await.as_deref(),
            Some("https://b.example/s")
        );
    }
}
