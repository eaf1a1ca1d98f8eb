/// Decode/render adapter — a uniform event surface over the two playback
/// paths we support:
///
///   - `Segmented`: playlist-manifest streams (HLS).  The manifest is
///     prefetched and validated with its own short retry loop before mpv is
///     pointed at it, mirroring the tuning a dedicated HLS client would use.
///   - `Progressive`: plain Icecast/Shoutcast-style HTTP audio, handed to
///     mpv directly.
///
/// Every attach is tagged with the session generation; all outcomes surface
/// asynchronously as `(generation, AdapterEvent)` pairs on the engine event
/// channel.  `detach()` aborts the per-attach task before stopping playback,
/// so once it returns no further events are delivered for that attach.
use crate::player::{MpvDriver, MpvEvent, MpvHandle, OBS_CACHE_WAIT, OBS_CORE_IDLE, OBS_ICY_TITLE, OBS_MEDIA_TITLE};
use crate::EngineEvent;
use retune_proto::config::{PlayerConfig, RecoveryConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

// ── taxonomy ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Segmented,
    Progressive,
}

/// Fatal error classification consumed by the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Manifest/segment/connection failure.
    #[error("network failure")]
    Network,
    /// Corrupt or unsupported media.
    #[error("decode failure")]
    Decode,
    /// Authorisation or opaque-response failure (HTTP 401/403 and friends).
    #[error("access denied")]
    Access,
    /// Anything the backend cannot classify.
    #[error("unclassified failure")]
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    BufferingStarted,
    PlaybackStarted,
    /// The backend recovered (or is recovering) on its own; informational.
    RecoverableError(String),
    FatalError(ErrorKind),
    Ended,
    TitleChanged(Option<String>),
    /// The playback engine itself is unusable (e.g. mpv missing).  Not a
    /// stream failure; never counts against the station.
    Unavailable(String),
}

// ── backend seam ──────────────────────────────────────────────────────────────

/// Capability abstraction the engine drives.  The real implementation talks
/// to mpv; tests substitute a scripted one.
pub trait StreamBackend: Send + Sync + 'static {
    /// Decide which playback path a candidate URL needs.  Called once per
    /// candidate; the result is fixed for the attempt.
    fn classify(&self, url: &str) -> impl Future<Output = BackendKind> + Send;

    /// Begin loading/playing.  Returns promptly; outcomes arrive as events
    /// tagged with `generation`.
    fn attach(
        &self,
        generation: u64,
        url: &str,
        kind: BackendKind,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Idempotent teardown.  After it returns, no further events are
    /// delivered for the previous attach.
    fn detach(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Output level, 0..1.
    fn set_level(&self, level: f32) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Read the output level back, if there is anything to read.
    fn level(&self) -> impl Future<Output = anyhow::Result<Option<f32>>> + Send;

    /// Heartbeat probe.
    fn check_liveness(&self) -> impl Future<Output = bool> + Send;

    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

// ── URL classification ────────────────────────────────────────────────────────

/// Extension-based classification.  `None` means the URL alone is not enough
/// and the content type has to be consulted.
pub fn classify_by_url(url: &str) -> Option<BackendKind> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".m3u8") || lower.ends_with(".m3u") {
        return Some(BackendKind::Segmented);
    }
    const PROGRESSIVE_EXTS: [&str; 8] = [
        ".mp3", ".aac", ".ogg", ".oga", ".opus", ".flac", ".m4a", ".wav",
    ];
    if PROGRESSIVE_EXTS.iter().any(|ext| lower.ends_with(ext)) {
        return Some(BackendKind::Progressive);
    }
    None
}

fn is_hls_mime(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("mpegurl")
}

/// Map mpv's end-file error strings onto the policy taxonomy.
pub fn classify_mpv_error(detail: &str) -> ErrorKind {
    let lower = detail.to_ascii_lowercase();
    if lower.contains("403")
        || lower.contains("401")
        || lower.contains("forbidden")
        || lower.contains("unauthorized")
        || lower.contains("access denied")
    {
        ErrorKind::Access
    } else if lower.contains("unsupported")
        || lower.contains("decod")
        || lower.contains("codec")
        || lower.contains("format not")
        || lower.contains("no audio")
    {
        ErrorKind::Decode
    } else if lower.contains("loading failed")
        || lower.contains("network")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connect")
        || lower.contains("resolve")
        || lower.contains("recognized")
    {
        ErrorKind::Network
    } else {
        ErrorKind::Other
    }
}

// ── mpv event mapping ─────────────────────────────────────────────────────────

/// Folds raw mpv events into adapter events.  Small amount of state: mpv
/// pushes initial property values on observe registration and we must not
/// mistake those for transitions.
struct EventMapper {
    started: bool,
    cache_wait: bool,
}

impl EventMapper {
    fn new() -> Self {
        Self {
            started: false,
            cache_wait: false,
        }
    }

    fn map(&mut self, evt: &MpvEvent) -> Vec<AdapterEvent> {
        if let Some((obs_id, data)) = evt.as_property_change() {
            return match obs_id {
                OBS_CORE_IDLE => match data.as_bool() {
                    Some(false) => {
                        self.started = true;
                        vec![AdapterEvent::PlaybackStarted]
                    }
                    Some(true) if self.started => {
                        // Decoder went idle without an end-file: stalled,
                        // mpv keeps the demuxer trying.
                        vec![AdapterEvent::BufferingStarted]
                    }
                    _ => vec![],
                },
                OBS_CACHE_WAIT => {
                    let waiting = data.as_bool().unwrap_or(false);
                    let was = self.cache_wait;
                    self.cache_wait = waiting;
                    if waiting && !was && self.started {
                        vec![AdapterEvent::BufferingStarted]
                    } else if !waiting && was && self.started {
                        vec![AdapterEvent::PlaybackStarted]
                    } else {
                        vec![]
                    }
                }
                OBS_MEDIA_TITLE | OBS_ICY_TITLE => {
                    vec![AdapterEvent::TitleChanged(clean_title(data))]
                }
                _ => vec![],
            };
        }

        match evt.event_name() {
            Some("end-file") => {
                let (reason, error) = evt.end_file_detail();
                match reason {
                    Some("eof") => vec![AdapterEvent::Ended],
                    Some("error") | Some("network") => {
                        let detail = error.unwrap_or("unknown");
                        info!("mpv: end-file error detail='{}'", detail);
                        vec![AdapterEvent::FatalError(classify_mpv_error(detail))]
                    }
                    // "stop"/"quit"/"redirect" are either our own doing or
                    // handled inside mpv.
                    _ => vec![],
                }
            }
            _ => vec![],
        }
    }
}

/// mpv falls back to the URL or an empty string when a stream carries no
/// metadata; treat those as "no title".
fn clean_title(data: &serde_json::Value) -> Option<String> {
    let raw = match data {
        serde_json::Value::String(s) => Some(s.clone()),
        _ => data.as_str().map(|s| s.to_string()),
    }?;
    let trimmed = raw.trim().trim_matches('-').trim();
    if trimmed.is_empty() || trimmed.contains("://") {
        None
    } else {
        Some(raw.trim().to_string())
    }
}

// ── mpv backend ───────────────────────────────────────────────────────────────

pub struct MpvBackend {
    driver: Arc<Mutex<MpvDriver>>,
    handle: Arc<Mutex<Option<MpvHandle>>>,
    /// Fan-out of raw mpv events; the per-attach task subscribes here.
    mpv_events: broadcast::Sender<MpvEvent>,
    /// The live attach task, if any.  Aborted on detach.
    attach_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    events: mpsc::Sender<EngineEvent>,
    http: reqwest::Client,
    recovery: RecoveryConfig,
}

impl MpvBackend {
    pub fn new(
        player: PlayerConfig,
        recovery: RecoveryConfig,
        events: mpsc::Sender<EngineEvent>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        let (mpv_events, _) = broadcast::channel(64);
        Ok(Self {
            driver: Arc::new(Mutex::new(MpvDriver::new(player))),
            handle: Arc::new(Mutex::new(None)),
            mpv_events,
            attach_task: Arc::new(Mutex::new(None)),
            events,
            http,
            recovery,
        })
    }

    /// Get a usable mpv handle, connecting or spawning as needed.  On a fresh
    /// connection, registers property observations and a forwarder that feeds
    /// the raw event fan-out.
    async fn ensure_handle(
        driver: &Arc<Mutex<MpvDriver>>,
        slot: &Arc<Mutex<Option<MpvHandle>>>,
        fanout: &broadcast::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let mut driver = driver.lock().await;

        if let Some(h) = slot.lock().await.clone() {
            let usable = if driver.owns_process() {
                driver.process_alive()
            } else {
                h.ping().await.is_ok()
            };
            if usable {
                return Ok(h);
            }
            debug!("mpv: previous connection unusable, reconnecting");
        }

        // One forwarder per connection; it exits when the reader task drops
        // the sender.
        let (tx, mut rx) = mpsc::channel::<MpvEvent>(64);
        let fan = fanout.clone();
        tokio::spawn(async move {
            while let Some(evt) = rx.recv().await {
                let _ = fan.send(evt);
            }
        });

        let handle = match driver.try_reconnect(tx.clone()).await {
            Some(h) => h,
            None => driver.spawn_and_connect(tx).await?,
        };
        handle.observe_playback_properties().await;
        *slot.lock().await = Some(handle.clone());
        Ok(handle)
    }

    /// Fetch and validate an HLS manifest before mpv is pointed at it.
    /// Transient failures are retried internally; the error returned here is
    /// already classified for the policy.
    async fn prefetch_manifest(
        http: &reqwest::Client,
        url: &str,
        timeout: Duration,
        retries: u32,
        generation: u64,
        sink: &mpsc::Sender<EngineEvent>,
    ) -> Result<(), ErrorKind> {
        let mut last_err = String::new();
        for attempt in 0..=retries {
            if attempt > 0 {
                let _ = sink
                    .send(EngineEvent::Backend {
                        generation,
                        event: AdapterEvent::RecoverableError(format!(
                            "manifest fetch retry {}/{}: {}",
                            attempt, retries, last_err
                        )),
                    })
                    .await;
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }

            let resp = match http.get(url).timeout(timeout).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = e.to_string();
                    continue;
                }
            };

            let status = resp.status();
            if status.as_u16() == 401 || status.as_u16() == 403 || status.as_u16() == 451 {
                warn!("manifest fetch denied ({}) for {}", status, url);
                return Err(ErrorKind::Access);
            }
            if status.is_client_error() {
                warn!("manifest fetch failed ({}) for {}", status, url);
                return Err(ErrorKind::Network);
            }
            if !status.is_success() {
                last_err = format!("HTTP {}", status);
                continue;
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if is_hls_mime(&content_type) {
                return Ok(());
            }

            // Peek at the first chunk only; this endpoint could be an
            // endless progressive stream that was mis-labelled.
            let mut resp = resp;
            match resp.chunk().await {
                Ok(Some(bytes)) => {
                    let head = String::from_utf8_lossy(&bytes);
                    if head.trim_start_matches('\u{feff}').trim_start().starts_with("#EXTM3U") {
                        return Ok(());
                    }
                    warn!("manifest at {} is not HLS (content-type '{}')", url, content_type);
                    return Err(ErrorKind::Decode);
                }
                Ok(None) => {
                    last_err = "empty manifest response".to_string();
                    continue;
                }
                Err(e) => {
                    last_err = e.to_string();
                    continue;
                }
            }
        }
        warn!("manifest fetch exhausted retries for {}: {}", url, last_err);
        Err(ErrorKind::Network)
    }
}

impl StreamBackend for MpvBackend {
    async fn classify(&self, url: &str) -> BackendKind {
        if let Some(kind) = classify_by_url(url) {
            return kind;
        }
        // Extension was inconclusive; ask the server.
        match self
            .http
            .head(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => {
                let ct = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                if is_hls_mime(ct) {
                    BackendKind::Segmented
                } else {
                    BackendKind::Progressive
                }
            }
            Err(e) => {
                debug!("content-type probe failed for {}: {}", url, e);
                BackendKind::Progressive
            }
        }
    }

    async fn attach(&self, generation: u64, url: &str, kind: BackendKind) -> anyhow::Result<()> {
        // The session manager detaches before re-attaching, but stay
        // idempotent if a task is somehow still around.
        if let Some(task) = self.attach_task.lock().await.take() {
            task.abort();
        }

        let driver = Arc::clone(&self.driver);
        let slot = Arc::clone(&self.handle);
        let fanout = self.mpv_events.clone();
        let sink = self.events.clone();
        let http = self.http.clone();
        let url = url.to_string();
        let timeout = Duration::from_secs(self.recovery.manifest_timeout_secs);
        let retries = self.recovery.manifest_retries;

        let task = tokio::spawn(async move {
            // Subscribe before loading so no transition is missed.
            let mut rx = fanout.subscribe();

            if kind == BackendKind::Segmented {
                if let Err(kind) =
                    Self::prefetch_manifest(&http, &url, timeout, retries, generation, &sink).await
                {
                    let _ = sink
                        .send(EngineEvent::Backend {
                            generation,
                            event: AdapterEvent::FatalError(kind),
                        })
                        .await;
                    return;
                }
            }

            let handle = match Self::ensure_handle(&driver, &slot, &fanout).await {
                Ok(h) => h,
                Err(e) => {
                    let _ = sink
                        .send(EngineEvent::Backend {
                            generation,
                            event: AdapterEvent::Unavailable(e.to_string()),
                        })
                        .await;
                    return;
                }
            };

            if let Err(e) = handle.load(&url).await {
                let _ = sink
                    .send(EngineEvent::Backend {
                        generation,
                        event: AdapterEvent::FatalError(classify_mpv_error(&e.to_string())),
                    })
                    .await;
                return;
            }
            debug!("mpv: loading gen={} url={}", generation, url);

            let mut mapper = EventMapper::new();
            loop {
                match rx.recv().await {
                    Ok(evt) => {
                        for out in mapper.map(&evt) {
                            if sink
                                .send(EngineEvent::Backend {
                                    generation,
                                    event: out,
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("mpv event watcher lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        *self.attach_task.lock().await = Some(task);
        Ok(())
    }

    async fn detach(&self) -> anyhow::Result<()> {
        // Abort the watcher first: no events may be delivered after detach.
        if let Some(task) = self.attach_task.lock().await.take() {
            task.abort();
        }
        let handle = self.handle.lock().await.clone();
        if let Some(h) = handle {
            let _ = h.stop().await;
        }
        Ok(())
    }

    async fn set_level(&self, level: f32) -> anyhow::Result<()> {
        let handle = self.handle.lock().await.clone();
        if let Some(h) = handle {
            h.set_volume(level.clamp(0.0, 1.0)).await?;
        }
        Ok(())
    }

    async fn level(&self) -> anyhow::Result<Option<f32>> {
        let handle = self.handle.lock().await.clone();
        match handle {
            Some(h) => Ok(Some(h.get_volume().await?)),
            None => Ok(None),
        }
    }

    async fn check_liveness(&self) -> bool {
        let mut driver = self.driver.lock().await;
        if driver.owns_process() {
            return driver.process_alive();
        }
        drop(driver);
        let handle = self.handle.lock().await.clone();
        match handle {
            Some(h) => h.ping().await.is_ok(),
            None => true,
        }
    }

    async fn shutdown(&self) {
        if let Some(task) = self.attach_task.lock().await.take() {
            task.abort();
        }
        let handle = self.handle.lock().await.take();
        if let Some(h) = handle {
            let _ = h.stop().await;
        }
        self.driver.lock().await.kill().await;
    }
}
