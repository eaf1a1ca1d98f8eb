/// The engine loop — single owner of the backend, the session lifecycle,
/// and the recovery ladder.
///
/// ```text
///   socket ──┐
///   http   ──┤                      ┌── StateManager (shared snapshots)
///   backend ─┼─► mpsc ─► EngineCore ┼── StreamBackend (exclusive)
///   timers ──┤                      ├── StreamRelay registry
///   fades  ──┘                      └── broadcast (StateUpdated / Log)
/// ```
///
/// Every event carries enough identity (generation, fade id) for the loop to
/// drop it if it arrives late: a superseded attempt's error must not restart
/// a station the user already left, and a cancelled fade's step must not
/// move the volume.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use retune_proto::config::Config;
use retune_proto::platform;
use retune_proto::protocol::{Command, PlaybackStatus, RecoveryInfo};
use retune_proto::state::StateManager;
use retune_proto::station::Station;

use crate::adapter::{AdapterEvent, BackendKind, ErrorKind, StreamBackend};
use crate::fader::{self, FadeHandle, FadeKind};
use crate::policy::{self, Decision};
use crate::relay::StreamRelay;
use crate::resolver;
use crate::session::{Attempt, SessionManager};
use crate::{BroadcastMessage, EngineEvent};

const HEARTBEAT_SECS: u64 = 10;

pub struct EngineCore<B: StreamBackend> {
    config: Config,
    state: Arc<StateManager>,
    backend: B,
    relay: StreamRelay,
    session: SessionManager,
    event_tx: mpsc::Sender<EngineEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    /// The one fade allowed to touch the level right now.
    fade: Option<FadeHandle>,
    next_fade_id: u64,
    /// Probed on first playback confirm; `None` until then.
    fades_supported: Option<bool>,
    /// Fade id of a ramp-out that finishes a user stop.
    pending_stop: Option<u64>,
    /// Generation whose ramp-in already ran; a cache-stall resume within the
    /// same attempt must not ramp again.
    ramped_generation: Option<u64>,
}

impl<B: StreamBackend> EngineCore<B> {
    pub fn new(
        config: Config,
        state: Arc<StateManager>,
        backend: B,
        relay: StreamRelay,
        event_tx: mpsc::Sender<EngineEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        Self {
            config,
            state,
            backend,
            relay,
            session: SessionManager::new(),
            event_tx,
            broadcast_tx,
            fade: None,
            next_fade_id: 0,
            fades_supported: None,
            pending_stop: None,
            ramped_generation: None,
        }
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    // ── event loop ────────────────────────────────────────────────────────────

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<EngineEvent>) -> Result<()> {
        let heartbeat_tx = self.event_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(HEARTBEAT_SECS));
            interval.tick().await; // the immediate first tick
            loop {
                interval.tick().await;
                if heartbeat_tx.send(EngineEvent::Heartbeat).await.is_err() {
                    break;
                }
            }
        });

        while let Some(event) = event_rx.recv().await {
            match event {
                EngineEvent::Command(cmd) => self.handle_command(cmd).await,
                EngineEvent::Backend { generation, event } => {
                    self.handle_backend(generation, event).await
                }
                EngineEvent::RetryElapsed { generation } => {
                    self.handle_retry_elapsed(generation).await
                }
                EngineEvent::FadeStep {
                    fade_id,
                    level,
                    last,
                } => self.handle_fade_step(fade_id, level, last).await,
                EngineEvent::Heartbeat => self.handle_heartbeat().await,
                EngineEvent::Shutdown => break,
            }
        }

        heartbeat.abort();
        self.cleanup().await;
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Play { station_idx } => self.play(station_idx).await,
            Command::Stop => self.stop().await,
            Command::Next => self.next().await,
            Command::Prev => self.prev().await,
            Command::Random => self.random().await,
            Command::Retry { station_idx } => self.retry(station_idx).await,
            Command::Volume { value } => self.set_volume(value).await,
            Command::Mute { muted } => self.set_muted(muted).await,
            // The socket answers GetState directly; nudging a broadcast here
            // resyncs everyone else too.
            Command::GetState => self.broadcast_state(),
        }
    }

    // ── user commands ─────────────────────────────────────────────────────────

    async fn play(&mut self, idx: usize) {
        let Some(station) = self.state.station(idx).await else {
            warn!("play: station index {idx} out of range");
            return;
        };
        if self.state.is_unplayable(&station.id).await {
            // Only an explicit retry clears the mark.
            warn!("play: station {} is marked unplayable, ignoring", station.id);
            return;
        }
        self.start_station(idx).await;
    }

    async fn stop(&mut self) {
        let status = self.state.get_state().await.playback_status;
        if status == PlaybackStatus::Idle {
            return; // already stopped
        }
        if status == PlaybackStatus::Playing && self.fades_supported == Some(true) {
            if self.pending_stop.is_some() {
                return; // ramp-out already running
            }
            self.cancel_fade();
            // Ramp down from wherever the output actually is; a stop landing
            // mid ramp-in must not jump up to the full target first.
            let from = match self.backend.level().await {
                Ok(Some(level)) => level,
                _ => self.effective_level().await,
            };
            if from > 0.0 {
                let id = self.allocate_fade_id();
                self.fade = Some(fader::spawn_fade(
                    id,
                    FadeKind::RampOut,
                    from,
                    0.0,
                    self.event_tx.clone(),
                ));
                self.pending_stop = Some(id);
                return;
            }
        }
        // Buffering, Error and silent playback stop at once.
        self.finish_stop().await;
    }

    async fn next(&mut self) {
        match self.state.pick_next().await {
            Some(idx) => self.start_station(idx).await,
            None => warn!("next: no playable stations"),
        }
    }

    async fn prev(&mut self) {
        match self.state.pick_prev().await {
            Some(idx) => self.start_station(idx).await,
            None => warn!("prev: no playable stations"),
        }
    }

    async fn random(&mut self) {
        let playable = self.state.playable_indices().await;
        if playable.is_empty() {
            warn!("random: no playable stations");
            return;
        }
        let idx = playable[rand::thread_rng().gen_range(0..playable.len())];
        self.start_station(idx).await;
    }

    async fn retry(&mut self, idx: usize) {
        let Some(station) = self.state.station(idx).await else {
            warn!("retry: station index {idx} out of range");
            return;
        };
        match self.state.clear_unplayable(&station.id).await {
            Ok(true) => info!(station = %station.id, "cleared unplayable mark"),
            Ok(false) => {}
            Err(err) => warn!("state save failed: {err:#}"),
        }
        self.start_station(idx).await;
    }

    async fn set_volume(&mut self, value: f32) {
        // A manual volume change always wins over a running fade.  If the
        // fade was a stop ramp, the stop is abandoned and playback continues
        // at the new level.
        self.cancel_fade();
        self.pending_stop = None;
        if let Err(err) = self.state.set_volume(value).await {
            warn!("state save failed: {err:#}");
        }
        if self.state.get_state().await.playback_status == PlaybackStatus::Playing {
            self.apply_level().await;
        }
        self.broadcast_state();
    }

    async fn set_muted(&mut self, muted: bool) {
        self.cancel_fade();
        self.pending_stop = None;
        if let Err(err) = self.state.set_muted(muted).await {
            warn!("state save failed: {err:#}");
        }
        if self.state.get_state().await.playback_status == PlaybackStatus::Playing {
            self.apply_level().await;
        }
        self.broadcast_state();
    }

    // ── backend events ────────────────────────────────────────────────────────

    async fn handle_backend(&mut self, generation: u64, event: AdapterEvent) {
        if !self.session.is_live(generation) {
            debug!(gen = generation, "discarding event from superseded attempt");
            return;
        }
        match event {
            AdapterEvent::BufferingStarted => {
                if self.state.get_state().await.playback_status == PlaybackStatus::Playing {
                    self.state.set_rebuffering().await;
                    self.broadcast_state();
                }
            }
            AdapterEvent::PlaybackStarted => self.confirm_playback(generation).await,
            AdapterEvent::RecoverableError(detail) => {
                debug!(gen = generation, "recoverable backend error: {detail}");
            }
            AdapterEvent::FatalError(kind) => self.handle_fatal(generation, kind).await,
            AdapterEvent::Ended => self.handle_ended().await,
            AdapterEvent::TitleChanged(title) => {
                self.state.set_now_playing(title).await;
                self.broadcast_state();
            }
            AdapterEvent::Unavailable(detail) => {
                // Infrastructure failure, not the station's fault; surface an
                // error without touching the unplayable set.
                warn!("backend unavailable: {detail}");
                self.teardown_attempt().await;
                self.state.set_error().await;
                self.broadcast_state();
            }
        }
    }

    async fn confirm_playback(&mut self, generation: u64) {
        self.state.set_playing().await;

        // First confirm of this attempt ramps the level in; a resume after a
        // cache stall is already at level.
        if self.ramped_generation != Some(generation) {
            self.ramped_generation = Some(generation);
            let target = self.effective_level().await;
            if self.probe_fades().await && target > 0.0 {
                self.cancel_fade();
                let _ = self.backend.set_level(0.0).await;
                let id = self.allocate_fade_id();
                self.fade = Some(fader::spawn_fade(
                    id,
                    FadeKind::RampIn,
                    0.0,
                    target,
                    self.event_tx.clone(),
                ));
            } else {
                let _ = self.backend.set_level(target).await;
            }
        }
        self.broadcast_state();
    }

    async fn handle_fatal(&mut self, generation: u64, kind: ErrorKind) {
        let Some(attempt) = self.session.current().cloned() else {
            return;
        };
        debug_assert_eq!(attempt.generation, generation);
        if self.pending_stop.is_some() {
            // The user was already stopping; the ramp-out just lost its
            // pipeline.  Finish the stop instead of recovering.
            self.finish_stop().await;
            return;
        }
        let Some(station) = self.state.station(attempt.station_idx).await else {
            return;
        };

        // The failed pipeline goes silent at once; fades are for starts and
        // user stops only.
        self.cancel_fade();
        self.pending_stop = None;
        self.ramped_generation = None;
        if let Err(err) = self.backend.detach().await {
            debug!("backend detach: {err:#}");
        }
        let _ = self.backend.set_level(0.0).await;
        self.relay.unregister(generation).await;

        let decision = policy::decide(&self.config.recovery, &station, &attempt, kind);
        info!(
            station = %station.id,
            gen = generation,
            %kind,
            ?decision,
            "fatal backend error"
        );

        let Some(next) = policy::apply(&attempt, &decision, self.session.allocate()) else {
            self.give_up(&station).await;
            return;
        };

        if let Some(step) = policy::step_of(&decision) {
            // Rungs run silently under Buffering, whatever status the dead
            // attempt had reached before it failed.
            self.state.set_rebuffering().await;
            self.state
                .set_recovery(Some(RecoveryInfo {
                    step,
                    retry_count: next.retry_count,
                    candidate_index: next.candidate_index,
                    using_fallback: next.using_fallback,
                }))
                .await;
            self.broadcast_state();
        }

        if let Decision::Retry { delay } = decision {
            // The waiting generation is live immediately; whatever the dead
            // pipeline still emits during the backoff is discarded.
            let generation = next.generation;
            self.session.adopt(next);
            let tx = self.event_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(EngineEvent::RetryElapsed { generation }).await;
            });
        } else {
            self.start_attempt(next).await;
        }
    }

    async fn handle_ended(&mut self) {
        if self.pending_stop.is_some() {
            self.finish_stop().await;
            return;
        }
        // Natural end of stream (some webcasts do end); move along the dial.
        info!("stream ended, advancing to the next playable station");
        match self.state.pick_next().await {
            Some(idx) => self.start_station(idx).await,
            None => self.finish_stop().await,
        }
    }

    async fn handle_retry_elapsed(&mut self, generation: u64) {
        if !self.session.is_live(generation) {
            return; // the user moved on during the backoff
        }
        let Some(attempt) = self.session.current().cloned() else {
            return;
        };
        self.start_attempt(attempt).await;
    }

    async fn handle_fade_step(&mut self, fade_id: u64, level: f32, last: bool) {
        if self.fade.as_ref().map(|f| f.id) != Some(fade_id) {
            return; // stale step from a cancelled fade
        }
        let _ = self.backend.set_level(level).await;
        if last {
            self.fade = None;
            if self.pending_stop == Some(fade_id) {
                self.pending_stop = None;
                self.finish_stop().await;
            }
        }
    }

    async fn handle_heartbeat(&mut self) {
        let Some(attempt) = self.session.current() else {
            return;
        };
        let generation = attempt.generation;
        if self.backend.check_liveness().await {
            return;
        }
        warn!(
            gen = generation,
            "backend liveness check failed, treating as network error"
        );
        self.handle_fatal(generation, ErrorKind::Network).await;
    }

    // ── attempt lifecycle ─────────────────────────────────────────────────────

    /// Start a brand-new attempt chain for a station the user picked.
    async fn start_station(&mut self, idx: usize) {
        self.teardown_attempt().await;
        if let Err(err) = self.state.set_buffering(idx).await {
            warn!("state save failed: {err:#}");
        }
        self.broadcast_state();
        let attempt = self.session.begin(idx);
        self.start_attempt(attempt).await;
    }

    /// Resolve and attach one attempt.  Shared by fresh starts, ladder
    /// escalations and elapsed retries.
    async fn start_attempt(&mut self, mut attempt: Attempt) {
        let Some(station) = self.state.station(attempt.station_idx).await else {
            warn!(
                "attempt references station {} which no longer exists",
                attempt.station_idx
            );
            self.finish_stop().await;
            return;
        };

        // Classification sticks for the candidate; escalations that change
        // the URL cleared it in `policy::apply`.
        if attempt.backend_kind.is_none() {
            if let Some(base) = resolver::current_base(&station, &attempt) {
                attempt.backend_kind = Some(self.backend.classify(base).await);
            }
        }

        let relay_base = platform::relay_base(self.config.relay.port);
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let Some(resolved) = resolver::resolve(&station, &attempt, &relay_base, now_ms) else {
            warn!("station {} has no usable URL", station.id);
            self.give_up(&station).await;
            return;
        };

        if let Some(upstream) = resolved.upstream.clone() {
            self.relay.register(attempt.generation, upstream).await;
        }

        let generation = attempt.generation;
        let kind = attempt.backend_kind.unwrap_or(BackendKind::Progressive);
        self.session.adopt(attempt);

        debug!(gen = generation, url = %resolved.url, ?kind, "starting attempt");
        if let Err(err) = self.backend.attach(generation, &resolved.url, kind).await {
            warn!("backend attach failed: {err:#}");
            self.teardown_attempt().await;
            self.state.set_error().await;
            self.broadcast_state();
        }
    }

    /// Rung 6: mark unplayable, show the error, end the session.
    async fn give_up(&mut self, station: &Station) {
        if let Some(old) = self.session.end() {
            self.relay.unregister(old.generation).await;
        }
        match self.state.mark_unplayable(&station.id).await {
            Ok(true) => info!(station = %station.id, "marked unplayable"),
            Ok(false) => {}
            Err(err) => warn!("state save failed: {err:#}"),
        }
        self.state.set_error().await;
        self.broadcast_state();
    }

    /// Tear down whatever attempt is live: fade, relay mapping, backend.
    /// The level is cut, not ramped.
    async fn teardown_attempt(&mut self) {
        self.cancel_fade();
        self.pending_stop = None;
        self.ramped_generation = None;
        if let Some(old) = self.session.end() {
            self.relay.unregister(old.generation).await;
        }
        if let Err(err) = self.backend.detach().await {
            debug!("backend detach: {err:#}");
        }
        let _ = self.backend.set_level(0.0).await;
    }

    async fn finish_stop(&mut self) {
        self.teardown_attempt().await;
        if let Err(err) = self.state.set_stopped().await {
            warn!("state save failed: {err:#}");
        }
        self.broadcast_state();
    }

    async fn cleanup(&mut self) {
        self.cancel_fade();
        if let Some(old) = self.session.end() {
            self.relay.unregister(old.generation).await;
        }
        self.backend.shutdown().await;
    }

    // ── level control ─────────────────────────────────────────────────────────

    /// What the output level should be right now: user volume scaled by the
    /// station's gain, clamped, silenced by mute.
    async fn effective_level(&self) -> f32 {
        let state = self.state.get_state().await;
        if state.muted {
            return 0.0;
        }
        let gain = state
            .current_station
            .and_then(|idx| state.stations.get(idx))
            .map(|s| s.gain)
            .unwrap_or(1.0);
        (state.volume * gain).clamp(0.0, 1.0)
    }

    async fn apply_level(&mut self) {
        let level = self.effective_level().await;
        let _ = self.backend.set_level(level).await;
    }

    /// One-time check that the backend honours level writes.  Backends that
    /// ignore them (some remote player shims do) get a single set-to-target
    /// instead of ramps.
    async fn probe_fades(&mut self) -> bool {
        if let Some(supported) = self.fades_supported {
            return supported;
        }
        let supported = match self.backend.set_level(0.37).await {
            Ok(()) => matches!(
                self.backend.level().await,
                Ok(Some(v)) if (v - 0.37).abs() < 0.01
            ),
            Err(_) => false,
        };
        let _ = self.backend.set_level(0.0).await;
        self.fades_supported = Some(supported);
        supported
    }

    fn cancel_fade(&mut self) {
        if let Some(fade) = self.fade.take() {
            fade.abort();
        }
    }

    fn allocate_fade_id(&mut self) -> u64 {
        self.next_fade_id += 1;
        self.next_fade_id
    }

    fn broadcast_state(&self) {
        // No receivers is fine; the daemon may be running headless.
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}
