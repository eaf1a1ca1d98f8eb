use crate::protocol::{EngineState, PlaybackStatus, RecoveryInfo};
use crate::station::Station;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Slice of the state that survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentState {
    pub last_station_id: Option<String>,
    pub volume: f32,
    #[serde(default)]
    pub muted: bool,
    /// Station ids that exhausted every recovery strategy.  Only an explicit
    /// retry removes an entry; restarts never clear it.
    #[serde(default)]
    pub unplayable: Vec<String>,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            last_station_id: None,
            volume: 0.5,
            muted: false,
            unplayable: Vec::new(),
        }
    }
}

pub struct StateManager {
    state: Arc<RwLock<EngineState>>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf, stations: Vec<Station>) -> Self {
        let persistent = Self::load_persistent(&state_file);

        let current_station = persistent
            .last_station_id
            .as_deref()
            .and_then(|id| stations.iter().position(|s| s.id == id));

        let mut unplayable = persistent.unplayable;
        unplayable.sort();
        unplayable.dedup();

        let state = EngineState {
            rev: 1,
            stations,
            current_station,
            volume: persistent.volume.clamp(0.0, 1.0),
            muted: persistent.muted,
            playback_status: PlaybackStatus::Idle,
            now_playing: None,
            recovery: None,
            unplayable,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            state_file,
        }
    }

    pub fn arc(&self) -> Arc<RwLock<EngineState>> {
        Arc::clone(&self.state)
    }

    pub async fn get_state(&self) -> EngineState {
        self.state.read().await.clone()
    }

    pub async fn station(&self, idx: usize) -> Option<Station> {
        self.state.read().await.stations.get(idx).cloned()
    }

    /// New attempt chain started for a station: selection moves, status goes
    /// to Buffering, stale per-station detail is cleared.
    pub async fn set_buffering(&self, idx: usize) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.current_station = Some(idx);
            state.playback_status = PlaybackStatus::Buffering;
            state.now_playing = None;
            state.recovery = None;
            state.rev += 1;
        }
        self.save().await
    }

    /// Backend confirmed audio is flowing.
    pub async fn set_playing(&self) {
        let mut state = self.state.write().await;
        state.playback_status = PlaybackStatus::Playing;
        state.recovery = None;
        state.rev += 1;
    }

    /// Backend lost audio but is self-recovering within the same attempt.
    pub async fn set_rebuffering(&self) {
        let mut state = self.state.write().await;
        state.playback_status = PlaybackStatus::Buffering;
        state.rev += 1;
    }

    pub async fn set_stopped(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.playback_status = PlaybackStatus::Idle;
            state.now_playing = None;
            state.recovery = None;
            state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_error(&self) {
        let mut state = self.state.write().await;
        state.playback_status = PlaybackStatus::Error;
        state.now_playing = None;
        state.recovery = None;
        state.rev += 1;
    }

    /// Recovery detail for "retrying…" client messaging.  Status itself stays
    /// Buffering while the ladder runs.
    pub async fn set_recovery(&self, info: Option<RecoveryInfo>) {
        let mut state = self.state.write().await;
        state.recovery = info;
        state.rev += 1;
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.volume = volume.clamp(0.0, 1.0);
            state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_muted(&self, muted: bool) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.muted = muted;
            state.rev += 1;
        }
        self.save().await
    }

    pub async fn set_now_playing(&self, title: Option<String>) {
        let mut state = self.state.write().await;
        state.now_playing = title;
        state.rev += 1;
    }

    // ── unplayable set ────────────────────────────────────────────────────────

    /// Add a station id to the unplayable set.  Returns false when it was
    /// already present (insertion is idempotent).
    pub async fn mark_unplayable(&self, id: &str) -> anyhow::Result<bool> {
        let inserted = {
            let mut state = self.state.write().await;
            match state.unplayable.binary_search_by(|e| e.as_str().cmp(id)) {
                Ok(_) => false,
                Err(pos) => {
                    state.unplayable.insert(pos, id.to_string());
                    state.rev += 1;
                    true
                }
            }
        };
        if inserted {
            self.save().await?;
        }
        Ok(inserted)
    }

    /// Remove a station id from the unplayable set (explicit user retry).
    pub async fn clear_unplayable(&self, id: &str) -> anyhow::Result<bool> {
        let removed = {
            let mut state = self.state.write().await;
            match state.unplayable.binary_search_by(|e| e.as_str().cmp(id)) {
                Ok(pos) => {
                    state.unplayable.remove(pos);
                    state.rev += 1;
                    true
                }
                Err(_) => false,
            }
        };
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    pub async fn is_unplayable(&self, id: &str) -> bool {
        let state = self.state.read().await;
        state
            .unplayable
            .binary_search_by(|e| e.as_str().cmp(id))
            .is_ok()
    }

    // ── navigation pickers ────────────────────────────────────────────────────
    //
    // Read-only: the engine applies the result through its own session
    // lifecycle, so these never mutate selection themselves.

    /// Next station after the current one that is not unplayable, wrapping.
    pub async fn pick_next(&self) -> Option<usize> {
        let state = self.state.read().await;
        Self::scan(&state, 1)
    }

    /// Previous playable station, wrapping.
    pub async fn pick_prev(&self) -> Option<usize> {
        let state = self.state.read().await;
        Self::scan(&state, -1)
    }

    /// Indices of all stations not in the unplayable set.
    pub async fn playable_indices(&self) -> Vec<usize> {
        let state = self.state.read().await;
        state
            .stations
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                state
                    .unplayable
                    .binary_search_by(|e| e.as_str().cmp(&s.id))
                    .is_err()
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn scan(state: &EngineState, dir: isize) -> Option<usize> {
        let len = state.stations.len();
        if len == 0 {
            return None;
        }
        let start = state.current_station.unwrap_or(0) as isize;
        // At most one full cycle; every candidate may be unplayable.
        for step in 1..=len as isize {
            let idx = (start + dir * step).rem_euclid(len as isize) as usize;
            let id = &state.stations[idx].id;
            if state
                .unplayable
                .binary_search_by(|e| e.as_str().cmp(id))
                .is_err()
            {
                return Some(idx);
            }
        }
        None
    }

    // ── persistence ───────────────────────────────────────────────────────────

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = {
            let state = self.state.read().await;
            PersistentState {
                last_station_id: state
                    .current_station
                    .and_then(|i| state.stations.get(i))
                    .map(|s| s.id.clone()),
                volume: state.volume,
                muted: state.muted,
                unplayable: state.unplayable.clone(),
            }
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &PathBuf) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}
