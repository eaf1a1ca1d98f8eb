use serde::{Deserialize, Serialize};

use crate::station::Station;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from control clients to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play { station_idx: usize },
    Stop,
    Next,
    Prev,
    Random,
    /// Remove a station from the unplayable set and play it again.
    Retry { station_idx: usize },
    Volume { value: f32 },
    Mute { muted: bool },
    GetState,
}

/// Messages sent from the daemon to control clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        engine_rev: u64,
        state: EngineState,
    },
    State {
        data: EngineState,
    },
    Log {
        message: String,
    },
}

/// Observable playback status — the authoritative state machine output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    /// Nothing selected, or explicitly stopped.
    #[default]
    Idle,
    /// An attempt is running but the backend has not confirmed audio yet.
    /// Recovery rungs keep the status here — escalation is silent.
    Buffering,
    /// Backend confirmed audio is flowing.
    Playing,
    /// The station was marked unplayable; only an explicit retry leaves this.
    Error,
}

impl PlaybackStatus {
    /// True while an attempt holds backend resources.
    pub fn is_active(&self) -> bool {
        matches!(self, PlaybackStatus::Buffering | PlaybackStatus::Playing)
    }
}

/// Which recovery rung the engine is currently walking, for optional
/// "retrying…" messaging in clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    NextMirror,
    HttpsUpgrade,
    Retry,
    RelayWrap,
    Fallback,
    RebuildPipeline,
}

/// Recovery detail carried while rungs 1-5 run.  Cleared on `Playing`,
/// `Idle`, and `Error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryInfo {
    pub step: RecoveryStep,
    pub retry_count: u8,
    pub candidate_index: usize,
    pub using_fallback: bool,
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineState {
    /// Monotonic revision counter — incremented on every state change.
    #[serde(default)]
    pub rev: u64,
    pub stations: Vec<Station>,
    pub current_station: Option<usize>,
    pub volume: f32,
    #[serde(default)]
    pub muted: bool,
    pub playback_status: PlaybackStatus,
    /// Stream/track title observed from the player, when available.
    pub now_playing: Option<String>,
    /// Present while the engine is escalating through recovery rungs.
    #[serde(default)]
    pub recovery: Option<RecoveryInfo>,
    /// Station ids that exhausted every recovery strategy.  Clients use this
    /// to pre-filter dead stations; only `Retry` removes an entry.
    #[serde(default)]
    pub unplayable: Vec<String>,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
