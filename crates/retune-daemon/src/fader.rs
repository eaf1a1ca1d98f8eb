/// Volume fades.
///
/// Starting a station ramps the level from silence to the station's
/// effective level over 1.5 s; a user stop ramps down over 0.5 s before the
/// backend is detached.  Error teardown never fades: recovery wants the old
/// pipeline silent immediately.
///
/// A fade runs as a detached task that feeds `FadeStep` events back into the
/// engine loop; the engine applies each step to the backend itself.  The
/// backend stays single-owner, and cancelling a fade is aborting the task
/// and forgetting its id — any step already in flight is dropped by the id
/// check on arrival.
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::EngineEvent;

pub const RAMP_IN_MS: u64 = 1_500;
pub const RAMP_OUT_MS: u64 = 500;
const RAMP_IN_STEP_MS: u64 = 50;
const RAMP_OUT_STEP_MS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeKind {
    RampIn,
    RampOut,
}

pub struct FadeHandle {
    pub id: u64,
    pub kind: FadeKind,
    task: JoinHandle<()>,
}

impl FadeHandle {
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Linear level schedule from `from` to `to`.  Entries are `step_ms` apart;
/// the final entry is exactly `to` so a fade never lands on a rounding
/// artifact.
pub fn plan(from: f32, to: f32, total_ms: u64, step_ms: u64) -> Vec<f32> {
    let steps = (total_ms / step_ms).max(1);
    (1..=steps)
        .map(|i| {
            if i == steps {
                to
            } else {
                from + (to - from) * (i as f32 / steps as f32)
            }
        })
        .collect()
}

pub fn spawn_fade(
    id: u64,
    kind: FadeKind,
    from: f32,
    to: f32,
    events: mpsc::Sender<EngineEvent>,
) -> FadeHandle {
    let (total_ms, step_ms) = match kind {
        FadeKind::RampIn => (RAMP_IN_MS, RAMP_IN_STEP_MS),
        FadeKind::RampOut => (RAMP_OUT_MS, RAMP_OUT_STEP_MS),
    };
    let schedule = plan(from, to, total_ms, step_ms);
    let task = tokio::spawn(async move {
        let last_idx = schedule.len() - 1;
        for (i, level) in schedule.into_iter().enumerate() {
            tokio::time::sleep(Duration::from_millis(step_ms)).await;
            let step = EngineEvent::FadeStep {
                fade_id: id,
                level,
                last: i == last_idx,
            };
            if events.send(step).await.is_err() {
                // Engine loop is gone; nothing left to fade.
                return;
            }
        }
    });
    FadeHandle { id, kind, task }
}
