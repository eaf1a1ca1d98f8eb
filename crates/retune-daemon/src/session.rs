//! Session lifecycle — one playback attempt at a time, each stamped with a
//! monotonically increasing generation.  Only the attempt whose generation
//! equals the manager's current one is live; events tagged with any other
//! generation are stale and must be discarded by the engine.
//!
//! The flags that steer URL resolution (`https_upgraded`, `relay_wrapped`,
//! `using_fallback`, ...) live here, scoped to the attempt, so nothing leaks
//! from one attempt chain into the next.

use crate::adapter::BackendKind;

#[derive(Debug, Clone)]
pub struct Attempt {
    pub generation: u64,
    pub station_idx: usize,
    /// Index into the station's mirror list.  Only ever increases; a reset
    /// to 0 happens solely when falling through to the fallback URL.
    pub candidate_index: usize,
    pub using_fallback: bool,
    pub https_upgraded: bool,
    pub relay_wrapped: bool,
    pub retry_count: u8,
    /// Whether the single in-place decode-pipeline rebuild has been spent.
    pub pipeline_rebuilt: bool,
    /// Decided once per candidate, then fixed.
    pub backend_kind: Option<BackendKind>,
}

impl Attempt {
    fn first(generation: u64, station_idx: usize) -> Self {
        Self {
            generation,
            station_idx,
            candidate_index: 0,
            using_fallback: false,
            https_upgraded: false,
            relay_wrapped: false,
            retry_count: 0,
            pipeline_rebuilt: false,
            backend_kind: None,
        }
    }
}

#[derive(Default)]
pub struct SessionManager {
    generation: u64,
    live: Option<Attempt>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next generation id.  Allocating alone does not make an
    /// attempt live; pair with `adopt`.
    pub fn allocate(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Start a fresh attempt chain for a station.  The previous attempt (if
    /// any) is implicitly dead from this point on; its backend resources must
    /// already have been released by the caller.
    pub fn begin(&mut self, station_idx: usize) -> Attempt {
        let attempt = Attempt::first(self.allocate(), station_idx);
        self.live = Some(attempt.clone());
        attempt
    }

    /// Install an escalated attempt (built by the recovery policy) as live.
    pub fn adopt(&mut self, attempt: Attempt) {
        debug_assert!(attempt.generation == self.generation);
        self.live = Some(attempt);
    }

    pub fn end(&mut self) -> Option<Attempt> {
        self.live.take()
    }

    pub fn current(&self) -> Option<&Attempt> {
        self.live.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Attempt> {
        self.live.as_mut()
    }

    /// The stale-event guard: true only for the single live generation.
    pub fn is_live(&self, generation: u64) -> bool {
        self.live
            .as_ref()
            .map(|a| a.generation == generation)
            .unwrap_or(false)
    }
}
