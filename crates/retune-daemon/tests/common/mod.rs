/// Shared harness for engine integration tests: a scripted backend that
/// records every call, and a running engine loop fed through the real event
/// channel.  Tests inject backend events tagged with generations they read
/// off the attach log, exactly as a live backend would produce them.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use retune_daemon::adapter::{classify_by_url, AdapterEvent, BackendKind, StreamBackend};
use retune_daemon::engine::EngineCore;
use retune_daemon::relay::StreamRelay;
use retune_daemon::{BroadcastMessage, EngineEvent};
use retune_proto::config::Config;
use retune_proto::protocol::{Command, EngineState};
use retune_proto::state::StateManager;
use retune_proto::station::Station;

#[derive(Debug, Clone)]
pub struct AttachCall {
    pub generation: u64,
    pub url: String,
    pub kind: BackendKind,
}

#[derive(Default)]
struct BackendLog {
    attaches: Vec<AttachCall>,
    detaches: usize,
    levels: Vec<f32>,
}

/// Backend double: records calls, produces no events of its own.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    log: Arc<Mutex<BackendLog>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attaches(&self) -> Vec<AttachCall> {
        self.log.lock().unwrap().attaches.clone()
    }

    pub fn attach_count(&self) -> usize {
        self.log.lock().unwrap().attaches.len()
    }

    pub fn detach_count(&self) -> usize {
        self.log.lock().unwrap().detaches
    }

    pub fn levels(&self) -> Vec<f32> {
        self.log.lock().unwrap().levels.clone()
    }

    pub fn last_level(&self) -> Option<f32> {
        self.log.lock().unwrap().levels.last().copied()
    }
}

impl StreamBackend for ScriptedBackend {
    async fn classify(&self, url: &str) -> BackendKind {
        classify_by_url(url).unwrap_or(BackendKind::Progressive)
    }

    async fn attach(&self, generation: u64, url: &str, kind: BackendKind) -> anyhow::Result<()> {
        self.log.lock().unwrap().attaches.push(AttachCall {
            generation,
            url: url.to_string(),
            kind,
        });
        Ok(())
    }

    async fn detach(&self) -> anyhow::Result<()> {
        self.log.lock().unwrap().detaches += 1;
        Ok(())
    }

    async fn set_level(&self, level: f32) -> anyhow::Result<()> {
        self.log.lock().unwrap().levels.push(level);
        Ok(())
    }

    async fn level(&self) -> anyhow::Result<Option<f32>> {
        Ok(self.log.lock().unwrap().levels.last().copied())
    }

    async fn check_liveness(&self) -> bool {
        true
    }

    async fn shutdown(&self) {}
}

pub struct TestHarness {
    pub backend: ScriptedBackend,
    pub relay: StreamRelay,
    pub state: Arc<StateManager>,
    pub event_tx: mpsc::Sender<EngineEvent>,
    _engine: tokio::task::JoinHandle<()>,
}

static STATE_FILE_SEQ: AtomicUsize = AtomicUsize::new(0);

impl TestHarness {
    pub fn start(stations: Vec<Station>) -> Self {
        let mut config = Config::default();
        config.daemon.state_file = std::env::temp_dir().join(format!(
            "retune-engine-test-{}-{}.json",
            std::process::id(),
            STATE_FILE_SEQ.fetch_add(1, Ordering::Relaxed),
        ));
        let _ = std::fs::remove_file(&config.daemon.state_file);

        let state = Arc::new(StateManager::new(config.daemon.state_file.clone(), stations));
        let backend = ScriptedBackend::new();
        let relay = StreamRelay::new();
        let (event_tx, event_rx) = mpsc::channel::<EngineEvent>(256);
        let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

        let engine = EngineCore::new(
            config,
            state.clone(),
            backend.clone(),
            relay.clone(),
            event_tx.clone(),
            broadcast_tx,
        );
        let engine_task = tokio::spawn(async move {
            let _ = engine.run(event_rx).await;
        });

        Self {
            backend,
            relay,
            state,
            event_tx,
            _engine: engine_task,
        }
    }

    pub async fn send(&self, cmd: Command) {
        self.event_tx
            .send(EngineEvent::Command(cmd))
            .await
            .expect("engine loop gone");
    }

    pub async fn emit(&self, generation: u64, event: AdapterEvent) {
        self.event_tx
            .send(EngineEvent::Backend { generation, event })
            .await
            .expect("engine loop gone");
    }

    /// Poll until the state snapshot satisfies `pred`.  Runs under a paused
    /// clock, so waiting also drives pending retry/fade timers.
    pub async fn wait_for<F>(&self, what: &str, pred: F) -> EngineState
    where
        F: Fn(&EngineState) -> bool,
    {
        for _ in 0..3000 {
            let state = self.state.get_state().await;
            if pred(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    /// Poll until the recorded backend calls satisfy `pred`.
    pub async fn wait_backend<F>(&self, what: &str, pred: F)
    where
        F: Fn(&ScriptedBackend) -> bool,
    {
        for _ in 0..3000 {
            if pred(&self.backend) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    /// Poll until the backend has seen `n` attaches; returns the latest.
    pub async fn wait_attaches(&self, n: usize) -> AttachCall {
        for _ in 0..3000 {
            let attaches = self.backend.attaches();
            if attaches.len() >= n {
                return attaches[n - 1].clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for attach #{n} (saw {})",
            self.backend.attach_count()
        );
    }

    /// Give in-flight events a chance to land, then make sure nothing new
    /// happened.  Used for "this must be ignored" assertions.
    pub async fn assert_quiet(&self) {
        let attaches = self.backend.attach_count();
        let rev = self.state.get_state().await.rev;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(self.backend.attach_count(), attaches, "unexpected attach");
        assert_eq!(
            self.state.get_state().await.rev,
            rev,
            "unexpected state change"
        );
    }
}

pub fn station(id: &str, stream_url: &str, fallback: Option<&str>) -> Station {
    Station {
        id: id.to_string(),
        name: id.to_string(),
        stream_url: stream_url.to_string(),
        fallback_stream_url: fallback.map(|s| s.to_string()),
        ..Station::default()
    }
}
