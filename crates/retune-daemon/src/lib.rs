//! retune daemon — resilient playback engine for internet radio.
//!
//! Everything that can happen (client commands, backend events, retry
//! timers, fade steps) funnels into one [`EngineEvent`] channel consumed by
//! a single engine loop ([`engine::EngineCore`]).  The loop owns the backend
//! and the session bookkeeping outright; the servers (control socket, HTTP
//! API, stream relay) only produce events and read shared state snapshots.

pub mod adapter;
pub mod engine;
pub mod fader;
pub mod http;
pub mod player;
pub mod policy;
pub mod relay;
pub mod resolver;
pub mod session;
pub mod socket;

use tokio::sync::broadcast;

use crate::adapter::AdapterEvent;
use retune_proto::protocol::Command;

/// Inputs to the engine loop.
#[derive(Debug)]
pub enum EngineEvent {
    /// A client command, from the control socket or the HTTP API.
    Command(Command),
    /// Something the stream backend observed.  Tagged with the generation of
    /// the attempt that produced it; events from superseded generations are
    /// discarded on arrival.
    Backend { generation: u64, event: AdapterEvent },
    /// A retry backoff timer fired for the given generation.
    RetryElapsed { generation: u64 },
    /// One step of a running fade is due.
    FadeStep { fade_id: u64, level: f32, last: bool },
    /// Periodic backend liveness check.
    Heartbeat,
    Shutdown,
}

/// Fan-out notifications for connected control clients.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    StateUpdated,
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
pub struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    pub fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only forward WARN and ERROR to clients to avoid clogging the channel
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();

        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // Send to broadcast channel (ignore errors - no receivers is OK)
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}
