//! Recovery ladder behaviour, observed from outside the engine: which URLs
//! the backend is pointed at, in which order, and what the shared state says
//! while the ladder runs.

mod common;

use common::{station, TestHarness};
use retune_daemon::adapter::{AdapterEvent, BackendKind, ErrorKind};
use retune_proto::protocol::{Command, PlaybackStatus, RecoveryStep};

#[tokio::test(start_paused = true)]
async fn next_mirror_takes_over_after_first_fatal() {
    let h = TestHarness::start(vec![station(
        "dual",
        "http://one.example/a.mp3|http://two.example/b.mp3",
        None,
    )]);

    h.send(Command::Play { station_idx: 0 }).await;
    let first = h.wait_attaches(1).await;
    assert!(first.url.starts_with("http://one.example/a.mp3?_t="));

    h.emit(first.generation, AdapterEvent::FatalError(ErrorKind::Network))
        .await;
    let second = h.wait_attaches(2).await;
    assert!(second.url.starts_with("http://two.example/b.mp3?_t="));
    assert!(second.generation > first.generation);

    h.emit(second.generation, AdapterEvent::PlaybackStarted).await;
    let state = h
        .wait_for("second mirror playing", |s| {
            s.playback_status == PlaybackStatus::Playing
        })
        .await;
    assert!(state.recovery.is_none());
    assert!(state.unplayable.is_empty());
}

#[tokio::test(start_paused = true)]
async fn fatal_while_playing_drops_status_back_to_buffering() {
    let h = TestHarness::start(vec![station(
        "confident",
        "https://one.example/a.mp3|https://two.example/b.mp3",
        None,
    )]);

    h.send(Command::Play { station_idx: 0 }).await;
    let first = h.wait_attaches(1).await;
    h.emit(first.generation, AdapterEvent::PlaybackStarted).await;
    h.wait_for("playing", |s| s.playback_status == PlaybackStatus::Playing)
        .await;

    // Dies with no stall event first, the way a heartbeat-detected player
    // crash arrives.
    h.emit(first.generation, AdapterEvent::FatalError(ErrorKind::Network))
        .await;
    let second = h.wait_attaches(2).await;
    assert!(second.url.starts_with("https://two.example/b.mp3?_t="));
    let state = h
        .wait_for("rung detail published", |s| {
            s.recovery.as_ref().map(|r| r.step) == Some(RecoveryStep::NextMirror)
        })
        .await;
    assert_eq!(state.playback_status, PlaybackStatus::Buffering);
}

#[tokio::test(start_paused = true)]
async fn single_mirror_walks_upgrade_retries_then_fallback() {
    let h = TestHarness::start(vec![station(
        "walker",
        "http://radio.example/stream.mp3",
        Some("https://backup.example/stream.mp3"),
    )]);

    h.send(Command::Play { station_idx: 0 }).await;
    let a1 = h.wait_attaches(1).await;
    assert!(a1.url.starts_with("http://radio.example/stream.mp3?_t="));

    // Rung 2: same URL, https scheme.
    h.emit(a1.generation, AdapterEvent::FatalError(ErrorKind::Network))
        .await;
    let a2 = h.wait_attaches(2).await;
    assert!(a2.url.starts_with("https://radio.example/stream.mp3?_t="));
    let state = h.state.get_state().await;
    assert_eq!(
        state.recovery.as_ref().map(|r| r.step),
        Some(RecoveryStep::HttpsUpgrade)
    );

    // Rung 3, twice: same upgraded URL after the backoff.
    h.emit(a2.generation, AdapterEvent::FatalError(ErrorKind::Network))
        .await;
    let state = h
        .wait_for("first retry pending", |s| {
            s.recovery.as_ref().map(|r| (r.step, r.retry_count)) == Some((RecoveryStep::Retry, 1))
        })
        .await;
    assert_eq!(state.playback_status, PlaybackStatus::Buffering);
    let a3 = h.wait_attaches(3).await;
    assert!(a3.url.starts_with("https://radio.example/stream.mp3?_t="));

    h.emit(a3.generation, AdapterEvent::FatalError(ErrorKind::Network))
        .await;
    h.wait_for("second retry pending", |s| {
        s.recovery.as_ref().map(|r| (r.step, r.retry_count)) == Some((RecoveryStep::Retry, 2))
    })
    .await;
    let a4 = h.wait_attaches(4).await;
    assert!(a4.url.starts_with("https://radio.example/stream.mp3?_t="));

    // Rung 5: retries exhausted, the fallback takes over.
    h.emit(a4.generation, AdapterEvent::FatalError(ErrorKind::Network))
        .await;
    let a5 = h.wait_attaches(5).await;
    assert!(a5.url.starts_with("https://backup.example/stream.mp3?_t="));
    let state = h.state.get_state().await;
    assert_eq!(
        state.recovery.as_ref().map(|r| (r.step, r.using_fallback)),
        Some((RecoveryStep::Fallback, true))
    );

    h.emit(a5.generation, AdapterEvent::PlaybackStarted).await;
    let state = h
        .wait_for("fallback playing", |s| {
            s.playback_status == PlaybackStatus::Playing
        })
        .await;
    assert!(state.recovery.is_none());
}

#[tokio::test(start_paused = true)]
async fn exhausted_ladder_marks_unplayable_until_explicit_retry() {
    let h = TestHarness::start(vec![station(
        "flaky",
        "https://radio.example/only.mp3",
        None,
    )]);

    h.send(Command::Play { station_idx: 0 }).await;
    for n in 1..=3 {
        let attach = h.wait_attaches(n).await;
        assert!(
            attach.url.starts_with("https://radio.example/only.mp3?_t="),
            "attach #{n} went to {}",
            attach.url
        );
        h.emit(attach.generation, AdapterEvent::FatalError(ErrorKind::Network))
            .await;
    }

    // One initial attempt plus two bounded retries, then the mark.
    let state = h
        .wait_for("station marked unplayable", |s| {
            s.playback_status == PlaybackStatus::Error
        })
        .await;
    assert_eq!(state.unplayable, vec!["flaky".to_string()]);
    assert!(state.recovery.is_none());
    assert_eq!(h.backend.attach_count(), 3);

    // Play on an unplayable station is refused outright.
    h.send(Command::Play { station_idx: 0 }).await;
    h.assert_quiet().await;

    // An explicit retry clears the mark and starts over.
    h.send(Command::Retry { station_idx: 0 }).await;
    let again = h.wait_attaches(4).await;
    assert!(again.url.starts_with("https://radio.example/only.mp3?_t="));
    let state = h.state.get_state().await;
    assert!(state.unplayable.is_empty());
    assert_eq!(state.playback_status, PlaybackStatus::Buffering);

    h.emit(again.generation, AdapterEvent::PlaybackStarted).await;
    h.wait_for("retried station playing", |s| {
        s.playback_status == PlaybackStatus::Playing
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn access_errors_escalate_to_the_relay() {
    let h = TestHarness::start(vec![station(
        "locked",
        "https://radio.example/locked.mp3",
        None,
    )]);

    h.send(Command::Play { station_idx: 0 }).await;
    for n in 1..=3 {
        let attach = h.wait_attaches(n).await;
        h.emit(attach.generation, AdapterEvent::FatalError(ErrorKind::Access))
            .await;
    }

    // After the bounded retries an access error gets the relay, once.
    let wrapped = h.wait_attaches(4).await;
    let expected = format!("http://127.0.0.1:9923/relay/{}?_t=", wrapped.generation);
    assert!(
        wrapped.url.starts_with(&expected),
        "expected relay URL, got {}",
        wrapped.url
    );
    assert_eq!(
        h.relay.upstream_of(wrapped.generation).await.as_deref(),
        Some("https://radio.example/locked.mp3")
    );
    let state = h.state.get_state().await;
    assert_eq!(
        state.recovery.as_ref().map(|r| r.step),
        Some(RecoveryStep::RelayWrap)
    );

    h.emit(wrapped.generation, AdapterEvent::PlaybackStarted).await;
    h.wait_for("relayed stream playing", |s| {
        s.playback_status == PlaybackStatus::Playing
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn decode_errors_rebuild_once_then_give_up() {
    let h = TestHarness::start(vec![station(
        "garbled",
        "https://radio.example/garbled.aac",
        None,
    )]);

    h.send(Command::Play { station_idx: 0 }).await;
    let a1 = h.wait_attaches(1).await;
    h.emit(a1.generation, AdapterEvent::FatalError(ErrorKind::Decode))
        .await;

    // One in-place rebuild of the same candidate, no mirror or fallback detour.
    let a2 = h.wait_attaches(2).await;
    assert!(a2.url.starts_with("https://radio.example/garbled.aac?_t="));
    let state = h.state.get_state().await;
    assert_eq!(
        state.recovery.as_ref().map(|r| r.step),
        Some(RecoveryStep::RebuildPipeline)
    );

    h.emit(a2.generation, AdapterEvent::FatalError(ErrorKind::Decode))
        .await;
    let state = h
        .wait_for("decode failure gives up", |s| {
            s.playback_status == PlaybackStatus::Error
        })
        .await;
    assert_eq!(state.unplayable, vec!["garbled".to_string()]);
    assert_eq!(h.backend.attach_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn unclassified_errors_give_up_immediately() {
    let h = TestHarness::start(vec![station(
        "odd",
        "http://one.example/a.mp3|http://two.example/b.mp3",
        Some("https://backup.example/c.mp3"),
    )]);

    h.send(Command::Play { station_idx: 0 }).await;
    let a1 = h.wait_attaches(1).await;
    h.emit(a1.generation, AdapterEvent::FatalError(ErrorKind::Other))
        .await;

    // Mirrors and fallback exist but unclassified errors skip the ladder.
    let state = h
        .wait_for("gave up without escalation", |s| {
            s.playback_status == PlaybackStatus::Error
        })
        .await;
    assert_eq!(state.unplayable, vec!["odd".to_string()]);
    assert_eq!(h.backend.attach_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn backend_unavailability_is_not_held_against_the_station() {
    let h = TestHarness::start(vec![station(
        "fine",
        "https://radio.example/fine.mp3",
        None,
    )]);

    h.send(Command::Play { station_idx: 0 }).await;
    let a1 = h.wait_attaches(1).await;
    h.emit(
        a1.generation,
        AdapterEvent::Unavailable("player binary not found".to_string()),
    )
    .await;

    let state = h
        .wait_for("error without unplayable mark", |s| {
            s.playback_status == PlaybackStatus::Error
        })
        .await;
    assert!(state.unplayable.is_empty());

    // The attempt is over; anything else it emits is stale.
    h.emit(a1.generation, AdapterEvent::FatalError(ErrorKind::Network))
        .await;
    h.assert_quiet().await;
}

#[tokio::test(start_paused = true)]
async fn playlist_urls_classify_as_segmented() {
    let h = TestHarness::start(vec![station(
        "hls",
        "https://cdn.example/live/master.m3u8",
        None,
    )]);

    h.send(Command::Play { station_idx: 0 }).await;
    let attach = h.wait_attaches(1).await;
    assert_eq!(attach.kind, BackendKind::Segmented);
    assert!(attach.url.starts_with("https://cdn.example/live/master.m3u8?_t="));
}
