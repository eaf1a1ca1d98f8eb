/// Error recovery policy — the strict escalation ladder consulted on every
/// fatal backend error.  Evaluated top to bottom against the live attempt:
///
///   1. next mirror      — mirrors remain in the primary list
///   2. https upgrade    — current base is `http:` and not yet upgraded
///   3. bounded retry    — same URL, linear backoff, capped
///   4. relay wrap       — access errors only, once per candidate
///   5. fallback URL     — station has one and it is unused
///   6. give up          — mark unplayable
///
/// Rungs 4 and 5 swap places when `relay_before_fallback` is off; both
/// orders appear in the wild and the choice is configuration, not fact.
///
/// Decode errors take a short path: one in-place pipeline rebuild, then give
/// up — changing transport rarely fixes corrupt media.  Unclassified errors
/// go straight to rung 6.
///
/// The policy only decides; it never mutates the live attempt.  The engine
/// routes every decision through the session manager so that each re-attempt
/// is a fresh generation.
use crate::adapter::ErrorKind;
use crate::resolver;
use crate::session::Attempt;
use retune_proto::config::RecoveryConfig;
use retune_proto::protocol::RecoveryStep;
use retune_proto::station::Station;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NextMirror,
    HttpsUpgrade,
    Retry { delay: Duration },
    RelayWrap,
    Fallback,
    RebuildPipeline,
    GiveUp,
}

pub fn decide(
    cfg: &RecoveryConfig,
    station: &Station,
    attempt: &Attempt,
    kind: ErrorKind,
) -> Decision {
    match kind {
        ErrorKind::Other => Decision::GiveUp,
        ErrorKind::Decode if cfg.rebuild_on_decode => {
            if attempt.pipeline_rebuilt {
                Decision::GiveUp
            } else {
                Decision::RebuildPipeline
            }
        }
        _ => ladder(cfg, station, attempt, kind),
    }
}

fn ladder(cfg: &RecoveryConfig, station: &Station, attempt: &Attempt, kind: ErrorKind) -> Decision {
    if resolver::has_more_mirrors(station, attempt) {
        return Decision::NextMirror;
    }

    if let Some(base) = resolver::current_base(station, attempt) {
        if base.starts_with("http:") && !attempt.https_upgraded {
            return Decision::HttpsUpgrade;
        }
    }

    if attempt.retry_count < cfg.max_retries {
        let delay = Duration::from_millis(
            cfg.retry_backoff_ms
                .saturating_mul(u64::from(attempt.retry_count) + 1),
        );
        return Decision::Retry { delay };
    }

    let relay_applies = kind == ErrorKind::Access && !attempt.relay_wrapped;
    let fallback_applies = resolver::fallback_url(station).is_some() && !attempt.using_fallback;

    if cfg.relay_before_fallback {
        if relay_applies {
            return Decision::RelayWrap;
        }
        if fallback_applies {
            return Decision::Fallback;
        }
    } else {
        if fallback_applies {
            return Decision::Fallback;
        }
        if relay_applies {
            return Decision::RelayWrap;
        }
    }

    Decision::GiveUp
}

/// Build the escalated attempt a decision calls for.  `None` for `GiveUp`,
/// which ends the chain instead of producing an attempt.
pub fn apply(prev: &Attempt, decision: &Decision, generation: u64) -> Option<Attempt> {
    let mut next = prev.clone();
    next.generation = generation;
    match decision {
        Decision::NextMirror => {
            next.candidate_index += 1;
            next.retry_count = 0;
            next.https_upgraded = false;
            next.relay_wrapped = false;
            next.pipeline_rebuilt = false;
            next.backend_kind = None;
        }
        Decision::HttpsUpgrade => {
            next.https_upgraded = true;
            next.retry_count = 0;
        }
        Decision::Retry { .. } => {
            next.retry_count += 1;
        }
        Decision::RelayWrap => {
            next.relay_wrapped = true;
            next.retry_count = 0;
        }
        Decision::Fallback => {
            next.using_fallback = true;
            next.candidate_index = 0;
            next.retry_count = 0;
            next.https_upgraded = false;
            next.relay_wrapped = false;
            next.pipeline_rebuilt = false;
            next.backend_kind = None;
        }
        Decision::RebuildPipeline => {
            next.pipeline_rebuilt = true;
        }
        Decision::GiveUp => return None,
    }
    Some(next)
}

/// Wire-level tag for the "retrying…" detail clients may surface.
pub fn step_of(decision: &Decision) -> Option<RecoveryStep> {
    match decision {
        Decision::NextMirror => Some(RecoveryStep::NextMirror),
        Decision::HttpsUpgrade => Some(RecoveryStep::HttpsUpgrade),
        Decision::Retry { .. } => Some(RecoveryStep::Retry),
        Decision::RelayWrap => Some(RecoveryStep::RelayWrap),
        Decision::Fallback => Some(RecoveryStep::Fallback),
        Decision::RebuildPipeline => Some(RecoveryStep::RebuildPipeline),
        Decision::GiveUp => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;

    fn station(spec: &str, fallback: Option<&str>) -> Station {
        Station {
            id: "test".to_string(),
            name: "Test".to_string(),
            stream_url: spec.to_string(),
            fallback_stream_url: fallback.map(|s| s.to_string()),
            ..Station::default()
        }
    }

    fn retry_ms(ms: u64) -> Decision {
        Decision::Retry {
            delay: Duration::from_millis(ms),
        }
    }

    /// Feed the same fatal error kind into the ladder until it gives up,
    /// collecting the decisions in order.
    fn walk(cfg: &RecoveryConfig, st: &Station, kind: ErrorKind) -> Vec<Decision> {
        let mut mgr = SessionManager::new();
        let mut attempt = mgr.begin(0);
        let mut out = Vec::new();
        for _ in 0..32 {
            let d = decide(cfg, st, &attempt, kind);
            out.push(d.clone());
            match apply(&attempt, &d, mgr.allocate()) {
                Some(next) => {
                    mgr.adopt(next.clone());
                    attempt = next;
                }
                None => break,
            }
        }
        out
    }

    #[test]
    fn network_walk_visits_mirrors_then_fallback_then_gives_up() {
        let st = station("http://a/1|http://b/2", Some("http://c/fb"));
        let cfg = RecoveryConfig::default();
        let walk = walk(&cfg, &st, ErrorKind::Network);
        assert_eq!(
            walk,
            vec![
                Decision::NextMirror,
                Decision::HttpsUpgrade,
                retry_ms(1000),
                retry_ms(2000),
                Decision::Fallback,
                // Fallback reset the upgrade flags, so the http fallback gets
                // its own upgrade and retries.
                Decision::HttpsUpgrade,
                retry_ms(1000),
                retry_ms(2000),
                Decision::GiveUp,
            ]
        );
        // No mirror is ever revisited: exactly one NextMirror for two mirrors.
        assert_eq!(
            walk.iter()
                .filter(|d| matches!(d, Decision::NextMirror))
                .count(),
            1
        );
    }

    #[test]
    fn single_http_mirror_with_fallback_escalates_upgrade_retries_fallback() {
        let st = station("http://only/1", Some("https://fb/2"));
        let cfg = RecoveryConfig::default();
        let walk = walk(&cfg, &st, ErrorKind::Network);
        assert_eq!(
            walk[..4],
            [
                Decision::HttpsUpgrade,
                retry_ms(1000),
                retry_ms(2000),
                Decision::Fallback,
            ]
        );
    }

    #[test]
    fn https_mirror_skips_upgrade_rung() {
        let st = station("https://only/1", None);
        let cfg = RecoveryConfig::default();
        assert_eq!(
            walk(&cfg, &st, ErrorKind::Network),
            vec![retry_ms(1000), retry_ms(2000), Decision::GiveUp]
        );
    }

    #[test]
    fn access_errors_reach_the_relay_exactly_once_per_candidate() {
        let st = station("https://only/1", None);
        let cfg = RecoveryConfig::default();
        assert_eq!(
            walk(&cfg, &st, ErrorKind::Access),
            vec![
                retry_ms(1000),
                retry_ms(2000),
                Decision::RelayWrap,
                retry_ms(1000),
                retry_ms(2000),
                Decision::GiveUp,
            ]
        );
    }

    #[test]
    fn network_errors_never_reach_the_relay() {
        let st = station("https://only/1", None);
        let cfg = RecoveryConfig::default();
        let walk = walk(&cfg, &st, ErrorKind::Network);
        assert!(!walk.iter().any(|d| matches!(d, Decision::RelayWrap)));
    }

    #[test]
    fn relay_fallback_order_is_configurable() {
        let st = station("https://only/1", Some("https://fb/2"));

        let order_of = |cfg: &RecoveryConfig| {
            walk(cfg, &st, ErrorKind::Access)
                .into_iter()
                .filter(|d| matches!(d, Decision::RelayWrap | Decision::Fallback))
                .collect::<Vec<_>>()
        };

        let default_cfg = RecoveryConfig::default();
        assert_eq!(
            order_of(&default_cfg)[..2],
            [Decision::RelayWrap, Decision::Fallback]
        );

        let flipped = RecoveryConfig {
            relay_before_fallback: false,
            ..RecoveryConfig::default()
        };
        assert_eq!(
            order_of(&flipped)[..2],
            [Decision::Fallback, Decision::RelayWrap]
        );
    }

    #[test]
    fn decode_gets_one_rebuild_then_gives_up() {
        let st = station("http://a/1|http://b/2", Some("http://c/fb"));
        let cfg = RecoveryConfig::default();
        // Mirrors and fallback exist but are not consulted for decode errors.
        assert_eq!(
            walk(&cfg, &st, ErrorKind::Decode),
            vec![Decision::RebuildPipeline, Decision::GiveUp]
        );
    }

    #[test]
    fn decode_joins_the_ladder_when_rebuild_is_disabled() {
        let st = station("http://a/1|http://b/2", None);
        let cfg = RecoveryConfig {
            rebuild_on_decode: false,
            ..RecoveryConfig::default()
        };
        let walk = walk(&cfg, &st, ErrorKind::Decode);
        assert_eq!(walk[0], Decision::NextMirror);
        assert!(!walk.iter().any(|d| matches!(d, Decision::RebuildPipeline)));
    }

    #[test]
    fn unclassified_errors_give_up_immediately() {
        let st = station("http://a/1|http://b/2", Some("http://c/fb"));
        let cfg = RecoveryConfig::default();
        assert_eq!(walk(&cfg, &st, ErrorKind::Other), vec![Decision::GiveUp]);
    }

    #[test]
    fn retry_count_is_capped_with_linear_backoff() {
        let st = station("https://only/1", None);
        let cfg = RecoveryConfig::default();
        let walk = walk(&cfg, &st, ErrorKind::Network);
        let retries: Vec<_> = walk
            .iter()
            .filter_map(|d| match d {
                Decision::Retry { delay } => Some(*delay),
                _ => None,
            })
            .collect();
        assert_eq!(
            retries,
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[test]
    fn next_mirror_resets_retry_and_transform_flags() {
        let mut mgr = SessionManager::new();
        let mut attempt = mgr.begin(0);
        attempt.retry_count = 2;
        attempt.https_upgraded = true;
        attempt.relay_wrapped = true;
        attempt.backend_kind = Some(crate::adapter::BackendKind::Progressive);

        let next = apply(&attempt, &Decision::NextMirror, mgr.allocate()).unwrap();
        assert_eq!(next.candidate_index, 1);
        assert_eq!(next.retry_count, 0);
        assert!(!next.https_upgraded);
        assert!(!next.relay_wrapped);
        assert!(next.backend_kind.is_none());
        assert!(next.generation > attempt.generation);
    }

    #[test]
    fn upgrade_keeps_candidate_and_backend_kind() {
        let mut mgr = SessionManager::new();
        let mut attempt = mgr.begin(0);
        attempt.candidate_index = 1;
        attempt.retry_count = 2;
        attempt.backend_kind = Some(crate::adapter::BackendKind::Segmented);

        let next = apply(&attempt, &Decision::HttpsUpgrade, mgr.allocate()).unwrap();
        assert_eq!(next.candidate_index, 1);
        assert_eq!(next.retry_count, 0);
        assert!(next.https_upgraded);
        assert_eq!(
            next.backend_kind,
            Some(crate::adapter::BackendKind::Segmented)
        );
    }

    #[test]
    fn fallback_rewinds_candidate_index_and_clears_flags() {
        let mut mgr = SessionManager::new();
        let mut attempt = mgr.begin(0);
        attempt.candidate_index = 2;
        attempt.https_upgraded = true;
        attempt.relay_wrapped = true;
        attempt.retry_count = 2;

        let next = apply(&attempt, &Decision::Fallback, mgr.allocate()).unwrap();
        assert!(next.using_fallback);
        assert_eq!(next.candidate_index, 0);
        assert_eq!(next.retry_count, 0);
        assert!(!next.https_upgraded);
        assert!(!next.relay_wrapped);
    }

    #[test]
    fn give_up_produces_no_attempt() {
        let mut mgr = SessionManager::new();
        let attempt = mgr.begin(0);
        assert!(apply(&attempt, &Decision::GiveUp, mgr.allocate()).is_none());
    }
}
