/// Candidate resolution — turns a station plus the live attempt's flags into
/// the one concrete URL to try next.
///
/// Selection: the mirror at `candidate_index`, or the fallback URL once
/// `using_fallback` is set.  On top of the selected base, three independent
/// transforms compose in a fixed order:
///
///   1. https-upgrade   — rewrite the `http:` scheme only (flag-gated)
///   2. relay-wrap      — swap in the local relay endpoint (flag-gated);
///                        the real upstream is registered with the relay
///                        under the attempt's generation
///   3. cache-defeat    — time-varying query parameter, always applied, so a
///                        player never reuses buffered data from an earlier
///                        attempt at the same URL
use crate::session::Attempt;
use retune_proto::station::Station;

/// A fully resolved candidate ready to hand to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// What the backend attaches.
    pub url: String,
    /// What the relay must fetch on the backend's behalf; `Some` only when
    /// the attempt is relay-wrapped.
    pub upstream: Option<String>,
    /// The selected mirror/fallback before any transform, used for backend
    /// classification.
    pub base: String,
}

/// The station's fallback URL, ignoring blank entries from hand-edited
/// catalogs.
pub fn fallback_url(station: &Station) -> Option<&str> {
    station
        .fallback_stream_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// The base URL the attempt is currently pointed at, before transforms.
pub fn current_base<'a>(station: &'a Station, attempt: &Attempt) -> Option<&'a str> {
    if attempt.using_fallback {
        fallback_url(station)
    } else {
        station.mirrors().get(attempt.candidate_index).copied()
    }
}

/// True while primary mirrors beyond the current one remain.
pub fn has_more_mirrors(station: &Station, attempt: &Attempt) -> bool {
    !attempt.using_fallback && attempt.candidate_index + 1 < station.mirrors().len()
}

/// True while anything at all is left to try: a later mirror, or an unused
/// fallback URL.
pub fn has_more_candidates(station: &Station, attempt: &Attempt) -> bool {
    has_more_mirrors(station, attempt)
        || (fallback_url(station).is_some() && !attempt.using_fallback)
}

pub fn resolve(
    station: &Station,
    attempt: &Attempt,
    relay_base: &str,
    now_ms: u64,
) -> Option<Resolved> {
    let base = current_base(station, attempt)?;

    let mut url = base.to_string();
    if attempt.https_upgraded {
        url = upgrade_scheme(&url);
    }

    let mut upstream = None;
    if attempt.relay_wrapped {
        upstream = Some(url);
        url = format!(
            "{}/relay/{}",
            relay_base.trim_end_matches('/'),
            attempt.generation
        );
    }

    url = defeat_cache(&url, now_ms);

    Some(Resolved {
        url,
        upstream,
        base: base.to_string(),
    })
}

/// Rewrite `http:` to `https:`; the rest of the URL is untouched.
fn upgrade_scheme(url: &str) -> String {
    match url.strip_prefix("http:") {
        Some(rest) => format!("https:{}", rest),
        None => url.to_string(),
    }
}

fn defeat_cache(url: &str, now_ms: u64) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}_t={}", url, sep, now_ms)
}
