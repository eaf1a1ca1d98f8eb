//! Station catalog boundary.
//!
//! The engine consumes `Station` records read-only.  Everything else here is
//! the loading cascade that produces them: inline config entries, a TOML file
//! in the config dir, one beside the executable, an optional remote JSON
//! list, and finally a small built-in default list.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::config::StationsConfig;

fn default_gain() -> f32 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Station {
    /// Opaque unique id — the key used by the unplayable set.
    pub id: String,
    pub name: String,
    /// Primary stream spec.  Mirrors for the same station may be bundled in
    /// one field, `|`-delimited and order-significant.
    #[serde(alias = "streamUrl")]
    pub stream_url: String,
    /// Single alternative source, tried only after every primary mirror and
    /// the recovery strategies on them are exhausted.
    #[serde(default, alias = "fallbackStreamUrl")]
    pub fallback_stream_url: Option<String>,
    /// Linear volume correction, multiplied with user volume and clamped to
    /// [0, 1] at the output.  Stations that broadcast hot get < 1.0, quiet
    /// ones > 1.0.
    #[serde(default = "default_gain")]
    pub gain: f32,
    /// Short description / blurb
    #[serde(default)]
    pub description: String,
    /// Searchable tags (genre, style, language, etc.)
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for Station {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            stream_url: String::new(),
            fallback_stream_url: None,
            gain: default_gain(),
            description: String::new(),
            tags: Vec::new(),
        }
    }
}

impl Station {
    /// Primary mirror URLs in catalog order.
    pub fn mirrors(&self) -> Vec<&str> {
        self.stream_url
            .split('|')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .collect()
    }

    /// True when at least one mirror is an http(s) URL.  Remote lists carry
    /// the occasional rtmp:// or empty entry; those never become playable.
    pub fn has_playable_url(&self) -> bool {
        self.mirrors()
            .iter()
            .any(|u| u.starts_with("http://") || u.starts_with("https://"))
    }
}

// ── TOML station loader ───────────────────────────────────────────────────────

/// Intermediate struct that matches the TOML `[[station]]` table.
/// We keep this separate from `Station` so the TOML schema can diverge from
/// the wire protocol struct without breaking either.
#[derive(Debug, Clone, Deserialize)]
pub struct TomlStation {
    /// Optional in TOML; derived from the name when absent.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub stream_url: String,
    #[serde(default)]
    pub fallback_stream_url: Option<String>,
    #[serde(default = "default_gain")]
    pub gain: f32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TomlStationFile {
    station: Vec<TomlStation>,
}

impl From<TomlStation> for Station {
    fn from(s: TomlStation) -> Self {
        let id = if s.id.is_empty() {
            slug_from_name(&s.name)
        } else {
            s.id
        };
        Station {
            id,
            name: s.name,
            stream_url: s.stream_url,
            fallback_stream_url: s.fallback_stream_url,
            gain: s.gain,
            description: s.description,
            tags: s.tags,
        }
    }
}

fn slug_from_name(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

pub fn load_stations_from_toml(path: &Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let file: TomlStationFile = toml::from_str(content)?;
    Ok(file.station.into_iter().map(Station::from).collect())
}

// ── remote JSON list ──────────────────────────────────────────────────────────

async fn fetch_stations_url(url: &str) -> anyhow::Result<Vec<Station>> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let text = response.text().await?;
    let stations: Vec<Station> = serde_json::from_str(&text)?;
    Ok(stations)
}

// ── loading cascade ───────────────────────────────────────────────────────────

pub async fn load_stations(config: &StationsConfig) -> Vec<Station> {
    // 1. Inline entries in the config file (highest priority)
    if !config.station.is_empty() {
        let stations: Vec<Station> = config
            .station
            .iter()
            .cloned()
            .map(Station::from)
            .collect();
        info!("Loaded {} stations from config entries", stations.len());
        return stations;
    }

    // 2. User stations.toml (config dir by default)
    let toml_path = &config.stations_toml;
    if toml_path.exists() {
        match load_stations_from_toml(toml_path) {
            Ok(s) => {
                info!(
                    "Loaded {} stations from TOML: {}",
                    s.len(),
                    toml_path.display()
                );
                return s;
            }
            Err(e) => warn!("Failed to parse TOML stations: {}", e),
        }
    }

    // 3. stations.toml beside executable (bundled distribution)
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let beside = dir.join("stations.toml");
            if beside.exists() {
                match load_stations_from_toml(&beside) {
                    Ok(s) => {
                        info!(
                            "Loaded {} stations from beside-exe: {}",
                            s.len(),
                            beside.display()
                        );
                        return s;
                    }
                    Err(e) => warn!("Failed to parse beside-exe stations.toml: {}", e),
                }
            }
        }
    }

    // 4. Remote JSON list
    if !config.remote_url.is_empty() {
        match fetch_stations_url(&config.remote_url).await {
            Ok(s) => {
                let playable: Vec<Station> =
                    s.into_iter().filter(Station::has_playable_url).collect();
                info!("Loaded {} stations from URL", playable.len());
                if !playable.is_empty() {
                    return playable;
                }
            }
            Err(e) => warn!("Failed to fetch stations from URL: {}", e),
        }
    }

    // 5. Built-in defaults
    let defaults = default_stations();
    info!("Using {} built-in default stations", defaults.len());
    defaults
}

/// Last-resort catalog so a fresh install can play something.
pub fn default_stations() -> Vec<Station> {
    vec![
        Station {
            id: "soma-groovesalad".into(),
            name: "SomaFM Groove Salad".into(),
            stream_url: "https://ice1.somafm.com/groovesalad-128-mp3|https://ice2.somafm.com/groovesalad-128-mp3".into(),
            fallback_stream_url: Some("https://ice6.somafm.com/groovesalad-128-mp3".into()),
            gain: 1.0,
            description: "Ambient/downtempo beats and grooves".into(),
            tags: vec!["ambient".into(), "electronic".into()],
        },
        Station {
            id: "soma-dronezone".into(),
            name: "SomaFM Drone Zone".into(),
            stream_url: "https://ice1.somafm.com/dronezone-128-mp3|https://ice2.somafm.com/dronezone-128-mp3".into(),
            fallback_stream_url: None,
            gain: 1.2,
            description: "Served best chilled, safe with most medications".into(),
            tags: vec!["ambient".into(), "space".into()],
        },
        Station {
            id: "nts-1".into(),
            name: "NTS 1".into(),
            stream_url: "https://stream-relay-geo.ntslive.net/stream".into(),
            fallback_stream_url: None,
            gain: 1.0,
            description: "London live channel 1".into(),
            tags: vec!["eclectic".into(), "live".into()],
        },
        Station {
            id: "cri-easyfm".into(),
            name: "Easy FM".into(),
            stream_url: "http://sk.cri.cn/915.m3u8".into(),
            fallback_stream_url: None,
            gain: 0.8,
            description: "CRI Easy FM, Beijing".into(),
            tags: vec!["pop".into(), "english".into()],
        },
        Station {
            id: "cnr-voice".into(),
            name: "CNR Voice of China".into(),
            stream_url: "https://ngcdn001.cnr.cn/live/zgzs/index.m3u8".into(),
            fallback_stream_url: None,
            gain: 1.0,
            description: "China National Radio news and talk".into(),
            tags: vec!["news".into(), "talk".into()],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_split_on_pipe_preserving_order() {
        let station = Station {
            stream_url: "http://a.example/one.mp3|https://b.example/two.mp3| https://c.example/x.m3u8 ".into(),
            ..Station::default()
        };
        assert_eq!(
            station.mirrors(),
            vec![
                "http://a.example/one.mp3",
                "https://b.example/two.mp3",
                "https://c.example/x.m3u8"
            ]
        );
    }

    #[test]
    fn single_url_is_one_mirror() {
        let station = Station {
            stream_url: "https://a.example/stream".into(),
            ..Station::default()
        };
        assert_eq!(station.mirrors(), vec!["https://a.example/stream"]);
    }

    #[test]
    fn toml_stations_parse_with_defaults() {
        let toml = r#"
            [[station]]
            name = "Test FM"
            stream_url = "https://example.com/a.mp3|https://mirror.example.com/a.mp3"

            [[station]]
            id = "custom-id"
            name = "Other"
            stream_url = "http://example.com/b.m3u8"
            fallback_stream_url = "https://backup.example.com/b.mp3"
            gain = 0.8
            tags = ["jazz"]
        "#;
        let stations = parse_stations_from_toml_str(toml).unwrap();
        assert_eq!(stations.len(), 2);

        assert_eq!(stations[0].id, "test-fm");
        assert_eq!(stations[0].gain, 1.0);
        assert_eq!(stations[0].mirrors().len(), 2);
        assert!(stations[0].fallback_stream_url.is_none());

        assert_eq!(stations[1].id, "custom-id");
        assert_eq!(stations[1].gain, 0.8);
        assert_eq!(
            stations[1].fallback_stream_url.as_deref(),
            Some("https://backup.example.com/b.mp3")
        );
    }

    #[test]
    fn json_station_accepts_camel_case_aliases() {
        let json = r#"{
            "id": "legacy-1",
            "name": "Legacy",
            "streamUrl": "https://example.com/live.m3u8",
            "fallbackStreamUrl": "https://example.com/live.mp3"
        }"#;
        let station: Station = serde_json::from_str(json).unwrap();
        assert_eq!(station.stream_url, "https://example.com/live.m3u8");
        assert_eq!(
            station.fallback_stream_url.as_deref(),
            Some("https://example.com/live.mp3")
        );
        assert_eq!(station.gain, 1.0);
    }

    #[test]
    fn playable_url_filter_rejects_non_http() {
        let bad = Station {
            stream_url: "rtmp://example.com/live".into(),
            ..Station::default()
        };
        assert!(!bad.has_playable_url());

        let good = Station {
            stream_url: "rtmp://example.com/live|https://example.com/live.mp3".into(),
            ..Station::default()
        };
        assert!(good.has_playable_url());
    }

    #[test]
    fn default_stations_are_well_formed() {
        let stations = default_stations();
        assert!(!stations.is_empty());
        for s in &stations {
            assert!(!s.id.is_empty());
            assert!(s.has_playable_url());
            assert!(s.gain > 0.0);
        }
    }
}
