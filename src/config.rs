use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::engine::AdmissionConfig;
use crate::limits::MAX_SUGGESTIONS;
use crate::model::{DAY_MS, Ms};

/// Server settings, read once at startup from `EVSHARE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    pub admission: AdmissionConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparsable values fall back to
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = AdmissionConfig::default();
        let mut max_suggestions = load(&lookup, "EVSHARE_MAX_SUGGESTIONS", defaults.max_suggestions);
        if max_suggestions > MAX_SUGGESTIONS {
            warn!("EVSHARE_MAX_SUGGESTIONS capped at {MAX_SUGGESTIONS}");
            max_suggestions = MAX_SUGGESTIONS;
        }

        let admission = AdmissionConfig {
            weights: defaults.weights,
            max_suggestions,
            search_horizon_ms: days(&lookup, "EVSHARE_SEARCH_HORIZON_DAYS", defaults.search_horizon_ms),
            scoring_window_ms: days(&lookup, "EVSHARE_SCORING_WINDOW_DAYS", defaults.scoring_window_ms),
            lead_horizon_ms: days(&lookup, "EVSHARE_LEAD_HORIZON_DAYS", defaults.lead_horizon_ms),
        };

        let reaper_secs: u64 = load(&lookup, "EVSHARE_REAPER_INTERVAL_SECS", 30);
        Self {
            port: load(&lookup, "EVSHARE_PORT", 8080),
            bind: lookup("EVSHARE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("EVSHARE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: lookup("EVSHARE_METRICS_PORT").and_then(|s| parse("EVSHARE_METRICS_PORT", &s)),
            compact_threshold: load(&lookup, "EVSHARE_COMPACT_THRESHOLD", 1000),
            reaper_interval: Duration::from_secs(reaper_secs.max(1)),
            admission,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("evshare.wal")
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Option<T>
where
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| warn!("Invalid {key} value {raw:?}: {e}, using default"))
        .ok()
}

fn load<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T::Err: Display,
{
    lookup(key).and_then(|raw| parse(key, &raw)).unwrap_or(default)
}

fn days(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Ms) -> Ms {
    match lookup(key).and_then(|raw| parse::<u32>(key, &raw)) {
        Some(0) => {
            warn!("{key} must be positive, using default");
            default
        }
        Some(d) => d as Ms * DAY_MS,
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.admission, AdmissionConfig::default());
        assert_eq!(config.wal_path(), PathBuf::from("./data/evshare.wal"));
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("EVSHARE_PORT", "9000"),
            ("EVSHARE_METRICS_PORT", "9100"),
            ("EVSHARE_SEARCH_HORIZON_DAYS", "3"),
            ("EVSHARE_MAX_SUGGESTIONS", "5"),
            ("EVSHARE_REAPER_INTERVAL_SECS", "10"),
        ]);
        assert_eq!(config.port, 9000);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.admission.search_horizon_ms, 3 * DAY_MS);
        assert_eq!(config.admission.max_suggestions, 5);
        assert_eq!(config.reaper_interval, Duration::from_secs(10));
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = config_from(&[
            ("EVSHARE_PORT", "not-a-port"),
            ("EVSHARE_LEAD_HORIZON_DAYS", "0"),
            ("EVSHARE_MAX_SUGGESTIONS", "500"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.admission.lead_horizon_ms, 7 * DAY_MS);
        assert_eq!(config.admission.max_suggestions, MAX_SUGGESTIONS);
        assert!(config.admission.validate().is_ok());
    }
}
