use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

use crate::limits::{BookingPolicy, MAX_MIN_LEAD_MINUTES};

const DEFAULT_MIN_LEAD_MINUTES: i64 = 30;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// JSON seed for the in-memory catalog.
    pub catalog_path: Option<PathBuf>,
    pub max_connections: usize,
    pub request_timeout: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub min_lead_minutes: i64,
    pub strict_duration: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            bind: lookup("BOOKSPOT_BIND").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "BOOKSPOT_PORT", 7878),
            data_dir: lookup("BOOKSPOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            catalog_path: lookup("BOOKSPOT_CATALOG")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            max_connections: parse_or::<usize>(&lookup, "BOOKSPOT_MAX_CONNECTIONS", 256).max(1),
            request_timeout: Duration::from_millis(parse_or(&lookup, "BOOKSPOT_REQUEST_TIMEOUT_MS", 5000)),
            compact_threshold: parse_or(&lookup, "BOOKSPOT_COMPACT_THRESHOLD", 1000),
            metrics_port: lookup("BOOKSPOT_METRICS_PORT").and_then(|v| v.trim().parse().ok()),
            min_lead_minutes: Some(parse_or(&lookup, "BOOKSPOT_MIN_LEAD_MINUTES", DEFAULT_MIN_LEAD_MINUTES))
                .filter(|m| (0..=MAX_MIN_LEAD_MINUTES).contains(m))
                .unwrap_or(DEFAULT_MIN_LEAD_MINUTES),
            strict_duration: lookup("BOOKSPOT_STRICT_DURATION")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }

    pub fn policy(&self) -> BookingPolicy {
        BookingPolicy {
            min_lead: TimeDelta::minutes(self.min_lead_minutes),
            strict_duration: self.strict_duration,
            ..BookingPolicy::default()
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]);
        assert_eq!(c.bind, "0.0.0.0");
        assert_eq!(c.port, 7878);
        assert_eq!(c.data_dir, PathBuf::from("./data"));
        assert!(c.catalog_path.is_none());
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.request_timeout, Duration::from_millis(5000));
        assert_eq!(c.compact_threshold, 1000);
        assert!(c.metrics_port.is_none());
        assert_eq!(c.policy(), BookingPolicy::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let c = config(&[
            ("BOOKSPOT_PORT", "9000"),
            ("BOOKSPOT_DATA_DIR", "/var/lib/bookspot"),
            ("BOOKSPOT_CATALOG", "/etc/bookspot/catalog.json"),
            ("BOOKSPOT_REQUEST_TIMEOUT_MS", "250"),
            ("BOOKSPOT_METRICS_PORT", "9100"),
            ("BOOKSPOT_MIN_LEAD_MINUTES", "0"),
            ("BOOKSPOT_STRICT_DURATION", "TRUE"),
        ]);
        assert_eq!(c.port, 9000);
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/bookspot/bookings.wal"));
        assert_eq!(c.catalog_path, Some(PathBuf::from("/etc/bookspot/catalog.json")));
        assert_eq!(c.request_timeout, Duration::from_millis(250));
        assert_eq!(c.metrics_port, Some(9100));
        let policy = c.policy();
        assert_eq!(policy.min_lead, TimeDelta::zero());
        assert!(policy.strict_duration);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let c = config(&[
            ("BOOKSPOT_PORT", "not-a-port"),
            ("BOOKSPOT_MAX_CONNECTIONS", "0"),
            ("BOOKSPOT_STRICT_DURATION", "maybe"),
            ("BOOKSPOT_CATALOG", ""),
        ]);
        assert_eq!(c.port, 7878);
        assert_eq!(c.max_connections, 1);
        assert!(!c.policy().strict_duration);
        assert!(c.catalog_path.is_none());
    }

    #[test]
    fn out_of_range_lead_time_falls_back() {
        for raw in ["-5", "99999999999999", "10081"] {
            let c = config(&[("BOOKSPOT_MIN_LEAD_MINUTES", raw)]);
            assert_eq!(c.min_lead_minutes, 30, "{raw}");
            assert_eq!(c.policy().min_lead, TimeDelta::minutes(30));
        }
        let week = config(&[("BOOKSPOT_MIN_LEAD_MINUTES", "10080")]);
        assert_eq!(week.min_lead_minutes, 10080);
    }
}
