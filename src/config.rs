use std::path::PathBuf;
use std::str::FromStr;

use crate::limits::*;
use crate::model::Ms;

/// Window bounds every reservation must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Minimum distance between "now" and the window start.
    pub min_lead: Ms,
    pub min_duration: Ms,
    pub max_duration: Ms,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            min_lead: DEFAULT_MIN_LEAD_MINUTES * MINUTE_MS,
            min_duration: DEFAULT_MIN_DURATION_MINUTES * MINUTE_MS,
            max_duration: DEFAULT_MAX_DURATION_MINUTES * MINUTE_MS,
        }
    }
}

/// Server configuration, read from `PARKLINE_*` environment variables.
///
/// | Variable | Default |
/// |----------|---------|
/// | PARKLINE_BIND | 0.0.0.0 |
/// | PARKLINE_PORT | 5434 |
/// | PARKLINE_DATA_DIR | ./data |
/// | PARKLINE_PASSWORD | parkline |
/// | PARKLINE_MAX_CONNECTIONS | 256 |
/// | PARKLINE_COMPACT_THRESHOLD | 1000 |
/// | PARKLINE_METRICS_PORT | unset (disabled) |
/// | PARKLINE_TLS_CERT / PARKLINE_TLS_KEY | unset (plaintext) |
/// | PARKLINE_MIN_LEAD_MINUTES | 5 |
/// | PARKLINE_MIN_DURATION_MINUTES | 30 |
/// | PARKLINE_MAX_DURATION_MINUTES | 1440 |
/// | PARKLINE_EXPIRY_POLL_MS | 1000 |
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub policy: BookingPolicy,
    /// Upper bound on how long the expiry worker sleeps between scans.
    pub expiry_poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5434,
            data_dir: PathBuf::from("./data"),
            password: "parkline".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            policy: BookingPolicy::default(),
            expiry_poll_ms: 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let policy = BookingPolicy {
            min_lead: env_parse::<i64>("PARKLINE_MIN_LEAD_MINUTES")
                .map_or(defaults.policy.min_lead, |m| m * MINUTE_MS),
            min_duration: env_parse::<i64>("PARKLINE_MIN_DURATION_MINUTES")
                .map_or(defaults.policy.min_duration, |m| m * MINUTE_MS),
            max_duration: env_parse::<i64>("PARKLINE_MAX_DURATION_MINUTES")
                .map_or(defaults.policy.max_duration, |m| m * MINUTE_MS),
        };
        Self {
            bind: std::env::var("PARKLINE_BIND").unwrap_or(defaults.bind),
            port: env_parse("PARKLINE_PORT").unwrap_or(defaults.port),
            data_dir: std::env::var("PARKLINE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: std::env::var("PARKLINE_PASSWORD").unwrap_or(defaults.password),
            max_connections: env_parse("PARKLINE_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: env_parse("PARKLINE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: env_parse("PARKLINE_METRICS_PORT"),
            tls_cert: std::env::var("PARKLINE_TLS_CERT").ok(),
            tls_key: std::env::var("PARKLINE_TLS_KEY").ok(),
            policy,
            expiry_poll_ms: env_parse("PARKLINE_EXPIRY_POLL_MS").unwrap_or(defaults.expiry_poll_ms),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("parkline.wal")
    }

    pub fn expiry_path(&self) -> PathBuf {
        self.data_dir.join("expiry.wal")
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_bounds() {
        let p = BookingPolicy::default();
        assert_eq!(p.min_lead, 5 * MINUTE_MS);
        assert_eq!(p.min_duration, 30 * MINUTE_MS);
        assert_eq!(p.max_duration, 24 * HOUR_MS);
    }

    #[test]
    fn wal_paths_live_in_data_dir() {
        let cfg = Config {
            data_dir: PathBuf::from("/tmp/parkline"),
            ..Config::default()
        };
        assert_eq!(cfg.wal_path(), PathBuf::from("/tmp/parkline/parkline.wal"));
        assert_eq!(cfg.expiry_path(), PathBuf::from("/tmp/parkline/expiry.wal"));
    }
}
