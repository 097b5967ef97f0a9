use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Log line format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Server settings, read from `SEATLINE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub user: String,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between automatic compactions.
    pub compact_threshold: u64,
    /// How long a request may wait to enter a section's serialization domain.
    pub lock_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            user: "seatline".into(),
            password: "seatline".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_timeout: Duration::from_millis(2_000),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            log_format: LogFormat::Compact,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }
        let defaults = Self::default();

        Self {
            bind: lookup("SEATLINE_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "SEATLINE_PORT").unwrap_or(defaults.port),
            data_dir: lookup("SEATLINE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            user: lookup("SEATLINE_USER").unwrap_or(defaults.user),
            password: lookup("SEATLINE_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "SEATLINE_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "SEATLINE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            lock_timeout: parsed(&lookup, "SEATLINE_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            metrics_port: parsed(&lookup, "SEATLINE_METRICS_PORT"),
            tls_cert: lookup("SEATLINE_TLS_CERT"),
            tls_key: lookup("SEATLINE_TLS_KEY"),
            log_format: parsed(&lookup, "SEATLINE_LOG_FORMAT").unwrap_or(defaults.log_format),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(lookup(&[]));
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.lock_timeout, Duration::from_secs(2));
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.log_format, LogFormat::Compact);
    }

    #[test]
    fn reads_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("SEATLINE_PORT", "6000"),
            ("SEATLINE_BIND", "127.0.0.1"),
            ("SEATLINE_LOCK_TIMEOUT_MS", "250"),
            ("SEATLINE_METRICS_PORT", "9100"),
            ("SEATLINE_LOG_FORMAT", "json"),
            ("SEATLINE_COMPACT_THRESHOLD", "42"),
        ]));
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6000");
        assert_eq!(cfg.lock_timeout, Duration::from_millis(250));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.compact_threshold, 42);
    }

    #[test]
    fn garbage_falls_back() {
        let cfg = Config::from_lookup(lookup(&[
            ("SEATLINE_PORT", "not-a-port"),
            ("SEATLINE_LOG_FORMAT", "xml"),
        ]));
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.log_format, LogFormat::Compact);
    }
}
