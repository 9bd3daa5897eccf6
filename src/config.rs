use std::path::PathBuf;
use std::str::FromStr;

use crate::limits::DEFAULT_TXN_ATTEMPTS;

/// Process configuration, read once at startup from `CLEANUP_*` variables.
/// Unparseable numbers fall back to their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Shared login password, used when no tokens file is configured.
    pub password: String,
    /// JSON object of user id to login token.
    pub tokens_file: Option<PathBuf>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub txn_attempts: u32,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup;
        Self {
            bind: lookup("CLEANUP_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(lookup, "CLEANUP_PORT").unwrap_or(5433),
            data_dir: lookup("CLEANUP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("CLEANUP_PASSWORD").unwrap_or_else(|| "cleanup".into()),
            tokens_file: lookup("CLEANUP_TOKENS_FILE").map(PathBuf::from),
            max_connections: parsed(lookup, "CLEANUP_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(lookup, "CLEANUP_COMPACT_THRESHOLD").unwrap_or(1000),
            txn_attempts: parsed(lookup, "CLEANUP_TXN_ATTEMPTS").unwrap_or(DEFAULT_TXN_ATTEMPTS),
            metrics_port: parsed(lookup, "CLEANUP_METRICS_PORT"),
            tls_cert: lookup("CLEANUP_TLS_CERT"),
            tls_key: lookup("CLEANUP_TLS_KEY"),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
