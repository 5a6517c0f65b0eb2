use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::civil::{BuildingZone, DEFAULT_UTC_OFFSET_MINUTES};

/// Server settings, read once at startup from `CONCIERGE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub password: String,
    pub data_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub directory_path: PathBuf,
    pub zone: BuildingZone,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    /// Plaintext when unset.
    pub tls: Option<TlsFiles>,
}

/// PEM certificate chain and private key for the wire listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={:?}: expected {}", self.var, self.value, self.expected)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |var: &str, default: &str| lookup(var).unwrap_or_else(|| default.to_string());

        let offset: i32 = parse_or(
            &lookup,
            "CONCIERGE_UTC_OFFSET_MINUTES",
            DEFAULT_UTC_OFFSET_MINUTES,
            "minutes east of UTC",
        )?;
        let zone = BuildingZone::from_offset_minutes(offset).ok_or_else(|| ConfigError {
            var: "CONCIERGE_UTC_OFFSET_MINUTES",
            value: offset.to_string(),
            expected: "an offset within ±1439 minutes",
        })?;

        let sweep_secs: u64 = parse_or(&lookup, "CONCIERGE_SWEEP_INTERVAL_SECS", 300, "seconds")?;
        if sweep_secs == 0 {
            return Err(ConfigError {
                var: "CONCIERGE_SWEEP_INTERVAL_SECS",
                value: "0".into(),
                expected: "a positive number of seconds",
            });
        }
        let max_connections: usize =
            parse_or(&lookup, "CONCIERGE_MAX_CONNECTIONS", 256, "a connection count")?;
        if max_connections == 0 {
            return Err(ConfigError {
                var: "CONCIERGE_MAX_CONNECTIONS",
                value: "0".into(),
                expected: "at least one connection",
            });
        }

        let metrics_port = match lookup("CONCIERGE_METRICS_PORT") {
            None => None,
            Some(raw) => Some(raw.parse().map_err(|_| ConfigError {
                var: "CONCIERGE_METRICS_PORT",
                value: raw.clone(),
                expected: "a TCP port",
            })?),
        };

        let tls = match (lookup("CONCIERGE_TLS_CERT"), lookup("CONCIERGE_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.into(),
                key: key.into(),
            }),
            (Some(_), None) => {
                return Err(ConfigError {
                    var: "CONCIERGE_TLS_KEY",
                    value: String::new(),
                    expected: "a key file to go with CONCIERGE_TLS_CERT",
                });
            }
            (None, Some(_)) => {
                return Err(ConfigError {
                    var: "CONCIERGE_TLS_CERT",
                    value: String::new(),
                    expected: "a certificate file to go with CONCIERGE_TLS_KEY",
                });
            }
        };

        Ok(Self {
            bind: text("CONCIERGE_BIND", "0.0.0.0"),
            port: parse_or(&lookup, "CONCIERGE_PORT", 5433, "a TCP port")?,
            password: text("CONCIERGE_PASSWORD", "concierge"),
            data_dir: PathBuf::from(text("CONCIERGE_DATA_DIR", "./data")),
            catalog_path: PathBuf::from(text("CONCIERGE_CATALOG", "./amenities.json")),
            directory_path: PathBuf::from(text("CONCIERGE_DIRECTORY", "./users.json")),
            zone,
            sweep_interval: Duration::from_secs(sweep_secs),
            compact_threshold: parse_or(&lookup, "CONCIERGE_COMPACT_THRESHOLD", 1000, "an append count")?,
            max_connections,
            metrics_port,
            tls,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservations.wal")
    }
}

impl TlsFiles {
    /// Load both files and build the acceptor. Clients negotiate ALPN `postgresql`.
    pub fn acceptor(&self) -> io::Result<TlsAcceptor> {
        let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidInput, msg);

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(&self.cert)?))
            .collect::<Result<_, _>>()?;
        if certs.is_empty() {
            return Err(invalid(format!("no certificates in {}", self.cert.display())));
        }
        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&self.key)?))?
            .ok_or_else(|| invalid(format!("no private key in {}", self.key.display())))?;

        let mut server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| invalid(e.to_string()))?;
        server.alpn_protocols = vec![b"postgresql".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(server)))
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError {
            var,
            value: raw,
            expected,
        }),
    }
}
