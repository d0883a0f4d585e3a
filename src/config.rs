use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Network to listen on: "tcp", "tcp4", "tcp6" or "unix"
    pub network: String,

    /// Maximum number of concurrently connected clients, -1 for no limit
    pub max_clients: i32,

    /// Path to a PEM certificate file; together with `tls_key` enables TLS mode
    pub tls_cert: Option<PathBuf>,

    /// Path to a PEM private key file; together with `tls_cert` enables TLS mode
    pub tls_key: Option<PathBuf>,

    /// Pre-built rustls configuration overriding the one loaded from
    /// `tls_cert`/`tls_key`
    #[serde(skip)]
    pub tls_config: Option<Arc<rustls::ServerConfig>>,

    /// Interval of the background job that aggregates metrics and reclaims
    /// closed sockets
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: "tcp".to_string(),
            max_clients: -1,
            tls_cert: None,
            tls_key: None,
            tls_config: None,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.network.as_str() {
            "tcp" | "tcp4" | "tcp6" | "unix" => {}
            other => anyhow::bail!("unsupported network {:?}", other),
        }

        if self.tick_interval.is_zero() {
            anyhow::bail!("tick_interval must be > 0");
        }

        if self.tls_cert.is_some() != self.tls_key.is_some() {
            anyhow::bail!("tls_cert and tls_key must be provided together");
        }

        Ok(())
    }

    /// TLS mode is enabled when both certificate and key paths are set.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.network, "tcp");
        assert_eq!(config.max_clients, -1);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert!(!config.tls_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_network() {
        let config = ServerConfig {
            network: "udp".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_partial_tls() {
        let config = ServerConfig {
            tls_cert: Some(PathBuf::from("cert.pem")),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = ServerConfig {
            max_clients: 64,
            tick_interval: Duration::from_millis(250),
            ..Default::default()
        };

        let encoded = toml::to_string(&config).unwrap();
        let decoded: ServerConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.max_clients, 64);
        assert_eq!(decoded.tick_interval, Duration::from_millis(250));
    }
}
