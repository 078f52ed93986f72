use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{SibError, SibResult};
use crate::types::SearchMode;

/// Top-level configuration (loaded from sibvault.toml), shared by `sibd` and `sib`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SibConfig {
    pub server: ServerConfig,
    pub shield: ShieldConfig,
    pub client: ClientConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address (default: 127.0.0.1:6543)
    pub listen: String,
    /// Maximum number of connections served concurrently (0 = cpu_count)
    pub workers: usize,
    /// Directory holding one JSON file per account
    pub store_dir: PathBuf,
    /// PEM certificate chain for the TLS listener
    pub tls_cert: Option<PathBuf>,
    /// PEM private key (PKCS#8) for the TLS listener
    pub tls_key: Option<PathBuf>,
    /// Refuse to start without a TLS certificate
    pub enforce_tls: bool,
    /// Pause between two streamed records, in milliseconds
    pub stream_pacing_ms: u64,
    /// Capacity of the per-connection inbound mailbox
    pub mailbox: usize,
    /// Prometheus metrics endpoint (default: disabled)
    pub metrics_addr: Option<String>,
}

/// Brute-force shield: peers collecting too many strikes are banned for a while
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    pub enabled: bool,
    /// Strikes tolerated before a ban
    pub max_suspicion: u32,
    /// Ban duration in seconds
    pub ban_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (host:port)
    pub server: String,
    /// Name checked against the server certificate (defaults to the host part)
    pub server_name: Option<String>,
    /// Extra CA certificate (PEM) trusted for the server
    pub ca_cert: Option<PathBuf>,
    /// Connect over TLS (default: true)
    pub tls: bool,
    /// Upper bound for the handshake and for each vault operation, in seconds
    pub timeout_secs: u64,
    /// Which fields a search pattern is matched against
    pub search_mode: SearchMode,
    /// PBKDF2-HMAC-SHA512 iterations for the master secret
    pub pbkdf2_iterations: u32,
    /// Cipher suite: curve1, cipher1, curve2, cipher2, curve3, cipher3
    /// (empty strings for unused stages)
    pub suite: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:6543".into(),
            workers: 0,
            store_dir: PathBuf::from("~/.local/share/sibvault/accounts"),
            tls_cert: None,
            tls_key: None,
            enforce_tls: false,
            stream_pacing_ms: 5,
            mailbox: 32,
            metrics_addr: None,
        }
    }
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_suspicion: 3,
            ban_secs: 600,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:6543".into(),
            server_name: None,
            ca_cert: None,
            tls: true,
            timeout_secs: 30,
            search_mode: SearchMode::First,
            pbkdf2_iterations: 100_000,
            suite: vec![
                "x25519".into(),
                "xchacha20-poly1305".into(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
            ],
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl SibConfig {
    /// Load the configuration file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> SibResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: SibConfig = toml::from_str(&content)
            .map_err(|e| SibError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration back, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> SibResult<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| SibError::Config(format!("serializing config: {e}")))?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(path).map_err(|e| SibError::Io(e.error))?;
        tracing::debug!("config written to {}", path.display());
        Ok(())
    }

    /// Reject values that cannot work at runtime.
    pub fn validate(&self) -> SibResult<()> {
        if self.client.suite.len() != 6 {
            return Err(SibError::InvalidValue {
                field: "client.suite",
                value: format!("{} names (expected 6)", self.client.suite.len()),
            });
        }
        if self.client.pbkdf2_iterations == 0 {
            return Err(SibError::InvalidValue {
                field: "client.pbkdf2_iterations",
                value: "0".into(),
            });
        }
        if self.client.timeout_secs == 0 {
            return Err(SibError::InvalidValue {
                field: "client.timeout_secs",
                value: "0".into(),
            });
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(SibError::Config(
                "server.tls_cert and server.tls_key must be set together".into(),
            ));
        }
        if self.server.mailbox == 0 {
            return Err(SibError::InvalidValue {
                field: "server.mailbox",
                value: "0".into(),
            });
        }
        Ok(())
    }
}

impl ServerConfig {
    /// Effective worker count (`0` resolves to the number of CPUs).
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(format!("{home}/{rest}"))
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[server]
listen = "0.0.0.0:7000"
workers = 8
store_dir = "/var/lib/sibvault"
tls_cert = "/etc/sibvault/cert.pem"
tls_key = "/etc/sibvault/key.pem"
enforce_tls = true
stream_pacing_ms = 0
metrics_addr = "127.0.0.1:9200"

[shield]
max_suspicion = 5
ban_secs = 60

[client]
server = "vault.example.com:7000"
tls = true
timeout_secs = 10
search_mode = "all"
pbkdf2_iterations = 200000
suite = ["secp256r1", "aes-256-gcm", "x25519", "chacha20-poly1305", "", ""]

[log]
level = "debug"
format = "json"
"#;
        let config: SibConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:7000");
        assert_eq!(config.server.effective_workers(), 8);
        assert!(config.server.enforce_tls);
        assert_eq!(config.server.stream_pacing_ms, 0);
        assert_eq!(config.shield.max_suspicion, 5);
        assert!(config.shield.enabled);
        assert_eq!(config.client.search_mode, SearchMode::All);
        assert_eq!(config.client.suite[2], "x25519");
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: SibConfig = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:6543");
        assert!(!config.server.enforce_tls);
        assert_eq!(config.server.stream_pacing_ms, 5);
        assert_eq!(config.client.timeout_secs, 30);
        assert_eq!(config.client.search_mode, SearchMode::First);
        assert_eq!(config.client.suite.len(), 6);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_validate_rejects_half_tls() {
        let mut config = SibConfig::default();
        config.server.tls_cert = Some(PathBuf::from("/tmp/cert.pem"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_suite() {
        let mut config = SibConfig::default();
        config.client.suite = vec!["x25519".into(), "aes-256-gcm".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client.suite"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SibConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.client.server, "127.0.0.1:6543");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sibvault.toml");
        std::fs::write(&path, "[client]\ntimeout_secs = 3\n").unwrap();
        let config = SibConfig::load(&path).unwrap();
        assert_eq!(config.client.timeout_secs, 3);
        assert_eq!(config.client.pbkdf2_iterations, 100_000);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sibvault.toml");
        let mut config = SibConfig::default();
        config.client.suite[0] = "secp384r1".into();
        config.client.timeout_secs = 7;
        config.save(&path).unwrap();

        let loaded = SibConfig::load(&path).unwrap();
        assert_eq!(loaded.client.suite, config.client.suite);
        assert_eq!(loaded.client.timeout_secs, 7);
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_save_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sibvault.toml");
        let mut config = SibConfig::default();
        config.client.suite.pop();
        assert!(config.save(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = SibConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SibConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.server.listen, parsed.server.listen);
        assert_eq!(config.client.suite, parsed.client.suite);
    }
}
