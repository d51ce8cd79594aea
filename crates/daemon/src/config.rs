//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// HTTP API listen address
    pub listen: String,

    /// Cache configuration
    pub cache: CacheConfig,

    /// WireGuard tool configuration
    pub wireguard: WireGuardConfig,

    /// Reconciliation configuration
    pub reconcile: ReconcileConfig,

    /// Security configuration
    pub security: SecurityConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: wgplane_common::default_store_path(),
            listen: "127.0.0.1:8002".to_string(),
            cache: CacheConfig::default(),
            wireguard: WireGuardConfig::default(),
            reconcile: ReconcileConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

/// Cache endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis endpoint URL; None runs with the in-process cache
    pub url: Option<String>,

    /// TTL for cached peer state in seconds
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            ttl_secs: 60,
        }
    }
}

/// WireGuard tool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardConfig {
    /// Path to the wg binary
    pub wg_binary: String,

    /// Path to the wg-quick binary
    pub wg_quick_binary: String,

    /// Host configuration directory for interface files
    pub config_dir: PathBuf,

    /// Per-invocation execution timeout in seconds
    pub apply_timeout_secs: u64,

    /// Maximum apply attempts before surfacing the failure
    pub retry_ceiling: u32,

    /// DNS server written into rendered client configs
    pub client_dns: Option<String>,

    /// PersistentKeepalive written into rendered client configs
    pub client_keepalive: u16,

    /// Seconds since last handshake before a peer counts as disconnected
    pub handshake_threshold_secs: i64,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            wg_binary: "wg".to_string(),
            wg_quick_binary: "wg-quick".to_string(),
            config_dir: PathBuf::from("/etc/wireguard"),
            apply_timeout_secs: 10,
            retry_ceiling: 3,
            client_dns: Some("1.1.1.1".to_string()),
            client_keepalive: 25,
            handshake_threshold_secs: 300,
        }
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Seconds between passes on each interface
    pub interval_secs: u64,

    /// Drift count above which a pass raises an operator alert
    pub drift_alert_threshold: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            drift_alert_threshold: 10,
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Key material for higher-layer auth token issuance.
    /// Loaded or generated at startup; token policy lives outside the core.
    pub token_secret_path: Option<PathBuf>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token_secret_path: None,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Get the token secret path
    pub fn token_secret_path(&self) -> PathBuf {
        self.security
            .token_secret_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("token.secret"))
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.wireguard.apply_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }
}
