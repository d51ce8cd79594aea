//! Core types for wgplane

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Peer lifecycle state as persisted in the store.
///
/// `Pending` means the store record is committed but the live interface
/// apply has not yet succeeded; API clients see it as `apply-pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Pending,
    Active,
    Revoked,
}

impl Default for PeerState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

impl std::str::FromStr for PeerState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "revoked" => Ok(Self::Revoked),
            _ => Err(format!("unknown peer state: {}", s)),
        }
    }
}

impl PeerState {
    /// External label; pending peers are presented as apply-pending
    /// to distinguish them from fully applied ones.
    pub fn api_label(&self) -> &'static str {
        match self {
            Self::Pending => "apply-pending",
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    /// Whether the peer belongs to the desired live set.
    pub fn is_desired_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }
}

/// A managed WireGuard server interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceRecord {
    pub id: Uuid,
    /// Device name, e.g. `wg0`.
    pub name: String,
    pub listen_port: u16,
    #[serde(skip_serializing, default)]
    pub private_key_encrypted: Option<Vec<u8>>,
    pub public_key: String,
    /// IPv4 block peers are allocated from, e.g. `10.8.0.0/24`.
    pub address_block: String,
    /// Public endpoint host clients connect to.
    pub endpoint: Option<String>,
    /// DNS server pushed into rendered client configs.
    pub dns: Option<String>,
    pub decommissioned_at: Option<i64>,
    pub created_at: i64,
}

impl InterfaceRecord {
    pub fn is_decommissioned(&self) -> bool {
        self.decommissioned_at.is_some()
    }
}

/// A peer enrolled on an interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: Uuid,
    pub interface_id: Uuid,
    pub name: String,
    pub public_key: String,
    /// Comma-separated CIDR list, e.g. `10.8.0.5/32`.
    pub allowed_addresses: String,
    #[serde(skip_serializing, default)]
    pub private_key_encrypted: Option<Vec<u8>>,
    #[serde(skip_serializing, default)]
    pub preshared_key_encrypted: Option<Vec<u8>>,
    pub status: PeerState,
    pub created_at: i64,
    /// Observed, not authoritative; merged back from the live interface.
    pub last_handshake_at: Option<i64>,
}

/// A peer as reported by the live kernel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePeer {
    pub public_key: String,
    pub allowed_addresses: String,
    pub endpoint: Option<String>,
    pub last_handshake_at: Option<i64>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl LivePeer {
    /// A peer counts as connected while its last handshake is younger
    /// than the given threshold.
    pub fn is_connected(&self, threshold_secs: i64) -> bool {
        match self.last_handshake_at {
            Some(ts) => chrono::Utc::now().timestamp() - ts < threshold_secs,
            None => false,
        }
    }
}

/// Peer view returned by the API (no key material).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerView {
    pub id: Uuid,
    pub interface_id: Uuid,
    pub name: String,
    pub public_key: String,
    pub allowed_addresses: String,
    pub status: String,
    pub created_at: i64,
    pub last_handshake_at: Option<i64>,
}

impl From<&PeerRecord> for PeerView {
    fn from(record: &PeerRecord) -> Self {
        Self {
            id: record.id,
            interface_id: record.interface_id,
            name: record.name.clone(),
            public_key: record.public_key.clone(),
            allowed_addresses: record.allowed_addresses.clone(),
            status: record.status.api_label().to_string(),
            created_at: record.created_at,
            last_handshake_at: record.last_handshake_at,
        }
    }
}
