//! SQLite-backed configuration store
//!
//! The durable record of interfaces and peers. All multi-step writes run
//! inside a single transaction on the serialized connection, so concurrent
//! peer creation on one interface cannot double-allocate addresses.

use crate::types::{InterfaceRecord, PeerRecord, PeerState};
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration store wrapper
#[derive(Clone)]
pub struct ConfigStore {
    conn: Arc<Mutex<Connection>>,
}

/// Inputs for provisioning a new interface.
pub struct NewInterface {
    pub name: String,
    pub listen_port: u16,
    pub private_key: Option<Vec<u8>>,
    pub public_key: String,
    pub address_block: String,
    pub endpoint: Option<String>,
    pub dns: Option<String>,
}

impl ConfigStore {
    /// Open or create the store at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        info!("Opened config store at {:?}", path.as_ref());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Server interfaces
            CREATE TABLE IF NOT EXISTS interfaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                listen_port INTEGER NOT NULL,
                private_key_encrypted BLOB,
                public_key TEXT NOT NULL,
                address_block TEXT NOT NULL,
                endpoint TEXT,
                dns TEXT,
                decommissioned_at INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_interfaces_name ON interfaces(name);

            -- Peers (soft-deleted via status = 'revoked', never removed)
            CREATE TABLE IF NOT EXISTS peers (
                id TEXT PRIMARY KEY,
                interface_id TEXT NOT NULL,
                name TEXT NOT NULL,
                public_key TEXT NOT NULL,
                allowed_addresses TEXT NOT NULL,
                private_key_encrypted BLOB,
                preshared_key_encrypted BLOB,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                last_handshake_at INTEGER,
                FOREIGN KEY(interface_id) REFERENCES interfaces(id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_peers_iface_key ON peers(interface_id, public_key);
            CREATE INDEX IF NOT EXISTS idx_peers_iface_status ON peers(interface_id, status);
            "#,
        )?;

        debug!("Config store schema initialized");
        Ok(())
    }

    // ========================================================================
    // Interface operations
    // ========================================================================

    /// Provision a new interface
    pub fn create_interface(&self, new: NewInterface) -> Result<InterfaceRecord> {
        // Address block must be a parseable IPv4 network before anything
        // touches the database.
        new.address_block
            .parse::<Ipv4Network>()
            .map_err(|e| Error::InvalidConfig(format!("bad address block: {}", e)))?;

        let conn = self.conn.lock();
        let id = Uuid::new_v4();
        let now = chrono::Utc::now().timestamp();

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM interfaces WHERE name = ?1",
                params![new.name],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(Error::Conflict {
                kind: "interface".to_string(),
                id: new.name.clone(),
                detail: "interface name already exists".to_string(),
            });
        }

        conn.execute(
            "INSERT INTO interfaces (id, name, listen_port, private_key_encrypted, public_key,
                                     address_block, endpoint, dns, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.to_string(),
                new.name,
                new.listen_port,
                new.private_key,
                new.public_key,
                new.address_block,
                new.endpoint,
                new.dns,
                now,
            ],
        )?;

        debug!("Created interface {} ({})", new.name, id);

        Ok(InterfaceRecord {
            id,
            name: new.name,
            listen_port: new.listen_port,
            private_key_encrypted: new.private_key,
            public_key: new.public_key,
            address_block: new.address_block,
            endpoint: new.endpoint,
            dns: new.dns,
            decommissioned_at: None,
            created_at: now,
        })
    }

    /// Get an interface by ID
    pub fn get_interface(&self, id: Uuid) -> Result<Option<InterfaceRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, name, listen_port, private_key_encrypted, public_key, address_block,
                        endpoint, dns, decommissioned_at, created_at
                 FROM interfaces WHERE id = ?1",
                params![id.to_string()],
                map_interface_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Get an interface by device name
    pub fn get_interface_by_name(&self, name: &str) -> Result<Option<InterfaceRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, name, listen_port, private_key_encrypted, public_key, address_block,
                        endpoint, dns, decommissioned_at, created_at
                 FROM interfaces WHERE name = ?1",
                params![name],
                map_interface_row,
            )
            .optional()?;
        Ok(record)
    }

    /// List all interfaces, decommissioned ones included
    pub fn list_interfaces(&self) -> Result<Vec<InterfaceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, listen_port, private_key_encrypted, public_key, address_block,
                    endpoint, dns, decommissioned_at, created_at
             FROM interfaces ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], map_interface_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Mark an interface as decommissioned; it stops accepting enrollments
    pub fn decommission_interface(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let rows = conn.execute(
            "UPDATE interfaces SET decommissioned_at = ?1 WHERE id = ?2 AND decommissioned_at IS NULL",
            params![now, id.to_string()],
        )?;
        if rows == 0 {
            return Err(Error::not_found("interface", &id.to_string()));
        }
        info!("Decommissioned interface {}", id);
        Ok(())
    }

    // ========================================================================
    // Peer operations
    // ========================================================================

    /// Create a peer on an interface, allocating its address from the
    /// interface's block inside the same transaction.
    ///
    /// Fails with a conflict when the public key is already enrolled on the
    /// interface.
    pub fn create_peer(
        &self,
        interface_id: Uuid,
        name: &str,
        public_key: &str,
        private_key: Option<&[u8]>,
        preshared_key: Option<&[u8]>,
    ) -> Result<PeerRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let interface = tx
            .query_row(
                "SELECT id, name, listen_port, private_key_encrypted, public_key, address_block,
                        endpoint, dns, decommissioned_at, created_at
                 FROM interfaces WHERE id = ?1",
                params![interface_id.to_string()],
                map_interface_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("interface", &interface_id.to_string()))?;

        if interface.is_decommissioned() {
            return Err(Error::InterfaceDecommissioned(interface.name));
        }

        let duplicate: i64 = tx.query_row(
            "SELECT COUNT(*) FROM peers WHERE interface_id = ?1 AND public_key = ?2",
            params![interface_id.to_string(), public_key],
            |row| row.get(0),
        )?;
        if duplicate > 0 {
            return Err(Error::duplicate_key(&interface_id.to_string(), public_key));
        }

        // Addresses held by non-revoked peers are occupied; revocation
        // releases the address for reuse.
        let mut occupied: HashSet<Ipv4Addr> = HashSet::new();
        {
            let mut stmt = tx.prepare(
                "SELECT allowed_addresses FROM peers
                 WHERE interface_id = ?1 AND status != 'revoked'",
            )?;
            let rows = stmt.query_map(params![interface_id.to_string()], |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                for cidr in row?.split(',') {
                    if let Some(addr) = cidr.trim().split('/').next() {
                        if let Ok(ip) = addr.parse::<Ipv4Addr>() {
                            occupied.insert(ip);
                        }
                    }
                }
            }
        }

        let address = allocate_address(&interface, &occupied)?;
        let allowed_addresses = format!("{}/32", address);

        let id = Uuid::new_v4();
        let now = chrono::Utc::now().timestamp();

        tx.execute(
            "INSERT INTO peers (id, interface_id, name, public_key, allowed_addresses,
                                private_key_encrypted, preshared_key_encrypted, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                id.to_string(),
                interface_id.to_string(),
                name,
                public_key,
                allowed_addresses,
                private_key,
                preshared_key,
                now,
            ],
        )?;

        tx.commit()?;

        debug!(
            "Created peer {} on interface {} at {}",
            id, interface_id, allowed_addresses
        );

        Ok(PeerRecord {
            id,
            interface_id,
            name: name.to_string(),
            public_key: public_key.to_string(),
            allowed_addresses,
            private_key_encrypted: private_key.map(|k| k.to_vec()),
            preshared_key_encrypted: preshared_key.map(|k| k.to_vec()),
            status: PeerState::Pending,
            created_at: now,
            last_handshake_at: None,
        })
    }

    /// Get a peer by ID
    pub fn get_peer(&self, id: Uuid) -> Result<Option<PeerRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT id, interface_id, name, public_key, allowed_addresses,
                        private_key_encrypted, preshared_key_encrypted, status,
                        created_at, last_handshake_at
                 FROM peers WHERE id = ?1",
                params![id.to_string()],
                map_peer_row,
            )
            .optional()?;
        Ok(record)
    }

    /// List every peer on an interface, revoked ones included
    pub fn list_peers(&self, interface_id: Uuid) -> Result<Vec<PeerRecord>> {
        self.list_peers_where(interface_id, "1=1")
    }

    /// List desired-live peers on an interface (pending or active)
    pub fn list_active_peers(&self, interface_id: Uuid) -> Result<Vec<PeerRecord>> {
        self.list_peers_where(interface_id, "status IN ('pending', 'active')")
    }

    fn list_peers_where(&self, interface_id: Uuid, filter: &str) -> Result<Vec<PeerRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, interface_id, name, public_key, allowed_addresses,
                    private_key_encrypted, preshared_key_encrypted, status,
                    created_at, last_handshake_at
             FROM peers WHERE interface_id = ?1 AND {} ORDER BY created_at",
            filter
        ))?;
        let rows = stmt.query_map(params![interface_id.to_string()], map_peer_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Update a peer's lifecycle status
    pub fn update_peer_status(&self, id: Uuid, status: PeerState) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE peers SET status = ?1 WHERE id = ?2",
            params![status.to_string(), id.to_string()],
        )?;
        if rows == 0 {
            return Err(Error::not_found("peer", &id.to_string()));
        }
        debug!("Peer {} -> {}", id, status);
        Ok(())
    }

    /// Merge an observed handshake timestamp into the record. Observed-only
    /// metadata; flows live -> store, never the reverse.
    pub fn record_handshake(&self, id: Uuid, timestamp: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE peers SET last_handshake_at = ?1
             WHERE id = ?2 AND (last_handshake_at IS NULL OR last_handshake_at < ?1)",
            params![timestamp, id.to_string()],
        )?;
        Ok(())
    }
}

/// Pick the first free host in the interface's block. The network address,
/// broadcast address, and first host (held by the interface itself) are
/// never handed out.
fn allocate_address(
    interface: &InterfaceRecord,
    occupied: &HashSet<Ipv4Addr>,
) -> Result<Ipv4Addr> {
    let network: Ipv4Network = interface
        .address_block
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("bad address block: {}", e)))?;

    let network_addr = network.network();
    let broadcast = network.broadcast();
    let first_host = Ipv4Addr::from(u32::from(network_addr).wrapping_add(1));

    for ip in network.iter() {
        if ip == network_addr || ip == broadcast || ip == first_host {
            continue;
        }
        if !occupied.contains(&ip) {
            return Ok(ip);
        }
    }

    Err(Error::AddressPoolExhausted {
        interface: interface.name.clone(),
        block: interface.address_block.clone(),
    })
}

fn map_interface_row(row: &Row<'_>) -> rusqlite::Result<InterfaceRecord> {
    Ok(InterfaceRecord {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
        name: row.get(1)?,
        listen_port: row.get(2)?,
        private_key_encrypted: row.get(3)?,
        public_key: row.get(4)?,
        address_block: row.get(5)?,
        endpoint: row.get(6)?,
        dns: row.get(7)?,
        decommissioned_at: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn map_peer_row(row: &Row<'_>) -> rusqlite::Result<PeerRecord> {
    Ok(PeerRecord {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap(),
        interface_id: Uuid::parse_str(&row.get::<_, String>(1)?).unwrap(),
        name: row.get(2)?,
        public_key: row.get(3)?,
        allowed_addresses: row.get(4)?,
        private_key_encrypted: row.get(5)?,
        preshared_key_encrypted: row.get(6)?,
        status: row.get::<_, String>(7)?.parse().unwrap(),
        created_at: row.get(8)?,
        last_handshake_at: row.get(9)?,
    })
}
