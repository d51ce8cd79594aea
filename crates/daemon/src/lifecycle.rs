//! Peer lifecycle management
//!
//! Coordinates the store, cache, and driver for enrollment, revocation,
//! and reads. The store is the source of truth: every mutation commits
//! there first, then invalidates the cache, then touches the live
//! interface. A failed apply never rolls the store record back; the peer
//! stays `pending` and reconciliation finishes the job.

use crate::config::DaemonConfig;
use crate::driver::{apply_with_retry, WgDriver};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use wgplane_common::cache::{peer_key, peer_list_key};
use wgplane_common::wg::{
    generate_keypair, generate_preshared_key, render_client_config, validate_public_key,
    ClientConfigParams,
};
use wgplane_common::{
    ConfigStore, Error, InterfaceRecord, NewInterface, PeerRecord, PeerState, PeerView, Result,
    StateCache,
};

/// Enrollment request. When `public_key` is absent the server generates
/// the full keypair and can render a client config.
#[derive(Debug, Clone)]
pub struct EnrollRequest {
    pub name: String,
    pub public_key: Option<String>,
}

/// Result of an enrollment. `client_config` is only present when the
/// server generated the keys; a client-supplied public key means the
/// private half never existed here.
#[derive(Debug, Serialize)]
pub struct EnrollOutcome {
    #[serde(flatten)]
    pub peer: PeerView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_config: Option<String>,
}

/// Peer detail enriched with live connectivity.
#[derive(Debug, Serialize)]
pub struct PeerDetail {
    #[serde(flatten)]
    pub peer: PeerView,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

pub struct PeerLifecycleManager {
    store: ConfigStore,
    cache: Arc<dyn StateCache>,
    driver: Arc<dyn WgDriver>,
    config: DaemonConfig,
}

impl PeerLifecycleManager {
    pub fn new(
        store: ConfigStore,
        cache: Arc<dyn StateCache>,
        driver: Arc<dyn WgDriver>,
        config: DaemonConfig,
    ) -> Self {
        Self {
            store,
            cache,
            driver,
            config,
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Provision a new server interface, generating its keypair.
    pub fn create_interface(
        &self,
        name: String,
        listen_port: u16,
        address_block: String,
        endpoint: Option<String>,
        dns: Option<String>,
    ) -> Result<InterfaceRecord> {
        let keypair = generate_keypair();
        let record = self.store.create_interface(NewInterface {
            name,
            listen_port,
            private_key: Some(keypair.private_key.into_bytes()),
            public_key: keypair.public_key,
            address_block,
            endpoint,
            dns: dns.or_else(|| self.config.wireguard.client_dns.clone()),
        })?;
        info!("Provisioned interface {} ({})", record.name, record.id);
        Ok(record)
    }

    /// Enroll a peer on an interface.
    ///
    /// Store-then-apply: the record is committed (with its allocated
    /// address) before the live interface is touched. An apply failure is
    /// logged and the call still succeeds with the peer in apply-pending.
    pub async fn enroll(&self, interface_id: Uuid, req: EnrollRequest) -> Result<EnrollOutcome> {
        let interface = self
            .store
            .get_interface(interface_id)?
            .ok_or_else(|| Error::not_found("interface", &interface_id.to_string()))?;
        if interface.is_decommissioned() {
            return Err(Error::InterfaceDecommissioned(interface.name));
        }

        // Client-supplied key: validate and store only the public half.
        // No key supplied: generate everything server-side.
        let (public_key, private_key, generated) = match &req.public_key {
            Some(key) => {
                validate_public_key(key)?;
                (key.clone(), None, false)
            }
            None => {
                let kp = generate_keypair();
                (kp.public_key, Some(kp.private_key), true)
            }
        };
        // A preshared key is only minted when the rendered config can
        // deliver it; a client holding its own keypair never sees one and
        // could not complete a handshake against it
        let preshared_key = generated.then(generate_preshared_key);

        let peer = self.store.create_peer(
            interface_id,
            &req.name,
            &public_key,
            private_key.as_deref().map(str::as_bytes),
            preshared_key.as_deref().map(str::as_bytes),
        )?;

        // Invalidate before returning so the next list read reflects the
        // commit even if the apply below is still in flight
        self.invalidate_peer_caches(interface_id, peer.id).await;

        match apply_with_retry(
            self.driver.as_ref(),
            &interface.name,
            &peer.public_key,
            &peer.allowed_addresses,
            preshared_key.as_deref(),
            self.config.wireguard.retry_ceiling,
        )
        .await
        {
            Ok(()) => {
                self.store.update_peer_status(peer.id, PeerState::Active)?;
                self.invalidate_peer_caches(interface_id, peer.id).await;
                info!("Enrolled peer {} on {} (active)", peer.id, interface.name);
            }
            Err(e) => {
                // Record stays pending; the reconciler retries the apply
                warn!(
                    "Peer {} committed but apply to {} failed: {}",
                    peer.id, interface.name, e
                );
            }
        }

        let peer = self
            .store
            .get_peer(peer.id)?
            .ok_or_else(|| Error::not_found("peer", &peer.id.to_string()))?;

        let client_config = if generated {
            Some(self.render_config(&interface, &peer)?)
        } else {
            None
        };

        Ok(EnrollOutcome {
            peer: PeerView::from(&peer),
            client_config,
        })
    }

    /// Revoke a peer. The status flip commits first; removal from the
    /// live interface is best-effort and reconciliation covers a miss.
    pub async fn revoke(&self, peer_id: Uuid) -> Result<PeerView> {
        let peer = self
            .store
            .get_peer(peer_id)?
            .ok_or_else(|| Error::not_found("peer", &peer_id.to_string()))?;

        if peer.status == PeerState::Revoked {
            return Ok(PeerView::from(&peer));
        }

        self.store.update_peer_status(peer_id, PeerState::Revoked)?;
        self.invalidate_peer_caches(peer.interface_id, peer_id).await;

        if let Some(interface) = self.store.get_interface(peer.interface_id)? {
            if let Err(e) = self
                .driver
                .remove_peer(&interface.name, &peer.public_key)
                .await
            {
                warn!(
                    "Revoked peer {} but live removal from {} failed: {}",
                    peer_id, interface.name, e
                );
            }
        }

        info!("Revoked peer {}", peer_id);
        let peer = self
            .store
            .get_peer(peer_id)?
            .ok_or_else(|| Error::not_found("peer", &peer_id.to_string()))?;
        Ok(PeerView::from(&peer))
    }

    /// List desired-live peers for an interface, read-through cached.
    ///
    /// Cache trouble degrades to a store read and a warning; it never
    /// fails the request.
    pub async fn list_peers(&self, interface_id: Uuid) -> Result<Vec<PeerView>> {
        let key = peer_list_key(interface_id);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<Vec<PeerView>>(&cached) {
                Ok(views) => return Ok(views),
                Err(e) => warn!("Discarding undecodable cache entry {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Cache read for {} failed, falling back to store: {}", key, e),
        }

        if self.store.get_interface(interface_id)?.is_none() {
            return Err(Error::not_found("interface", &interface_id.to_string()));
        }

        let views: Vec<PeerView> = self
            .store
            .list_active_peers(interface_id)?
            .iter()
            .map(PeerView::from)
            .collect();

        match serde_json::to_string(&views) {
            Ok(serialized) => {
                if let Err(e) = self
                    .cache
                    .set(&key, &serialized, self.config.cache_ttl())
                    .await
                {
                    warn!("Cache fill for {} failed: {}", key, e);
                }
            }
            Err(e) => warn!("Could not serialize peer list for cache: {}", e),
        }

        Ok(views)
    }

    /// Fetch a peer with its live connectivity. The live lookup is
    /// best-effort; a driver error degrades to store-only data.
    pub async fn get_peer(&self, peer_id: Uuid) -> Result<PeerDetail> {
        let peer = self
            .store
            .get_peer(peer_id)?
            .ok_or_else(|| Error::not_found("peer", &peer_id.to_string()))?;
        let interface = self
            .store
            .get_interface(peer.interface_id)?
            .ok_or_else(|| Error::not_found("interface", &peer.interface_id.to_string()))?;

        let mut detail = PeerDetail {
            peer: PeerView::from(&peer),
            connected: false,
            endpoint: None,
            bytes_received: 0,
            bytes_sent: 0,
        };

        if peer.status.is_desired_live() {
            match self.driver.list_live_peers(&interface.name).await {
                Ok(live) => {
                    if let Some(entry) = live.iter().find(|p| p.public_key == peer.public_key) {
                        detail.connected = entry
                            .is_connected(self.config.wireguard.handshake_threshold_secs);
                        detail.endpoint = entry.endpoint.clone();
                        detail.bytes_received = entry.bytes_received;
                        detail.bytes_sent = entry.bytes_sent;
                        if let Some(ts) = entry.last_handshake_at {
                            detail.peer.last_handshake_at = Some(
                                detail.peer.last_handshake_at.map_or(ts, |old| old.max(ts)),
                            );
                        }
                    }
                }
                Err(e) => warn!(
                    "Live lookup on {} failed, returning stored state: {}",
                    interface.name, e
                ),
            }
        }

        Ok(detail)
    }

    /// Render the importable client config for a server-generated peer.
    pub fn client_config(&self, peer_id: Uuid) -> Result<String> {
        let peer = self
            .store
            .get_peer(peer_id)?
            .ok_or_else(|| Error::not_found("peer", &peer_id.to_string()))?;
        if peer.status == PeerState::Revoked {
            return Err(Error::Conflict {
                kind: "peer".to_string(),
                id: peer_id.to_string(),
                detail: "peer is revoked".to_string(),
            });
        }
        let interface = self
            .store
            .get_interface(peer.interface_id)?
            .ok_or_else(|| Error::not_found("interface", &peer.interface_id.to_string()))?;

        self.render_config(&interface, &peer)
    }

    fn render_config(&self, interface: &InterfaceRecord, peer: &PeerRecord) -> Result<String> {
        let private_key = peer
            .private_key_encrypted
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
            .ok_or_else(|| {
                Error::InvalidConfig(
                    "peer was enrolled with a client-supplied key; no config to render"
                        .to_string(),
                )
            })?;
        let preshared_key = peer
            .preshared_key_encrypted
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok());

        Ok(render_client_config(&ClientConfigParams {
            private_key,
            address: &peer.allowed_addresses,
            server_public_key: &interface.public_key,
            preshared_key,
            endpoint: interface.endpoint.as_deref(),
            listen_port: interface.listen_port,
            dns: interface
                .dns
                .as_deref()
                .or(self.config.wireguard.client_dns.as_deref()),
            keepalive: self.config.wireguard.client_keepalive,
        }))
    }

    async fn invalidate_peer_caches(&self, interface_id: Uuid, peer_id: Uuid) {
        for key in [peer_list_key(interface_id), peer_key(peer_id)] {
            if let Err(e) = self.cache.invalidate(&key).await {
                warn!("Cache invalidation for {} failed: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeDriver;
    use wgplane_common::MemoryCache;

    fn manager() -> (PeerLifecycleManager, Arc<FakeDriver>, Uuid) {
        let store = ConfigStore::open_memory().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let cache = Arc::new(MemoryCache::new());
        let mut config = DaemonConfig::default();
        config.wireguard.retry_ceiling = 2;

        let mgr = PeerLifecycleManager::new(store, cache, driver.clone(), config);
        let iface = mgr
            .create_interface(
                "wg0".to_string(),
                51820,
                "10.8.0.0/24".to_string(),
                Some("vpn.example.com".to_string()),
                None,
            )
            .unwrap();
        (mgr, driver, iface.id)
    }

    #[tokio::test]
    async fn test_enroll_applies_and_activates() {
        let (mgr, driver, iface_id) = manager();

        let outcome = mgr
            .enroll(
                iface_id,
                EnrollRequest {
                    name: "laptop".to_string(),
                    public_key: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.peer.status, "active");
        assert!(outcome.client_config.is_some());
        let config = outcome.client_config.unwrap();
        assert!(config.contains("Endpoint = vpn.example.com:51820"));
        assert_eq!(driver.live_keys("wg0"), vec![outcome.peer.public_key]);
    }

    #[tokio::test]
    async fn test_enroll_failed_apply_stays_pending() {
        let (mgr, driver, iface_id) = manager();
        driver.fail_next_applies(10);

        let outcome = mgr
            .enroll(
                iface_id,
                EnrollRequest {
                    name: "laptop".to_string(),
                    public_key: None,
                },
            )
            .await
            .unwrap();

        // Store record exists with an address even though the live apply
        // never landed
        assert_eq!(outcome.peer.status, "apply-pending");
        assert!(outcome.peer.allowed_addresses.starts_with("10.8.0."));
        assert!(driver.live_keys("wg0").is_empty());
    }

    #[tokio::test]
    async fn test_enroll_client_supplied_key() {
        let (mgr, _driver, iface_id) = manager();
        let kp = generate_keypair();

        let outcome = mgr
            .enroll(
                iface_id,
                EnrollRequest {
                    name: "byok".to_string(),
                    public_key: Some(kp.public_key.clone()),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.peer.public_key, kp.public_key);
        assert!(outcome.client_config.is_none());
        assert!(matches!(
            mgr.client_config(outcome.peer.id).unwrap_err(),
            Error::InvalidConfig(_)
        ));
    }

    #[tokio::test]
    async fn test_preshared_key_only_when_server_generates() {
        let (mgr, _driver, iface_id) = manager();

        // Client-supplied key: no psk is stored or applied, since nothing
        // ever delivers it to the client
        let kp = generate_keypair();
        let outcome = mgr
            .enroll(
                iface_id,
                EnrollRequest {
                    name: "byok".to_string(),
                    public_key: Some(kp.public_key),
                },
            )
            .await
            .unwrap();
        let stored = mgr.store().get_peer(outcome.peer.id).unwrap().unwrap();
        assert!(stored.preshared_key_encrypted.is_none());

        // Server-generated keys: the psk is stored and travels in the
        // rendered config
        let outcome = mgr
            .enroll(
                iface_id,
                EnrollRequest {
                    name: "managed".to_string(),
                    public_key: None,
                },
            )
            .await
            .unwrap();
        let stored = mgr.store().get_peer(outcome.peer.id).unwrap().unwrap();
        assert!(stored.preshared_key_encrypted.is_some());
        assert!(outcome.client_config.unwrap().contains("PresharedKey = "));
    }

    #[tokio::test]
    async fn test_enroll_rejects_bad_key() {
        let (mgr, _driver, iface_id) = manager();
        let err = mgr
            .enroll(
                iface_id,
                EnrollRequest {
                    name: "bad".to_string(),
                    public_key: Some("not base64!!".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_revoke_removes_live_peer() {
        let (mgr, driver, iface_id) = manager();
        let outcome = mgr
            .enroll(
                iface_id,
                EnrollRequest {
                    name: "laptop".to_string(),
                    public_key: None,
                },
            )
            .await
            .unwrap();

        let view = mgr.revoke(outcome.peer.id).await.unwrap();
        assert_eq!(view.status, "revoked");
        assert!(driver.live_keys("wg0").is_empty());

        // Idempotent second revoke
        let view = mgr.revoke(outcome.peer.id).await.unwrap();
        assert_eq!(view.status, "revoked");
    }

    #[tokio::test]
    async fn test_list_peers_reflects_mutations() {
        let (mgr, _driver, iface_id) = manager();

        assert!(mgr.list_peers(iface_id).await.unwrap().is_empty());

        let outcome = mgr
            .enroll(
                iface_id,
                EnrollRequest {
                    name: "laptop".to_string(),
                    public_key: None,
                },
            )
            .await
            .unwrap();

        // Read-your-writes through the cache invalidation
        let listed = mgr.list_peers(iface_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, outcome.peer.id);

        mgr.revoke(outcome.peer.id).await.unwrap();
        assert!(mgr.list_peers(iface_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_peer_live_status() {
        let (mgr, driver, iface_id) = manager();
        let outcome = mgr
            .enroll(
                iface_id,
                EnrollRequest {
                    name: "laptop".to_string(),
                    public_key: None,
                },
            )
            .await
            .unwrap();

        let detail = mgr.get_peer(outcome.peer.id).await.unwrap();
        assert!(!detail.connected);

        driver.set_handshake(
            "wg0",
            &outcome.peer.public_key,
            chrono::Utc::now().timestamp() - 5,
        );
        let detail = mgr.get_peer(outcome.peer.id).await.unwrap();
        assert!(detail.connected);
    }

    #[tokio::test]
    async fn test_enroll_on_decommissioned_interface() {
        let (mgr, _driver, iface_id) = manager();
        mgr.store().decommission_interface(iface_id).unwrap();

        let err = mgr
            .enroll(
                iface_id,
                EnrollRequest {
                    name: "late".to_string(),
                    public_key: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InterfaceDecommissioned(_)));
    }
}
