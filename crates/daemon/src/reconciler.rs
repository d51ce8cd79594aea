//! Reconciliation loop
//!
//! One background task per managed interface keeps the live kernel state
//! converged on the store. A supervisor rescans the store so interfaces
//! provisioned or decommissioned at runtime gain or lose their worker.

use crate::config::DaemonConfig;
use crate::driver::{apply_with_retry, WgDriver};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wgplane_common::{ConfigStore, InterfaceRecord, PeerState, Result};

/// Outcome of one pass over one interface.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassReport {
    /// Desired peers that were missing live and got applied.
    pub applied: usize,
    /// Live peers with no desired counterpart that got removed.
    pub removed: usize,
    /// Apply/remove attempts that failed this pass.
    pub failed: usize,
}

impl PassReport {
    pub fn drift(&self) -> usize {
        self.applied + self.removed + self.failed
    }
}

pub struct Reconciler {
    inner: Arc<Inner>,
}

struct Inner {
    store: ConfigStore,
    driver: Arc<dyn WgDriver>,
    config: DaemonConfig,
}

impl Reconciler {
    pub fn new(store: ConfigStore, driver: Arc<dyn WgDriver>, config: DaemonConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                driver,
                config,
            }),
        }
    }

    /// Run the supervisor loop. Never returns; the caller owns shutdown.
    pub async fn run(&self) {
        info!("Reconciler started");
        let interval = self.inner.config.reconcile_interval();
        let mut workers: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

        loop {
            match self.inner.store.list_interfaces() {
                Ok(interfaces) => {
                    let wanted: HashSet<Uuid> = interfaces
                        .iter()
                        .filter(|i| !i.is_decommissioned())
                        .map(|i| i.id)
                        .collect();

                    // Stop workers for interfaces that disappeared or
                    // were decommissioned
                    workers.retain(|id, handle| {
                        if !wanted.contains(id) || handle.is_finished() {
                            info!("Stopping reconcile worker for interface {}", id);
                            handle.abort();
                            false
                        } else {
                            true
                        }
                    });

                    for interface in interfaces {
                        if wanted.contains(&interface.id) && !workers.contains_key(&interface.id) {
                            info!(
                                "Starting reconcile worker for interface {} ({})",
                                interface.name, interface.id
                            );
                            let inner = self.inner.clone();
                            workers.insert(
                                interface.id,
                                tokio::spawn(async move { inner.worker(interface).await }),
                            );
                        }
                    }
                }
                Err(e) => error!("Reconciler could not list interfaces: {}", e),
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Run a single pass over one interface. Exposed for the startup
    /// convergence pass in main.
    pub async fn reconcile_interface(&self, interface: &InterfaceRecord) -> Result<PassReport> {
        self.inner.reconcile_interface(interface).await
    }
}

impl Inner {
    async fn worker(self: Arc<Self>, interface: InterfaceRecord) {
        let interval = self.config.reconcile_interval();

        loop {
            match self.reconcile_interface(&interface).await {
                Ok(report) if report.drift() > 0 => {
                    if report.drift() > self.config.reconcile.drift_alert_threshold {
                        // Drift this large usually means something else is
                        // rewriting the interface; make it operator-visible
                        error!(
                            "Interface {}: drift of {} exceeds alert threshold {} \
                             (applied {}, removed {}, failed {})",
                            interface.name,
                            report.drift(),
                            self.config.reconcile.drift_alert_threshold,
                            report.applied,
                            report.removed,
                            report.failed,
                        );
                    } else {
                        info!(
                            "Interface {}: reconciled drift (applied {}, removed {}, failed {})",
                            interface.name, report.applied, report.removed, report.failed
                        );
                    }
                }
                Ok(_) => debug!("Interface {}: converged", interface.name),
                Err(e) => warn!("Reconcile pass on {} failed: {}", interface.name, e),
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// Diff desired store state against the live peer set and repair in
    /// both directions. Store records are never deleted here.
    async fn reconcile_interface(&self, interface: &InterfaceRecord) -> Result<PassReport> {
        let desired = self.store.list_active_peers(interface.id)?;
        let observed = self.driver.list_live_peers(&interface.name).await?;

        let observed_keys: HashMap<&str, &wgplane_common::LivePeer> = observed
            .iter()
            .map(|p| (p.public_key.as_str(), p))
            .collect();
        let desired_keys: HashSet<&str> =
            desired.iter().map(|p| p.public_key.as_str()).collect();

        let mut report = PassReport::default();

        for peer in &desired {
            match observed_keys.get(peer.public_key.as_str()) {
                Some(live) => {
                    // Converged; fold the kernel's handshake timestamp back
                    // into the store
                    if let Some(ts) = live.last_handshake_at {
                        if let Err(e) = self.store.record_handshake(peer.id, ts) {
                            warn!("Could not record handshake for peer {}: {}", peer.id, e);
                        }
                    }
                    if peer.status == PeerState::Pending {
                        // Applied out-of-band or by a crashed earlier pass
                        self.store.update_peer_status(peer.id, PeerState::Active)?;
                    }
                }
                None => {
                    let preshared = peer
                        .preshared_key_encrypted
                        .as_deref()
                        .and_then(|b| std::str::from_utf8(b).ok());

                    match apply_with_retry(
                        self.driver.as_ref(),
                        &interface.name,
                        &peer.public_key,
                        &peer.allowed_addresses,
                        preshared,
                        self.config.wireguard.retry_ceiling,
                    )
                    .await
                    {
                        Ok(()) => {
                            if peer.status == PeerState::Pending {
                                self.store.update_peer_status(peer.id, PeerState::Active)?;
                            }
                            report.applied += 1;
                        }
                        Err(e) => {
                            warn!(
                                "Could not apply peer {} to {}: {}",
                                peer.id, interface.name, e
                            );
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        for live in &observed {
            if !desired_keys.contains(live.public_key.as_str()) {
                match self
                    .driver
                    .remove_peer(&interface.name, &live.public_key)
                    .await
                {
                    Ok(()) => report.removed += 1,
                    Err(e) => {
                        warn!(
                            "Could not remove extraneous peer from {}: {}",
                            interface.name, e
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }
}
