//! WireGuard host tool driver
//!
//! The only component that touches host networking. Wraps `wg` and
//! `wg-quick` invocations; all operations against one interface are
//! serialized behind a per-interface lock because the tools are not safe
//! for concurrent invocation on the same device.

use crate::config::WireGuardConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use wgplane_common::{Error, LivePeer, Result};

/// Driver interface over the live kernel state.
///
/// Hidden behind a trait so lifecycle and reconciliation can be exercised
/// against a fake without host privileges.
#[async_trait]
pub trait WgDriver: Send + Sync {
    /// Idempotent upsert of a peer into the live interface.
    async fn apply_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_addresses: &str,
        preshared_key: Option<&str>,
    ) -> Result<()>;

    /// Idempotent removal; absent peers are not an error.
    async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()>;

    /// Kernel-reported peer set for an interface.
    async fn list_live_peers(&self, interface: &str) -> Result<Vec<LivePeer>>;
}

/// Apply through any driver with bounded exponential backoff. Lifecycle and
/// reconciliation both go through this so transient tool failures behave
/// the same on either path.
pub async fn apply_with_retry(
    driver: &dyn WgDriver,
    interface: &str,
    public_key: &str,
    allowed_addresses: &str,
    preshared_key: Option<&str>,
    retry_ceiling: u32,
) -> Result<()> {
    let mut delay = Duration::from_millis(250);
    let attempts = retry_ceiling.max(1);

    for attempt in 1..=attempts {
        match driver
            .apply_peer(interface, public_key, allowed_addresses, preshared_key)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    "Apply attempt {}/{} on {} failed: {}; retrying in {:?}",
                    attempt, attempts, interface, e, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("retry loop always returns")
}

/// Driver invoking the host `wg`/`wg-quick` tools.
pub struct WgTool {
    config: WireGuardConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WgTool {
    pub fn new(config: WireGuardConfig) -> Self {
        Self {
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Verify the wg binary is present and executable. Called once at
    /// startup; a failure here is fatal for peer mutation handling.
    pub async fn probe(&self) -> Result<()> {
        let output = Command::new(&self.config.wg_binary)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::ToolUnavailable(format!("{}: {}", self.config.wg_binary, e))
            })?;

        if !output.status.success() {
            return Err(Error::ToolUnavailable(format!(
                "{} --version exited with {:?}",
                self.config.wg_binary,
                output.status.code()
            )));
        }

        info!(
            "WireGuard tool available: {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }

    fn interface_lock(&self, interface: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(interface.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run a tool invocation under the configured timeout, optionally
    /// piping data to stdin. The caller must hold the interface lock.
    async fn run_tool(
        &self,
        binary: &str,
        args: &[&str],
        stdin_data: Option<&str>,
        interface: &str,
    ) -> Result<std::process::Output> {
        debug!("Running: {} {}", binary, args.join(" "));

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolUnavailable(format!("{}: {}", binary, e))
            } else {
                Error::ApplyFailed {
                    interface: interface.to_string(),
                    detail: format!("failed to spawn {}: {}", binary, e),
                    exit_status: None,
                }
            }
        })?;

        if let Some(data) = stdin_data {
            let mut handle = child.stdin.take().ok_or_else(|| Error::ApplyFailed {
                interface: interface.to_string(),
                detail: "stdin not captured".to_string(),
                exit_status: None,
            })?;
            handle.write_all(data.as_bytes()).await?;
            // Closing stdin lets the tool read EOF
            drop(handle);
        }

        let timeout = Duration::from_secs(self.config.apply_timeout_secs);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // kill_on_drop reaps the child; a timed-out invocation is
                // an apply failure per the error taxonomy
                return Err(Error::ApplyFailed {
                    interface: interface.to_string(),
                    detail: format!(
                        "{} timed out after {}s",
                        binary, self.config.apply_timeout_secs
                    ),
                    exit_status: None,
                });
            }
        };

        if !output.status.success() {
            return Err(Error::ApplyFailed {
                interface: interface.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                exit_status: output.status.code(),
            });
        }

        Ok(output)
    }

    /// Persist the live interface state into its config file so it
    /// survives a host restart.
    async fn save_interface(&self, interface: &str) -> Result<()> {
        self.run_tool(
            &self.config.wg_quick_binary,
            &["save", interface],
            None,
            interface,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WgDriver for WgTool {
    async fn apply_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_addresses: &str,
        preshared_key: Option<&str>,
    ) -> Result<()> {
        let lock = self.interface_lock(interface);
        let _guard = lock.lock().await;

        match preshared_key {
            Some(psk) => {
                self.run_tool(
                    &self.config.wg_binary,
                    &[
                        "set",
                        interface,
                        "peer",
                        public_key,
                        "allowed-ips",
                        allowed_addresses,
                        "preshared-key",
                        "/dev/stdin",
                    ],
                    Some(psk),
                    interface,
                )
                .await?;
            }
            None => {
                self.run_tool(
                    &self.config.wg_binary,
                    &[
                        "set",
                        interface,
                        "peer",
                        public_key,
                        "allowed-ips",
                        allowed_addresses,
                    ],
                    None,
                    interface,
                )
                .await?;
            }
        }

        self.save_interface(interface).await?;
        debug!("Applied peer {} on {}", public_key, interface);
        Ok(())
    }

    async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()> {
        let lock = self.interface_lock(interface);
        let _guard = lock.lock().await;

        // `wg set ... remove` exits 0 for peers that are already absent,
        // which gives the idempotency the callers rely on
        self.run_tool(
            &self.config.wg_binary,
            &["set", interface, "peer", public_key, "remove"],
            None,
            interface,
        )
        .await?;

        self.save_interface(interface).await?;
        debug!("Removed peer {} from {}", public_key, interface);
        Ok(())
    }

    async fn list_live_peers(&self, interface: &str) -> Result<Vec<LivePeer>> {
        let lock = self.interface_lock(interface);
        let _guard = lock.lock().await;

        let output = self
            .run_tool(
                &self.config.wg_binary,
                &["show", interface, "dump"],
                None,
                interface,
            )
            .await?;

        Ok(parse_dump(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `wg show <iface> dump` output. The first line describes the
/// interface itself; each following tab-separated line is a peer:
/// pubkey, psk, endpoint, allowed-ips, latest-handshake, rx, tx, keepalive.
fn parse_dump(dump: &str) -> Vec<LivePeer> {
    let mut peers = Vec::new();

    for line in dump.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 7 {
            continue;
        }

        let endpoint = match parts[2] {
            "(none)" | "" => None,
            e => Some(e.to_string()),
        };
        let last_handshake_at = match parts[4] {
            "0" | "" => None,
            ts => ts.parse::<i64>().ok(),
        };

        peers.push(LivePeer {
            public_key: parts[0].to_string(),
            allowed_addresses: parts[3].to_string(),
            endpoint,
            last_handshake_at,
            bytes_received: parts[5].parse().unwrap_or(0),
            bytes_sent: parts[6].parse().unwrap_or(0),
        });
    }

    peers
}

// ============================================================================
// Fake driver for tests
// ============================================================================

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory driver standing in for the live kernel state.
    #[derive(Default)]
    pub struct FakeDriver {
        peers: Mutex<HashMap<String, HashMap<String, LivePeer>>>,
        /// Number of upcoming apply calls that fail transiently.
        fail_next_applies: AtomicU32,
        pub apply_calls: AtomicU32,
        pub remove_calls: AtomicU32,
    }

    impl FakeDriver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_next_applies(&self, count: u32) {
            self.fail_next_applies.store(count, Ordering::SeqCst);
        }

        pub fn live_keys(&self, interface: &str) -> Vec<String> {
            self.peers
                .lock()
                .get(interface)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default()
        }

        pub fn set_handshake(&self, interface: &str, public_key: &str, timestamp: i64) {
            if let Some(peer) = self
                .peers
                .lock()
                .get_mut(interface)
                .and_then(|m| m.get_mut(public_key))
            {
                peer.last_handshake_at = Some(timestamp);
            }
        }

        /// Inject a peer directly, bypassing apply accounting (simulates
        /// out-of-band drift).
        pub fn inject_peer(&self, interface: &str, public_key: &str, allowed: &str) {
            self.peers
                .lock()
                .entry(interface.to_string())
                .or_default()
                .insert(
                    public_key.to_string(),
                    LivePeer {
                        public_key: public_key.to_string(),
                        allowed_addresses: allowed.to_string(),
                        endpoint: None,
                        last_handshake_at: None,
                        bytes_received: 0,
                        bytes_sent: 0,
                    },
                );
        }
    }

    #[async_trait]
    impl WgDriver for FakeDriver {
        async fn apply_peer(
            &self,
            interface: &str,
            public_key: &str,
            allowed_addresses: &str,
            _preshared_key: Option<&str>,
        ) -> Result<()> {
            self.apply_calls.fetch_add(1, Ordering::SeqCst);

            let remaining = self.fail_next_applies.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next_applies.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::ApplyFailed {
                    interface: interface.to_string(),
                    detail: "injected failure".to_string(),
                    exit_status: Some(1),
                });
            }

            self.inject_peer(interface, public_key, allowed_addresses);
            Ok(())
        }

        async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()> {
            self.remove_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(map) = self.peers.lock().get_mut(interface) {
                map.remove(public_key);
            }
            Ok(())
        }

        async fn list_live_peers(&self, interface: &str) -> Result<Vec<LivePeer>> {
            Ok(self
                .peers
                .lock()
                .get(interface)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default())
        }
    }
}
