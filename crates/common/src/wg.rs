//! WireGuard key generation and client config rendering
//!
//! Uses x25519-dalek for key generation; keys travel as base64 strings
//! exactly as `wg` expects them.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};

/// WireGuard key pair
#[derive(Clone)]
pub struct WgKeyPair {
    pub private_key: String, // Base64
    pub public_key: String,  // Base64
}

impl std::fmt::Debug for WgKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgKeyPair")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Generate a WireGuard keypair using x25519
pub fn generate_keypair() -> WgKeyPair {
    use rand::RngCore;
    use x25519_dalek::{PublicKey, StaticSecret};

    let mut private_key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut private_key_bytes);

    // WireGuard key clamping
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    WgKeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Generate a random preshared key
pub fn generate_preshared_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Validate that a string is a syntactically valid WireGuard public key:
/// base64 of exactly 32 bytes.
pub fn validate_public_key(key: &str) -> Result<()> {
    let decoded = STANDARD
        .decode(key)
        .map_err(|_| Error::InvalidKey(format!("not valid base64: {}", key)))?;
    if decoded.len() != 32 {
        return Err(Error::InvalidKey(format!(
            "decoded to {} bytes, expected 32",
            decoded.len()
        )));
    }
    Ok(())
}

/// Inputs for rendering a client-side config file.
pub struct ClientConfigParams<'a> {
    pub private_key: &'a str,
    pub address: &'a str,
    pub server_public_key: &'a str,
    pub preshared_key: Option<&'a str>,
    pub endpoint: Option<&'a str>,
    pub listen_port: u16,
    pub dns: Option<&'a str>,
    pub keepalive: u16,
}

/// Render the `[Interface]`/`[Peer]` config a client imports.
pub fn render_client_config(params: &ClientConfigParams<'_>) -> String {
    let dns_line = params
        .dns
        .map(|d| format!("DNS = {}\n", d))
        .unwrap_or_default();

    let psk_line = params
        .preshared_key
        .map(|k| format!("PresharedKey = {}\n", k))
        .unwrap_or_default();

    let endpoint_line = match params.endpoint {
        Some(host) => format!("Endpoint = {}:{}\n", host, params.listen_port),
        None => format!("# Endpoint = your-server:{}\n", params.listen_port),
    };

    format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {address}\n\
         {dns_line}\
         \n\
         [Peer]\n\
         PublicKey = {server_public_key}\n\
         {psk_line}\
         AllowedIPs = 0.0.0.0/0, ::/0\n\
         PersistentKeepalive = {keepalive}\n\
         {endpoint_line}",
        private_key = params.private_key,
        address = params.address,
        dns_line = dns_line,
        server_public_key = params.server_public_key,
        psk_line = psk_line,
        keepalive = params.keepalive,
        endpoint_line = endpoint_line,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = generate_keypair();
        assert_eq!(kp.private_key.len(), 44); // Base64 of 32 bytes
        assert_eq!(kp.public_key.len(), 44);
        assert_ne!(kp.private_key, kp.public_key);
        validate_public_key(&kp.public_key).unwrap();
    }

    #[test]
    fn test_preshared_key() {
        let psk = generate_preshared_key();
        validate_public_key(&psk).unwrap(); // same shape: 32 bytes base64
        assert_ne!(psk, generate_preshared_key());
    }

    #[test]
    fn test_validate_public_key_rejects_garbage() {
        assert!(validate_public_key("not-a-key").is_err());
        // Valid base64 but wrong length
        assert!(validate_public_key("aGVsbG8=").is_err());
    }

    #[test]
    fn test_render_client_config() {
        let server = generate_keypair();
        let client = generate_keypair();
        let config = render_client_config(&ClientConfigParams {
            private_key: &client.private_key,
            address: "10.8.0.2/32",
            server_public_key: &server.public_key,
            preshared_key: Some("psk-value"),
            endpoint: Some("vpn.example.com"),
            listen_port: 51820,
            dns: Some("1.1.1.1"),
            keepalive: 25,
        });

        assert!(config.contains("[Interface]"));
        assert!(config.contains(&format!("PrivateKey = {}", client.private_key)));
        assert!(config.contains("Address = 10.8.0.2/32"));
        assert!(config.contains("DNS = 1.1.1.1"));
        assert!(config.contains(&format!("PublicKey = {}", server.public_key)));
        assert!(config.contains("PresharedKey = psk-value"));
        assert!(config.contains("Endpoint = vpn.example.com:51820"));
    }

    #[test]
    fn test_render_without_endpoint_or_dns() {
        let kp = generate_keypair();
        let config = render_client_config(&ClientConfigParams {
            private_key: &kp.private_key,
            address: "10.8.0.3/32",
            server_public_key: &kp.public_key,
            preshared_key: None,
            endpoint: None,
            listen_port: 51820,
            dns: None,
            keepalive: 25,
        });

        assert!(!config.contains("DNS ="));
        assert!(!config.contains("PresharedKey"));
        assert!(config.contains("# Endpoint = your-server:51820"));
    }
}
