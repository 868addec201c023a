//! User-facing configuration for servers, clients, and individual connections.

use std::collections::HashSet;
use std::sync::Arc;

use rustls::ServerConfig as RustlsServerConfig;

use crate::frame::DEFAULT_MAX_MESSAGE_SIZE;

/// Shared protocol-level limits, independent of which side of the connection
/// this is.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Caps a single frame's declared payload length. This is a receive-side
    /// guard against a peer claiming an absurd length up front; it has no
    /// bearing on sends, which are always a single frame regardless of size.
    pub max_frame_size: usize,
    /// Caps the total accumulated length of one reassembled message.
    pub max_message_size: usize,
    /// Whether to offer/accept `permessage-deflate` during the handshake.
    pub compression: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 << 20,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compression: true,
        }
    }
}

/// Options governing a server-side listener.
#[derive(Clone, Default)]
pub struct ServerConfig {
    pub web_socket_config: WebSocketConfig,
    pub tls_config: Option<Arc<RustlsServerConfig>>,
    /// Case-insensitive allow-list for the `Origin` header. Empty means allow
    /// every origin.
    pub allowed_origins: HashSet<String>,
}

impl ServerConfig {
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty()
            || self.allowed_origins.iter().any(|allowed| allowed.eq_ignore_ascii_case(origin))
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("web_socket_config", &self.web_socket_config)
            .field("tls_config", &self.tls_config.is_some())
            .field("allowed_origins", &self.allowed_origins)
            .finish()
    }
}

/// Options governing a client-side connect call.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub web_socket_config: WebSocketConfig,
    /// Extra request headers, sent verbatim alongside the mandatory upgrade
    /// headers.
    pub headers: Vec<(String, String)>,
    /// Overrides the `Host` header derived from the connection URI.
    pub host_override: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_permits_any_origin() {
        let config = ServerConfig::default();
        assert!(config.is_origin_allowed("https://anything.example"));
    }

    #[test]
    fn allow_list_match_is_case_insensitive() {
        let mut config = ServerConfig::default();
        config.allowed_origins.insert("https://Example.com".to_string());
        assert!(config.is_origin_allowed("https://example.COM"));
        assert!(!config.is_origin_allowed("https://other.example"));
    }
}
