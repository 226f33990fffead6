//! `[relay]` and `[admin]` section configuration.
//!
//! ```toml
//! [relay]
//! interface = "127.0.0.1"
//! port = 5290                  # Viewers connect to ws://host:port/?project=<id>
//! upstream_path = "/"
//! upstream_protocol = "vite-hmr"
//!
//! [admin]
//! port = 5280
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Live update relay endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enable: bool,
    pub interface: IpAddr,
    pub port: u16,
    /// Path of the runtime's live-update socket.
    pub upstream_path: String,
    /// `Sec-WebSocket-Protocol` offered to the runtime.
    pub upstream_protocol: Option<String>,
    /// Relay pass interval.
    pub pump_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enable: true,
            interface: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 5290,
            upstream_path: "/".into(),
            upstream_protocol: None,
            pump_ms: 20,
        }
    }
}

impl RelayConfig {
    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_ms.max(1))
    }
}

/// Admin HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enable: bool,
    pub interface: IpAddr,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enable: true,
            interface: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 5280,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use crate::config::test_parse_config;

    #[test]
    fn test_relay_and_admin() {
        let config = test_parse_config(
            "[relay]\nport = 9000\nupstream_protocol = \"vite-hmr\"\n[admin]\ninterface = \"0.0.0.0\"\nenable = false",
        );
        assert_eq!(config.relay.port, 9000);
        assert_eq!(config.relay.upstream_protocol.as_deref(), Some("vite-hmr"));
        assert_eq!(config.admin.interface, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(!config.admin.enable);
        assert_eq!(config.admin.port, 5280);
    }
}
