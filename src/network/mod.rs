//! Network module - Handles stream and datagram communication
//!
//! Provides:
//! - Server for accepting connections and dispatching messages
//! - Connection read loop and framed sends
//! - Client for talking to a server (demo and tests)

mod server;
mod client;
mod connection;
mod transport;

pub use server::*;
pub use client::*;
pub use connection::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::config::ServerConfig;

/// Kind of socket the server listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TCP. One socket read is treated as one frame.
    #[default]
    Stream,
    /// UDP. One datagram is one frame.
    Datagram,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("stream"),
            TransportKind::Datagram => f.write_str("datagram"),
        }
    }
}

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Transport to listen on
    pub transport: TransportKind,
    /// Port to listen on. 0 lets the OS pick one.
    pub port: u16,
    /// Interface to bind to
    pub bind_address: IpAddr,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stream,
            port: crate::protocol::DEFAULT_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl NetworkConfig {
    pub fn new(transport: TransportKind, port: u16) -> Self {
        Self {
            transport,
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    /// Address the listening socket binds to
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl TryFrom<&ServerConfig> for NetworkConfig {
    type Error = std::net::AddrParseError;

    fn try_from(config: &ServerConfig) -> Result<Self, Self::Error> {
        let mut net = NetworkConfig::new(config.transport, config.port);
        if let Some(addr) = &config.bind_address {
            net.bind_address = addr.parse()?;
        }
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_binds_all_interfaces() {
        let config = NetworkConfig::default();
        assert_eq!(config.bind_addr().to_string(), "0.0.0.0:12345");
        assert_eq!(config.transport, TransportKind::Stream);
    }

    #[test]
    fn test_from_server_config() {
        let server = ServerConfig {
            transport: TransportKind::Datagram,
            port: 4000,
            bind_address: Some("127.0.0.1".to_string()),
        };
        let net = NetworkConfig::try_from(&server).unwrap();
        assert_eq!(net.bind_addr().to_string(), "127.0.0.1:4000");
        assert_eq!(net.transport, TransportKind::Datagram);

        let bad = ServerConfig {
            bind_address: Some("not-an-ip".to_string()),
            ..server
        };
        assert!(NetworkConfig::try_from(&bad).is_err());
    }
}
