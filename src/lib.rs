//! tagwire - Minimal message-oriented network server
//!
//! Accepts stream or datagram connections, frames inbound bytes into tagged
//! messages and exposes four channels to the application:
//!
//! - new connections
//! - closed connections
//! - inbound messages
//! - outbound messages (addressed to one peer, or broadcast)
//!
//! ```ignore
//! let server = Server::bind(&NetworkConfig::new(TransportKind::Stream, 12345), codec).await?;
//! let mut channels = server.start().await?;
//!
//! while let Some(msg) = channels.inbound.recv().await {
//!     channels.outbound.send(Message::new(msg.address(), 2, reply)).await?;
//! }
//! ```

pub mod config;
pub mod network;
pub mod protocol;

pub use network::{
    Channels, Client, ClientError, Connection, ConnectionError, ConnectionState, NetworkConfig, Server,
    ServerError, ServerState, TransportKind,
};
pub use protocol::{Address, ByteMessage, Codec, CodecError, Frame, Message, RawCodec, TagRegistry};
