//! Message definitions
//!
//! Values exchanged between the server and the application. Both message
//! kinds are immutable once built; ownership moves with each channel send.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

/// Where a message comes from or goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// A single remote endpoint
    Peer(SocketAddr),
    /// Every connection registered when the message is dispatched
    Broadcast,
}

impl Address {
    /// The remote endpoint, or `None` for a broadcast
    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            Address::Peer(addr) => Some(*addr),
            Address::Broadcast => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Address::Broadcast)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Peer(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Peer(addr) => write!(f, "{}", addr),
            Address::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// A decoded payload tagged with its message type and remote endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Message<P> {
    address: Address,
    msg_id: u32,
    payload: P,
}

impl<P> Message<P> {
    pub fn new(address: impl Into<Address>, msg_id: u32, payload: P) -> Self {
        Self {
            address: address.into(),
            msg_id,
            payload,
        }
    }

    /// A message addressed to every live connection
    pub fn broadcast(msg_id: u32, payload: P) -> Self {
        Self::new(Address::Broadcast, msg_id, payload)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn msg_id(&self) -> u32 {
        self.msg_id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_parts(self) -> (Address, u32, P) {
        (self.address, self.msg_id, self.payload)
    }
}

/// Undecoded bytes from or to a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteMessage {
    address: Address,
    data: Bytes,
}

impl ByteMessage {
    pub fn new(address: impl Into<Address>, data: impl Into<Bytes>) -> Self {
        Self {
            address: address.into(),
            data: data.into(),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_peer_message() {
        let msg = Message::new(addr(), 7, "hi");
        assert_eq!(msg.address(), Address::Peer(addr()));
        assert_eq!(msg.address().peer(), Some(addr()));
        assert_eq!(msg.msg_id(), 7);
        assert_eq!(*msg.payload(), "hi");
    }

    #[test]
    fn test_broadcast_has_no_peer() {
        let msg = Message::broadcast(1, ());
        assert!(msg.address().is_broadcast());
        assert_eq!(msg.address().peer(), None);
        assert_eq!(msg.address().to_string(), "broadcast");
    }

    #[test]
    fn test_byte_message() {
        let msg = ByteMessage::new(addr(), vec![1u8, 2, 3]);
        assert_eq!(msg.address().to_string(), "127.0.0.1:4000");
        assert_eq!(msg.data().as_ref(), &[1, 2, 3]);
        assert_eq!(msg.into_data(), Bytes::from_static(&[1, 2, 3]));
    }
}
