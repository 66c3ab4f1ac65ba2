//! Protocol module - Defines the wire framing used by tagwire
//!
//! Every frame on the wire is:
//! - 4 bytes message-type tag (big-endian)
//! - Variable length payload, serialized by the application's codec
//!
//! There is no length field. A frame is whatever one transport record holds:
//! one datagram, or one socket read on stream transports.

mod message;
mod codec;
mod frame;

pub use message::*;
pub use codec::*;
pub use frame::*;

/// Size of the message-type tag that prefixes every frame
pub const TAG_SIZE: usize = 4;

/// Fixed per-connection read buffer size. Encoded frames must stay below it.
pub const BUFFER_SIZE: usize = 65536;

/// Queue capacity of every server channel
pub const CHANNEL_CAPACITY: usize = 100;

/// Default port for the demo server
pub const DEFAULT_PORT: u16 = 12345;
