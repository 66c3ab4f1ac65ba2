//! Connection handling for tagwire
//!
//! Manages individual peer connections, including:
//! - The read loop that decodes records into messages
//! - Framed sends
//! - Connection state and the one-time close notification

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};

use super::transport::{Link, Source};
use crate::protocol::{ByteMessage, Codec, CodecError, Decoder, Encoder, Message, BUFFER_SIZE, CHANNEL_CAPACITY};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Reading and writing
    Open = 0,
    /// Close in progress
    Closing = 1,
    /// Socket released; terminal
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames written
    pub messages_sent: u64,
    /// Frames decoded and forwarded
    pub messages_received: u64,
    /// Bytes written
    pub bytes_sent: u64,
    /// Bytes read, including dropped records
    pub bytes_received: u64,
}

#[derive(Default)]
struct StatCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Server-side channel ends every connection reports into
pub(crate) struct Outlets<P> {
    pub(crate) inbound: mpsc::Sender<Message<P>>,
    pub(crate) closed: mpsc::Sender<SocketAddr>,
}

impl<P> Clone for Outlets<P> {
    fn clone(&self) -> Self {
        Self {
            inbound: self.inbound.clone(),
            closed: self.closed.clone(),
        }
    }
}

/// How a close reports itself on the closed-connection channel
enum Notify {
    /// Wait for room in the channel
    Wait,
    /// Drop the notification if the channel is full
    BestEffort,
}

/// A live link to one remote endpoint
pub struct Connection<C: Codec> {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// Current `ConnectionState`
    state: AtomicU8,
    /// Write side, `None` once closed
    link: Mutex<Option<Link>>,
    /// Read side, taken by the read loop
    source: Mutex<Option<Source>>,
    /// Feeds the read loop of datagram connections
    records: Option<mpsc::Sender<ByteMessage>>,
    /// Flipped to `true` on close to stop the read loop
    close_tx: watch::Sender<bool>,
    outlets: Outlets<C::Payload>,
    encoder: Encoder<C>,
    decoder: Decoder<C>,
    stats: StatCounters,
}

impl<C: Codec> Connection<C> {
    /// Wrap an accepted stream socket
    pub(crate) fn stream(
        stream: TcpStream,
        remote_addr: SocketAddr,
        codec: Arc<C>,
        outlets: Outlets<C::Payload>,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(remote_addr, Link::Stream(writer), Source::Stream(reader), None, codec, outlets)
    }

    /// Create a connection for a datagram peer of the server's socket
    pub(crate) fn datagram(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        codec: Arc<C>,
        outlets: Outlets<C::Payload>,
    ) -> Self {
        let (records_tx, records_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self::new(
            peer,
            Link::Datagram { socket, peer },
            Source::Datagram(records_rx),
            Some(records_tx),
            codec,
            outlets,
        )
    }

    fn new(
        remote_addr: SocketAddr,
        link: Link,
        source: Source,
        records: Option<mpsc::Sender<ByteMessage>>,
        codec: Arc<C>,
        outlets: Outlets<C::Payload>,
    ) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            remote_addr,
            state: AtomicU8::new(ConnectionState::Open as u8),
            link: Mutex::new(Some(link)),
            source: Mutex::new(Some(source)),
            records,
            close_tx,
            outlets,
            encoder: Encoder::new(codec.clone()),
            decoder: Decoder::new(codec),
            stats: StatCounters::default(),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Read records until the peer goes away or the connection is closed.
    ///
    /// Decoded messages are forwarded in arrival order. Forwarding waits while
    /// the inbound channel is full. Returns immediately if the loop is already
    /// running or has run.
    pub async fn read_loop(&self) {
        let Some(mut source) = self.source.lock().await.take() else {
            return;
        };
        let mut close_rx = self.close_tx.subscribe();
        let mut buf = BytesMut::zeroed(BUFFER_SIZE);

        loop {
            if *close_rx.borrow() {
                break;
            }

            let n = tokio::select! {
                _ = close_rx.changed() => break,
                result = source.read_record(&mut buf) => match result {
                    Ok(Some(n)) => n,
                    Ok(None) => {
                        tracing::debug!(addr = %self.remote_addr, "Peer closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(addr = %self.remote_addr, error = %e, "Read failed");
                        break;
                    }
                }
            };
            self.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);

            let frame = match self.decoder.decode(&buf[..n]) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(addr = %self.remote_addr, error = %e, "Dropping undecodable frame");
                    continue;
                }
            };
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

            let message = Message::new(self.remote_addr, frame.tag, frame.payload);
            tokio::select! {
                _ = close_rx.changed() => break,
                result = self.outlets.inbound.send(message) => {
                    if result.is_err() {
                        tracing::debug!(addr = %self.remote_addr, "Inbound channel closed");
                        break;
                    }
                }
            }
        }
    }

    /// Hand a datagram to the read loop. Returns `false` if it was not queued.
    pub(crate) async fn deliver(&self, record: ByteMessage) -> bool {
        match &self.records {
            Some(records) if self.is_open() => records.send(record).await.is_ok(),
            _ => false,
        }
    }

    /// Encode and send a message. Does nothing once the connection is closed.
    pub async fn send(&self, tag: u32, payload: &C::Payload) -> ConnectionResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        let frame = self.encoder.encode(tag, payload)?;
        self.send_frame(&frame).await
    }

    /// Write an already encoded frame.
    ///
    /// A write blocked on a peer that stopped reading is abandoned as soon as
    /// the connection is closed.
    pub async fn send_frame(&self, frame: &Bytes) -> ConnectionResult<()> {
        let mut close_rx = self.close_tx.subscribe();
        if *close_rx.borrow() {
            return Ok(());
        }

        let mut link = tokio::select! {
            _ = close_rx.changed() => return Ok(()),
            link = self.link.lock() => link,
        };
        let Some(link) = link.as_mut() else {
            return Ok(());
        };

        tokio::select! {
            _ = close_rx.changed() => {
                tracing::debug!(addr = %self.remote_addr, "Write abandoned, connection closed");
                return Ok(());
            }
            result = link.write(frame) => result?,
        }

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Close the connection.
    ///
    /// Only the first call does anything: it releases the socket, stops the
    /// read loop and announces the endpoint on the closed-connection channel.
    /// Returns the error from shutting the socket down, if any.
    pub async fn close(&self) -> ConnectionResult<()> {
        self.close_with(Notify::Wait).await
    }

    /// Close without waiting on a full closed-connection channel
    pub(crate) async fn abort(&self) -> ConnectionResult<()> {
        self.close_with(Notify::BestEffort).await
    }

    async fn close_with(&self, notify: Notify) -> ConnectionResult<()> {
        let opened = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if opened.is_err() {
            return Ok(());
        }

        self.close_tx.send_replace(true);
        // Unblocks a datagram receive loop waiting on a full record queue
        drop(self.source.lock().await.take());

        let result = match self.link.lock().await.take() {
            Some(mut link) => link.shutdown().await.map_err(ConnectionError::from),
            None => Ok(()),
        };
        self.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
        tracing::info!(addr = %self.remote_addr, "Connection closed");

        let delivered = match notify {
            Notify::Wait => self.outlets.closed.send(self.remote_addr).await.is_ok(),
            Notify::BestEffort => self.outlets.closed.try_send(self.remote_addr).is_ok(),
        };
        if !delivered {
            tracing::debug!(addr = %self.remote_addr, "Close notification not delivered");
        }

        result
    }
}
