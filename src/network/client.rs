//! tagwire Client
//!
//! Connects to a tagwire server and exchanges framed messages. Used by the
//! demo binary and the tests.

use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use super::TransportKind;
use crate::protocol::{Codec, CodecError, Decoder, Encoder, Frame, BUFFER_SIZE};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Timed out waiting for a message")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

enum Socket {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

/// tagwire Client
pub struct Client<C: Codec> {
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    encoder: Encoder<C>,
    decoder: Decoder<C>,
    buf: Vec<u8>,
}

impl<C: Codec> Client<C> {
    /// Connect to a server
    pub async fn connect(kind: TransportKind, server_addr: SocketAddr, codec: C) -> ClientResult<Self> {
        tracing::info!(%server_addr, transport = %kind, "Connecting");

        let socket = match kind {
            TransportKind::Stream => {
                let stream = TcpStream::connect(server_addr).await?;
                stream.set_nodelay(true)?;
                Socket::Stream(stream)
            }
            TransportKind::Datagram => {
                let unspecified = match server_addr.ip() {
                    IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                };
                let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
                socket.connect(server_addr).await?;
                Socket::Datagram(socket)
            }
        };

        let local_addr = match &socket {
            Socket::Stream(stream) => stream.local_addr()?,
            Socket::Datagram(socket) => socket.local_addr()?,
        };

        let codec = Arc::new(codec);
        Ok(Self {
            socket,
            local_addr,
            peer_addr: server_addr,
            encoder: Encoder::new(codec.clone()),
            decoder: Decoder::new(codec),
            buf: vec![0u8; BUFFER_SIZE],
        })
    }

    /// Local address, as the server sees it
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Send a message to the server
    pub async fn send(&mut self, tag: u32, payload: &C::Payload) -> ClientResult<()> {
        let frame = self.encoder.encode(tag, payload)?;
        self.send_raw(&frame).await
    }

    /// Send bytes as one record, without framing
    pub async fn send_raw(&mut self, record: &[u8]) -> ClientResult<()> {
        match &mut self.socket {
            Socket::Stream(stream) => stream.write_all(record).await?,
            Socket::Datagram(socket) => {
                socket.send(record).await?;
            }
        }
        Ok(())
    }

    /// Receive one record. Returns `None` once the server closed a stream.
    pub async fn recv_raw(&mut self) -> ClientResult<Option<Bytes>> {
        let n = match &mut self.socket {
            Socket::Stream(stream) => {
                let n = stream.read(&mut self.buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                n
            }
            Socket::Datagram(socket) => socket.recv(&mut self.buf).await?,
        };
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }

    /// Receive the next decodable message.
    ///
    /// Short records and unknown tags are skipped. Returns `None` once the
    /// server closed a stream.
    pub async fn recv(&mut self) -> ClientResult<Option<Frame<C::Payload>>> {
        loop {
            let Some(record) = self.recv_raw().await? else {
                return Ok(None);
            };
            if let Some(frame) = self.decoder.decode(&record)? {
                return Ok(Some(frame));
            }
        }
    }

    /// Like [`Client::recv`], giving up after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ClientResult<Option<Frame<C::Payload>>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Close the connection
    pub async fn close(self) -> ClientResult<()> {
        if let Socket::Stream(mut stream) = self.socket {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RawCodec;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_stream_client_frames_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = Client::connect(TransportKind::Stream, addr, RawCodec::new()).await.unwrap();
        let (mut server_side, remote) = listener.accept().await.unwrap();
        assert_eq!(remote, client.local_addr());
        assert_eq!(client.peer_addr(), addr);

        client.send(5, &Bytes::from_static(b"abc")).await.unwrap();
        let mut buf = [0u8; 7];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, &[0, 0, 0, 5, b'a', b'b', b'c']);

        server_side.write_all(&[0, 0, 0, 6, b'z']).await.unwrap();
        let frame = client.recv().await.unwrap().unwrap();
        assert_eq!(frame.tag, 6);
        assert_eq!(frame.payload.as_ref(), b"z");

        drop(server_side);
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_datagram_client_skips_short_records() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = Client::connect(TransportKind::Datagram, addr, RawCodec::new()).await.unwrap();
        client.send_raw(b"hi").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");

        server.send_to(&[0, 0, 1], from).await.unwrap();
        server.send_to(&[0, 0, 0, 1, b'!'], from).await.unwrap();

        let frame = client.recv().await.unwrap().unwrap();
        assert_eq!(frame.tag, 1);
        assert_eq!(frame.payload.as_ref(), b"!");
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut client = Client::connect(TransportKind::Datagram, server.local_addr().unwrap(), RawCodec::new())
            .await
            .unwrap();

        let result = client.recv_timeout(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ClientError::Timeout)));
    }
}
