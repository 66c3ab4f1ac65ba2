//! Socket plumbing shared by the server and its connections
//!
//! Stream sockets are split into an owned read half (the connection's read
//! loop) and an owned write half (sends). Datagram peers share the server's
//! socket: writes go out with `send_to`, records arrive through a queue fed by
//! the server's receive loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use super::TransportKind;
use crate::protocol::ByteMessage;

/// The listening socket
pub(crate) enum Listener {
    Stream(TcpListener),
    Datagram(Arc<UdpSocket>),
}

impl Listener {
    pub(crate) async fn bind(kind: TransportKind, addr: SocketAddr) -> io::Result<Self> {
        match kind {
            TransportKind::Stream => Ok(Listener::Stream(TcpListener::bind(addr).await?)),
            TransportKind::Datagram => Ok(Listener::Datagram(Arc::new(UdpSocket::bind(addr).await?))),
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Stream(listener) => listener.local_addr(),
            Listener::Datagram(socket) => socket.local_addr(),
        }
    }
}

/// Write side of a connection
pub(crate) enum Link {
    Stream(OwnedWriteHalf),
    Datagram {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

impl Link {
    pub(crate) async fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        match self {
            Link::Stream(writer) => {
                writer.write_all(frame).await?;
                writer.flush().await
            }
            Link::Datagram { socket, peer } => {
                let sent = socket.send_to(frame, *peer).await?;
                if sent != frame.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("datagram truncated: sent {} of {} bytes", sent, frame.len()),
                    ));
                }
                Ok(())
            }
        }
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Link::Stream(writer) => writer.shutdown().await,
            // Nothing to tear down; the socket belongs to the server
            Link::Datagram { .. } => Ok(()),
        }
    }
}

/// Read side of a connection
pub(crate) enum Source {
    Stream(OwnedReadHalf),
    Datagram(mpsc::Receiver<ByteMessage>),
}

impl Source {
    /// Read one record into `buf`.
    ///
    /// Returns `Ok(None)` once the peer has gone away.
    pub(crate) async fn read_record(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self {
            Source::Stream(reader) => {
                let n = reader.read(buf).await?;
                Ok((n > 0).then_some(n))
            }
            Source::Datagram(records) => {
                let Some(record) = records.recv().await else {
                    return Ok(None);
                };
                let data = record.data();
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(Some(n))
            }
        }
    }
}
