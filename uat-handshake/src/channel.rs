// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reliable, ordered byte-stream channels and the line framing the handshake runs on.
//!
//! Any transport which offers a bidirectional byte stream (TCP, RFCOMM, an in-process pipe) can
//! carry a handshake by implementing [`Channel`]. Listening endpoints implement
//! [`ChannelListener`] so the [host server](crate::server::HostServer) can accept from them.
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::trace;

/// Bidirectional byte stream to a remote device.
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Address of the remote end, used to identify the peer in events and logs.
    fn remote_address(&self) -> String;

    /// Human-readable name of the remote device, if the transport knows one.
    fn remote_name(&self) -> Option<String> {
        None
    }
}

impl Channel for TcpStream {
    fn remote_address(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

impl Channel for Box<dyn Channel> {
    fn remote_address(&self) -> String {
        (**self).remote_address()
    }

    fn remote_name(&self) -> Option<String> {
        (**self).remote_name()
    }
}

/// Endpoint accepting incoming channels.
#[async_trait]
pub trait ChannelListener: Send + 'static {
    type Channel: Channel;

    /// Waits for the next incoming channel.
    ///
    /// Returns an error of kind [`io::ErrorKind::NotConnected`] when the listener can not accept
    /// any further channels.
    async fn accept(&mut self) -> io::Result<Self::Channel>;
}

#[async_trait]
impl ChannelListener for TcpListener {
    type Channel = TcpStream;

    async fn accept(&mut self) -> io::Result<TcpStream> {
        let (stream, _) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no data received within {0:?}")]
    Timeout(Duration),

    #[error("channel closed by remote")]
    Closed,

    #[error("line exceeds the maximum length")]
    LineTooLong,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<LinesCodecError> for ChannelError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => ChannelError::LineTooLong,
            LinesCodecError::Io(err) => ChannelError::Io(err),
        }
    }
}

/// Newline-delimited text framing over a channel with a read timeout.
///
/// Every read waits at most `timeout` for the next line.
pub struct LineChannel {
    framed: Framed<Box<dyn Channel>, LinesCodec>,
    remote: String,
    timeout: Duration,
}

impl LineChannel {
    pub fn new<C: Channel>(channel: C, max_line_length: usize, timeout: Duration) -> Self {
        let remote = channel.remote_address();
        let channel: Box<dyn Channel> = Box::new(channel);
        Self {
            framed: Framed::new(channel, LinesCodec::new_with_max_length(max_line_length)),
            remote,
            timeout,
        }
    }

    pub fn remote_address(&self) -> &str {
        &self.remote
    }

    pub fn remote_name(&self) -> Option<String> {
        self.framed.get_ref().remote_name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub async fn read_line(&mut self) -> Result<String, ChannelError> {
        let line = tokio::time::timeout(self.timeout, self.framed.next())
            .await
            .map_err(|_| ChannelError::Timeout(self.timeout))?
            .ok_or(ChannelError::Closed)??;
        trace!(remote = %self.remote, %line, "received line");
        Ok(line)
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        trace!(remote = %self.remote, %line, "sending line");
        self.framed.send(line).await?;
        Ok(())
    }

    /// Flushes pending lines and shuts down the write half of the channel.
    pub async fn close(mut self) -> Result<(), ChannelError> {
        SinkExt::<&str>::flush(&mut self.framed).await?;
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }

    /// Returns the underlying channel.
    ///
    /// Lines which were already read from the channel but not consumed yet are lost.
    pub fn into_inner(self) -> Box<dyn Channel> {
        self.framed.into_inner()
    }
}

impl fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineChannel")
            .field("remote", &self.remote)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// In-process channel backed by a [`tokio::io::duplex`] pipe.
#[derive(Debug)]
pub struct MemoryChannel {
    stream: DuplexStream,
    remote: String,
}

/// Creates two connected in-process channels, each knowing the other one by its address.
pub fn memory_pair(address_a: &str, address_b: &str) -> (MemoryChannel, MemoryChannel) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        MemoryChannel {
            stream: a,
            remote: address_b.to_string(),
        },
        MemoryChannel {
            stream: b,
            remote: address_a.to_string(),
        },
    )
}

impl Channel for MemoryChannel {
    fn remote_address(&self) -> String {
        self.remote.clone()
    }
}

impl AsyncRead for MemoryChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// In-process listener, connect to it through its [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryListener {
    address: String,
    incoming: mpsc::Receiver<MemoryChannel>,
}

/// Handle to open channels towards a [`MemoryListener`].
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    address: String,
    outgoing: mpsc::Sender<MemoryChannel>,
}

pub fn memory_listener(address: &str) -> (MemoryListener, MemoryConnector) {
    let (outgoing, incoming) = mpsc::channel(16);
    (
        MemoryListener {
            address: address.to_string(),
            incoming,
        },
        MemoryConnector {
            address: address.to_string(),
            outgoing,
        },
    )
}

impl MemoryConnector {
    /// Opens a channel to the listener, `local_address` is what the listener sees as remote.
    pub async fn connect(&self, local_address: &str) -> io::Result<MemoryChannel> {
        let (local, remote) = memory_pair(local_address, &self.address);
        self.outgoing
            .send(remote)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener is gone"))?;
        Ok(local)
    }
}

#[async_trait]
impl ChannelListener for MemoryListener {
    type Channel = MemoryChannel;

    async fn accept(&mut self) -> io::Result<MemoryChannel> {
        self.incoming.recv().await.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no connectors left for {}", self.address),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::net::{TcpListener, TcpStream};

    use super::{ChannelError, ChannelListener, LineChannel, memory_listener, memory_pair};

    #[tokio::test]
    async fn lines_over_memory_pair() {
        let (a, b) = memory_pair("alice", "bob");
        let mut a = LineChannel::new(a, 1024, Duration::from_secs(1));
        let mut b = LineChannel::new(b, 1024, Duration::from_secs(1));
        assert_eq!(a.remote_address(), "bob");
        assert_eq!(b.remote_address(), "alice");

        a.write_line("HELO there").await.unwrap();
        assert_eq!(b.read_line().await.unwrap(), "HELO there");

        a.close().await.unwrap();
        assert_matches!(b.read_line().await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn read_times_out() {
        let (a, _b) = memory_pair("alice", "bob");
        let mut a = LineChannel::new(a, 1024, Duration::from_millis(20));
        assert_matches!(a.read_line().await, Err(ChannelError::Timeout(_)));
    }

    #[tokio::test]
    async fn rejects_long_lines() {
        let (a, b) = memory_pair("alice", "bob");
        let mut a = LineChannel::new(a, 1024, Duration::from_secs(1));
        let mut b = LineChannel::new(b, 8, Duration::from_secs(1));
        a.write_line("this line is too long").await.unwrap();
        assert_matches!(b.read_line().await, Err(ChannelError::LineTooLong));
    }

    #[tokio::test]
    async fn memory_listener_accepts() {
        let (mut listener, connector) = memory_listener("server");
        let client = connector.connect("client").await.unwrap();
        let server = listener.accept().await.unwrap();

        let mut client = LineChannel::new(client, 64, Duration::from_secs(1));
        let mut server = LineChannel::new(server, 64, Duration::from_secs(1));
        assert_eq!(server.remote_address(), "client");
        client.write_line("ping").await.unwrap();
        assert_eq!(server.read_line().await.unwrap(), "ping");

        drop(connector);
        drop(client);
        assert_eq!(
            listener.accept().await.unwrap_err().kind(),
            std::io::ErrorKind::NotConnected
        );
    }

    #[tokio::test]
    async fn tcp_channel() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let client = TcpStream::connect(address).await.unwrap();
        let server = ChannelListener::accept(&mut listener).await.unwrap();

        let mut client = LineChannel::new(client, 64, Duration::from_secs(1));
        let mut server = LineChannel::new(server, 64, Duration::from_secs(1));
        assert_eq!(client.remote_address(), address.to_string());
        server.write_line("pong").await.unwrap();
        assert_eq!(client.read_line().await.unwrap(), "pong");
    }
}
