// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connectionless transports for candidate key nodes.
//!
//! Datagrams may get lost, duplicated or reordered, the protocol tolerates all of these.
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, mpsc};
use tokio_util::task::AbortOnDropHandle;
use tracing::{trace, warn};

/// Largest payload of a single UDP datagram over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Number of incoming datagrams queued before further ones are dropped.
const INCOMING_QUEUE_SIZE: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    /// Address of the sender, used to reply with [`DatagramChannel::send_to`].
    pub remote: String,
    pub payload: Vec<u8>,
}

/// Incoming datagrams of a channel.
pub type DatagramReceiver = mpsc::Receiver<Datagram>;

/// Sending side of a connectionless transport.
///
/// Incoming datagrams are delivered through the [`DatagramReceiver`] handed out together with the
/// channel.
#[async_trait]
pub trait DatagramChannel: fmt::Debug + Send + Sync + 'static {
    fn local_address(&self) -> String;

    /// Sends the payload to every node listening on the channel.
    async fn send_multicast(&self, payload: &[u8]) -> io::Result<()>;

    async fn send_to(&self, remote: &str, payload: &[u8]) -> io::Result<()>;
}

fn check_size(payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("datagram of {} bytes is too large", payload.len()),
        ));
    }
    Ok(())
}

/// In-memory multicast group connecting channels within one process.
///
/// Datagrams are dropped when the queue of the receiver is full or the receiver is gone.
#[derive(Clone, Debug, Default)]
pub struct DatagramHub {
    members: Arc<RwLock<HashMap<String, mpsc::Sender<Datagram>>>>,
}

impl DatagramHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member with the given address, replacing any previous member with that address.
    pub async fn join(&self, address: &str) -> (HubChannel, DatagramReceiver) {
        let (tx, rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
        self.members.write().await.insert(address.to_string(), tx);
        let channel = HubChannel {
            address: address.to_string(),
            hub: self.clone(),
        };
        (channel, rx)
    }

    pub async fn leave(&self, address: &str) {
        self.members.write().await.remove(address);
    }
}

#[derive(Clone, Debug)]
pub struct HubChannel {
    address: String,
    hub: DatagramHub,
}

impl HubChannel {
    fn deliver(&self, to: &str, tx: &mpsc::Sender<Datagram>, payload: &[u8]) {
        let datagram = Datagram {
            remote: self.address.clone(),
            payload: payload.to_vec(),
        };
        if let Err(err) = tx.try_send(datagram) {
            trace!(to, "dropped datagram: {err}");
        }
    }
}

#[async_trait]
impl DatagramChannel for HubChannel {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn send_multicast(&self, payload: &[u8]) -> io::Result<()> {
        check_size(payload)?;
        let members = self.hub.members.read().await;
        for (address, tx) in members.iter() {
            if *address != self.address {
                self.deliver(address, tx, payload);
            }
        }
        Ok(())
    }

    async fn send_to(&self, remote: &str, payload: &[u8]) -> io::Result<()> {
        check_size(payload)?;
        match self.hub.members.read().await.get(remote) {
            Some(tx) => self.deliver(remote, tx, payload),
            None => trace!(remote, "dropped datagram to unknown member"),
        }
        Ok(())
    }
}

/// Channel over a UDP socket.
///
/// Remote addresses are socket addresses in their string form, for example `192.168.1.5:4242`.
/// Datagrams are only received after [`start`](Self::start), until the channel is dropped.
#[derive(Debug)]
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    local_address: SocketAddr,
    multicast_address: SocketAddr,
    handle: Option<AbortOnDropHandle<()>>,
}

impl UdpChannel {
    /// Binds to `port` on all interfaces and joins the IPv4 multicast `group` on the same port.
    ///
    /// Our own multicast datagrams are not looped back.
    pub async fn join_multicast(group: Ipv4Addr, port: u16) -> io::Result<Self> {
        if !group.is_multicast() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{group} is not a multicast address"),
            ));
        }
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(false)?;
        Self::from_socket(socket, SocketAddr::from((group, port)))
    }

    /// Uses a bound socket, "multicasting" to `multicast_address`, which can also be a single
    /// unicast or broadcast address.
    pub fn from_socket(socket: UdpSocket, multicast_address: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            local_address: socket.local_addr()?,
            socket: Arc::new(socket),
            multicast_address,
            handle: None,
        })
    }

    /// Spawns the task receiving datagrams from the socket.
    pub fn start(&mut self) -> io::Result<DatagramReceiver> {
        if self.handle.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "udp channel is already receiving",
            ));
        }
        let (tx, rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
        let task = tokio::spawn(receive_loop(self.socket.clone(), self.local_address, tx));
        self.handle = Some(AbortOnDropHandle::new(task));
        Ok(rx)
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, local: SocketAddr, tx: mpsc::Sender<Datagram>) {
    let mut buf = vec![0; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if from == local {
                    continue;
                }
                let datagram = Datagram {
                    remote: from.to_string(),
                    payload: buf[..len].to_vec(),
                };
                if let Err(err) = tx.try_send(datagram) {
                    if tx.is_closed() {
                        break;
                    }
                    trace!(%from, "dropped datagram: {err}");
                }
            }
            Err(err) => warn!("failed receiving datagram on udp socket: {err}"),
        }
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    fn local_address(&self) -> String {
        self.local_address.to_string()
    }

    async fn send_multicast(&self, payload: &[u8]) -> io::Result<()> {
        check_size(payload)?;
        self.socket
            .send_to(payload, self.multicast_address)
            .await
            .map(|_| ())
    }

    async fn send_to(&self, remote: &str, payload: &[u8]) -> io::Result<()> {
        check_size(payload)?;
        let remote: SocketAddr = remote
            .parse()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        self.socket.send_to(payload, remote).await.map(|_| ())
    }
}
