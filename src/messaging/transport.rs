use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// A [Transport] creates the datagram sockets a node talks through: one long-lived server
///  socket that receives rounds initiated by other nodes, and a short-lived client socket per
///  round that this node initiates.
///
/// It is passed around as an `Arc<dyn ...>` so tests can run a cluster without real sockets.
#[async_trait::async_trait]
pub trait Transport: Sync + Send {
    async fn create_server(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn DatagramSocket>>;

    /// an ephemeral socket on the given local interface
    async fn create_client(&self, host: IpAddr) -> anyhow::Result<Arc<dyn DatagramSocket>>;
}

#[async_trait::async_trait]
pub trait DatagramSocket: Sync + Send {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()>;

    async fn recv_from(&self) -> anyhow::Result<(Bytes, SocketAddr)>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}

/// way bigger than what we ever send: a datagram that does not fit is truncated by the OS
const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTransport {}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn create_server(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn DatagramSocket>> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("bound UDP server socket to {:?}", socket.local_addr()?);
        Ok(Arc::new(UdpDatagramSocket { socket }))
    }

    async fn create_client(&self, host: IpAddr) -> anyhow::Result<Arc<dyn DatagramSocket>> {
        let socket = match UdpSocket::bind(SocketAddr::new(host, 0)).await {
            Ok(socket) => socket,
            Err(e) => {
                trace!("could not bind client socket to {} ({}) - falling back to the unspecified address", host, e);
                let unspecified: IpAddr = if host.is_ipv4() { Ipv4Addr::UNSPECIFIED.into() } else { Ipv6Addr::UNSPECIFIED.into() };
                UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?
            }
        };
        Ok(Arc::new(UdpDatagramSocket { socket }))
    }
}

struct UdpDatagramSocket {
    socket: UdpSocket,
}

#[async_trait::async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv_from(&self) -> anyhow::Result<(Bytes, SocketAddr)> {
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);
        Ok((Bytes::from(buf), from))
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// Resolves a host name or IP literal. The first address wins if there are several.
pub async fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host((host, port)).await?
        .next()
        .ok_or_else(|| anyhow!("host {} did not resolve to any address", host))
}
