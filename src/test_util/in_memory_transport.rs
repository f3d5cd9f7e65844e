use std::collections::{BTreeSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::trace;

use crate::messaging::transport::{DatagramSocket, Transport};

const FIRST_EPHEMERAL_PORT: u16 = 40000;
/// the log of sent datagrams keeps this many of the most recent ones
pub const SENT_LOG_CAPACITY: usize = 10_000;

/// A datagram as it was handed to the network, whether or not it was delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub payload: Bytes,
}

type Inbox = mpsc::UnboundedSender<(Bytes, SocketAddr)>;

#[derive(Default)]
struct NetworkState {
    sockets: FxHashMap<SocketAddr, Inbox>,
    next_ephemeral_port: u16,
    released_ephemeral_ports: BTreeSet<u16>,
    ephemeral: FxHashSet<SocketAddr>,
    isolated: FxHashSet<IpAddr>,
    sent: VecDeque<SentDatagram>,
}

/// An in-process datagram network for running several nodes in one test, with full control
///  over time (there is no I/O that tokio's paused clock does not know about).
///
/// Delivery is immediate and in order. Datagrams to an address nobody is bound to are dropped,
///  as are datagrams from or to an isolated host.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> InMemoryNetwork {
        Default::default()
    }

    pub fn transport(&self) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport { network: self.clone() })
    }

    /// drop all traffic from and to `host` until it is healed
    pub fn isolate(&self, host: IpAddr) {
        self.state().isolated.insert(host);
    }

    pub fn heal(&self, host: IpAddr) {
        self.state().isolated.remove(&host);
    }

    /// the most recent datagrams, up to [SENT_LOG_CAPACITY]
    pub fn sent_datagrams(&self) -> Vec<SentDatagram> {
        self.state().sent.iter().cloned().collect()
    }

    pub fn clear_sent_datagrams(&self) {
        self.state().sent.clear();
    }

    fn state(&self) -> MutexGuard<NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bind(&self, addr: SocketAddr) -> anyhow::Result<InMemorySocket> {
        let mut state = self.state();
        if state.sockets.contains_key(&addr) {
            bail!("address {} is already in use", addr);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.sockets.insert(addr, sender);
        Ok(InMemorySocket {
            addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(receiver),
        })
    }

    fn bind_ephemeral(&self, host: IpAddr) -> anyhow::Result<InMemorySocket> {
        let port = {
            let mut state = self.state();
            match state.released_ephemeral_ports.pop_first() {
                Some(port) => port,
                None => {
                    if state.next_ephemeral_port < FIRST_EPHEMERAL_PORT {
                        state.next_ephemeral_port = FIRST_EPHEMERAL_PORT;
                    }
                    let port = state.next_ephemeral_port;
                    state.next_ephemeral_port = port.checked_add(1)
                        .ok_or_else(|| anyhow!("ran out of ephemeral ports"))?;
                    port
                }
            }
        };

        let addr = SocketAddr::new(host, port);
        let socket = self.bind(addr)?;
        self.state().ephemeral.insert(addr);
        Ok(socket)
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, payload: Bytes) {
        let mut state = self.state();
        if state.sent.len() == SENT_LOG_CAPACITY {
            state.sent.pop_front();
        }
        state.sent.push_back(SentDatagram { from, to, payload: payload.clone() });

        if state.isolated.contains(&from.ip()) || state.isolated.contains(&to.ip()) {
            trace!("dropping datagram from {:?} to {:?}: host is isolated", from, to);
            return;
        }
        match state.sockets.get(&to) {
            Some(inbox) => {
                let _ = inbox.send((payload, from));
            }
            None => trace!("dropping datagram from {:?} to {:?}: nobody is listening", from, to),
        }
    }

    fn unbind(&self, addr: &SocketAddr) {
        let mut state = self.state();
        state.sockets.remove(addr);
        if state.ephemeral.remove(addr) {
            state.released_ephemeral_ports.insert(addr.port());
        }
    }
}

pub struct InMemoryTransport {
    network: InMemoryNetwork,
}

#[async_trait::async_trait]
impl Transport for InMemoryTransport {
    async fn create_server(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn DatagramSocket>> {
        Ok(Arc::new(self.network.bind(addr)?))
    }

    async fn create_client(&self, host: IpAddr) -> anyhow::Result<Arc<dyn DatagramSocket>> {
        Ok(Arc::new(self.network.bind_ephemeral(host)?))
    }
}

struct InMemorySocket {
    addr: SocketAddr,
    network: InMemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
}

#[async_trait::async_trait]
impl DatagramSocket for InMemorySocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> anyhow::Result<()> {
        self.network.deliver(self.addr, to, Bytes::copy_from_slice(buf));
        Ok(())
    }

    async fn recv_from(&self) -> anyhow::Result<(Bytes, SocketAddr)> {
        self.inbox.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("socket {} was closed", self.addr))
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for InMemorySocket {
    fn drop(&mut self) {
        self.network.unbind(&self.addr);
    }
}
