use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::anti_entropy::AntiEntropy;
use crate::failure_detector::phi_accrual::PhiAccrualDetector;
use crate::failure_detector::FailureDetector;
use crate::messaging::node_id::NodeId;
use crate::messaging::transport::{resolve, DatagramSocket};
use crate::node::gossip::{gossip_round, run_driver, GossipTarget};
use crate::node::join::{run_join, validate_port, PeerEndpoint};
use crate::node::keys::{app_key, JOIN_KEY};
use crate::node::membership::Membership;
use crate::node::node_config::NodeConfig;
use crate::node::node_error::NodeError;
use crate::node::node_events::{NodeEvent, NodeEventNotifier};
use crate::node::peer::PeerInfo;

const REPLY_REQUEST_CAPACITY: usize = 128;

/// What a node is bound to once it listens
pub(crate) struct LocalBinding {
    pub info: PeerInfo,
    pub socket_addr: SocketAddr,
    pub reply_requests: mpsc::Sender<GossipTarget>,
}

/// State shared between a [Node] and its background tasks
pub(crate) struct NodeInner {
    pub config: NodeConfig,
    pub membership: RwLock<Membership>,
    pub anti_entropy: AntiEntropy,
    pub event_notifier: Arc<NodeEventNotifier>,
    pub binding: OnceLock<LocalBinding>,
}

impl NodeInner {
    pub fn id(&self) -> &NodeId {
        &self.config.id
    }

    /// traffic from `id` was observed
    pub async fn report(&self, id: &NodeId) {
        if id == self.id() {
            return;
        }
        self.membership.write().await
            .report(id);
    }
}

/// A cluster member. A node is created with its configuration, becomes part of the network by
///  calling [Node::listen], and joins an existing cluster through [Node::join].
///
/// Dropping the node stops its background gossip.
pub struct Node {
    inner: Arc<NodeInner>,
    listening: AtomicBool,
    driver: OnceLock<JoinHandle<()>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Node, NodeError> {
        if config.gossip_rate == 0 {
            return Err(NodeError::InvalidGossipRate);
        }

        let failure_detector_config = config.failure_detector_config();
        let event_notifier = Arc::new(NodeEventNotifier::new());
        let membership = Membership::new(
            config.id.clone(),
            Arc::new(move || Box::new(PhiAccrualDetector::new(&failure_detector_config)) as Box<dyn FailureDetector>),
            event_notifier.clone(),
        );

        debug!("creating node with {:?}", config);

        Ok(Node {
            inner: Arc::new(NodeInner {
                anti_entropy: AntiEntropy::new(config.id.clone()),
                membership: RwLock::new(membership),
                event_notifier,
                binding: OnceLock::new(),
                config,
            }),
            listening: AtomicBool::new(false),
            driver: OnceLock::new(),
        })
    }

    pub fn id(&self) -> &NodeId {
        self.inner.id()
    }

    /// host, port and id as announced to the cluster, once the node listens
    pub fn local_info(&self) -> Option<PeerInfo> {
        self.inner.binding.get()
            .map(|b| b.info.clone())
    }

    /// Binds the node to the configured host and the given port, announces it through gossip
    ///  and starts periodic gossip rounds. This can be done only once per node.
    pub async fn listen(&self, port: u32) -> Result<PeerInfo, NodeError> {
        let port = validate_port(port)?;
        if self.listening.swap(true, Ordering::AcqRel) {
            return Err(NodeError::AlreadyListening);
        }

        match self.do_listen(port).await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.listening.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn do_listen(&self, port: u16) -> Result<PeerInfo, NodeError> {
        let inner = &self.inner;
        let info = PeerInfo {
            id: inner.id().clone(),
            host: inner.config.host.clone(),
            port,
        };

        let socket_addr = resolve(&info.host, port).await?;
        let server: Arc<dyn DatagramSocket> = inner.config.transport.create_server(socket_addr).await?;
        let (reply_requests, reply_requests_receiver) = mpsc::channel(REPLY_REQUEST_CAPACITY);

        // `listening` guarantees we get here only once
        let _ = inner.binding.set(LocalBinding {
            info: info.clone(),
            socket_addr,
            reply_requests,
        });

        info!("node {:?} listening on [{}]:{}", info.id, info.host, info.port);

        let updates = inner.anti_entropy.subscribe();
        inner.anti_entropy.set(JOIN_KEY, json!(info)).await;

        let driver = tokio::spawn(run_driver(inner.clone(), server, updates, reply_requests_receiver));
        let _ = self.driver.set(driver);

        Ok(info)
    }

    /// Runs a gossip round outside the regular schedule, with a random healthy peer if no
    ///  target is given.
    pub async fn gossip(&self, target: Option<PeerInfo>) -> Result<(), NodeError> {
        if self.inner.binding.get().is_none() {
            return Err(NodeError::NotListening);
        }
        gossip_round(&self.inner, target.map(GossipTarget::from), false).await?;
        Ok(())
    }

    /// Joins a cluster through one of its members. Returns the number of attempts it took.
    pub async fn join(&self, host: &str, port: u32) -> Result<usize, NodeError> {
        let endpoint = PeerEndpoint::new(host, port)?;
        if self.inner.binding.get().is_none() {
            return Err(NodeError::NotListening);
        }
        run_join(&self.inner, endpoint).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.event_notifier.subscribe()
    }

    /// Publishes an application value to the cluster. Other nodes see it as
    ///  [NodeEvent::AppUpdate] with the given name as key. Publishing an unchanged value does
    ///  nothing, and `false` is returned.
    pub async fn publish(&self, name: &str, value: Value) -> bool {
        self.inner.anti_entropy.set(&app_key(name), value).await
    }

    /// Like [Node::publish], but disseminated even if the value did not change
    pub async fn publish_event(&self, name: &str, value: Value) {
        self.inner.anti_entropy.event(&app_key(name), value).await
    }

    /// healthy peers, ordered by id
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.inner.membership.read().await.peer_infos()
    }

    /// peers that are considered down, ordered by id
    pub async fn downed(&self) -> Vec<PeerInfo> {
        self.inner.membership.read().await.downed_infos()
    }

    /// current suspicion score for a known peer
    pub async fn phi(&self, id: &NodeId) -> Option<f64> {
        self.inner.membership.read().await.phi(id)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get() {
            driver.abort();
        }
    }
}
