use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::failure_detector::FailureDetectorConfig;
use crate::messaging::node_id::NodeId;
use crate::messaging::transport::{Transport, UdpTransport};
use crate::node::link_policy::{AllowAllLinks, LinkPolicy};

pub struct NodeConfig {
    pub id: NodeId,
    /// host name or IP address this node binds to and announces to others
    pub host: String,

    /// gossip rounds per minute
    pub gossip_rate: u32,
    /// how long a round waits for the other side's reply. Defaults to the gossip interval.
    pub round_reply_timeout: Option<Duration>,
    /// bump a heartbeat key on every gossip tick so peers keep hearing from this node even if
    ///  nothing else changes
    pub publish_heartbeats: bool,

    pub join_attempts: usize,
    pub join_attempt_timeout: Duration,

    /// seed for the failure detectors' interval statistics. Defaults to the gossip interval.
    pub first_heartbeat_estimate: Option<Duration>,
    pub phi_min_std_dev: Duration,
    pub report_burst_window: Duration,

    pub transport: Arc<dyn Transport>,
    pub link_policy: Arc<dyn LinkPolicy>,
}

impl NodeConfig {
    pub fn new() -> NodeConfig {
        NodeConfig {
            id: NodeId::generate(),
            host: "127.0.0.1".to_string(),
            gossip_rate: 6,
            round_reply_timeout: None,
            publish_heartbeats: true,
            join_attempts: 3,
            join_attempt_timeout: Duration::from_secs(10),
            first_heartbeat_estimate: None,
            phi_min_std_dev: Duration::from_millis(500),
            report_burst_window: Duration::from_millis(100),
            transport: Arc::new(UdpTransport::default()),
            link_policy: Arc::new(AllowAllLinks::default()),
        }
    }

    pub fn with_id(id: impl Into<NodeId>) -> NodeConfig {
        NodeConfig {
            id: id.into(),
            ..NodeConfig::new()
        }
    }

    /// `60 / gossip_rate` seconds. A rate of 0 is rejected when creating a node.
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_secs(60) / self.gossip_rate.max(1)
    }

    pub fn round_reply_timeout(&self) -> Duration {
        self.round_reply_timeout
            .unwrap_or_else(|| self.gossip_interval())
    }

    pub fn failure_detector_config(&self) -> FailureDetectorConfig {
        FailureDetectorConfig {
            first_heartbeat_estimate: self.first_heartbeat_estimate
                .unwrap_or_else(|| self.gossip_interval()),
            min_std_dev: self.phi_min_std_dev,
            burst_window: self.report_burst_window,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig::new()
    }
}

impl Debug for NodeConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("gossip_rate", &self.gossip_rate)
            .field("round_reply_timeout", &self.round_reply_timeout)
            .field("publish_heartbeats", &self.publish_heartbeats)
            .field("join_attempts", &self.join_attempts)
            .field("join_attempt_timeout", &self.join_attempt_timeout)
            .field("first_heartbeat_estimate", &self.first_heartbeat_estimate)
            .field("phi_min_std_dev", &self.phi_min_std_dev)
            .field("report_burst_window", &self.report_burst_window)
            .finish_non_exhaustive()
    }
}
