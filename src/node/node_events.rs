use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::node::peer::PeerInfo;

#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    /// a node announced itself, either for the first time or with a new address
    Join(PeerInfo),
    /// a peer went silent for long enough to be considered failed
    Down(PeerInfo),
    /// a downed peer was heard from again
    Alive(PeerInfo),
    /// An application value published by some node. `key` is the application's name for it,
    ///  without the namespace prefix.
    AppUpdate {
        key: String,
        value: Value,
    },
}

pub struct NodeEventNotifier {
    sender: broadcast::Sender<NodeEvent>,
}
impl NodeEventNotifier {
    pub fn new() -> NodeEventNotifier {
        let (sender, _) = broadcast::channel(128);

        NodeEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: NodeEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for NodeEventNotifier {
    fn default() -> Self {
        NodeEventNotifier::new()
    }
}
