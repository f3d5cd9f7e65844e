use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tracing::{debug, error, info, trace, warn};

use crate::anti_entropy::messages::{GossipMessage, UpdateRecord};
use crate::anti_entropy::session::ExchangeSession;
use crate::messaging::codec;
use crate::messaging::codec::{InboundRecord, Stamped};
use crate::messaging::node_id::NodeId;
use crate::messaging::transport::{resolve, DatagramSocket};
use crate::messaging::wire::{Handshake, WireRecord};
use crate::node::keys::{NodeKey, HEARTBEAT_KEY};
use crate::node::node::NodeInner;
use crate::node::node_events::NodeEvent;
use crate::node::peer::PeerInfo;

/// Where a gossip round goes. The id is unknown for rounds towards a bare address, e.g. when
///  joining a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipTarget {
    pub id: Option<NodeId>,
    pub host: String,
    pub port: u16,
}

impl GossipTarget {
    pub fn address(host: String, port: u16) -> GossipTarget {
        GossipTarget { id: None, host, port }
    }
}

impl From<PeerInfo> for GossipTarget {
    fn from(value: PeerInfo) -> Self {
        GossipTarget {
            id: Some(value.id),
            host: value.host,
            port: value.port,
        }
    }
}

/// The node's background loop. It runs scheduled gossip rounds, answers datagrams arriving at
///  the server socket, and turns replica updates into membership changes and node events.
pub(crate) async fn run_driver(
    inner: Arc<NodeInner>,
    server: Arc<dyn DatagramSocket>,
    mut updates: broadcast::Receiver<UpdateRecord>,
    mut reply_requests: mpsc::Receiver<GossipTarget>,
) {
    let interval = inner.config.gossip_interval();
    let mut gossip_ticks = time::interval_at(Instant::now() + interval, interval);
    gossip_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut heartbeat_counter: u64 = 0;

    info!("starting gossip driver for {:?}, gossip interval {:?}", inner.id(), interval);

    loop {
        select! {
            _ = gossip_ticks.tick() => {
                if inner.config.publish_heartbeats {
                    heartbeat_counter += 1;
                    inner.anti_entropy.event(HEARTBEAT_KEY, json!(heartbeat_counter)).await;
                }
                spawn_round(&inner, None, false);
            }
            received = server.recv_from() => {
                match received {
                    Ok((payload, from)) => on_datagram(&inner, server.as_ref(), &payload, from).await,
                    Err(e) => error!("error receiving gossip datagram: {}", e),
                }
            }
            update = updates.recv() => {
                match update {
                    Ok(update) => on_update(&inner, update).await,
                    Err(RecvError::Lagged(num_skipped)) => warn!("skipped {} replica updates", num_skipped),
                    Err(RecvError::Closed) => {
                        debug!("replica update stream closed - stopping gossip driver");
                        return;
                    }
                }
            }
            Some(target) = reply_requests.recv() => {
                spawn_round(&inner, Some(target), true);
            }
        }
    }
}

fn spawn_round(inner: &Arc<NodeInner>, target: Option<GossipTarget>, is_response: bool) {
    let inner = inner.clone();
    tokio::spawn(async move {
        if let Err(e) = gossip_round(&inner, target, is_response).await {
            error!("gossip round failed: {}", e);
        }
    });
}

/// Starts a gossip round, i.e. sends this node's opening of an exchange. `None` picks a random
///  healthy peer.
///
/// A round that is not a response is preceded by a handshake so the receiver answers with a
///  round of its own. Waiting for and processing the reply happens in the background, this
///  returns as soon as the opening datagram was sent.
pub(crate) async fn gossip_round(inner: &Arc<NodeInner>, target: Option<GossipTarget>, is_response: bool) -> anyhow::Result<()> {
    let binding = inner.binding.get()
        .ok_or_else(|| anyhow!("node is not listening"))?;

    let target = match target {
        Some(target) => target,
        None => {
            let selected = inner.membership.write().await
                .select_gossip_target();
            match selected {
                Some(peer) => GossipTarget::from(peer),
                None => {
                    debug!("no peers - skipping gossip round");
                    return Ok(());
                }
            }
        }
    };

    if let Some(id) = &target.id {
        if id == inner.id() {
            debug!("not gossiping with myself");
            return Ok(());
        }
        if !inner.config.link_policy.should_gossip(inner.id(), id) {
            debug!(peer = ?id, "link policy suppresses gossip");
            return Ok(());
        }
    }

    debug!(peer = ?target.id, "{} [{}]:{}", if is_response { "responding to" } else { "gossiping with" }, target.host, target.port);

    let session = inner.anti_entropy.create_stream();
    let mut records = Vec::new();
    if !is_response {
        records.push(WireRecord::Handshake(Handshake { from: binding.info.clone() }));
    }
    records.extend(session.opening().await
        .into_iter()
        .map(WireRecord::Message));

    let to = resolve(&target.host, target.port).await?;
    let client = inner.config.transport.create_client(binding.socket_addr.ip()).await?;
    send_records(client.as_ref(), &records, to).await?;

    tokio::spawn(await_reply(inner.clone(), client, session, target, to));
    Ok(())
}

async fn await_reply(inner: Arc<NodeInner>, client: Arc<dyn DatagramSocket>, session: ExchangeSession, target: GossipTarget, to: SocketAddr) {
    let reply_timeout = inner.config.round_reply_timeout();
    let (payload, from) = match time::timeout(reply_timeout, client.recv_from()).await {
        Ok(Ok(received)) => received,
        Ok(Err(e)) => {
            error!("error receiving gossip reply from {:?}: {}", to, e);
            return;
        }
        Err(_) => {
            trace!(peer = ?target.id, "no reply from {:?} within {:?}", to, reply_timeout);
            return;
        }
    };

    let records = codec::decode(&payload, reply_sender(&target, to, from));
    let follow_up = handle_records(&inner, &session, records).await;
    if let Err(e) = send_messages(client.as_ref(), follow_up, to).await {
        error!("error sending gossip to {:?}: {}", to, e);
    }
}

/// The node a reply can be attributed to: the round's target, but only if the reply came from
///  the address the round was sent to.
fn reply_sender(target: &GossipTarget, to: SocketAddr, from: SocketAddr) -> Option<&NodeId> {
    if from != to {
        debug!(peer = ?target.id, "reply for {:?} came from {:?} - not attributing it", to, from);
        return None;
    }
    target.id.as_ref()
}

async fn on_datagram(inner: &Arc<NodeInner>, server: &dyn DatagramSocket, payload: &[u8], from: SocketAddr) {
    trace!("received datagram of {} bytes from {:?}", payload.len(), from);

    let session = inner.anti_entropy.exchange();
    // the server's peers talk from ephemeral ports, so there is no way to tell who sent this
    let records = codec::decode(payload, None);
    let reply = handle_records(inner, &session, records).await;
    if let Err(e) = send_messages(server, reply, from).await {
        error!("error replying to {:?}: {}", from, e);
    }
}

/// Feeds a datagram's records into an exchange session, and returns the session's output.
///  Handshakes are taken out and answered with a round of our own.
async fn handle_records(inner: &Arc<NodeInner>, session: &ExchangeSession, records: Vec<InboundRecord>) -> Vec<GossipMessage> {
    let mut sender_reported = false;
    let mut output = Vec::new();

    for record in records {
        match record {
            InboundRecord::Handshake(from) => {
                trace!(peer = ?from.id, "received handshake");
                inner.report(&from.id).await;
                request_reply_round(inner, from);
            }
            InboundRecord::Message(Stamped { sender, message }) => {
                if let Some(sender) = &sender {
                    // once per datagram is enough
                    if !sender_reported {
                        inner.report(sender).await;
                        sender_reported = true;
                    }
                }
                output.append(&mut session.on_message(message).await);
            }
        }
    }
    output
}

fn request_reply_round(inner: &NodeInner, to: PeerInfo) {
    let Some(binding) = inner.binding.get() else {
        return;
    };
    if let Err(e) = binding.reply_requests.try_send(GossipTarget::from(to)) {
        warn!("dropping reply round: {}", e);
    }
}

/// Interprets a replica update that came in through gossip
async fn on_update(inner: &NodeInner, update: UpdateRecord) {
    inner.report(&update.r).await;

    match NodeKey::parse(&update.k) {
        None => debug!("ignoring update for {} outside the node namespace", update.k),
        Some(NodeKey::Join) => match serde_json::from_value::<PeerInfo>(update.v) {
            Ok(announced) => inner.membership.write().await.on_join_announcement(announced),
            Err(e) => warn!(origin = ?update.r, "malformed join announcement: {}", e),
        },
        Some(NodeKey::Heartbeat) => trace!(origin = ?update.r, "heartbeat {}", update.v),
        Some(NodeKey::App(name)) => {
            inner.event_notifier.send_event(NodeEvent::AppUpdate {
                key: name.to_string(),
                value: update.v,
            });
        }
    }
}

async fn send_messages(socket: &dyn DatagramSocket, messages: Vec<GossipMessage>, to: SocketAddr) -> anyhow::Result<()> {
    let records = messages.into_iter()
        .map(WireRecord::Message)
        .collect::<Vec<_>>();
    send_records(socket, &records, to).await
}

async fn send_records(socket: &dyn DatagramSocket, records: &[WireRecord], to: SocketAddr) -> anyhow::Result<()> {
    let datagram = codec::encode(records, to);
    if datagram.payload.is_empty() {
        trace!("nothing to send to {:?}", to);
        return Ok(());
    }
    socket.send_to(&datagram.payload, datagram.to).await
}
