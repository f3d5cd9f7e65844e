//! Everything between a node's in-memory view of a gossip round and bytes on the network:
//!  node identities, the JSON wire records, datagram framing and the socket abstraction.

pub mod codec;
pub mod node_id;
pub mod transport;
pub mod wire;
