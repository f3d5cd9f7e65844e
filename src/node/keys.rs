//! Node level state shares the gossiped key space with application data. All keys this crate
//!  writes or interprets live in the `watercooler:` namespace, anything else in the replica is
//!  ignored.

pub const NAMESPACE: &str = "watercooler";
pub const JOIN_KEY: &str = "watercooler:join";
pub const HEARTBEAT_KEY: &str = "watercooler:heartbeat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKey<'a> {
    Join,
    Heartbeat,
    App(&'a str),
}

impl<'a> NodeKey<'a> {
    /// `None` for keys outside the namespace
    pub fn parse(key: &'a str) -> Option<NodeKey<'a>> {
        let name = key.strip_prefix(NAMESPACE)?.strip_prefix(':')?;
        match name {
            "join" => Some(NodeKey::Join),
            "heartbeat" => Some(NodeKey::Heartbeat),
            "" => None,
            app => Some(NodeKey::App(app)),
        }
    }
}

pub fn app_key(name: &str) -> String {
    format!("{}:{}", NAMESPACE, name)
}
