//! Voice-chat identifiers
//!
//! Channel ids reported by a voice-chat server are only unique within that
//! server, so channels are always keyed by [`ChannelKey`], which pairs the
//! server's unique id with the channel id.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally unique identity of a voice-chat client
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique id of a voice-chat server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerUid(pub String);

impl fmt::Display for ServerUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServerUid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Channel id as reported by a server (unique only within that server)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

/// Globally unique channel key: server unique id + channel id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub server: ServerUid,
    pub channel: ChannelId,
}

impl ChannelKey {
    pub fn new(server: impl Into<ServerUid>, channel: u64) -> Self {
        Self {
            server: server.into(),
            channel: ChannelId(channel),
        }
    }

    /// Check whether this channel belongs to the given server
    pub fn is_on(&self, server: &ServerUid) -> bool {
        &self.server == server
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server, self.channel.0)
    }
}
