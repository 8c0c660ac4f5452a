use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::mpsc;

use crate::broker::{IceCandidate, MediaHandle};
use crate::round_table::signaling::ServerMessage;

/// Identifies which media relation of a knight a message refers to: the
/// knight's own outgoing feed, one of the two hub legs, or another
/// knight's feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelationKey {
    SelfFeed,
    Composite,
    Dispatcher,
    Peer(String),
}

impl RelationKey {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "self" => RelationKey::SelfFeed,
            "composite" => RelationKey::Composite,
            "dispatcher" => RelationKey::Dispatcher,
            other => RelationKey::Peer(other.to_string()),
        }
    }
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationKey::SelfFeed => f.write_str("self"),
            RelationKey::Composite => f.write_str("composite"),
            RelationKey::Dispatcher => f.write_str("dispatcher"),
            RelationKey::Peer(id) => f.write_str(id),
        }
    }
}

impl Serialize for RelationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RelationKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(RelationKey::from_wire(&value))
    }
}

/// King hosts the table and owns source selection; everyone else holds a
/// seat token that was validated at join time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    King,
    Seated { seat_token: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnightSnapshot {
    pub id: String,
    pub name: String,
}

/// Per-connection session state. Candidates arriving before the matching
/// endpoint exists are queued per relation and flushed in arrival order
/// when the endpoint binds.
pub struct Knight {
    pub id: String,
    pub name: String,
    pub table_id: String,
    pub role: Role,
    endpoints: HashMap<RelationKey, MediaHandle>,
    hub_ports: HashMap<RelationKey, MediaHandle>,
    pending_candidates: HashMap<RelationKey, VecDeque<IceCandidate>>,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl Knight {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        table_id: impl Into<String>,
        role: Role,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            table_id: table_id.into(),
            role,
            endpoints: HashMap::new(),
            hub_ports: HashMap::new(),
            pending_candidates: HashMap::new(),
            sender,
        }
    }

    pub fn is_king(&self) -> bool {
        self.role == Role::King
    }

    pub fn seat_token(&self) -> Option<&str> {
        match &self.role {
            Role::King => None,
            Role::Seated { seat_token } => Some(seat_token),
        }
    }

    pub fn endpoint(&self, relation: &RelationKey) -> Option<&MediaHandle> {
        self.endpoints.get(relation)
    }

    pub fn hub_port(&self, relation: &RelationKey) -> Option<&MediaHandle> {
        self.hub_ports.get(relation)
    }

    /// Binds an endpoint for a relation, returning the candidates queued
    /// while it did not exist (in arrival order) and any handle the bind
    /// displaced, for the caller to release.
    pub fn bind_endpoint(
        &mut self,
        relation: RelationKey,
        handle: MediaHandle,
    ) -> (Vec<IceCandidate>, Option<MediaHandle>) {
        let queued = self
            .pending_candidates
            .remove(&relation)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default();
        let replaced = self.endpoints.insert(relation, handle);
        (queued, replaced)
    }

    pub fn bind_hub_port(
        &mut self,
        relation: RelationKey,
        handle: MediaHandle,
    ) -> Option<MediaHandle> {
        self.hub_ports.insert(relation, handle)
    }

    pub fn queue_candidate(&mut self, relation: RelationKey, candidate: IceCandidate) {
        self.pending_candidates
            .entry(relation)
            .or_default()
            .push_back(candidate);
    }

    pub fn take_endpoint(&mut self, relation: &RelationKey) -> Option<MediaHandle> {
        self.pending_candidates.remove(relation);
        self.endpoints.remove(relation)
    }

    /// Empties every media handle this knight holds, for release by the
    /// caller. Pending candidates are discarded with them.
    pub fn drain_handles(&mut self) -> Vec<MediaHandle> {
        self.pending_candidates.clear();
        let mut handles: Vec<MediaHandle> = self.endpoints.drain().map(|(_, h)| h).collect();
        handles.extend(self.hub_ports.drain().map(|(_, h)| h));
        handles
    }

    /// Delivers a message to this knight's connection. A closed channel
    /// means the socket is already gone; the session teardown path will
    /// notice on its own.
    pub fn send(&self, message: ServerMessage) {
        let _ = self.sender.send(message);
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.sender.clone()
    }

    pub fn snapshot(&self) -> KnightSnapshot {
        KnightSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}
