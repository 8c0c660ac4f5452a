pub mod local;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::LocalBroker;

/// Opaque identifier for a broker-owned media resource (pipeline, hub,
/// hub port or endpoint). The broker is the only party that can interpret
/// it; this side only stores, compares and hands it back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle(String);

impl MediaHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trickled network-path candidate, forwarded verbatim between the client
/// and the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct BrokerError(String);

impl BrokerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type CandidateCallback = Box<dyn Fn(IceCandidate) + Send + Sync>;

/// The remote media-processing service, reduced to the operations this
/// server consumes. Every call is a suspension point; callers re-validate
/// their own state after awaiting.
#[async_trait]
pub trait MediaBroker: Send + Sync {
    /// Allocates a fresh media pipeline to host a room's media objects.
    async fn create_pipeline(&self) -> Result<MediaHandle, BrokerError>;

    /// Allocates a bidirectional real-time media endpoint on a pipeline.
    async fn create_endpoint(&self, pipeline: &MediaHandle) -> Result<MediaHandle, BrokerError>;

    /// Allocates the room's audio-mixing hub.
    async fn create_mix_hub(&self, pipeline: &MediaHandle) -> Result<MediaHandle, BrokerError>;

    /// Allocates the room's one-to-many broadcast hub.
    async fn create_broadcast_hub(&self, pipeline: &MediaHandle)
        -> Result<MediaHandle, BrokerError>;

    /// Allocates a port on a hub, to be wired to exactly one endpoint.
    async fn create_hub_port(&self, hub: &MediaHandle) -> Result<MediaHandle, BrokerError>;

    /// Wires media flow from `src` into `dst`.
    async fn connect(&self, src: &MediaHandle, dst: &MediaHandle) -> Result<(), BrokerError>;

    /// Selects which hub port feeds the broadcast hub's outgoing stream.
    async fn set_broadcast_source(
        &self,
        hub: &MediaHandle,
        port: &MediaHandle,
    ) -> Result<(), BrokerError>;

    /// Hands an SDP offer to an endpoint, resolving to the SDP answer once
    /// the broker has processed it. Independent of `gather_candidates`;
    /// both may be in flight at once.
    async fn process_offer(
        &self,
        endpoint: &MediaHandle,
        sdp_offer: &str,
    ) -> Result<String, BrokerError>;

    /// Starts ICE candidate gathering on an endpoint.
    async fn gather_candidates(&self, endpoint: &MediaHandle) -> Result<(), BrokerError>;

    /// Delivers a client candidate to an endpoint.
    async fn add_remote_candidate(
        &self,
        endpoint: &MediaHandle,
        candidate: IceCandidate,
    ) -> Result<(), BrokerError>;

    /// Registers a callback invoked for every locally gathered candidate
    /// on the endpoint, for trickling back to the client.
    async fn on_local_candidate(
        &self,
        endpoint: &MediaHandle,
        callback: CandidateCallback,
    ) -> Result<(), BrokerError>;

    /// Releases a broker resource. Idempotent for unknown handles within a
    /// single call; callers still null their own copy before releasing so
    /// a handle is never submitted twice.
    async fn release(&self, handle: &MediaHandle);
}
