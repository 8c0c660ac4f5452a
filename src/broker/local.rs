use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{BrokerError, CandidateCallback, IceCandidate, MediaBroker, MediaHandle};

/// Point in the broker surface where the next call fails. Single-shot:
/// consumed by the first matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    CreatePipeline,
    CreateEndpoint,
    CreateMixHub,
    CreateBroadcastHub,
    CreateHubPort,
    Connect,
    SetBroadcastSource,
    ProcessOffer,
    GatherCandidates,
    AddRemoteCandidate,
}

#[derive(Default)]
struct State {
    next_id: u64,
    live: HashSet<MediaHandle>,
    parents: HashMap<MediaHandle, MediaHandle>,
    links: Vec<(MediaHandle, MediaHandle)>,
    broadcast_sources: HashMap<MediaHandle, MediaHandle>,
    delivered: HashMap<MediaHandle, Vec<IceCandidate>>,
    release_counts: HashMap<String, u32>,
    callbacks: HashMap<MediaHandle, Vec<CandidateCallback>>,
    gathering: HashSet<MediaHandle>,
    fail_next: Option<FailPoint>,
}

impl State {
    fn alloc(&mut self, kind: &str) -> MediaHandle {
        self.next_id += 1;
        let handle = MediaHandle::new(format!("{}-{}", kind, self.next_id));
        self.live.insert(handle.clone());
        handle
    }

    fn trip(&mut self, point: FailPoint) -> Result<(), BrokerError> {
        if self.fail_next == Some(point) {
            self.fail_next = None;
            return Err(BrokerError::new(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }

    fn ensure_live(&self, handle: &MediaHandle) -> Result<(), BrokerError> {
        if self.live.contains(handle) {
            Ok(())
        } else {
            Err(BrokerError::new(format!("unknown media object {}", handle)))
        }
    }
}

/// In-process stand-in for the remote media service. Tracks every object
/// it hands out so callers (and tests) can inspect wiring, candidate
/// delivery and release behaviour without a real media server.
#[derive(Default)]
pub struct LocalBroker {
    state: Mutex<State>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a single-shot failure at the given call site.
    pub async fn fail_next(&self, point: FailPoint) {
        self.state.lock().await.fail_next = Some(point);
    }

    /// Simulates the media service gathering a local candidate on an
    /// endpoint, invoking every registered callback.
    pub async fn trickle(&self, endpoint: &MediaHandle, candidate: IceCandidate) {
        let state = self.state.lock().await;
        if let Some(callbacks) = state.callbacks.get(endpoint) {
            for cb in callbacks {
                cb(candidate.clone());
            }
        }
    }

    pub async fn is_live(&self, handle: &MediaHandle) -> bool {
        self.state.lock().await.live.contains(handle)
    }

    pub async fn release_count(&self, handle: &MediaHandle) -> u32 {
        self.state
            .lock()
            .await
            .release_counts
            .get(handle.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub async fn delivered(&self, endpoint: &MediaHandle) -> Vec<IceCandidate> {
        self.state
            .lock()
            .await
            .delivered
            .get(endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn links(&self) -> Vec<(MediaHandle, MediaHandle)> {
        self.state.lock().await.links.clone()
    }

    pub async fn broadcast_source_of(&self, hub: &MediaHandle) -> Option<MediaHandle> {
        self.state.lock().await.broadcast_sources.get(hub).cloned()
    }

    pub async fn created_count(&self) -> u64 {
        self.state.lock().await.next_id
    }

    pub async fn live_count(&self) -> usize {
        self.state.lock().await.live.len()
    }
}

#[async_trait]
impl MediaBroker for LocalBroker {
    async fn create_pipeline(&self) -> Result<MediaHandle, BrokerError> {
        let mut state = self.state.lock().await;
        state.trip(FailPoint::CreatePipeline)?;
        Ok(state.alloc("pipeline"))
    }

    async fn create_endpoint(&self, pipeline: &MediaHandle) -> Result<MediaHandle, BrokerError> {
        let mut state = self.state.lock().await;
        state.trip(FailPoint::CreateEndpoint)?;
        state.ensure_live(pipeline)?;
        let handle = state.alloc("endpoint");
        state.parents.insert(handle.clone(), pipeline.clone());
        Ok(handle)
    }

    async fn create_mix_hub(&self, pipeline: &MediaHandle) -> Result<MediaHandle, BrokerError> {
        let mut state = self.state.lock().await;
        state.trip(FailPoint::CreateMixHub)?;
        state.ensure_live(pipeline)?;
        let handle = state.alloc("mixhub");
        state.parents.insert(handle.clone(), pipeline.clone());
        Ok(handle)
    }

    async fn create_broadcast_hub(
        &self,
        pipeline: &MediaHandle,
    ) -> Result<MediaHandle, BrokerError> {
        let mut state = self.state.lock().await;
        state.trip(FailPoint::CreateBroadcastHub)?;
        state.ensure_live(pipeline)?;
        let handle = state.alloc("casthub");
        state.parents.insert(handle.clone(), pipeline.clone());
        Ok(handle)
    }

    async fn create_hub_port(&self, hub: &MediaHandle) -> Result<MediaHandle, BrokerError> {
        let mut state = self.state.lock().await;
        state.trip(FailPoint::CreateHubPort)?;
        state.ensure_live(hub)?;
        let handle = state.alloc("port");
        state.parents.insert(handle.clone(), hub.clone());
        Ok(handle)
    }

    async fn connect(&self, src: &MediaHandle, dst: &MediaHandle) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.trip(FailPoint::Connect)?;
        state.ensure_live(src)?;
        state.ensure_live(dst)?;
        state.links.push((src.clone(), dst.clone()));
        Ok(())
    }

    async fn set_broadcast_source(
        &self,
        hub: &MediaHandle,
        port: &MediaHandle,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.trip(FailPoint::SetBroadcastSource)?;
        state.ensure_live(hub)?;
        state.ensure_live(port)?;
        state.broadcast_sources.insert(hub.clone(), port.clone());
        Ok(())
    }

    async fn process_offer(
        &self,
        endpoint: &MediaHandle,
        sdp_offer: &str,
    ) -> Result<String, BrokerError> {
        let mut state = self.state.lock().await;
        state.trip(FailPoint::ProcessOffer)?;
        state.ensure_live(endpoint)?;
        Ok(format!("answer::{}", sdp_offer))
    }

    async fn gather_candidates(&self, endpoint: &MediaHandle) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.trip(FailPoint::GatherCandidates)?;
        state.ensure_live(endpoint)?;
        state.gathering.insert(endpoint.clone());
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        endpoint: &MediaHandle,
        candidate: IceCandidate,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.trip(FailPoint::AddRemoteCandidate)?;
        state.ensure_live(endpoint)?;
        state
            .delivered
            .entry(endpoint.clone())
            .or_default()
            .push(candidate);
        Ok(())
    }

    async fn on_local_candidate(
        &self,
        endpoint: &MediaHandle,
        callback: CandidateCallback,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_live(endpoint)?;
        state
            .callbacks
            .entry(endpoint.clone())
            .or_default()
            .push(callback);
        Ok(())
    }

    async fn release(&self, handle: &MediaHandle) {
        let mut state = self.state.lock().await;
        *state
            .release_counts
            .entry(handle.as_str().to_string())
            .or_insert(0) += 1;
        if !state.live.remove(handle) {
            tracing::debug!(handle = %handle, "release of unknown media object ignored");
            return;
        }
        // Children of a released container go down with it, as the media
        // service destroys the whole object tree.
        let children: Vec<MediaHandle> = state
            .parents
            .iter()
            .filter(|&(_, parent)| parent == handle)
            .map(|(child, _)| child.clone())
            .collect();
        for child in children {
            state.live.remove(&child);
            state.parents.remove(&child);
        }
        state.parents.remove(handle);
        state.callbacks.remove(handle);
        state.gathering.remove(handle);
        state.broadcast_sources.remove(handle);
    }
}
