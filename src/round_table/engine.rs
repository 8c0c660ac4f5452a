use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::broker::{IceCandidate, MediaBroker, MediaHandle};
use crate::error::{Result, TableError};
use crate::round_table::knight::{Knight, RelationKey, Role};
use crate::round_table::registry::SessionRegistry;
use crate::round_table::seats::parse_seat;
use crate::round_table::signaling::ServerMessage;

/// Broker handles created but not yet owned by a table or knight. On
/// failure they are released newest-first; once a handle is stored in its
/// owner, `forget` hands teardown over to that owner's release path.
struct Rollback {
    handles: Vec<MediaHandle>,
}

impl Rollback {
    fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    fn track(&mut self, handle: &MediaHandle) {
        self.handles.push(handle.clone());
    }

    fn forget(&mut self, handle: &MediaHandle) {
        self.handles.retain(|h| h != handle);
    }

    async fn run(self, broker: &dyn MediaBroker) {
        for handle in self.handles.into_iter().rev() {
            broker.release(&handle).await;
        }
    }
}

/// Orchestrates tables, knights and the media broker: every signaling
/// operation lands here. State is re-checked after each broker call, as
/// any peer may have left or dissolved the table while we were waiting.
pub struct RoundTable {
    registry: SessionRegistry,
    broker: Arc<dyn MediaBroker>,
}

impl RoundTable {
    pub fn new(broker: Arc<dyn MediaBroker>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            broker,
        }
    }

    /// Creates a table with its media fabric and seats the caller as its
    /// King. Any failure undoes every step already taken.
    pub async fn reserve(
        &self,
        conn_id: &str,
        name: &str,
        number_of_seats: u32,
        sender: UnboundedSender<ServerMessage>,
    ) -> Result<()> {
        let table_id = self.registry.reserve_table(number_of_seats).await;
        tracing::info!(table = %table_id, connection = conn_id, "reserving table");

        let mut rollback = Rollback::new();
        match self
            .reserve_inner(conn_id, name, &table_id, sender, &mut rollback)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(table = %table_id, error = %err, "reserve failed, rolling back");
                rollback.run(self.broker.as_ref()).await;
                self.unregister_knight(conn_id).await;
                if let Some(mut table) = self.registry.remove_table(&table_id).await {
                    table.release(self.broker.as_ref()).await;
                }
                Err(err)
            }
        }
    }

    async fn reserve_inner(
        &self,
        conn_id: &str,
        name: &str,
        table_id: &str,
        sender: UnboundedSender<ServerMessage>,
        rollback: &mut Rollback,
    ) -> Result<()> {
        let pipeline = self.broker.create_pipeline().await?;
        rollback.track(&pipeline);
        let mix_hub = self.broker.create_mix_hub(&pipeline).await?;
        rollback.track(&mix_hub);
        let cast_hub = self.broker.create_broadcast_hub(&pipeline).await?;
        rollback.track(&cast_hub);

        let display_name = format!("{}#host", name);
        {
            let mut tables = self.registry.tables.write().await;
            let table = tables
                .get_mut(table_id)
                .ok_or_else(|| TableError::TableNotFound(table_id.to_string()))?;
            table.set_pipeline(pipeline.clone());
            table.set_mix_hub(mix_hub.clone());
            table.set_broadcast_hub(cast_hub.clone());
            table.attach_owner(conn_id, &display_name);
        }
        rollback.forget(&pipeline);
        rollback.forget(&mix_hub);
        rollback.forget(&cast_hub);

        self.registry
            .register_knight(Knight::new(
                conn_id,
                display_name,
                table_id,
                Role::King,
                sender,
            ))
            .await?;

        let endpoint = self.broker.create_endpoint(&pipeline).await?;
        rollback.track(&endpoint);
        self.install_candidate_relay(conn_id, RelationKey::SelfFeed, &endpoint)
            .await?;
        self.bind_endpoint_and_flush(conn_id, RelationKey::SelfFeed, endpoint.clone(), rollback)
            .await?;

        let mix_port = self.broker.create_hub_port(&mix_hub).await?;
        rollback.track(&mix_port);
        let cast_port = self.broker.create_hub_port(&cast_hub).await?;
        rollback.track(&cast_port);
        self.broker.connect(&endpoint, &mix_port).await?;
        self.broker.connect(&endpoint, &cast_port).await?;
        self.broker.set_broadcast_source(&cast_hub, &cast_port).await?;
        self.bind_hub_port(conn_id, RelationKey::Composite, mix_port, rollback)
            .await?;
        self.bind_hub_port(conn_id, RelationKey::Dispatcher, cast_port, rollback)
            .await?;

        let room = {
            let tables = self.registry.tables.read().await;
            tables
                .get(table_id)
                .ok_or_else(|| TableError::TableNotFound(table_id.to_string()))?
                .snapshot(true)
        };
        let knights = self.registry.knights.read().await;
        let knight = knights
            .get(conn_id)
            .ok_or_else(|| TableError::protocol("session closed during reserve"))?;
        let me = knight.snapshot();
        knight.send(ServerMessage::StartCommunication { room, me });
        Ok(())
    }

    /// Seats a knight at the table named inside its seat token and builds
    /// its media legs. On failure the seat goes back to available and
    /// every created handle is released.
    pub async fn join(
        &self,
        conn_id: &str,
        seat_token: &str,
        name: &str,
        sender: UnboundedSender<ServerMessage>,
    ) -> Result<()> {
        let (table_id, serial) = parse_seat(seat_token)?;
        let display_name = format!("{}#{}", name, serial);

        let (pipeline, mix_hub, cast_hub) = {
            let mut tables = self.registry.tables.write().await;
            let table = tables
                .get_mut(&table_id)
                .ok_or_else(|| TableError::TableNotFound(table_id.clone()))?;
            let pipeline = table
                .pipeline()
                .cloned()
                .ok_or_else(|| TableError::TableNotFound(table_id.clone()))?;
            let mix_hub = table
                .mix_hub()
                .cloned()
                .ok_or_else(|| TableError::TableNotFound(table_id.clone()))?;
            let cast_hub = table
                .broadcast_hub()
                .cloned()
                .ok_or_else(|| TableError::TableNotFound(table_id.clone()))?;
            table.attach_knight(conn_id, &display_name, seat_token)?;
            (pipeline, mix_hub, cast_hub)
        };
        tracing::info!(table = %table_id, connection = conn_id, "knight joining");

        let knight = Knight::new(
            conn_id,
            display_name,
            &table_id,
            Role::Seated {
                seat_token: seat_token.to_string(),
            },
            sender,
        );
        if let Err(err) = self.registry.register_knight(knight).await {
            self.detach_seat(&table_id, conn_id, false).await;
            return Err(err);
        }

        let mut rollback = Rollback::new();
        let outcome = async {
            self.join_inner(conn_id, &pipeline, &mix_hub, &cast_hub, &mut rollback)
                .await?;
            self.announce_join(conn_id, &table_id).await
        }
        .await;
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(table = %table_id, connection = conn_id, error = %err,
                    "join failed, rolling back");
                rollback.run(self.broker.as_ref()).await;
                self.unregister_knight(conn_id).await;
                self.detach_seat(&table_id, conn_id, false).await;
                Err(err)
            }
        }
    }

    async fn join_inner(
        &self,
        conn_id: &str,
        pipeline: &MediaHandle,
        mix_hub: &MediaHandle,
        cast_hub: &MediaHandle,
        rollback: &mut Rollback,
    ) -> Result<()> {
        let endpoint = self.broker.create_endpoint(pipeline).await?;
        rollback.track(&endpoint);
        self.install_candidate_relay(conn_id, RelationKey::SelfFeed, &endpoint)
            .await?;
        self.bind_endpoint_and_flush(conn_id, RelationKey::SelfFeed, endpoint.clone(), rollback)
            .await?;

        let mix_port = self.broker.create_hub_port(mix_hub).await?;
        rollback.track(&mix_port);
        let cast_port = self.broker.create_hub_port(cast_hub).await?;
        rollback.track(&cast_port);
        self.broker.connect(&endpoint, &mix_port).await?;
        self.broker.connect(&endpoint, &cast_port).await?;
        self.bind_hub_port(conn_id, RelationKey::Composite, mix_port, rollback)
            .await?;
        self.bind_hub_port(conn_id, RelationKey::Dispatcher, cast_port, rollback)
            .await?;
        Ok(())
    }

    async fn announce_join(&self, conn_id: &str, table_id: &str) -> Result<()> {
        let (room, others) = {
            let tables = self.registry.tables.read().await;
            let table = tables
                .get(table_id)
                .ok_or_else(|| TableError::TableNotFound(table_id.to_string()))?;
            let others: Vec<String> = table
                .roster_ids()
                .into_iter()
                .filter(|id| id != conn_id)
                .collect();
            (table.snapshot(false), others)
        };
        let me = {
            let knights = self.registry.knights.read().await;
            knights
                .get(conn_id)
                .ok_or_else(|| TableError::protocol("session closed during join"))?
                .snapshot()
        };
        self.broadcast(&others, ServerMessage::KnightJoined {
            participant: me.clone(),
        })
        .await;
        let knights = self.registry.knights.read().await;
        if let Some(knight) = knights.get(conn_id) {
            knight.send(ServerMessage::StartCommunication { room, me });
        }
        Ok(())
    }

    /// Negotiates one media leg for the caller and returns the SDP
    /// answer. A missing source rejects just that leg; any other failure
    /// closes the whole session, as the client cannot recover the
    /// half-built state.
    pub async fn connect(
        &self,
        conn_id: &str,
        relation: RelationKey,
        sdp_offer: &str,
    ) -> Result<String> {
        match self.connect_inner(conn_id, relation, sdp_offer).await {
            Ok(answer) => Ok(answer),
            Err(err @ TableError::SourceNotFound(_)) => Err(err),
            Err(err) => {
                tracing::warn!(connection = conn_id, error = %err,
                    "connect failed, closing session");
                self.leave(conn_id).await;
                Err(err)
            }
        }
    }

    async fn connect_inner(
        &self,
        conn_id: &str,
        relation: RelationKey,
        sdp_offer: &str,
    ) -> Result<String> {
        match relation {
            RelationKey::SelfFeed => {
                let (endpoint, table_id) = {
                    let knights = self.registry.knights.read().await;
                    let knight = knights.get(conn_id).ok_or_else(|| {
                        TableError::protocol(format!("unknown session {}", conn_id))
                    })?;
                    let endpoint = knight
                        .endpoint(&RelationKey::SelfFeed)
                        .cloned()
                        .ok_or_else(|| TableError::SourceNotFound("self".to_string()))?;
                    (endpoint, knight.table_id.clone())
                };
                let answer = self.negotiate(&endpoint, sdp_offer).await?;
                self.announce_connected(conn_id, &table_id).await;
                Ok(answer)
            }
            other => self.connect_receive_leg(conn_id, other, sdp_offer).await,
        }
    }

    async fn connect_receive_leg(
        &self,
        conn_id: &str,
        relation: RelationKey,
        sdp_offer: &str,
    ) -> Result<String> {
        let pipeline = self.pipeline_of(conn_id).await?;
        let endpoint = self.broker.create_endpoint(&pipeline).await?;
        let mut rollback = Rollback::new();
        rollback.track(&endpoint);

        if let Err(err) = self
            .install_candidate_relay(conn_id, relation.clone(), &endpoint)
            .await
        {
            rollback.run(self.broker.as_ref()).await;
            return Err(err);
        }
        if let Err(err) = self
            .bind_endpoint_and_flush(conn_id, relation.clone(), endpoint.clone(), &mut rollback)
            .await
        {
            rollback.run(self.broker.as_ref()).await;
            return Err(err);
        }

        let Some(source) = self.lookup_source(conn_id, &relation).await else {
            self.release_knight_endpoint(conn_id, &relation).await;
            return Err(TableError::SourceNotFound(relation.to_string()));
        };
        self.broker.connect(&source, &endpoint).await?;
        self.negotiate(&endpoint, sdp_offer).await
    }

    async fn lookup_source(
        &self,
        conn_id: &str,
        relation: &RelationKey,
    ) -> Option<MediaHandle> {
        let knights = self.registry.knights.read().await;
        match relation {
            RelationKey::Composite | RelationKey::Dispatcher => knights
                .get(conn_id)
                .and_then(|k| k.hub_port(relation).cloned()),
            RelationKey::Peer(peer_id) => {
                let me = knights.get(conn_id)?;
                let peer = knights.get(peer_id)?;
                if peer.table_id != me.table_id {
                    return None;
                }
                peer.endpoint(&RelationKey::SelfFeed).cloned()
            }
            RelationKey::SelfFeed => None,
        }
    }

    /// Repoints the broadcast hub to another knight's feed. Only the
    /// King may switch; anyone else's request resolves without effect.
    pub async fn change_source(&self, conn_id: &str, source: &str) -> Result<()> {
        let table_id = {
            let knights = self.registry.knights.read().await;
            match knights.get(conn_id) {
                Some(knight) if knight.is_king() => knight.table_id.clone(),
                _ => {
                    tracing::debug!(connection = conn_id, "changeSource ignored for non-owner");
                    return Ok(());
                }
            }
        };
        let hub = {
            let tables = self.registry.tables.read().await;
            tables.get(&table_id).and_then(|t| t.broadcast_hub().cloned())
        };
        let port = {
            let knights = self.registry.knights.read().await;
            knights
                .get(source)
                .filter(|k| k.table_id == table_id)
                .and_then(|k| k.hub_port(&RelationKey::Dispatcher).cloned())
        };
        let (Some(hub), Some(port)) = (hub, port) else {
            tracing::debug!(table = %table_id, source, "changeSource target unavailable");
            return Ok(());
        };

        self.broker.set_broadcast_source(&hub, &port).await?;
        let roster = {
            let mut tables = self.registry.tables.write().await;
            match tables.get_mut(&table_id) {
                Some(table) => {
                    table.set_broadcast_source(source);
                    table.roster_ids()
                }
                None => return Ok(()),
            }
        };
        tracing::info!(table = %table_id, source, "broadcast source changed");
        self.broadcast(&roster, ServerMessage::ChangeSource {
            source: source.to_string(),
        })
        .await;
        Ok(())
    }

    /// Closes the caller's session. A departing King dissolves the whole
    /// table; anyone else just vacates their seat. Unknown connections
    /// are a no-op, so a disconnect after leave costs nothing.
    pub async fn leave(&self, conn_id: &str) {
        let (is_king, table_id) = {
            let knights = self.registry.knights.read().await;
            match knights.get(conn_id) {
                Some(knight) => (knight.is_king(), knight.table_id.clone()),
                None => return,
            }
        };
        if is_king {
            self.release_table(&table_id).await;
        } else {
            self.depart(conn_id, &table_id, false).await;
        }
    }

    /// Ejects the occupant of a seat and burns the seat for good. Only
    /// the King may do this; anyone else's request resolves silently.
    pub async fn kickout(&self, conn_id: &str, seat_token: &str) {
        let table_id = {
            let knights = self.registry.knights.read().await;
            match knights.get(conn_id) {
                Some(knight) if knight.is_king() => knight.table_id.clone(),
                _ => {
                    tracing::debug!(connection = conn_id, "kickout ignored for non-owner");
                    return;
                }
            }
        };
        let occupant = {
            let tables = self.registry.tables.read().await;
            tables
                .get(&table_id)
                .and_then(|t| t.occupant_of_seat(seat_token).map(String::from))
        };
        let Some(occupant) = occupant else {
            tracing::debug!(table = %table_id, "kickout of unoccupied seat ignored");
            return;
        };
        tracing::info!(table = %table_id, connection = %occupant, "knight removed by owner");
        self.depart(&occupant, &table_id, true).await;
    }

    /// Mints extra seats and reports the fresh token list to the King.
    /// Only the King may grow the table.
    pub async fn generate_seats(&self, conn_id: &str, count: u32) {
        let table_id = {
            let knights = self.registry.knights.read().await;
            match knights.get(conn_id) {
                Some(knight) if knight.is_king() => knight.table_id.clone(),
                _ => {
                    tracing::debug!(connection = conn_id, "generateSeats ignored for non-owner");
                    return;
                }
            }
        };
        let (seats, number_of_seats) = {
            let mut tables = self.registry.tables.write().await;
            match tables.get_mut(&table_id) {
                Some(table) => {
                    table.generate_seats(count);
                    (table.available_seats(), table.number_of_seats())
                }
                None => return,
            }
        };
        let knights = self.registry.knights.read().await;
        if let Some(knight) = knights.get(conn_id) {
            knight.send(ServerMessage::SeatsUpdated {
                seats,
                number_of_seats,
            });
        }
    }

    /// Routes a client candidate to the endpoint it belongs to, or queues
    /// it until that endpoint exists. Queued candidates are delivered
    /// ahead of later arrivals when the endpoint binds.
    pub async fn on_ice_candidate(
        &self,
        conn_id: &str,
        relation: RelationKey,
        candidate: IceCandidate,
    ) {
        let endpoint = {
            let mut knights = self.registry.knights.write().await;
            let Some(knight) = knights.get_mut(conn_id) else {
                tracing::debug!(connection = conn_id, "candidate for unknown session dropped");
                return;
            };
            match knight.endpoint(&relation) {
                Some(handle) => handle.clone(),
                None => {
                    knight.queue_candidate(relation, candidate);
                    return;
                }
            }
        };
        if let Err(err) = self.broker.add_remote_candidate(&endpoint, candidate).await {
            tracing::warn!(error = %err, "failed to deliver remote candidate");
        }
    }

    async fn release_table(&self, table_id: &str) {
        let Some(mut table) = self.registry.remove_table(table_id).await else {
            return;
        };
        tracing::info!(table = %table_id, "dissolving table");
        for member in table.roster_ids() {
            if let Some(mut knight) = self.registry.remove_knight(&member).await {
                knight.send(ServerMessage::StopCommunication);
                for handle in knight.drain_handles() {
                    self.broker.release(&handle).await;
                }
            }
        }
        table.release(self.broker.as_ref()).await;
    }

    async fn depart(&self, conn_id: &str, table_id: &str, force: bool) {
        self.reassign_source_if_departing(table_id, conn_id).await;

        let participant = {
            let knights = self.registry.knights.read().await;
            knights.get(conn_id).map(|k| k.snapshot())
        };

        let remaining: Vec<String> = {
            let mut tables = self.registry.tables.write().await;
            match tables.get_mut(table_id) {
                Some(table) => {
                    table.detach(conn_id, force);
                    table.roster_ids()
                }
                None => Vec::new(),
            }
        };

        // Everyone watching the departing feed loses their receive leg.
        let peer_relation = RelationKey::Peer(conn_id.to_string());
        let stripped: Vec<MediaHandle> = {
            let mut knights = self.registry.knights.write().await;
            remaining
                .iter()
                .filter_map(|id| {
                    knights
                        .get_mut(id)
                        .and_then(|k| k.take_endpoint(&peer_relation))
                })
                .collect()
        };
        for handle in &stripped {
            self.broker.release(handle).await;
        }

        if let Some(participant) = participant {
            self.broadcast(&remaining, ServerMessage::KnightLeft {
                participant,
                is_removed: force,
            })
            .await;
        }

        if let Some(mut knight) = self.registry.remove_knight(conn_id).await {
            knight.send(ServerMessage::StopCommunication);
            for handle in knight.drain_handles() {
                self.broker.release(&handle).await;
            }
        }
    }

    /// If the departing knight is the live broadcast source, the hub
    /// falls back to the owner's feed before anything is torn down, so
    /// viewers never hold a dead stream.
    async fn reassign_source_if_departing(&self, table_id: &str, departing: &str) {
        let (owner, hub) = {
            let tables = self.registry.tables.read().await;
            match tables.get(table_id) {
                Some(table) if table.broadcast_source() == Some(departing) => (
                    table.owner().map(String::from),
                    table.broadcast_hub().cloned(),
                ),
                _ => return,
            }
        };
        let (Some(owner), Some(hub)) = (owner, hub) else {
            return;
        };
        if owner == departing {
            return;
        }
        let port = {
            let knights = self.registry.knights.read().await;
            knights
                .get(&owner)
                .and_then(|k| k.hub_port(&RelationKey::Dispatcher).cloned())
        };
        let Some(port) = port else {
            return;
        };
        if let Err(err) = self.broker.set_broadcast_source(&hub, &port).await {
            tracing::warn!(table = %table_id, error = %err,
                "failed to repoint broadcast source to owner");
        }
        let roster = {
            let mut tables = self.registry.tables.write().await;
            match tables.get_mut(table_id) {
                Some(table) => {
                    table.set_broadcast_source(owner.clone());
                    table.roster_ids()
                }
                None => return,
            }
        };
        self.broadcast(&roster, ServerMessage::ChangeSource { source: owner })
            .await;
    }

    async fn announce_connected(&self, conn_id: &str, table_id: &str) {
        let others: Vec<String> = {
            let tables = self.registry.tables.read().await;
            match tables.get(table_id) {
                Some(table) => table
                    .roster_ids()
                    .into_iter()
                    .filter(|id| id != conn_id)
                    .collect(),
                None => return,
            }
        };
        let me = {
            let knights = self.registry.knights.read().await;
            match knights.get(conn_id) {
                Some(knight) => knight.snapshot(),
                None => return,
            }
        };
        self.broadcast(&others, ServerMessage::KnightConnected { participant: me })
            .await;
    }

    async fn negotiate(&self, endpoint: &MediaHandle, sdp_offer: &str) -> Result<String> {
        let (answer, ()) = futures::future::try_join(
            self.broker.process_offer(endpoint, sdp_offer),
            self.broker.gather_candidates(endpoint),
        )
        .await?;
        Ok(answer)
    }

    async fn install_candidate_relay(
        &self,
        conn_id: &str,
        relation: RelationKey,
        endpoint: &MediaHandle,
    ) -> Result<()> {
        let sender = {
            let knights = self.registry.knights.read().await;
            knights
                .get(conn_id)
                .ok_or_else(|| TableError::protocol(format!("unknown session {}", conn_id)))?
                .outbound()
        };
        self.broker
            .on_local_candidate(
                endpoint,
                Box::new(move |candidate| {
                    let _ = sender.send(ServerMessage::IceCandidate {
                        relation_key: relation.clone(),
                        candidate,
                    });
                }),
            )
            .await?;
        Ok(())
    }

    /// Stores the endpoint on the knight and delivers the candidates
    /// that queued up while it did not exist. The knights lock is held
    /// across the flush so live deliveries cannot overtake the queue.
    async fn bind_endpoint_and_flush(
        &self,
        conn_id: &str,
        relation: RelationKey,
        endpoint: MediaHandle,
        rollback: &mut Rollback,
    ) -> Result<()> {
        let replaced = {
            let mut knights = self.registry.knights.write().await;
            let knight = knights
                .get_mut(conn_id)
                .ok_or_else(|| TableError::protocol(format!("unknown session {}", conn_id)))?;
            let (queued, replaced) = knight.bind_endpoint(relation, endpoint.clone());
            rollback.forget(&endpoint);
            for candidate in queued {
                self.broker.add_remote_candidate(&endpoint, candidate).await?;
            }
            replaced
        };
        if let Some(old) = replaced {
            self.broker.release(&old).await;
        }
        Ok(())
    }

    async fn bind_hub_port(
        &self,
        conn_id: &str,
        relation: RelationKey,
        port: MediaHandle,
        rollback: &mut Rollback,
    ) -> Result<()> {
        let replaced = {
            let mut knights = self.registry.knights.write().await;
            let knight = knights
                .get_mut(conn_id)
                .ok_or_else(|| TableError::protocol(format!("unknown session {}", conn_id)))?;
            let replaced = knight.bind_hub_port(relation, port.clone());
            rollback.forget(&port);
            replaced
        };
        if let Some(old) = replaced {
            self.broker.release(&old).await;
        }
        Ok(())
    }

    async fn release_knight_endpoint(&self, conn_id: &str, relation: &RelationKey) {
        let handle = {
            let mut knights = self.registry.knights.write().await;
            knights
                .get_mut(conn_id)
                .and_then(|k| k.take_endpoint(relation))
        };
        if let Some(handle) = handle {
            self.broker.release(&handle).await;
        }
    }

    async fn pipeline_of(&self, conn_id: &str) -> Result<MediaHandle> {
        let table_id = {
            let knights = self.registry.knights.read().await;
            knights
                .get(conn_id)
                .map(|k| k.table_id.clone())
                .ok_or_else(|| TableError::protocol(format!("unknown session {}", conn_id)))?
        };
        let tables = self.registry.tables.read().await;
        let table = tables
            .get(&table_id)
            .ok_or_else(|| TableError::TableNotFound(table_id.clone()))?;
        table
            .pipeline()
            .cloned()
            .ok_or_else(|| TableError::TableNotFound(table_id))
    }

    async fn broadcast(&self, ids: &[String], message: ServerMessage) {
        let knights = self.registry.knights.read().await;
        for id in ids {
            if let Some(knight) = knights.get(id) {
                knight.send(message.clone());
            }
        }
    }

    async fn unregister_knight(&self, conn_id: &str) {
        if let Some(mut knight) = self.registry.remove_knight(conn_id).await {
            for handle in knight.drain_handles() {
                self.broker.release(&handle).await;
            }
        }
    }

    async fn detach_seat(&self, table_id: &str, knight_id: &str, force: bool) {
        let mut tables = self.registry.tables.write().await;
        if let Some(table) = tables.get_mut(table_id) {
            table.detach(knight_id, force);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::local::FailPoint;
    use crate::broker::LocalBroker;
    use crate::round_table::seats::SeatState;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn fixture() -> (RoundTable, Arc<LocalBroker>) {
        let broker = Arc::new(LocalBroker::new());
        (RoundTable::new(broker.clone()), broker)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn reserve(
        engine: &RoundTable,
        conn: &str,
        seats: u32,
    ) -> (UnboundedReceiver<ServerMessage>, String, Vec<String>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.reserve(conn, "Arthur", seats, tx).await.unwrap();
        match rx.try_recv().expect("startCommunication for the host") {
            ServerMessage::StartCommunication { room, .. } => {
                (rx, room.id, room.seats.expect("host sees seat tokens"))
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    async fn join(
        engine: &RoundTable,
        conn: &str,
        seat: &str,
    ) -> (UnboundedReceiver<ServerMessage>, crate::error::Result<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let result = engine.join(conn, seat, "Percival", tx).await;
        (rx, result)
    }

    async fn seat_state(engine: &RoundTable, table_id: &str, token: &str) -> Option<SeatState> {
        engine
            .registry
            .tables
            .read()
            .await
            .get(table_id)
            .and_then(|t| t.seat_state(token).cloned())
    }

    async fn knight_endpoint(
        engine: &RoundTable,
        conn: &str,
        relation: &RelationKey,
    ) -> Option<MediaHandle> {
        engine
            .registry
            .knights
            .read()
            .await
            .get(conn)
            .and_then(|k| k.endpoint(relation).cloned())
    }

    async fn knight_hub_port(
        engine: &RoundTable,
        conn: &str,
        relation: &RelationKey,
    ) -> Option<MediaHandle> {
        engine
            .registry
            .knights
            .read()
            .await
            .get(conn)
            .and_then(|k| k.hub_port(relation).cloned())
    }

    fn candidate(text: &str) -> IceCandidate {
        IceCandidate {
            candidate: text.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn count_change_source(messages: &[ServerMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, ServerMessage::ChangeSource { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_reserve_creates_room_and_starts_host() {
        let (engine, broker) = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.reserve("conn-king", "Arthur", 3, tx).await.unwrap();

        match rx.try_recv().unwrap() {
            ServerMessage::StartCommunication { room, me } => {
                assert_eq!(room.seats.as_ref().unwrap().len(), 3);
                assert_eq!(room.broadcast_source.as_deref(), Some("conn-king"));
                assert_eq!(me.name, "Arthur#host");
                assert_eq!(room.knights.len(), 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        // Pipeline, two hubs, host endpoint and two hub ports.
        assert_eq!(broker.live_count().await, 6);
    }

    #[tokio::test]
    async fn test_reserve_failure_rolls_back_everything() {
        let (engine, broker) = fixture();
        broker.fail_next(FailPoint::CreateBroadcastHub).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = engine
            .reserve("conn-king", "Arthur", 3, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::Broker(_)));
        assert_eq!(broker.live_count().await, 0);
        assert!(!engine.registry.knight_exists("conn-king").await);
        assert!(engine.registry.tables.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_generate_seats_grows_and_notifies_owner() {
        let (engine, _broker) = fixture();
        let (mut rx, _table_id, seats) = reserve(&engine, "conn-king", 3).await;
        assert_eq!(seats.len(), 3);

        engine.generate_seats("conn-king", 2).await;
        match rx.try_recv().unwrap() {
            ServerMessage::SeatsUpdated {
                seats,
                number_of_seats,
            } => {
                assert_eq!(seats.len(), 5);
                assert_eq!(number_of_seats, 5);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_seats_ignored_for_non_owner() {
        let (engine, _broker) = fixture();
        let (mut king_rx, table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (mut knight_rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        drain(&mut king_rx);
        drain(&mut knight_rx);

        engine.generate_seats("conn-2", 5).await;
        assert!(drain(&mut king_rx).is_empty());
        assert!(drain(&mut knight_rx).is_empty());
        let tables = engine.registry.tables.read().await;
        assert_eq!(tables.get(&table_id).unwrap().number_of_seats(), 2);
    }

    #[tokio::test]
    async fn test_join_unknown_table_rejected_without_side_effects() {
        let (engine, broker) = fixture();
        let token = URL_SAFE_NO_PAD.encode("ghost-table#000001");
        let (_rx, result) = join(&engine, "conn-2", &token).await;
        assert!(matches!(result, Err(TableError::TableNotFound(_))));
        assert!(!engine.registry.knight_exists("conn-2").await);
        assert_eq!(broker.created_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_malformed_token_rejected() {
        let (engine, _broker) = fixture();
        let (_rx, result) = join(&engine, "conn-2", "not a token !!!").await;
        assert!(matches!(result, Err(TableError::InvalidSeat(_))));
    }

    #[tokio::test]
    async fn test_join_occupied_seat_rejected() {
        let (engine, _broker) = fixture();
        let (_king_rx, _table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (_rx1, first) = join(&engine, "conn-2", &seats[0]).await;
        first.unwrap();
        let (_rx2, second) = join(&engine, "conn-3", &seats[0]).await;
        assert!(matches!(second, Err(TableError::InvalidSeat(_))));
    }

    #[tokio::test]
    async fn test_join_with_duplicate_connection_frees_seat() {
        let (engine, _broker) = fixture();
        let (_king_rx, table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (_rx, result) = join(&engine, "conn-king", &seats[0]).await;
        assert!(matches!(result, Err(TableError::DuplicateKnight(_))));
        assert_eq!(
            seat_state(&engine, &table_id, &seats[0]).await,
            Some(SeatState::Available)
        );
    }

    #[tokio::test]
    async fn test_join_announces_roster_and_starts_joiner() {
        let (engine, _broker) = fixture();
        let (mut king_rx, _table_id, seats) = reserve(&engine, "conn-king", 2).await;

        let (mut rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();

        match rx.try_recv().unwrap() {
            ServerMessage::StartCommunication { room, me } => {
                assert_eq!(room.knights.len(), 2);
                assert!(room.seats.is_none());
                assert!(me.name.starts_with("Percival#"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        let king_messages = drain(&mut king_rx);
        assert!(king_messages.iter().any(|m| matches!(
            m,
            ServerMessage::KnightJoined { participant } if participant.id == "conn-2"
        )));
    }

    #[tokio::test]
    async fn test_join_failure_rolls_back_seat_and_session() {
        let (engine, broker) = fixture();
        let (mut king_rx, table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let live_before = broker.live_count().await;

        broker.fail_next(FailPoint::CreateEndpoint).await;
        let (_rx, result) = join(&engine, "conn-2", &seats[0]).await;
        assert!(matches!(result, Err(TableError::Broker(_))));

        assert_eq!(
            seat_state(&engine, &table_id, &seats[0]).await,
            Some(SeatState::Available)
        );
        assert!(!engine.registry.knight_exists("conn-2").await);
        assert_eq!(broker.live_count().await, live_before);
        assert!(drain(&mut king_rx).is_empty());
    }

    #[tokio::test]
    async fn test_connect_self_reuses_endpoint_and_announces() {
        let (engine, broker) = fixture();
        let (mut king_rx, _table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (_rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        drain(&mut king_rx);
        let live_before = broker.live_count().await;

        let answer = engine
            .connect("conn-2", RelationKey::SelfFeed, "v=0 offer")
            .await
            .unwrap();
        assert_eq!(answer, "answer::v=0 offer");
        assert_eq!(broker.live_count().await, live_before);

        let king_messages = drain(&mut king_rx);
        assert!(king_messages.iter().any(|m| matches!(
            m,
            ServerMessage::KnightConnected { participant } if participant.id == "conn-2"
        )));
    }

    #[tokio::test]
    async fn test_connect_composite_builds_receive_leg() {
        let (engine, broker) = fixture();
        let (_king_rx, _table_id, _seats) = reserve(&engine, "conn-king", 2).await;

        let answer = engine
            .connect("conn-king", RelationKey::Composite, "offer")
            .await
            .unwrap();
        assert_eq!(answer, "answer::offer");

        let endpoint = knight_endpoint(&engine, "conn-king", &RelationKey::Composite)
            .await
            .expect("composite receive leg bound");
        let port = knight_hub_port(&engine, "conn-king", &RelationKey::Composite)
            .await
            .unwrap();
        assert!(broker.links().await.contains(&(port, endpoint)));
    }

    #[tokio::test]
    async fn test_connect_peer_wires_source_feed() {
        let (engine, broker) = fixture();
        let (_king_rx, _table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (_rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();

        engine
            .connect("conn-2", RelationKey::Peer("conn-king".to_string()), "offer")
            .await
            .unwrap();

        let source = knight_endpoint(&engine, "conn-king", &RelationKey::SelfFeed)
            .await
            .unwrap();
        let leg = knight_endpoint(
            &engine,
            "conn-2",
            &RelationKey::Peer("conn-king".to_string()),
        )
        .await
        .unwrap();
        assert!(broker.links().await.contains(&(source, leg)));
    }

    #[tokio::test]
    async fn test_connect_missing_peer_releases_endpoint_only() {
        let (engine, broker) = fixture();
        let (_king_rx, _table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (_rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        let live_before = broker.live_count().await;

        let err = engine
            .connect("conn-2", RelationKey::Peer("ghost".to_string()), "offer")
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::SourceNotFound(_)));
        // Session survives; only the speculative receive leg went away.
        assert!(engine.registry.knight_exists("conn-2").await);
        assert_eq!(broker.live_count().await, live_before);
    }

    #[tokio::test]
    async fn test_connect_failure_tears_down_session() {
        let (engine, broker) = fixture();
        let (mut king_rx, table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (mut rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        drain(&mut king_rx);
        drain(&mut rx);

        broker.fail_next(FailPoint::ProcessOffer).await;
        let err = engine
            .connect("conn-2", RelationKey::SelfFeed, "offer")
            .await
            .unwrap_err();
        assert!(matches!(err, TableError::Broker(_)));

        assert!(!engine.registry.knight_exists("conn-2").await);
        assert_eq!(
            seat_state(&engine, &table_id, &seats[0]).await,
            Some(SeatState::Available)
        );
        let king_messages = drain(&mut king_rx);
        assert!(king_messages.iter().any(|m| matches!(
            m,
            ServerMessage::KnightLeft { participant, is_removed: false }
                if participant.id == "conn-2"
        )));
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::StopCommunication)));
    }

    #[tokio::test]
    async fn test_change_source_by_king_switches_hub_and_notifies() {
        let (engine, broker) = fixture();
        let (mut king_rx, table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (mut rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        drain(&mut king_rx);
        drain(&mut rx);

        engine.change_source("conn-king", "conn-2").await.unwrap();

        let hub = engine
            .registry
            .tables
            .read()
            .await
            .get(&table_id)
            .unwrap()
            .broadcast_hub()
            .cloned()
            .unwrap();
        let port = knight_hub_port(&engine, "conn-2", &RelationKey::Dispatcher)
            .await
            .unwrap();
        assert_eq!(broker.broadcast_source_of(&hub).await, Some(port));
        assert_eq!(count_change_source(&drain(&mut king_rx)), 1);
        assert_eq!(count_change_source(&drain(&mut rx)), 1);
    }

    #[tokio::test]
    async fn test_change_source_by_non_owner_is_silent() {
        let (engine, broker) = fixture();
        let (mut king_rx, table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (mut rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        drain(&mut king_rx);
        drain(&mut rx);

        engine.change_source("conn-2", "conn-2").await.unwrap();

        assert!(drain(&mut king_rx).is_empty());
        assert!(drain(&mut rx).is_empty());
        let hub = engine
            .registry
            .tables
            .read()
            .await
            .get(&table_id)
            .unwrap()
            .broadcast_hub()
            .cloned()
            .unwrap();
        let king_port = knight_hub_port(&engine, "conn-king", &RelationKey::Dispatcher)
            .await
            .unwrap();
        assert_eq!(broker.broadcast_source_of(&hub).await, Some(king_port));
    }

    #[tokio::test]
    async fn test_departing_source_repoints_to_owner_once() {
        let (engine, broker) = fixture();
        let (mut king_rx, table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (mut rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        engine.change_source("conn-king", "conn-2").await.unwrap();
        drain(&mut king_rx);
        drain(&mut rx);

        engine.leave("conn-2").await;

        let king_messages = drain(&mut king_rx);
        assert_eq!(count_change_source(&king_messages), 1);
        assert!(king_messages.iter().any(|m| matches!(
            m,
            ServerMessage::ChangeSource { source } if source == "conn-king"
        )));
        let departed = drain(&mut rx);
        assert_eq!(count_change_source(&departed), 1);
        assert!(departed
            .iter()
            .any(|m| matches!(m, ServerMessage::StopCommunication)));

        let hub = engine
            .registry
            .tables
            .read()
            .await
            .get(&table_id)
            .unwrap()
            .broadcast_hub()
            .cloned()
            .unwrap();
        let king_port = knight_hub_port(&engine, "conn-king", &RelationKey::Dispatcher)
            .await
            .unwrap();
        assert_eq!(broker.broadcast_source_of(&hub).await, Some(king_port));
    }

    #[tokio::test]
    async fn test_leave_strips_peer_receive_legs() {
        let (engine, broker) = fixture();
        let (_king_rx, _table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (_rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        engine
            .connect("conn-king", RelationKey::Peer("conn-2".to_string()), "offer")
            .await
            .unwrap();
        let leg = knight_endpoint(
            &engine,
            "conn-king",
            &RelationKey::Peer("conn-2".to_string()),
        )
        .await
        .unwrap();

        engine.leave("conn-2").await;

        assert!(!broker.is_live(&leg).await);
        assert!(knight_endpoint(
            &engine,
            "conn-king",
            &RelationKey::Peer("conn-2".to_string())
        )
        .await
        .is_none());
    }

    #[tokio::test]
    async fn test_kickout_burns_seat_and_notifies() {
        let (engine, _broker) = fixture();
        let (mut king_rx, table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (mut rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        drain(&mut king_rx);
        drain(&mut rx);

        engine.kickout("conn-king", &seats[0]).await;

        assert_eq!(
            seat_state(&engine, &table_id, &seats[0]).await,
            Some(SeatState::Removed)
        );
        assert!(!engine.registry.knight_exists("conn-2").await);
        assert!(drain(&mut king_rx).iter().any(|m| matches!(
            m,
            ServerMessage::KnightLeft { is_removed: true, .. }
        )));
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::StopCommunication)));

        // The burned seat can never be claimed again.
        let (_rx2, rejoin) = join(&engine, "conn-3", &seats[0]).await;
        assert!(matches!(rejoin, Err(TableError::InvalidSeat(_))));
    }

    #[tokio::test]
    async fn test_kickout_of_source_repoints_before_removal() {
        let (engine, broker) = fixture();
        let (mut king_rx, table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (mut rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        engine.change_source("conn-king", "conn-2").await.unwrap();
        drain(&mut king_rx);
        drain(&mut rx);

        engine.kickout("conn-king", &seats[0]).await;

        let king_messages = drain(&mut king_rx);
        assert_eq!(count_change_source(&king_messages), 1);
        assert!(king_messages.iter().any(|m| matches!(
            m,
            ServerMessage::ChangeSource { source } if source == "conn-king"
        )));
        assert_eq!(
            seat_state(&engine, &table_id, &seats[0]).await,
            Some(SeatState::Removed)
        );
        assert!(!engine.registry.knight_exists("conn-2").await);

        let hub = engine
            .registry
            .tables
            .read()
            .await
            .get(&table_id)
            .unwrap()
            .broadcast_hub()
            .cloned()
            .unwrap();
        let king_port = knight_hub_port(&engine, "conn-king", &RelationKey::Dispatcher)
            .await
            .unwrap();
        assert_eq!(broker.broadcast_source_of(&hub).await, Some(king_port));
    }

    #[tokio::test]
    async fn test_kickout_by_non_owner_ignored() {
        let (engine, _broker) = fixture();
        let (_king_rx, _table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (_rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();

        engine.kickout("conn-2", &seats[0]).await;
        assert!(engine.registry.knight_exists("conn-2").await);
    }

    #[tokio::test]
    async fn test_king_leave_dissolves_table() {
        let (engine, broker) = fixture();
        let (_king_rx, table_id, seats) = reserve(&engine, "conn-king", 2).await;
        let (mut rx, result) = join(&engine, "conn-2", &seats[0]).await;
        result.unwrap();
        drain(&mut rx);

        engine.leave("conn-king").await;

        assert!(!engine.registry.table_exists(&table_id).await);
        assert!(!engine.registry.knight_exists("conn-king").await);
        assert!(!engine.registry.knight_exists("conn-2").await);
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::StopCommunication)));
        assert_eq!(broker.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_release_submits_each_handle_once() {
        let (engine, broker) = fixture();
        let (_king_rx, _table_id, _seats) = reserve(&engine, "conn-king", 2).await;

        tokio::join!(engine.leave("conn-king"), engine.leave("conn-king"));

        for id in [
            "pipeline-1",
            "mixhub-2",
            "casthub-3",
            "endpoint-4",
            "port-5",
            "port-6",
        ] {
            assert_eq!(
                broker.release_count(&MediaHandle::new(id)).await,
                1,
                "handle {} released more than once",
                id
            );
        }
        assert_eq!(broker.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_endpoint_binds_fifo() {
        let (engine, broker) = fixture();
        let (_king_rx, _table_id, _seats) = reserve(&engine, "conn-king", 2).await;

        // No composite receive leg yet: both candidates must queue.
        engine
            .on_ice_candidate("conn-king", RelationKey::Composite, candidate("a"))
            .await;
        engine
            .on_ice_candidate("conn-king", RelationKey::Composite, candidate("b"))
            .await;

        engine
            .connect("conn-king", RelationKey::Composite, "offer")
            .await
            .unwrap();
        engine
            .on_ice_candidate("conn-king", RelationKey::Composite, candidate("c"))
            .await;

        let endpoint = knight_endpoint(&engine, "conn-king", &RelationKey::Composite)
            .await
            .unwrap();
        let delivered: Vec<String> = broker
            .delivered(&endpoint)
            .await
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(delivered, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_local_candidates_relay_to_client() {
        let (engine, broker) = fixture();
        let (mut king_rx, _table_id, _seats) = reserve(&engine, "conn-king", 2).await;

        let endpoint = knight_endpoint(&engine, "conn-king", &RelationKey::SelfFeed)
            .await
            .unwrap();
        broker.trickle(&endpoint, candidate("local-path")).await;

        let messages = drain(&mut king_rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::IceCandidate { relation_key, candidate }
                if *relation_key == RelationKey::SelfFeed
                    && candidate.candidate == "local-path"
        )));
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_session_dropped() {
        let (engine, broker) = fixture();
        engine
            .on_ice_candidate("conn-ghost", RelationKey::SelfFeed, candidate("x"))
            .await;
        assert_eq!(broker.created_count().await, 0);
    }
}
