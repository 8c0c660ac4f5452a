use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::broker::{MediaBroker, MediaHandle};
use crate::error::{Result, TableError};
use crate::round_table::knight::KnightSnapshot;
use crate::round_table::seats::{mint_seat, SeatState};

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub name: String,
    pub seat: Option<String>,
}

/// Serializable projection of a table, sent to clients. Seat tokens are
/// confidential to the owner, so they are only present when requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSnapshot {
    pub id: String,
    pub number_of_seats: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seats: Option<Vec<String>>,
    pub knights: Vec<KnightSnapshot>,
    pub broadcast_source: Option<String>,
}

/// One conference room: its seat ledger, the roster of present knights
/// and the broker handles for its shared media objects.
pub struct Table {
    pub id: String,
    owner: Option<String>,
    number_of_seats: u32,
    seats: HashMap<String, SeatState>,
    roster: HashMap<String, RosterEntry>,
    broadcast_source: Option<String>,
    pipeline: Option<MediaHandle>,
    mix_hub: Option<MediaHandle>,
    broadcast_hub: Option<MediaHandle>,
}

impl Table {
    pub fn new(id: impl Into<String>, number_of_seats: u32) -> Self {
        let id = id.into();
        let mut seats = HashMap::new();
        for _ in 0..number_of_seats {
            let token = mint_seat(&id, &seats);
            seats.insert(token, SeatState::Available);
        }
        Self {
            id,
            owner: None,
            number_of_seats,
            seats,
            roster: HashMap::new(),
            broadcast_source: None,
            pipeline: None,
            mix_hub: None,
            broadcast_hub: None,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn broadcast_source(&self) -> Option<&str> {
        self.broadcast_source.as_deref()
    }

    /// Seats the host. The host occupies no seat and starts as the
    /// broadcast source.
    pub fn attach_owner(&mut self, knight_id: impl Into<String>, name: impl Into<String>) {
        let knight_id = knight_id.into();
        self.roster.insert(
            knight_id.clone(),
            RosterEntry {
                name: name.into(),
                seat: None,
            },
        );
        self.broadcast_source = Some(knight_id.clone());
        self.owner = Some(knight_id);
    }

    /// Claims a seat for a joining knight. Only an `Available` seat can
    /// be claimed; occupied and removed seats both reject.
    pub fn attach_knight(
        &mut self,
        knight_id: impl Into<String>,
        name: impl Into<String>,
        seat_token: &str,
    ) -> Result<()> {
        let knight_id = knight_id.into();
        match self.seats.get_mut(seat_token) {
            Some(state @ SeatState::Available) => {
                *state = SeatState::Occupied(knight_id.clone());
            }
            _ => return Err(TableError::InvalidSeat(seat_token.to_string())),
        }
        self.roster.insert(
            knight_id,
            RosterEntry {
                name: name.into(),
                seat: Some(seat_token.to_string()),
            },
        );
        Ok(())
    }

    /// Removes a knight from the roster. Its seat returns to `Available`
    /// on a voluntary leave, or is burned to `Removed` on a kickout.
    /// Returns the seat token that changed state, if any.
    pub fn detach(&mut self, knight_id: &str, force_remove: bool) -> Option<String> {
        let entry = self.roster.remove(knight_id)?;
        let token = entry.seat?;
        if let Some(state) = self.seats.get_mut(&token) {
            *state = if force_remove {
                SeatState::Removed
            } else {
                SeatState::Available
            };
        }
        Some(token)
    }

    pub fn set_broadcast_source(&mut self, knight_id: impl Into<String>) {
        self.broadcast_source = Some(knight_id.into());
    }

    /// Mints `count` additional seats, growing the table.
    pub fn generate_seats(&mut self, count: u32) {
        for _ in 0..count {
            let token = mint_seat(&self.id, &self.seats);
            self.seats.insert(token, SeatState::Available);
        }
        self.number_of_seats += count;
    }

    pub fn available_seats(&self) -> Vec<String> {
        let mut seats: Vec<String> = self
            .seats
            .iter()
            .filter(|(_, state)| **state == SeatState::Available)
            .map(|(token, _)| token.clone())
            .collect();
        seats.sort();
        seats
    }

    pub fn seat_state(&self, token: &str) -> Option<&SeatState> {
        self.seats.get(token)
    }

    pub fn occupant_of_seat(&self, token: &str) -> Option<&str> {
        match self.seats.get(token) {
            Some(SeatState::Occupied(id)) => Some(id),
            _ => None,
        }
    }

    pub fn contains(&self, knight_id: &str) -> bool {
        self.roster.contains_key(knight_id)
    }

    pub fn roster_ids(&self) -> Vec<String> {
        self.roster.keys().cloned().collect()
    }

    pub fn number_of_seats(&self) -> u32 {
        self.number_of_seats
    }

    pub fn set_pipeline(&mut self, handle: MediaHandle) {
        self.pipeline = Some(handle);
    }

    pub fn set_mix_hub(&mut self, handle: MediaHandle) {
        self.mix_hub = Some(handle);
    }

    pub fn set_broadcast_hub(&mut self, handle: MediaHandle) {
        self.broadcast_hub = Some(handle);
    }

    pub fn pipeline(&self) -> Option<&MediaHandle> {
        self.pipeline.as_ref()
    }

    pub fn mix_hub(&self) -> Option<&MediaHandle> {
        self.mix_hub.as_ref()
    }

    pub fn broadcast_hub(&self) -> Option<&MediaHandle> {
        self.broadcast_hub.as_ref()
    }

    /// Releases the table's shared media objects. Each handle is taken
    /// out of its slot before the release call, so concurrent or repeated
    /// teardown never submits a handle twice.
    pub async fn release(&mut self, broker: &dyn MediaBroker) {
        if let Some(hub) = self.broadcast_hub.take() {
            broker.release(&hub).await;
        }
        if let Some(hub) = self.mix_hub.take() {
            broker.release(&hub).await;
        }
        if let Some(pipeline) = self.pipeline.take() {
            broker.release(&pipeline).await;
        }
    }

    pub fn snapshot(&self, include_seats: bool) -> TableSnapshot {
        let mut knights: Vec<KnightSnapshot> = self
            .roster
            .iter()
            .map(|(id, entry)| KnightSnapshot {
                id: id.clone(),
                name: entry.name.clone(),
            })
            .collect();
        knights.sort_by(|a, b| a.id.cmp(&b.id));
        TableSnapshot {
            id: self.id.clone(),
            number_of_seats: self.number_of_seats,
            seats: include_seats.then(|| self.available_seats()),
            knights,
            broadcast_source: self.broadcast_source.clone(),
        }
    }
}
