use serde::{Deserialize, Serialize};

use crate::broker::IceCandidate;
use crate::round_table::knight::{KnightSnapshot, RelationKey};
use crate::round_table::table::TableSnapshot;

/// Messages a client sends over the socket. The `id` field selects the
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Reserve {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        number_of_seats: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    Join {
        seat_token: String,
        #[serde(default)]
        name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Connect {
        relation_key: RelationKey,
        sdp_offer: String,
    },
    Leave,
    #[serde(rename_all = "camelCase")]
    ChangeSource { source: String },
    #[serde(rename_all = "camelCase")]
    GenerateSeats {
        #[serde(default)]
        number_of_seats: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    Kickout { seat_token: String },
    #[serde(rename_all = "camelCase")]
    OnIceCandidate {
        relation_key: RelationKey,
        candidate: IceCandidate,
    },
}

/// Messages the server pushes to clients, tagged the same way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    StartCommunication {
        room: TableSnapshot,
        #[serde(rename = "self")]
        me: KnightSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    ConnectResponse {
        response: String,
        relation_key: RelationKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        relation_key: RelationKey,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    KnightJoined { participant: KnightSnapshot },
    #[serde(rename_all = "camelCase")]
    KnightLeft {
        participant: KnightSnapshot,
        is_removed: bool,
    },
    #[serde(rename_all = "camelCase")]
    KnightConnected { participant: KnightSnapshot },
    #[serde(rename_all = "camelCase")]
    ChangeSource { source: String },
    #[serde(rename_all = "camelCase")]
    SeatsUpdated {
        seats: Vec<String>,
        number_of_seats: u32,
    },
    StopCommunication,
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

impl ServerMessage {
    pub fn accepted(relation_key: RelationKey, sdp_answer: String) -> Self {
        ServerMessage::ConnectResponse {
            response: "accepted".to_string(),
            relation_key,
            sdp_answer: Some(sdp_answer),
            error: None,
        }
    }

    pub fn rejected(relation_key: RelationKey, error: String) -> Self {
        ServerMessage::ConnectResponse {
            response: "rejected".to_string(),
            relation_key,
            sdp_answer: None,
            error: Some(error),
        }
    }
}
