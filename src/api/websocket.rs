use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc::{self, UnboundedSender};
use warp::ws::{Message, WebSocket};

use crate::round_table::signaling::{ClientMessage, ServerMessage};
use crate::round_table::RoundTable;

pub async fn handle_connection(websocket: WebSocket, engine: Arc<RoundTable>) {
    let conn_id = generate_connection_id();
    tracing::info!(connection = %conn_id, "new signaling connection");

    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Spawn task to push server messages out to the client.
    let sender_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize outbound message");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::text(text)).await {
                tracing::error!(error = %e, "failed to send WebSocket message");
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(message) => handle_message(&engine, &conn_id, &tx, message).await,
            Err(e) => {
                tracing::error!(connection = %conn_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // A dropped socket counts as a leave; a knight that already left makes
    // this a no-op.
    engine.leave(&conn_id).await;
    sender_task.abort();
    tracing::info!(connection = %conn_id, "signaling connection closed");
}

async fn handle_message(
    engine: &Arc<RoundTable>,
    conn_id: &str,
    tx: &UnboundedSender<ServerMessage>,
    message: Message,
) {
    let Ok(text) = message.to_str() else {
        return;
    };
    tracing::debug!(connection = conn_id, raw_message = %text, "received signaling message");

    match serde_json::from_str::<ClientMessage>(text) {
        Ok(parsed) => dispatch(engine, conn_id, tx, parsed).await,
        Err(e) => {
            tracing::error!(
                connection = conn_id,
                error = %e,
                raw_message = %text,
                "failed to parse signaling message"
            );
            let _ = tx.send(ServerMessage::Error {
                message: format!("Invalid message: {}", e),
            });
        }
    }
}

async fn dispatch(
    engine: &Arc<RoundTable>,
    conn_id: &str,
    tx: &UnboundedSender<ServerMessage>,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Reserve {
            name,
            number_of_seats,
        } => {
            let name = name.unwrap_or_else(|| "Knight".to_string());
            let seats = number_of_seats.unwrap_or(10);
            if let Err(err) = engine.reserve(conn_id, &name, seats, tx.clone()).await {
                let _ = tx.send(ServerMessage::Error {
                    message: format!("Fail to reserve table: {}", err),
                });
            }
        }
        ClientMessage::Join { seat_token, name } => {
            let name = name.unwrap_or_else(|| "Knight".to_string());
            if let Err(err) = engine.join(conn_id, &seat_token, &name, tx.clone()).await {
                let _ = tx.send(ServerMessage::Error {
                    message: format!("Fail to join table: {}", err),
                });
            }
        }
        ClientMessage::Connect {
            relation_key,
            sdp_offer,
        } => match engine.connect(conn_id, relation_key.clone(), &sdp_offer).await {
            Ok(answer) => {
                let _ = tx.send(ServerMessage::accepted(relation_key, answer));
            }
            Err(err) => {
                let _ = tx.send(ServerMessage::rejected(relation_key, err.to_string()));
            }
        },
        ClientMessage::Leave => engine.leave(conn_id).await,
        ClientMessage::ChangeSource { source } => {
            if let Err(err) = engine.change_source(conn_id, &source).await {
                let _ = tx.send(ServerMessage::Error {
                    message: format!("Fail to change source: {}", err),
                });
            }
        }
        ClientMessage::GenerateSeats { number_of_seats } => {
            engine
                .generate_seats(conn_id, number_of_seats.unwrap_or(1))
                .await;
        }
        ClientMessage::Kickout { seat_token } => engine.kickout(conn_id, &seat_token).await,
        ClientMessage::OnIceCandidate {
            relation_key,
            candidate,
        } => {
            engine
                .on_ice_candidate(conn_id, relation_key, candidate)
                .await;
        }
    }
}

fn generate_connection_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("conn-{}", suffix)
}
