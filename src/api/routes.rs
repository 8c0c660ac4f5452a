use std::sync::Arc;
use warp::Filter;

use super::websocket;
use crate::round_table::RoundTable;

/// Creates the signaling WebSocket route.
pub fn signaling_route(
    engine: Arc<RoundTable>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("ws")
        .and(warp::ws())
        .and(with_engine(engine))
        .map(|ws: warp::ws::Ws, engine: Arc<RoundTable>| {
            ws.on_upgrade(move |websocket| websocket::handle_connection(websocket, engine))
        })
}

pub fn health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "service": "Round Table Server",
            "version": "1.0.0"
        }))
    })
}

fn with_engine(
    engine: Arc<RoundTable>,
) -> impl Filter<Extract = (Arc<RoundTable>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || engine.clone())
}
