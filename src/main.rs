mod api;
mod broker;
mod config;
mod error;
mod round_table;

use std::sync::Arc;

use warp::Filter;

use broker::{LocalBroker, MediaBroker};
use config::Config;
use round_table::RoundTable;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("round_table_server=info")),
        )
        .init();

    let broker: Arc<dyn MediaBroker> = Arc::new(LocalBroker::new());
    let engine = Arc::new(RoundTable::new(broker));

    let routes = api::routes::signaling_route(engine).or(api::routes::health_check());

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "starting Round Table server"
    );
    warp::serve(routes).run(config.bind_address()).await;
}
