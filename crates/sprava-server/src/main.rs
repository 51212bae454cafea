mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use sprava_gateway::{Gateway, connection};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sprava_server=debug,sprava_gateway=debug,sprava_api=debug,sprava_db=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(sprava_db::Database::open(&config.db_path)?);

    // Shared state
    let gateway = Gateway::new(db, config.presence_mode);

    let ws_route = Router::new()
        .route("/ws/{token}", get(ws_upgrade))
        .with_state(gateway.clone());

    let app = Router::new()
        .merge(sprava_api::routes(gateway))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!(
        "Sprava server listening on {} (presence mode: {})",
        addr, config.presence_mode
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(gateway): State<Gateway>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, gateway, token))
}
