//! HTTP metrics exposition endpoint.

use std::io;
use std::net::SocketAddr;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::registry::MetricStore;

const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Serves the registry on `GET <path>` until the listener fails. Rendering
/// snapshots the live handles, so scrapes never wait on a poll cycle.
pub async fn serve(store: MetricStore, listen: SocketAddr, path: String) -> io::Result<()> {
    let app = Router::new().route(&path, get(render_metrics)).with_state(store);
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, %path, "serving metrics endpoint");
    axum::serve(listener, app).await
}

async fn render_metrics(State(store): State<MetricStore>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], store.render())
}
