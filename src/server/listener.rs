use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::backend::handler::Handlers;
use crate::config::Config;
use crate::http::connection::Connection;
use crate::routing::RouteTable;
use crate::server::{Registry, ServerContext};

pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let routes = Arc::new(RouteTable::from_config(&cfg)?);
    let registry = Registry::new();
    let handlers = Handlers::start(&cfg, registry.clone());

    let ctx = Arc::new(ServerContext {
        routes,
        registry,
        handlers,
        limits: cfg.limits.clone(),
        upload_store: cfg.upload.temp_store.clone(),
    });

    let listener = TcpListener::bind(&cfg.server.listen_addr).await?;
    info!("Listening on {}", cfg.server.listen_addr);

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!(peer = %peer, "Accepted connection");

                let ctx = ctx.clone();
                tokio::spawn(async move {
                    Connection::new(socket, peer.ip().to_string(), ctx).run().await;
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
