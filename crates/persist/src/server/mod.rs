mod routes;

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{backends::Registry, config::Config, Result};

pub struct Server {
    registry: Arc<Registry>,
    object_storage: String,
}

impl Server {
    pub fn new(config: &Config, registry: Arc<Registry>) -> Self {
        Self {
            registry,
            object_storage: config.backends.object_storage.clone(),
        }
    }

    pub fn build_router(self) -> Router {
        let state = Arc::new(self);

        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub async fn start(self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        axum::serve(listener, self.build_router()).await?;
        Ok(())
    }
}
