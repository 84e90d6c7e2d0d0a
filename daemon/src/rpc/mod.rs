pub mod http;

use crate::core::store::Store;
use actix_web::{dev::ServerHandle, web::Data, App, HttpServer};
use anyhow::Context;
use keymirror_common::crypto::Address;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type SharedApiServer = Arc<ApiServer>;

// State shared with every HTTP handler
pub struct ApiState {
    pub store: Store,
    pub modules: Vec<Address>,
}

// Read-only HTTP API over the mirrored registry state.
// Readers only ever observe committed update transactions.
pub struct ApiServer {
    handle: Mutex<Option<ServerHandle>>,
}

impl ApiServer {
    pub async fn start(
        bind_address: &str,
        store: Store,
        modules: Vec<Address>,
    ) -> Result<SharedApiServer, anyhow::Error> {
        let prometheus = PrometheusBuilder::new()
            .install_recorder()
            .context("Failed to install Prometheus recorder")?;

        let state = Data::new(ApiState { store, modules });
        let prometheus = Data::new(prometheus);

        let http_server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .app_data(prometheus.clone())
                .service(http::index)
                .service(http::metrics)
                .service(http::status)
                .service(http::list_keys)
                .service(http::find_keys)
                .service(http::get_key)
                .service(http::list_operators)
        })
        .disable_signals()
        .bind(bind_address)
        .with_context(|| format!("Failed to bind HTTP API on {}", bind_address))?
        .run();

        info!("HTTP API listening on {}", bind_address);

        let handle = http_server.handle();
        tokio::spawn(async move {
            if let Err(e) = http_server.await {
                error!("HTTP API server error: {}", e);
            }
        });

        Ok(Arc::new(Self {
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub async fn stop(&self, graceful: bool) {
        info!("Stopping HTTP API...");
        if let Some(handle) = self.handle.lock().await.take() {
            handle.stop(graceful).await;
        }
    }
}
