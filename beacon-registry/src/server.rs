//! Registry host: serves the HTTP surface and runs the stale sweeper

use anyhow::{Context, Result};
use axum::Router;
use beacon_core::{RegistryConfig, ServerConfig};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::http::{create_router, AppState};
use crate::store::RegistryStore;
use crate::sweeper::StaleSweeper;

pub struct RegistryServer {
    store: RegistryStore,
    server_config: ServerConfig,
    registry_config: RegistryConfig,
    cancel_token: CancellationToken,
}

impl RegistryServer {
    #[must_use]
    pub fn new(server_config: ServerConfig, registry_config: RegistryConfig) -> Self {
        Self::with_store(RegistryStore::new(), server_config, registry_config)
    }

    /// Serve an existing store (shared with in-process callers or tests)
    #[must_use]
    pub fn with_store(
        store: RegistryStore,
        server_config: ServerConfig,
        registry_config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            server_config,
            registry_config,
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Token that stops the server and its sweeper when cancelled
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutting down registry server");
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn router(&self) -> Router {
        create_router(AppState::new(
            self.store.clone(),
            self.registry_config.clone(),
        ))
    }

    /// Bind the configured address and serve until shut down
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.server_config.host, self.server_config.http_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind registry server to {addr}"))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shut down
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local_addr: SocketAddr = listener.local_addr()?;
        let router = self.router();

        let sweeper = self.registry_config.sweep_interval().map(|period| {
            StaleSweeper::new(
                self.store.clone(),
                self.registry_config.stale_after_secs,
                period,
            )
            .with_cancel_token(self.cancel_token.child_token())
            .start()
        });

        info!(address = %local_addr, "Registry server listening");

        let cancel = self.cancel_token.clone();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("Registry HTTP server failed");

        self.cancel_token.cancel();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }

        info!("Registry server stopped");
        result
    }
}
