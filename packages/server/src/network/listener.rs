//! TCP listener with deferred startup lifecycle (spec §4.D "Accepting
//! connections", §5 "Concurrency & Resource Model").
//!
//! Grounded on the teacher's `network/module.rs` `NetworkModule`: `new()`
//! allocates shared state, `start()` binds the listener, `serve()` accepts
//! until shutdown — generalized from axum/WebSocket routing to a raw RESP
//! accept loop, and with the HTTP router's single bound address replaced by
//! one optional outbound replica link alongside it.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::EngineHandle;

use super::connection::{handle_client, ConnectionRegistry};
use super::replica;
use super::shutdown::ShutdownController;

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages the TCP listener lifecycle: bind, then accept until shutdown.
pub struct Listener {
    config: Arc<Config>,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
}

impl Listener {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            listener: None,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the listener to the configured host/port. Returns the actual
    /// bound port (differs from the configured one if `port 0` was used).
    ///
    /// # Errors
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        info!(%addr, bound_port = port, "TCP listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Accepts connections until the shutdown signal fires, then drains
    /// in-flight connections for up to 30 seconds before returning.
    ///
    /// Consumes `self` because the listener is moved into the accept loop.
    ///
    /// # Panics
    /// Panics if `start()` was not called first.
    pub async fn serve(self, engine: EngineHandle) -> anyhow::Result<()> {
        let listener = self.listener.expect("start() must be called before serve()");
        let registry = self.registry;
        let shutdown = self.shutdown;
        let config = self.config;

        if let Some((host, port)) = config.slaveof.clone() {
            let engine = engine.clone();
            let config = Arc::clone(&config);
            let shutdown_rx = shutdown.shutdown_receiver();
            tokio::spawn(replica::run(engine, config, host, port, shutdown_rx));
        }

        shutdown.set_ready();

        let mut shutdown_rx = shutdown.shutdown_receiver();
        let mut sweep = tokio::time::interval(IDLE_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    registry.sweep_idle(config.timeout);
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let engine = engine.clone();
                            let config = Arc::clone(&config);
                            let registry = Arc::clone(&registry);
                            let shutdown = Arc::clone(&shutdown);
                            tokio::spawn(handle_client(stream, addr.to_string(), engine, config, registry, shutdown));
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }

        info!("draining in-flight connections");
        for kill in registry.kill_senders() {
            let _ = kill.try_send(());
        }
        if !shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
            warn!("drain timed out with connections still open");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_binds_ephemeral_port() {
        let mut config = Config::default();
        config.bind = "127.0.0.1".to_string();
        config.port = 0;
        let mut listener = Listener::new(Arc::new(config));
        let port = listener.start().await.unwrap();
        assert_ne!(port, 0);
    }
}
