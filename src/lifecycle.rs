//! Start, stop and monitor the long-lived components of an application as a single unit.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use carrot_hutch::lifecycle::ServiceGroup;
//! use carrot_hutch::transport::memory::MemoryBroker;
//! use carrot_hutch::{ConnectionHolder, PoolSizes};
//!
//! async fn run() -> Result<(), anyhow::Error> {
//!     let holder = Arc::new(ConnectionHolder::new(MemoryBroker::new(), PoolSizes::default()));
//!     ServiceGroup::new()
//!         .service(holder)
//!         .run_until_sigterm()
//!         .await
//! }
//! ```
use std::sync::Arc;

use anyhow::Context;
use shutdown_handler::ShutdownHandler;

/// A component with a start/stop lifecycle and a health status.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Used to identify the service in logs and errors.
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), anyhow::Error>;

    async fn stop(&self) -> Result<(), anyhow::Error>;

    async fn health_check(&self) -> bool;
}

#[async_trait::async_trait]
impl<S: Service + ?Sized> Service for Arc<S> {
    fn name(&self) -> &str {
        S::name(self)
    }

    async fn start(&self) -> Result<(), anyhow::Error> {
        S::start(self).await
    }

    async fn stop(&self) -> Result<(), anyhow::Error> {
        S::stop(self).await
    }

    async fn health_check(&self) -> bool {
        S::health_check(self).await
    }
}

/// A set of services started in registration order and stopped in reverse order.
///
/// Register the [`ConnectionHolder`](crate::ConnectionHolder) before the listeners and
/// publishers relying on it: it is then the last one to be stopped.
#[derive(Default)]
pub struct ServiceGroup {
    services: Vec<Arc<dyn Service>>,
}

impl ServiceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn service<S: Service + 'static>(mut self, service: Arc<S>) -> Self {
        self.services.push(service);
        self
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Start every service.
    ///
    /// If one fails the services started before it are stopped again and the error is returned.
    #[tracing::instrument(name = "service_group_start", skip_all, fields(services = self.services.len()))]
    pub async fn start(&self) -> Result<(), anyhow::Error> {
        for (started, service) in self.services.iter().enumerate() {
            if let Err(e) = service.start().await {
                tracing::error!(error = ?e, service = service.name(), "Failed to start service");
                for service in self.services[..started].iter().rev() {
                    if let Err(e) = service.stop().await {
                        tracing::warn!(error = ?e, service = service.name(), "Failed to stop service");
                    }
                }
                return Err(e.context(format!("Failed to start `{}`", service.name())));
            }
            tracing::debug!(service = service.name(), "Service started");
        }
        Ok(())
    }

    /// Stop every service, in reverse registration order.
    ///
    /// A failure does not prevent the remaining services from being stopped: the first error is
    /// returned once they all have been.
    #[tracing::instrument(name = "service_group_stop", skip_all, fields(services = self.services.len()))]
    pub async fn stop(&self) -> Result<(), anyhow::Error> {
        let mut first_error = None;
        for service in self.services.iter().rev() {
            match service.stop().await {
                Ok(()) => tracing::debug!(service = service.name(), "Service stopped"),
                Err(e) => {
                    tracing::warn!(error = ?e, service = service.name(), "Failed to stop service");
                    if first_error.is_none() {
                        first_error =
                            Some(e.context(format!("Failed to stop `{}`", service.name())));
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Healthy if every service is.
    pub async fn health_check(&self) -> bool {
        for service in &self.services {
            if !service.health_check().await {
                tracing::warn!(service = service.name(), "Service is unhealthy");
                return false;
            }
        }
        true
    }

    /// Start the services and stop them once SIGTERM is received.
    pub async fn run_until_sigterm(&self) -> Result<(), anyhow::Error> {
        let shutdown = ShutdownHandler::sigterm().context("Failed to listen for SIGTERM")?;
        self.run_until_shutdown(shutdown).await
    }

    /// Start the services and stop them once `shutdown` is signalled.
    #[tracing::instrument(name = "service_group_run", skip_all)]
    pub async fn run_until_shutdown(&self, shutdown: Arc<ShutdownHandler>) -> Result<(), anyhow::Error> {
        self.start().await?;
        tracing::info!("Services started, waiting for a shutdown signal");
        shutdown.wait_for_signal().await;
        tracing::info!("Shutdown signal received, stopping services");
        self.stop().await
    }
}
