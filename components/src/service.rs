//! Long-running, network-attached containers reachable through the reverse
//! proxy, e.g. interactive workstations.
//!
//! A [`Service`] leaves its container running when dropped. Whoever reaps
//! idle services calls [`Service::stop_and_cleanup`].

use crate::connection::Connection;
use crate::error::InfrastructureError;
use crate::host::{ContainerSpec, LogOptions, NetworkPolicy};
use crate::store::BlobStore;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

/// Lines of service logs returned by [`Service::logs`].
const SERVICE_LOG_LINES: usize = 1000;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Hostname {hostname} cannot contain a '.'")]
    InvalidHostname { hostname: String },

    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
}

pub struct Service {
    connection: Connection,
}

impl Service {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn container_name(&self) -> String {
        self.connection.container_name("service")
    }

    #[instrument(skip(self, blobs, environment), fields(job = %self.connection.label()))]
    pub async fn start(
        &self,
        blobs: &dyn BlobStore,
        http_port: u16,
        websocket_port: u16,
        hostname: &str,
        environment: BTreeMap<String, String>,
    ) -> Result<(), ServiceError> {
        if hostname.contains('.') {
            return Err(ServiceError::InvalidHostname {
                hostname: hostname.to_string(),
            });
        }
        self.connection.pull_executable_image(blobs).await?;

        let settings = &self.connection.settings().service;
        let mut labels = self.connection.labels().clone();
        labels.extend(proxy_labels(
            hostname,
            http_port,
            websocket_port,
            &settings.http_entrypoint,
            &settings.websocket_entrypoint,
        ));
        let run_config = self
            .connection
            .run_config()
            .clone()
            .with_network(NetworkPolicy::Attached(settings.network.clone()));

        let mut spec = ContainerSpec::new(
            self.container_name(),
            self.connection.image().digest(),
            labels,
            run_config,
        );
        spec.environment = environment;
        spec.auto_remove = true;
        spec.extra_hosts = self.extra_hosts().await?;

        self.connection
            .host()
            .run_container(&spec)
            .await
            .map_err(InfrastructureError::host("start service"))?;
        info!(container = %spec.name, hostname, "Started service");
        Ok(())
    }

    /// In debug mode the API runs on the developer's machine, reachable
    /// through the gateway of the service network.
    async fn extra_hosts(&self) -> Result<Vec<String>, InfrastructureError> {
        let settings = self.connection.settings();
        if !settings.debug {
            return Ok(Vec::new());
        }
        let gateway = self
            .connection
            .host()
            .network_gateway(&settings.service.network)
            .await
            .map_err(InfrastructureError::host("inspect service network"))?;
        Ok(gateway
            .map(|gateway| vec![format!("{}:{}", settings.service.api_hostname, gateway)])
            .unwrap_or_default())
    }

    /// The container's logs, or the error text if they cannot be read.
    pub async fn logs(&self) -> String {
        match self
            .connection
            .host()
            .container_logs(&self.container_name(), LogOptions::combined(SERVICE_LOG_LINES))
            .await
        {
            Ok(logs) => logs,
            Err(error) => error.to_string(),
        }
    }

    pub async fn stop_and_cleanup(&self, timeout: Duration) -> Result<(), InfrastructureError> {
        self.connection.stop_and_cleanup(timeout).await
    }
}

/// Reverse-proxy routing labels for a service reachable at `hostname`.
pub fn proxy_labels(
    hostname: &str,
    http_port: u16,
    websocket_port: u16,
    http_entrypoint: &str,
    websocket_entrypoint: &str,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([("traefik.enable".to_string(), "true".to_string())]);
    for (kind, port, entrypoint) in [
        ("http", http_port, http_entrypoint),
        ("websocket", websocket_port, websocket_entrypoint),
    ] {
        let router = format!("traefik.http.routers.{}-{}", hostname, kind);
        labels.insert(format!("{}.rule", router), format!("Host(`{}`)", hostname));
        labels.insert(format!("{}.service", router), format!("{}-{}", hostname, kind));
        labels.insert(format!("{}.entrypoints", router), entrypoint.to_string());
        labels.insert(
            format!(
                "traefik.http.services.{}-{}.loadbalancer.server.port",
                hostname, kind
            ),
            port.to_string(),
        );
    }
    labels
}
