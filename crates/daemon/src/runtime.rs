//! Capability interface over the container runtime, plus the Docker
//! implementation used in production.
//!
//! The trait is the substitution seam: the allocator and reconciler only
//! ever see `Arc<dyn ContainerRuntime>`, so tests drive them with fakes.

use crate::error::BrokerError;
use async_trait::async_trait;
use bollard::container::{Config, ListContainersOptions, StartContainerOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a detached container running `command`, publishing
    /// `exposed_port` on a dynamically chosen host port. The container's
    /// own process must self-terminate after `lifespan_seconds`; the
    /// broker holds no kill timer.
    async fn create_detached(
        &self,
        image: &str,
        command: &str,
        lifespan_seconds: u64,
        exposed_port: u16,
    ) -> Result<String, BrokerError>;

    /// Host port currently mapped to `exposed_port` inside the container.
    async fn resolve_published_port(
        &self,
        container_id: &str,
        exposed_port: u16,
    ) -> Result<u16, BrokerError>;

    /// IDs of all containers the runtime considers live right now. Fetched
    /// fresh on every call; never cached.
    async fn list_running_ids(&self) -> Result<HashSet<String>, BrokerError>;
}

/// Docker-backed runtime gateway.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it is reachable.
    pub async fn connect() -> Result<Self, BrokerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BrokerError::RuntimeUnavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| BrokerError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn is_docker_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_detached(
        &self,
        image: &str,
        command: &str,
        lifespan_seconds: u64,
        exposed_port: u16,
    ) -> Result<String, BrokerError> {
        let port_key = format!("{}/tcp", exposed_port);

        // Empty host_port asks Docker for a dynamic mapping, the same as
        // `docker run --publish <port>`.
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(String::new()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let config = Config {
            image: Some(image.to_string()),
            // The `sleep` bound is the only hard TTL in the system.
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("{} && sleep {}", command, lifespan_seconds),
            ]),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container::<String, String>(None, config)
            .await
            .map_err(|e| BrokerError::Provision(e.to_string()))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| BrokerError::Provision(e.to_string()))?;

        debug!(container_id = %created.id, image, "started challenge box");
        Ok(created.id)
    }

    async fn resolve_published_port(
        &self,
        container_id: &str,
        exposed_port: u16,
    ) -> Result<u16, BrokerError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| {
                if is_docker_not_found(&e) {
                    BrokerError::NotFound(container_id.to_string())
                } else {
                    BrokerError::PortResolution {
                        container_id: container_id.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let port_key = format!("{}/tcp", exposed_port);
        inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(&port_key).cloned())
            .flatten()
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| BrokerError::PortResolution {
                container_id: container_id.to_string(),
                reason: format!("no host binding for {}", port_key),
            })
    }

    async fn list_running_ids(&self) -> Result<HashSet<String>, BrokerError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(|e| BrokerError::RuntimeUnavailable(e.to_string()))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}
