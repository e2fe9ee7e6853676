use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use uuid::Uuid;

use crate::protocol::Platform;

use super::error::DriverError;
use super::{
    BackendState, PlatformDriver, ProvisionOutcome, ProvisionRequest, validate_template,
    workload_name,
};

/// Docker execution backend: one container per session with 1:1 host port
/// mappings.
pub struct DockerDriver {
    docker: Docker,
    /// Address sessions are reachable on (the Docker host).
    host_address: String,
}

impl DockerDriver {
    pub fn connect(host_address: impl Into<String>) -> Result<Self, DriverError> {
        let docker = Docker::connect_with_socket_defaults()?;
        Ok(Self {
            docker,
            host_address: host_address.into(),
        })
    }

    pub fn new(docker: Docker, host_address: impl Into<String>) -> Self {
        Self {
            docker,
            host_address: host_address.into(),
        }
    }
}

#[async_trait]
impl PlatformDriver for DockerDriver {
    #[tracing::instrument(skip(self, req), fields(session_id = %req.session_id), err)]
    async fn provision(&self, req: &ProvisionRequest) -> Result<ProvisionOutcome, DriverError> {
        validate_template(&req.template)?;

        let name = workload_name(req.session_id);
        let body = build_container_body(req);

        let options = CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        };
        match self.docker.create_container(Some(options), body).await {
            Ok(_) => {}
            // Redelivered command: the container from the first attempt
            // is already there.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        let started = tokio::time::timeout(
            req.deadline,
            self.docker
                .start_container(&name, None::<StartContainerOptions>),
        )
        .await
        .map_err(|_| DriverError::Timeout(format!("container {name} did not start")))?;
        match started {
            Ok(())
            // 304: already running, which is what a redelivery wants.
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        let port = req.template.spec.ports.first().copied().unwrap_or(8080);
        Ok(ProvisionOutcome {
            pod_ref: name.clone(),
            url: format!("http://{}:{port}", self.host_address),
        })
    }

    /// Stop and remove by name; a container that is already gone counts
    /// as success.
    #[tracing::instrument(skip(self), fields(%session_id), err)]
    async fn teardown(&self, session_id: Uuid) -> Result<(), DriverError> {
        let name = workload_name(session_id);

        match self
            .docker
            .stop_container(&name, None::<StopContainerOptions>)
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        match self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn hibernate(&self, session_id: Uuid) -> Result<(), DriverError> {
        let name = workload_name(session_id);
        match self
            .docker
            .stop_container(&name, None::<StopContainerOptions>)
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wake(&self, session_id: Uuid) -> Result<(), DriverError> {
        let name = workload_name(session_id);
        match self
            .docker
            .start_container(&name, None::<StartContainerOptions>)
            .await
        {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn query_state(&self, session_id: Uuid) -> Result<BackendState, DriverError> {
        let name = workload_name(session_id);
        match self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let running = info
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                if running {
                    Ok(BackendState::Running)
                } else {
                    Ok(BackendState::Hibernated)
                }
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(BackendState::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn healthcheck(&self) -> Result<(), DriverError> {
        self.docker.ping().await?;
        Ok(())
    }

    fn platform(&self) -> Platform {
        Platform::Docker
    }
}

// ---------------------------------------------------------------------------
// Container synthesis
// ---------------------------------------------------------------------------

pub(crate) fn build_container_body(req: &ProvisionRequest) -> ContainerCreateBody {
    let spec = &req.template.spec;

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &spec.ports {
        let key = format!("{port}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.to_string()),
            }]),
        );
    }

    let labels = HashMap::from([
        ("streamspace.io/component".to_owned(), "session".to_owned()),
        (
            "streamspace.io/session".to_owned(),
            req.session_id.to_string(),
        ),
    ]);

    ContainerCreateBody {
        image: Some(spec.base_image.clone()),
        exposed_ports: Some(exposed_ports),
        labels: Some(labels),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            memory: parse_memory(&req.resources.memory),
            nano_cpus: parse_cpu(&req.resources.cpu),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Parse a Kubernetes-style memory quantity ("1Gi", "512Mi") into bytes.
/// Unparseable input yields None: Docker then applies no limit rather
/// than a wrong one.
pub(crate) fn parse_memory(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    let suffixes: [(&str, i64); 4] = [
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
        ("", 1),
    ];
    for (suffix, factor) in suffixes {
        if let Some(num) = quantity.strip_suffix(suffix) {
            if suffix.is_empty() && num.chars().any(|c| !c.is_ascii_digit()) {
                continue;
            }
            if let Ok(value) = num.parse::<i64>() {
                return Some(value * factor);
            }
        }
    }
    None
}

/// Parse a Kubernetes-style cpu quantity ("500m", "2") into Docker
/// nano-cpus.
pub(crate) fn parse_cpu(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    if let Some(milli) = quantity.strip_suffix('m') {
        return milli.parse::<i64>().ok().map(|m| m * 1_000_000);
    }
    quantity.parse::<i64>().ok().map(|c| c * 1_000_000_000)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::{ResourceSpec, Template, TemplateSpec};

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            session_id: Uuid::parse_str("12345678-1234-1234-1234-123456789abc").unwrap(),
            template: Template {
                name: Some("firefox-browser".into()),
                version: None,
                spec: TemplateSpec {
                    base_image: "streamspace/firefox:128".into(),
                    ports: vec![5900],
                    default_resources: None,
                    capabilities: vec![],
                    volume_mounts: vec![],
                },
            },
            resources: ResourceSpec {
                memory: "1Gi".into(),
                cpu: "500m".into(),
            },
            persistent_home: false,
            deadline: Duration::from_secs(60),
        }
    }

    #[test]
    fn ports_map_one_to_one() {
        let body = build_container_body(&request());
        let bindings = body.host_config.unwrap().port_bindings.unwrap();
        let binding = bindings["5900/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("5900"));
    }

    #[test]
    fn session_label_present() {
        let body = build_container_body(&request());
        let labels = body.labels.unwrap();
        assert_eq!(
            labels["streamspace.io/session"],
            "12345678-1234-1234-1234-123456789abc"
        );
    }

    #[test]
    fn memory_quantities() {
        assert_eq!(parse_memory("1Gi"), Some(1 << 30));
        assert_eq!(parse_memory("512Mi"), Some(512 << 20));
        assert_eq!(parse_memory("1024"), Some(1024));
        assert_eq!(parse_memory("1.5Gi"), None);
        assert_eq!(parse_memory("weird"), None);
    }

    #[test]
    fn cpu_quantities() {
        assert_eq!(parse_cpu("500m"), Some(500_000_000));
        assert_eq!(parse_cpu("2"), Some(2_000_000_000));
        assert_eq!(parse_cpu("lots"), None);
    }

    #[test]
    fn resource_limits_applied() {
        let body = build_container_body(&request());
        let host = body.host_config.unwrap();
        assert_eq!(host.memory, Some(1 << 30));
        assert_eq!(host.nano_cpus, Some(500_000_000));
    }
}
