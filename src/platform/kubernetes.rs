use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};

use async_trait::async_trait;
use uuid::Uuid;

use crate::protocol::Platform;

use super::error::DriverError;
use super::{
    BackendState, PlatformDriver, ProvisionOutcome, ProvisionRequest, validate_template,
    workload_name,
};

const COMPONENT_LABEL: &str = "streamspace.io/component";
const SESSION_LABEL: &str = "streamspace.io/session";
const HOME_VOLUME: &str = "home";
const HOME_PVC_SIZE: &str = "5Gi";
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Kubernetes execution backend: one Deployment + Service per session,
/// plus a PVC when the session asked for a persistent home.
pub struct KubernetesDriver {
    client: kube::Client,
    namespace: String,
}

impl KubernetesDriver {
    pub fn new(client: kube::Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn session_url(&self, name: &str, port: u16) -> String {
        format!("http://{name}.{}.svc.cluster.local:{port}", self.namespace)
    }

    /// Block until the session Deployment reports an available replica or
    /// the deadline passes.
    async fn wait_ready(&self, name: &str, deadline: Duration) -> Result<(), DriverError> {
        let deployments = self.deployments();
        let start = std::time::Instant::now();

        loop {
            if start.elapsed() > deadline {
                return Err(DriverError::Timeout(format!(
                    "deployment {name} not ready within {}s",
                    deadline.as_secs()
                )));
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;

            let deploy = match deployments.get(name).await {
                Ok(d) => d,
                Err(kube::Error::Api(err)) if err.code == 404 => continue,
                Err(e) => return Err(e.into()),
            };

            let available = deploy
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0);
            if available >= 1 {
                return Ok(());
            }
        }
    }

    async fn scale(&self, name: &str, replicas: i32) -> Result<(), DriverError> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.deployments()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref ae) if ae.code == 404 => DriverError::Platform {
                    message: format!("deployment {name} not found"),
                    transient: false,
                },
                other => other.into(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl PlatformDriver for KubernetesDriver {
    #[tracing::instrument(skip(self, req), fields(session_id = %req.session_id), err)]
    async fn provision(&self, req: &ProvisionRequest) -> Result<ProvisionOutcome, DriverError> {
        validate_template(&req.template)?;

        let name = workload_name(req.session_id);

        if req.persistent_home {
            let pvc = build_home_pvc(&name, req.session_id, &self.namespace);
            create_ignoring_conflict(&self.pvcs(), &pvc).await?;
        }

        let deployment = build_session_deployment(&name, req, &self.namespace);
        create_ignoring_conflict(&self.deployments(), &deployment).await?;

        let service = build_session_service(&name, req, &self.namespace);
        create_ignoring_conflict(&self.services(), &service).await?;

        self.wait_ready(&name, req.deadline).await?;

        let port = req.template.spec.ports.first().copied().unwrap_or(8080);
        Ok(ProvisionOutcome {
            pod_ref: name.clone(),
            url: self.session_url(&name, port),
        })
    }

    /// Delete-by-name for everything provision may have created. Absent
    /// objects count as success so redelivered stops converge.
    #[tracing::instrument(skip(self), fields(%session_id), err)]
    async fn teardown(&self, session_id: Uuid) -> Result<(), DriverError> {
        let name = workload_name(session_id);
        delete_ignoring_missing(&self.deployments(), &name).await?;
        delete_ignoring_missing(&self.services(), &name).await?;
        delete_ignoring_missing(&self.pvcs(), &format!("{name}-{HOME_VOLUME}")).await?;
        Ok(())
    }

    async fn hibernate(&self, session_id: Uuid) -> Result<(), DriverError> {
        self.scale(&workload_name(session_id), 0).await
    }

    async fn wake(&self, session_id: Uuid) -> Result<(), DriverError> {
        self.scale(&workload_name(session_id), 1).await
    }

    async fn query_state(&self, session_id: Uuid) -> Result<BackendState, DriverError> {
        let name = workload_name(session_id);
        match self.deployments().get(&name).await {
            Ok(deploy) => {
                let desired = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
                if desired == 0 {
                    Ok(BackendState::Hibernated)
                } else {
                    Ok(BackendState::Running)
                }
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(BackendState::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn healthcheck(&self) -> Result<(), DriverError> {
        self.deployments()
            .list(&ListParams::default().limit(1))
            .await?;
        Ok(())
    }

    fn platform(&self) -> Platform {
        Platform::Kubernetes
    }
}

async fn create_ignoring_conflict<K>(api: &Api<K>, obj: &K) -> Result<(), DriverError>
where
    K: Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        // Redelivery of the same command finds its own earlier work.
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<(), DriverError>
where
    K: Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Object synthesis
// ---------------------------------------------------------------------------

fn session_labels(name: &str, session_id: Uuid) -> BTreeMap<String, String> {
    BTreeMap::from([
        (COMPONENT_LABEL.into(), "session".into()),
        (SESSION_LABEL.into(), session_id.to_string()),
        ("app".into(), name.to_owned()),
    ])
}

pub(crate) fn build_session_deployment(
    name: &str,
    req: &ProvisionRequest,
    namespace: &str,
) -> Deployment {
    let labels = session_labels(name, req.session_id);
    let spec = &req.template.spec;

    let ports = spec
        .ports
        .iter()
        .map(|p| ContainerPort {
            container_port: i32::from(*p),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let mut volume_mounts: Vec<VolumeMount> = spec
        .volume_mounts
        .iter()
        .map(|m| VolumeMount {
            name: m.name.clone(),
            mount_path: m.mount_path.clone(),
            ..Default::default()
        })
        .collect();
    if !volume_mounts.iter().any(|m| m.name == HOME_VOLUME) {
        volume_mounts.push(VolumeMount {
            name: HOME_VOLUME.into(),
            mount_path: "/home/user".into(),
            ..Default::default()
        });
    }

    let mut volumes: Vec<Volume> = spec
        .volume_mounts
        .iter()
        .filter(|m| m.name != HOME_VOLUME)
        .map(|m| Volume {
            name: m.name.clone(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        })
        .collect();
    volumes.push(home_volume(name, req.persistent_home));

    let container = Container {
        name: "session".into(),
        image: Some(spec.base_image.clone()),
        ports: Some(ports),
        volume_mounts: Some(volume_mounts),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".into(), Quantity(req.resources.cpu.clone())),
                ("memory".into(), Quantity(req.resources.memory.clone())),
            ])),
            limits: Some(BTreeMap::from([
                ("cpu".into(), Quantity(req.resources.cpu.clone())),
                ("memory".into(), Quantity(req.resources.memory.clone())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn home_volume(name: &str, persistent: bool) -> Volume {
    if persistent {
        Volume {
            name: HOME_VOLUME.into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: format!("{name}-{HOME_VOLUME}"),
                ..Default::default()
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: HOME_VOLUME.into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    }
}

pub(crate) fn build_session_service(
    name: &str,
    req: &ProvisionRequest,
    namespace: &str,
) -> Service {
    let labels = session_labels(name, req.session_id);

    // 1:1 with the template's port list.
    let ports = req
        .template
        .spec
        .ports
        .iter()
        .map(|p| ServicePort {
            name: Some(format!("port-{p}")),
            port: i32::from(*p),
            target_port: Some(IntOrString::Int(i32::from(*p))),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn build_home_pvc(
    name: &str,
    session_id: Uuid,
    namespace: &str,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(format!("{name}-{HOME_VOLUME}")),
            namespace: Some(namespace.to_owned()),
            labels: Some(session_labels(name, session_id)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".into(),
                    Quantity(HOME_PVC_SIZE.into()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ResourceSpec, Template, TemplateSpec, VolumeMountSpec};

    fn request(persistent_home: bool) -> ProvisionRequest {
        ProvisionRequest {
            session_id: Uuid::parse_str("12345678-1234-1234-1234-123456789abc").unwrap(),
            template: Template {
                name: Some("firefox-browser".into()),
                version: Some("1.2.0".into()),
                spec: TemplateSpec {
                    base_image: "ghcr.io/streamspace/firefox:128".into(),
                    ports: vec![5900, 8080],
                    default_resources: None,
                    capabilities: vec![],
                    volume_mounts: vec![VolumeMountSpec {
                        name: "shm".into(),
                        mount_path: "/dev/shm".into(),
                    }],
                },
            },
            resources: ResourceSpec {
                memory: "1Gi".into(),
                cpu: "500m".into(),
            },
            persistent_home,
            deadline: Duration::from_secs(120),
        }
    }

    #[test]
    fn deployment_name_and_labels_derive_from_session() {
        let req = request(false);
        let deploy = build_session_deployment("ssp-12345678", &req, "streamspace");
        assert_eq!(deploy.metadata.name.as_deref(), Some("ssp-12345678"));
        let labels = deploy.metadata.labels.unwrap();
        assert_eq!(labels[SESSION_LABEL], req.session_id.to_string());
        assert_eq!(labels[COMPONENT_LABEL], "session");
    }

    #[test]
    fn container_ports_match_template() {
        let req = request(false);
        let deploy = build_session_deployment("ssp-12345678", &req, "ns");
        let containers = deploy.spec.unwrap().template.spec.unwrap().containers;
        let ports = containers[0].ports.as_ref().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].container_port, 5900);
        assert_eq!(ports[1].container_port, 8080);
    }

    #[test]
    fn ephemeral_home_uses_empty_dir() {
        let req = request(false);
        let deploy = build_session_deployment("ssp-12345678", &req, "ns");
        let volumes = deploy.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        let home = volumes.iter().find(|v| v.name == HOME_VOLUME).unwrap();
        assert!(home.empty_dir.is_some());
        assert!(home.persistent_volume_claim.is_none());
    }

    #[test]
    fn persistent_home_uses_pvc() {
        let req = request(true);
        let deploy = build_session_deployment("ssp-12345678", &req, "ns");
        let volumes = deploy.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        let home = volumes.iter().find(|v| v.name == HOME_VOLUME).unwrap();
        let claim = home.persistent_volume_claim.as_ref().unwrap();
        assert_eq!(claim.claim_name, "ssp-12345678-home");
    }

    #[test]
    fn service_ports_are_one_to_one() {
        let req = request(false);
        let svc = build_session_service("ssp-12345678", &req, "ns");
        let ports = svc.spec.unwrap().ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 5900);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(5900)));
    }

    #[test]
    fn service_selector_matches_pod_labels() {
        let req = request(false);
        let deploy = build_session_deployment("ssp-12345678", &req, "ns");
        let svc = build_session_service("ssp-12345678", &req, "ns");
        let pod_labels = deploy
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .labels
            .unwrap();
        assert_eq!(svc.spec.unwrap().selector.unwrap(), pod_labels);
    }

    #[test]
    fn pvc_requests_home_storage() {
        let req = request(true);
        let pvc = build_home_pvc("ssp-12345678", req.session_id, "ns");
        assert_eq!(pvc.metadata.name.as_deref(), Some("ssp-12345678-home"));
        let requests = pvc.spec.unwrap().resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"], Quantity(HOME_PVC_SIZE.into()));
    }

    #[test]
    fn resource_limits_from_request() {
        let req = request(false);
        let deploy = build_session_deployment("ssp-12345678", &req, "ns");
        let containers = deploy.spec.unwrap().template.spec.unwrap().containers;
        let limits = containers[0].resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["memory"], Quantity("1Gi".into()));
        assert_eq!(limits["cpu"], Quantity("500m".into()));
    }
}
