pub mod docker;
pub mod error;
pub mod kubernetes;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::protocol::{Platform, ResourceSpec, Template};

pub use docker::DockerDriver;
pub use error::DriverError;
pub use kubernetes::KubernetesDriver;

/// Everything a driver needs to provision one session. The template
/// travels by value inside the command payload; drivers never fetch it
/// from their own backend.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub session_id: Uuid,
    pub template: Template,
    pub resources: ResourceSpec,
    pub persistent_home: bool,
    pub deadline: Duration,
}

/// Where a provisioned session landed.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    /// Backend-opaque handle (deployment name, container id).
    pub pod_ref: String,
    pub url: String,
}

/// Backend view of a session's workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Running,
    Hibernated,
    NotFound,
}

/// Polymorphic capability set over the execution backends. Every method is
/// idempotent with respect to redelivery: names derive from the session id,
/// and deleting something already absent succeeds.
#[async_trait]
pub trait PlatformDriver: Send + Sync {
    async fn provision(&self, req: &ProvisionRequest) -> Result<ProvisionOutcome, DriverError>;

    async fn teardown(&self, session_id: Uuid) -> Result<(), DriverError>;

    async fn hibernate(&self, session_id: Uuid) -> Result<(), DriverError>;

    async fn wake(&self, session_id: Uuid) -> Result<(), DriverError>;

    async fn query_state(&self, session_id: Uuid) -> Result<BackendState, DriverError>;

    async fn healthcheck(&self) -> Result<(), DriverError>;

    fn platform(&self) -> Platform;
}

/// Workload name for a session, shared by both drivers so teardown can
/// always reconstruct what provision created.
pub fn workload_name(session_id: Uuid) -> String {
    let id = session_id.to_string();
    format!("ssp-{}", &id[..8])
}

/// Validate the template manifest carried in a `start_session` payload.
/// The control plane is the source of truth; a payload without a usable
/// manifest is fatal for that command.
pub fn validate_template(template: &Template) -> Result<(), DriverError> {
    if template.spec.base_image.trim().is_empty() {
        return Err(DriverError::ManifestMissing(
            "template spec has no baseImage".into(),
        ));
    }
    if template.spec.ports.iter().any(|p| *p == 0) {
        return Err(DriverError::ManifestMissing(
            "template spec lists port 0".into(),
        ));
    }
    for mount in &template.spec.volume_mounts {
        if !mount.mount_path.starts_with('/') {
            return Err(DriverError::ManifestMissing(format!(
                "volume mount {} is not an absolute path",
                mount.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TemplateSpec, VolumeMountSpec};

    fn template(base_image: &str) -> Template {
        Template {
            name: None,
            version: None,
            spec: TemplateSpec {
                base_image: base_image.into(),
                ports: vec![5900],
                default_resources: None,
                capabilities: vec![],
                volume_mounts: vec![],
            },
        }
    }

    #[test]
    fn workload_name_is_stable_per_session() {
        let id = Uuid::parse_str("12345678-1234-1234-1234-123456789abc").unwrap();
        assert_eq!(workload_name(id), "ssp-12345678");
        assert_eq!(workload_name(id), workload_name(id));
    }

    #[test]
    fn empty_base_image_is_manifest_missing() {
        let err = validate_template(&template("  ")).unwrap_err();
        assert!(matches!(err, DriverError::ManifestMissing(_)));
    }

    #[test]
    fn port_zero_is_rejected() {
        let mut t = template("img");
        t.spec.ports = vec![0];
        assert!(validate_template(&t).is_err());
    }

    #[test]
    fn relative_mount_path_is_rejected() {
        let mut t = template("img");
        t.spec.volume_mounts = vec![VolumeMountSpec {
            name: "home".into(),
            mount_path: "home/user".into(),
        }];
        assert!(validate_template(&t).is_err());
    }

    #[test]
    fn sane_template_passes() {
        assert!(validate_template(&template("ghcr.io/streamspace/firefox:128")).is_ok());
    }
}
