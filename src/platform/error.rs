use crate::protocol::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("manifest missing: {0}")]
    ManifestMissing(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("platform error: {message}")]
    Platform { message: String, transient: bool },
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ManifestMissing(_) => ErrorKind::ManifestMissing,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Platform { .. } => ErrorKind::PlatformError,
        }
    }

    /// Whether one more attempt is worth it. RBAC refusals and bad
    /// manifests never heal by retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Platform { transient: true, .. })
    }
}

impl From<kube::Error> for DriverError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 403 => Self::PermissionDenied(ae.message.clone()),
            kube::Error::Api(ae) => Self::Platform {
                message: format!("kubernetes api: {}", ae.message),
                transient: ae.code >= 500,
            },
            _ => Self::Platform {
                message: err.to_string(),
                transient: true,
            },
        }
    }
}

impl From<bollard::errors::Error> for DriverError {
    fn from(err: bollard::errors::Error) -> Self {
        match &err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                403 => Self::PermissionDenied(message.clone()),
                code => Self::Platform {
                    message: format!("docker api: {message}"),
                    transient: *code >= 500,
                },
            },
            _ => Self::Platform {
                message: err.to_string(),
                transient: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_wire_strings() {
        assert_eq!(
            DriverError::ManifestMissing("x".into()).kind(),
            ErrorKind::ManifestMissing
        );
        assert_eq!(
            DriverError::NotSupported("hibernate").kind(),
            ErrorKind::NotSupported
        );
    }

    #[test]
    fn rbac_refusal_is_not_transient() {
        assert!(!DriverError::PermissionDenied("forbidden".into()).is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        let err = DriverError::Platform {
            message: "boom".into(),
            transient: true,
        };
        assert!(err.is_transient());
    }
}
