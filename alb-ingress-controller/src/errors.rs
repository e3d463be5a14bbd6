/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    /// Invalid or missing controller configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The cloud provider API failed. `retryable` tells whether another
    /// attempt is worthwhile (throttling, timeouts) or not (permissions).
    #[error("cloud provider error: {message}")]
    Provider { message: String, retryable: bool },
    /// The initial provider synchronization failed, the controller has no
    /// baseline inventory and must not start reconciling.
    #[error("initial provider synchronization failed: {0}")]
    StartupSync(#[source] Box<ControllerError>),
    /// `stop` was called while a previous shutdown is still underway.
    #[error("shutdown already in progress")]
    ShutdownInProgress,
    /// `start` was called on a controller which has been started before.
    #[error("controller has already been started")]
    AlreadyStarted,
    /// Translating Ingresses into load balancer configuration failed.
    #[error("{0}")]
    Reconcile(String),
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub fn provider(message: impl Into<String>, retryable: bool) -> Self {
        ControllerError::Provider {
            message: message.into(),
            retryable,
        }
    }

    /// Whether a failed work item should be retried.
    pub fn is_temporary(&self) -> bool {
        match self {
            ControllerError::Configuration(_) => false,
            ControllerError::ShutdownInProgress => false,
            ControllerError::AlreadyStarted => false,
            ControllerError::Provider { retryable, .. } => *retryable,
            ControllerError::StartupSync(e) => e.is_temporary(),
            ControllerError::KubeApi(e) => !e.is_not_found(),
            _ => true,
        }
    }
}
