use std::time::Duration;

/// Phase of a deploy during which an error occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Validation,
    Apply,
    Readiness,
    Rollback,
}

/// Identifies the resource a per-resource error is about.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ResourceRef {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub resource_id: String,
}

/// All errors possible to occur while resolving, deploying, or tearing down a resource graph.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate.
    #[error("Kubernetes reported error: {source}")]
    KubeError {
        #[from]
        source: kube::Error,
    },

    /// Spec failed schema validation before any API call was made.
    #[error("spec failed validation: {message}")]
    ValidationError { message: String },

    /// A schema reference pointed outside the spec under strict resolution.
    #[error("reference {path} could not be resolved against the spec")]
    ResolveError { path: String },

    /// The Kubernetes API returned a fatal (non-404/409) status while applying a resource.
    #[error("apply failed for {resource:?}: {cause}")]
    ApplyError {
        resource: ResourceRef,
        cause: String,
    },

    /// The readiness poller exhausted its timeout before the resource reported ready.
    #[error("{resource:?} did not become ready within {elapsed:?}")]
    ReadinessTimeout {
        resource: ResourceRef,
        elapsed: Duration,
    },

    /// A Kro instance reported `state=FAILED` or `InstanceSynced=False`.
    #[error("kro reconcile failed for {resource:?}: {message}")]
    KroReconcileFailure {
        resource: ResourceRef,
        message: String,
    },

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency involving {nodes:?}")]
    CyclicDependency { nodes: Vec<String> },

    /// The reference resolver was given a cyclic input value.
    #[error("cyclic input value at {path}")]
    CyclicInput { path: String },

    /// A non-404 failure occurred while deleting a resource during rollback.
    #[error("delete failed for {resource:?}: {cause}")]
    DeleteError {
        resource: ResourceRef,
        cause: String,
    },

    /// User input or graph definition error not covered by a more specific variant.
    #[error("invalid input: {0}")]
    UserInputError(String),

    /// The current span has no valid trace id to attach to a metric exemplar.
    #[error("no valid trace id in current span")]
    InvalidTraceId,
}

impl Error {
    /// Phase in which this error occurred, for the §7 user-visible message shape.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::ValidationError { .. } => Some(Phase::Validation),
            Error::ApplyError { .. } => Some(Phase::Apply),
            Error::ReadinessTimeout { .. } | Error::KroReconcileFailure { .. } => {
                Some(Phase::Readiness)
            }
            Error::DeleteError { .. } => Some(Phase::Rollback),
            _ => None,
        }
    }

    /// Short, stable label for metric cardinality (mirrors the teacher's `metric_label`).
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError { .. } => "kube_error".to_owned(),
            Error::ValidationError { .. } => "validation_error".to_owned(),
            Error::ResolveError { .. } => "resolve_error".to_owned(),
            Error::ApplyError { .. } => "apply_error".to_owned(),
            Error::ReadinessTimeout { .. } => "readiness_timeout".to_owned(),
            Error::KroReconcileFailure { .. } => "kro_reconcile_failure".to_owned(),
            Error::CyclicDependency { .. } => "cyclic_dependency".to_owned(),
            Error::CyclicInput { .. } => "cyclic_input".to_owned(),
            Error::DeleteError { .. } => "delete_error".to_owned(),
            Error::UserInputError(_) => "user_input_error".to_owned(),
            Error::InvalidTraceId => "invalid_trace_id".to_owned(),
        }
    }

    /// True for errors the poller should retry rather than fail fast on (§6 error mapping).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::KubeError { source } => is_transient_kube_error(source),
            _ => false,
        }
    }
}

/// 404 (not yet visible) and 5xx/network errors are transient; other 4xx are fatal.
pub fn is_transient_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => resp.code == 404 || resp.code >= 500,
        // Anything below the HTTP-status level (transport, service, auth refresh) is
        // treated as transient: it says nothing about whether the resource itself is bad.
        _ => true,
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
