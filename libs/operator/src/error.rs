use thiserror::Error;

/// Broad bucket used to decide requeue behavior and where a failure is surfaced.
///
/// Transient errors are requeued silently, Terminal-spec errors
/// are written to the object's `Ready` condition and not retried until the object
/// changes, Terminal-external errors are surfaced on aggregate status without
/// blocking upstream reconciliation, and Invariant-violation errors are logged,
/// counted and retried rather than panicking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    TerminalSpec,
    TerminalExternal,
    InvariantViolation,
}

/// All errors possible to occur during reconciliation across every controller
/// in this operator.
#[derive(Debug, Error)]
pub enum Error {
    /// Any error originating from the `kube-rs` crate.
    #[error("kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// A finalizer-event wrapper failure (`kube::runtime::finalizer::Error`).
    #[error("finalizer error: {0}")]
    FinalizerError(#[from] Box<kube::runtime::finalizer::Error<Error>>),

    /// The object is missing a field the reconciler requires to proceed, or
    /// carries a value that can never be valid (bad selector, malformed helm
    /// version, non-namespaced object). Terminal-spec.
    #[error("invalid spec: {0}")]
    UserInputError(String),

    /// A `GitRepoRestriction` rejected a field on a `GitRepo` or `Bundle`.
    /// Terminal-spec.
    #[error("restriction violation: {0}")]
    RestrictionViolation(String),

    /// A sub-step failed and the cause is wrapped with the sub-step's name so
    /// the surfaced condition message identifies where the failure occurred.
    #[error("failed to {step}: {source}")]
    SubStep {
        step: String,
        #[source]
        source: Box<Error>,
    },

    /// Canonicalization or hashing of a resource set failed.
    #[error("failed to canonicalize resources: {0}")]
    DigestError(String),

    /// A `ContentResource` declared `encoding: base64` but its `content`
    /// field was not valid base64. Terminal-spec.
    #[error("failed to decode resource content: {0}")]
    ResourceDecodeError(String),

    /// An OCI reference could not be resolved to a content id. Retryable when
    /// the credential secret read failed, terminal when the secret was read
    /// but its content is malformed.
    #[error("OCI reference resolution failed: {0}")]
    OciResolutionError(String),

    /// A Content object referenced by a BundleDeployment's `deploymentID` does
    /// not exist. This should never happen; it is an invariant violation.
    #[error("content {0} referenced but missing")]
    MissingContent(String),

    /// `Bundle.dependsOn` forms a cycle; gating can never be satisfied.
    #[error("dependency cycle detected among bundles: {0:?}")]
    DependencyCycle(Vec<String>),

    /// Serialization/deserialization of an embedded resource list failed.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Loading process-wide configuration from the environment or a ConfigMap
    /// failed.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The current span has no valid OpenTelemetry trace id to attach as a
    /// histogram exemplar; the observation is still recorded, just without one.
    #[error("no valid trace id in current span")]
    InvalidTraceId,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wraps `self` as the cause of a failure in a named sub-step, for example
    /// `"failed to load values secret for bundle: <cause>"`.
    pub fn in_step(self, step: impl Into<String>) -> Error {
        Error::SubStep {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Classifies the error for the purposes of requeue-vs-condition-only
    /// handling.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::KubeError(source) => match source {
                kube::Error::Api(resp) if resp.code == 409 || resp.code == 429 => {
                    ErrorCategory::Transient
                }
                kube::Error::Api(resp) if resp.code >= 500 => ErrorCategory::Transient,
                _ => ErrorCategory::TerminalExternal,
            },
            Error::FinalizerError(_) => ErrorCategory::Transient,
            Error::UserInputError(_) | Error::RestrictionViolation(_) => {
                ErrorCategory::TerminalSpec
            }
            Error::SubStep { source, .. } => source.category(),
            Error::DigestError(_) | Error::SerdeError(_) => ErrorCategory::TerminalSpec,
            Error::ResourceDecodeError(_) => ErrorCategory::TerminalSpec,
            Error::OciResolutionError(_) => ErrorCategory::TerminalSpec,
            Error::MissingContent(_) | Error::DependencyCycle(_) => {
                ErrorCategory::InvariantViolation
            }
            Error::ConfigError(_) => ErrorCategory::Transient,
            Error::InvalidTraceId => ErrorCategory::Transient,
        }
    }

    /// Returns true when the object was simply deleted mid-reconcile; callers
    /// should treat this as a successful no-op rather than an error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// Short, low-cardinality label used to bucket Prometheus failure counters.
    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube_error".to_owned(),
            Error::FinalizerError(_) => "finalizer_error".to_owned(),
            Error::UserInputError(_) => "user_input_error".to_owned(),
            Error::RestrictionViolation(_) => "restriction_violation".to_owned(),
            Error::SubStep { source, .. } => source.metric_label(),
            Error::DigestError(_) => "digest_error".to_owned(),
            Error::ResourceDecodeError(_) => "resource_decode_error".to_owned(),
            Error::OciResolutionError(_) => "oci_resolution_error".to_owned(),
            Error::MissingContent(_) => "missing_content".to_owned(),
            Error::DependencyCycle(_) => "dependency_cycle".to_owned(),
            Error::SerdeError(_) => "serde_error".to_owned(),
            Error::ConfigError(_) => "config_error".to_owned(),
            Error::InvalidTraceId => "invalid_trace_id".to_owned(),
        }
    }
}

/// Helper for `IgnoreNotFound` semantics: collapses a 404 `kube::Error` into
/// `Ok(None)` and passes everything else through as an error.
pub fn ignore_not_found<T>(result: kube::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
        Err(e) => Err(Error::KubeError(e)),
    }
}
