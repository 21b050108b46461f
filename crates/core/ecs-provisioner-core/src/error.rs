//! Error types for the provisioner

use crate::types::InstanceStatus;
use std::time::Duration;
use thiserror::Error;

/// Provisioner result type
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Failure reported by the cloud compute API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message} (request id: {})", .request_id.as_deref().unwrap_or("none"))]
pub struct ApiError {
    /// Upstream error code
    pub code: String,

    /// Upstream error message
    pub message: String,

    /// Upstream request id
    pub request_id: Option<String>,

    /// HTTP status, when known
    pub status: Option<u16>,
}

impl ApiError {
    /// Create an API error
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: None,
            status: None,
        }
    }

    /// Attach the upstream request id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach the HTTP status
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether the referenced resource does not exist
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404) || self.code.ends_with("NotFound")
    }
}

/// Errors surfaced by the provisioning engine
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Resource absent; callers treat this as already converged
    #[error("instance not found: {0}")]
    NotFound(String),

    /// Stock-out; the offering has been negative-cached
    #[error("insufficient capacity: {message} (request id: {})", .request_id.as_deref().unwrap_or("none"))]
    InsufficientCapacity {
        request_id: Option<String>,
        message: String,
    },

    /// Instance is in a phase where the operation is rejected; retry later
    #[error("operation not supported for instance {instance_id} in state {status}")]
    OperationNotSupported {
        instance_id: String,
        status: InstanceStatus,
    },

    /// Launch rate limiter wait was cancelled or timed out
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Provisioning-group response could not be interpreted
    #[error("invalid response when creating provisioning group: {detail} (request id: {})", .request_id.as_deref().unwrap_or("none"))]
    MalformedResponse {
        request_id: Option<String>,
        detail: String,
    },

    /// Launch result carried no instance and no recognised stock-out
    #[error("failed to launch instance: errorCode={code}, errorMessage={message} (request id: {})", .request_id.as_deref().unwrap_or("none"))]
    LaunchFailed {
        request_id: Option<String>,
        code: String,
        message: String,
    },

    /// Candidate shapes were filtered down to nothing
    #[error("no compatible instance shapes: {0}")]
    NoCompatibleShapes(String),

    /// Truncated shapes cannot satisfy a minimum-distinct-values rule
    #[error("minimum values requirement not satisfied: {0}")]
    MinValuesNotSatisfied(String),

    /// No image compatible with the shape
    #[error("matching image not found for instance shape {0}")]
    ImageNotFound(String),

    /// Cloud API call failed
    #[error("{context}: {source}")]
    Api {
        context: String,
        #[source]
        source: ApiError,
    },

    /// Outbound call exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Delete failed and the follow-up lookup did not prove the instance gone
    #[error("terminating instance {instance_id}: {source}{}", .lookup.as_ref().map(|e| format!("; {e}")).unwrap_or_default())]
    DeleteFailed {
        instance_id: String,
        #[source]
        source: ApiError,
        lookup: Option<Box<ProvisionError>>,
    },
}

impl ProvisionError {
    /// Wrap a cloud API error with context
    pub fn api(context: impl Into<String>, source: ApiError) -> Self {
        Self::Api {
            context: context.into(),
            source,
        }
    }

    /// Resource is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Capacity was exhausted for the attempted offerings
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. })
    }

    /// Whether an outer loop should retry after backoff rather than abandon
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InsufficientCapacity { .. }
            | Self::OperationNotSupported { .. }
            | Self::RateLimitExceeded(_)
            | Self::Timeout(_) => true,
            Self::Api { source, .. } => source.status.is_some_and(|s| s >= 500 || s == 429),
            _ => false,
        }
    }

    /// Upstream request id, when the error carries one
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::InsufficientCapacity { request_id, .. }
            | Self::MalformedResponse { request_id, .. }
            | Self::LaunchFailed { request_id, .. } => request_id.as_deref(),
            Self::Api { source, .. } | Self::DeleteFailed { source, .. } => {
                source.request_id.as_deref()
            }
            _ => None,
        }
    }
}
