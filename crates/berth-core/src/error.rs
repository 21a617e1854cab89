//! Error handling for berth
//!
//! Provides a unified error type and result type for use across all berth
//! components. Capacity, validation, and lifecycle-conflict kinds carry
//! enough context to be mapped to HTTP responses by the API layer.

/// Result type alias for berth operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for berth
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not enough free GPUs to satisfy an allocation
    #[error("gpu not enough: requested {requested}, free {free}")]
    GpuNotEnough { requested: usize, free: usize },

    /// Not enough free CPUs to satisfy an allocation
    #[error("cpu not enough: requested {requested}, free {free}")]
    CpuNotEnough { requested: usize, free: usize },

    /// Not enough free host ports to satisfy an allocation
    #[error("port not enough: requested {requested}, free {free}")]
    PortNotEnough { requested: usize, free: usize },

    /// A container with this replica-set name already exists
    #[error("container already exists: {0}")]
    ContainerExisted(String),

    /// Rollback target equals the live version
    #[error("no rollback required: version {0} is already live")]
    NoRollbackRequired(i64),

    /// Key lookup miss in the key-value store
    #[error("key does not exist in store: {0}")]
    NotExistInStore(String),

    /// Malformed memory string (expected `<float><KB|MB|GB|TB>`)
    #[error("invalid memory format: {0}")]
    InvalidMemoryFormat(String),

    /// Resource not found (replica set, version, container)
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Container runtime failure, wrapped with the call site
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Key-value store failure, wrapped with the call site
    #[error("store error: {0}")]
    Store(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is a scheduler capacity failure
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            Error::GpuNotEnough { .. } | Error::CpuNotEnough { .. } | Error::PortNotEnough { .. }
        )
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::GpuNotEnough { .. }
                | Error::CpuNotEnough { .. }
                | Error::PortNotEnough { .. }
                | Error::ContainerExisted(_)
                | Error::NoRollbackRequired(_)
                | Error::NotExistInStore(_)
                | Error::InvalidMemoryFormat(_)
                | Error::NotFound(_)
                | Error::InvalidRequest(_)
        )
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::GpuNotEnough { .. } => "gpu_not_enough",
            Error::CpuNotEnough { .. } => "cpu_not_enough",
            Error::PortNotEnough { .. } => "port_not_enough",
            Error::ContainerExisted(_) => "container_existed",
            Error::NoRollbackRequired(_) => "no_rollback_required",
            Error::NotExistInStore(_) => "not_exist_in_store",
            Error::InvalidMemoryFormat(_) => "invalid_memory_format",
            Error::NotFound(_) => "not_found",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Runtime(_) => "runtime",
            Error::Store(_) => "store",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }

    /// Convert to an HTTP status code for the REST surface
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::InvalidRequest(_) | Error::InvalidMemoryFormat(_) => 400,
            Error::NotFound(_) | Error::NotExistInStore(_) => 404,
            Error::ContainerExisted(_) | Error::NoRollbackRequired(_) => 409,
            Error::GpuNotEnough { .. }
            | Error::CpuNotEnough { .. }
            | Error::PortNotEnough { .. } => 422,
            Error::Runtime(_) | Error::Store(_) => 502,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_errors() {
        let err = Error::GpuNotEnough {
            requested: 4,
            free: 2,
        };
        assert!(err.is_capacity_error());
        assert!(err.is_client_error());
        assert_eq!(err.to_http_status(), 422);
        assert_eq!(err.to_string(), "gpu not enough: requested 4, free 2");
    }

    #[test]
    fn test_classification() {
        assert!(Error::NotExistInStore("containers/job".into()).is_client_error());
        assert!(Error::NoRollbackRequired(3).is_client_error());
        assert!(!Error::runtime("create failed").is_client_error());
        assert!(!Error::internal("oops").is_capacity_error());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(Error::invalid_request("bad").to_http_status(), 400);
        assert_eq!(Error::not_found("job").to_http_status(), 404);
        assert_eq!(Error::ContainerExisted("job".into()).to_http_status(), 409);
        assert_eq!(Error::runtime("boom").to_http_status(), 502);
        assert_eq!(Error::internal("boom").to_http_status(), 500);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::CpuNotEnough {
                requested: 1,
                free: 0
            }
            .category(),
            "cpu_not_enough"
        );
        assert_eq!(Error::store("etcd down").category(), "store");
    }
}
