/// Provider-specific error with retry classification
///
/// Providers return this error type to tell the runtime what went wrong and
/// whether retrying can help. The runtime retries `StorageUnavailable` with
/// backoff and surfaces the other kinds to callers.
///
/// # Example Usage
///
/// ```rust
/// use duratask::providers::ProviderError;
///
/// let busy = ProviderError::retryable("ack_orchestration_item", "Database is busy");
/// assert!(busy.is_retryable());
///
/// let missing = ProviderError::instance_not_found("read", "inst-42");
/// assert!(missing.is_instance_not_found());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g., "append", "fetch_orchestration_item")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    pub kind: ProviderErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The instance does not exist in the store.
    InstanceNotFound,
    /// `create_instance` was called with an id that is already taken.
    AlreadyExists,
    /// Transient: busy database, I/O hiccup, connection loss.
    StorageUnavailable,
    /// Won't succeed on retry: corrupt data, stale lock token, bad input.
    Permanent,
}

impl ProviderError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::StorageUnavailable,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Permanent,
        }
    }

    pub fn instance_not_found(operation: impl Into<String>, instance: &str) -> Self {
        Self {
            operation: operation.into(),
            message: format!("instance not found: {instance}"),
            kind: ProviderErrorKind::InstanceNotFound,
        }
    }

    pub fn already_exists(operation: impl Into<String>, instance: &str) -> Self {
        Self {
            operation: operation.into(),
            message: format!("instance already exists: {instance}"),
            kind: ProviderErrorKind::AlreadyExists,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::StorageUnavailable
    }

    pub fn is_instance_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::InstanceNotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == ProviderErrorKind::AlreadyExists
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}
