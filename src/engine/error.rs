use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input; nothing was persisted.
    Validation(String),
    NotFound(Ulid),
    /// The actor's role or ownership does not allow the operation.
    Forbidden(&'static str),
    /// Stale version, or an overlapping approved booking under the
    /// rejecting overlap policy. Carries the booking in the way.
    Conflict(Ulid),
    HasBookings(Ulid),
    LimitExceeded(&'static str),
    /// The WAL could not be written.
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Conflict(_) => "conflict",
            EngineError::HasBookings(_) => "has_bookings",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "persistence",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Forbidden(what) => write!(f, "forbidden: {what}"),
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::HasBookings(id) => {
                write!(f, "cannot delete instrument {id}: bookings still reference it")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
