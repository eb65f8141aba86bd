use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    #[error("non-monotonic observation: {got} is before {previous}")]
    NonMonotonic {
        previous: OffsetDateTime,
        got: OffsetDateTime,
    },

    #[error("negative duration: session ends at {end} before it starts at {start}")]
    NegativeDuration {
        start: OffsetDateTime,
        end: OffsetDateTime,
    },

    #[error("invalid timestamp {0}")]
    InvalidTimestamp(f64),

    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Errors caused by the caller's input rather than the store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::UnknownStatus(_)
                | CoreError::NonMonotonic { .. }
                | CoreError::NegativeDuration { .. }
                | CoreError::InvalidTimestamp(_)
                | CoreError::InvalidDate(_)
                | CoreError::Json(_)
        )
    }

    /// Short machine-readable code for the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::UnknownStatus(_) => "unknown_status",
            CoreError::NonMonotonic { .. } => "non_monotonic",
            CoreError::NegativeDuration { .. } => "negative_duration",
            CoreError::InvalidTimestamp(_) => "invalid_timestamp",
            CoreError::InvalidDate(_) => "invalid_date",
            CoreError::SchemaTooNew { .. } => "schema_too_new",
            CoreError::Storage(_) => "db_error",
            CoreError::Io(_) => "io_error",
            CoreError::Json(_) => "invalid_json",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
