use thiserror::Error;

// Failure kinds the engine distinguishes.
//
// None of these should take the process down: the worst outcome is a
// notification that did not fire or a cache entry that was not populated.
#[derive(Debug, Error)]
pub enum EngineError {
    // A closed enum value without a profile. Build-time defect, never retried.
    #[error("no profile configured for {what}")]
    ConfigurationGap { what: String },

    // Query or mutation against the persistent store failed.
    #[error("persistent store failure: {message}")]
    TransientStore { message: String },

    // The OS notification capability rejected a schedule/cancel call.
    #[error("notification sink rejected {operation} for {id}: {message}")]
    NotificationSink {
        operation: &'static str,
        id: String,
        message: String,
    },

    // Id given by a caller that the store does not know.
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    // Malformed stored value; callers substitute defaults.
    #[error("invalid value for {field}: {message}")]
    Validation { field: String, message: String },
}

impl EngineError {
    pub fn store(message: impl Into<String>) -> Self {
        EngineError::TransientStore {
            message: message.into(),
        }
    }

    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::store(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::store(format!("malformed document: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
