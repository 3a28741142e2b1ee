use thiserror::Error;

/// Raised when a compound id does not have the expected number of segments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed id '{id}': expected {expected} ':'-separated segments, found {found}")]
pub struct MalformedIdError {
    pub id: String,
    pub expected: usize,
    pub found: usize,
}

/// Transport-independent classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Forbidden,
    NotFound,
    Internal,
}

impl ErrorKind {
    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Internal => 500,
        }
    }
}

/// Errors produced by element, branch and project operations.
#[derive(Debug, Error)]
pub enum MbeeError {
    /// Malformed payload, disallowed field change, broken source/target pairing, self-loops
    #[error("{0}")]
    Validation(String),

    /// A referenced org, project, branch or element does not exist
    #[error("{0}")]
    NotFound(String),

    /// Archived-element mutation, tag mutation or missing permission
    #[error("{0}")]
    Forbidden(String),

    /// Id collision on create
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    MalformedId(#[from] MalformedIdError),

    /// Failure reported by the underlying document store
    #[error("Store operation failed: {0}")]
    Store(#[from] anyhow::Error),
}

pub type MbeeResult<T> = std::result::Result<T, MbeeError>;

impl MbeeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MbeeError::Validation(_) | MbeeError::Conflict(_) | MbeeError::MalformedId(_) => {
                ErrorKind::BadRequest
            }
            MbeeError::NotFound(_) => ErrorKind::NotFound,
            MbeeError::Forbidden(_) => ErrorKind::Forbidden,
            MbeeError::Store(_) => ErrorKind::Internal,
        }
    }

    /// Attach the id of the element that caused the failure, keeping the kind.
    pub fn for_element(self, element_id: &str) -> Self {
        let prefix = |msg: String| format!("Element [{}]: {}", element_id, msg);
        match self {
            MbeeError::Validation(m) => MbeeError::Validation(prefix(m)),
            MbeeError::NotFound(m) => MbeeError::NotFound(prefix(m)),
            MbeeError::Forbidden(m) => MbeeError::Forbidden(prefix(m)),
            MbeeError::Conflict(m) => MbeeError::Conflict(prefix(m)),
            MbeeError::MalformedId(e) => MbeeError::Validation(prefix(e.to_string())),
            MbeeError::Store(e) => MbeeError::Store(e.context(format!("element [{}]", element_id))),
        }
    }
}
