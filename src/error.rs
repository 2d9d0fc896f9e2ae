// Typed domain errors and the wire-level error envelope.
//
// Expected domain outcomes (NotFound, Conflict, InvalidPath, ...) travel as
// typed variants so callers can branch on them; unexpected infrastructure
// failures are wrapped in Internal/Unavailable. The HTTP adapter maps each
// kind to a status code and renders the `messages[]` envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TitanError>;

#[derive(Debug, Error)]
pub enum TitanError {
    /// Entity or element does not exist. `what` is the machine-code prefix
    /// ("Submodel", "Aas", "Element", ...).
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Duplicate identifier on create, or duplicate idShort on element insert.
    #[error("{0}")]
    Conflict(String),

    /// Malformed request body, invalid identifier, or value-type mismatch.
    #[error("{0}")]
    BadRequest(String),

    /// Base64URL token outside the alphabet, wrong padding, or empty.
    #[error("invalid identifier token: {0}")]
    InvalidIdentifier(String),

    /// idShortPath that does not parse.
    #[error("invalid idShort path: {0}")]
    InvalidPath(String),

    /// idShortPath that parses but does not resolve.
    #[error("element not found at path: {0}")]
    ElementNotFound(String),

    /// Element insert against an already occupied idShort.
    #[error("element already exists: {0}")]
    ElementExists(String),

    /// If-Match precondition miss.
    #[error("etag mismatch: expected {expected}, current {current}")]
    PreconditionFailed { expected: String, current: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("too many requests")]
    TooManyRequests,

    /// Cancelled job queried after its record expired.
    #[error("gone: {0}")]
    Gone(String),

    /// Storage or cache down where it is essential.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TitanError {
    /// Short machine code for the error envelope, e.g. `Submodel.NotFound`.
    pub fn code(&self) -> String {
        match self {
            TitanError::NotFound { what, .. } => format!("{what}.NotFound"),
            TitanError::Conflict(_) => "Conflict".to_string(),
            TitanError::BadRequest(_) => "BadRequest".to_string(),
            TitanError::InvalidIdentifier(_) => "Identifier.Invalid".to_string(),
            TitanError::InvalidPath(_) => "Element.InvalidPath".to_string(),
            TitanError::ElementNotFound(_) => "Element.NotFound".to_string(),
            TitanError::ElementExists(_) => "Element.Exists".to_string(),
            TitanError::PreconditionFailed { .. } => "ETag.Mismatch".to_string(),
            TitanError::Unauthorized => "Unauthorized".to_string(),
            TitanError::Forbidden(_) => "Forbidden".to_string(),
            TitanError::TooManyRequests => "TooManyRequests".to_string(),
            TitanError::Gone(_) => "Gone".to_string(),
            TitanError::Unavailable(_) => "Unavailable".to_string(),
            TitanError::Internal(_) => "Internal".to_string(),
        }
    }

    /// HTTP status the adapter should use for this kind.
    pub fn status(&self) -> u16 {
        match self {
            TitanError::NotFound { .. } | TitanError::ElementNotFound(_) => 404,
            TitanError::Conflict(_) | TitanError::ElementExists(_) => 409,
            TitanError::BadRequest(_)
            | TitanError::InvalidIdentifier(_)
            | TitanError::InvalidPath(_) => 400,
            TitanError::PreconditionFailed { .. } => 412,
            TitanError::Unauthorized => 401,
            TitanError::Forbidden(_) => 403,
            TitanError::TooManyRequests => 429,
            TitanError::Gone(_) => 410,
            TitanError::Unavailable(_) => 503,
            TitanError::Internal(_) => 500,
        }
    }

    /// Render the wire-level envelope carried by every 4xx/5xx response.
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            messages: vec![ErrorMessage {
                code: self.code(),
                message_type: MessageType::Error,
                text: self.to_string(),
                timestamp: Utc::now(),
            }],
        }
    }
}

impl From<sqlx::Error> for TitanError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                TitanError::Unavailable(e.to_string())
            }
            other => TitanError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<serde_json::Error> for TitanError {
    fn from(e: serde_json::Error) -> Self {
        TitanError::BadRequest(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Error,
    Warning,
}

/// One entry of the `messages[]` error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub code: String,
    pub message_type: MessageType,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub messages: Vec<ErrorMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let e = TitanError::NotFound {
            what: "Submodel",
            id: "urn:x:sm:1".into(),
        };
        assert_eq!(e.code(), "Submodel.NotFound");
        assert_eq!(e.status(), 404);

        let e = TitanError::PreconditionFailed {
            expected: "a".into(),
            current: "b".into(),
        };
        assert_eq!(e.code(), "ETag.Mismatch");
        assert_eq!(e.status(), 412);
    }

    #[test]
    fn test_envelope_shape() {
        let e = TitanError::InvalidPath("Temp..x".into());
        let env = e.to_envelope();
        assert_eq!(env.messages.len(), 1);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["messages"][0]["code"], "Element.InvalidPath");
        assert_eq!(json["messages"][0]["messageType"], "Error");
        assert!(json["messages"][0]["timestamp"].is_string());
    }
}
