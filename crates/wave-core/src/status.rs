//! Return status carried by every response.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome codes shared by all responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    BadRequest,
    InternalError,
    NotAuthorized,
    VersionError,
    InvalidOperation,
    SchemaViolation,
    SizeLimitExceeded,
    PolicyViolation,
    Quarantined,
    TooOld,
    NotExists,
    AlreadyExists,
    NotLoggedIn,
    Unsubscribed,
    IndexingInProcess,
}

/// A status code with an optional human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnStatus {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReturnStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl Default for ReturnStatus {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for ReturnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{:?}: {}", self.code, message),
            None => write!(f, "{:?}", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        let status = ReturnStatus::error(StatusCode::VersionError, "stale");
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"code":"VERSION_ERROR","message":"stale"}"#);

        let ok: ReturnStatus = serde_json::from_str(r#"{"code":"OK"}"#).unwrap();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(ReturnStatus::ok().to_string(), "Ok");
        assert_eq!(
            ReturnStatus::error(StatusCode::TooOld, "truncated").to_string(),
            "TooOld: truncated"
        );
    }
}
