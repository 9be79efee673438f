//! External collaborators used by the domain handlers.

pub mod identity;
pub mod salesforce;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::contracts::HandlerError;

pub use identity::IdentityApiClient;
pub use salesforce::SalesforceClient;

/// CRM object store.
#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Creates an object and returns its id.
    async fn create_object(&self, object_type: &str, fields: Value) -> Result<String, CrmError>;

    /// Runs a query and returns the matching records.
    async fn query(&self, query: &str) -> Result<Vec<Value>, CrmError>;

    async fn delete_object(&self, object_type: &str, id: &str) -> Result<(), CrmError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn get_user(&self, user_id: i64) -> Result<UserProfile, CrmError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CrmError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Upstream rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Upstream failed with status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Decode(String),
}

impl CrmError {
    pub fn from_status(status: u16, body: String) -> Self {
        if (400..500).contains(&status) {
            Self::Rejected { status, body }
        } else {
            Self::Upstream { status, body }
        }
    }

    /// Response body text, if the upstream answered at all.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Rejected { body, .. } | Self::Upstream { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// 4xx means the request itself is wrong and will stay wrong, except for
/// expired credentials, timeouts and throttling.
impl From<CrmError> for HandlerError {
    fn from(err: CrmError) -> Self {
        match err {
            CrmError::Rejected { status, .. } if !RETRYABLE_CLIENT_STATUSES.contains(&status) => {
                HandlerError::permanent(err.to_string())
            }
            _ => HandlerError::retryable(err.to_string()),
        }
    }
}

/// 401 Unauthorized, 408 Request Timeout, 429 Too Many Requests.
const RETRYABLE_CLIENT_STATUSES: [u16; 3] = [401, 408, 429];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            CrmError::from_status(400, "bad".into()),
            CrmError::Rejected { status: 400, .. }
        ));
        assert!(matches!(
            CrmError::from_status(503, "down".into()),
            CrmError::Upstream { status: 503, .. }
        ));
    }

    #[test]
    fn test_handler_error_mapping() {
        assert!(HandlerError::from(CrmError::from_status(404, String::new())).should_ack());
        assert!(!HandlerError::from(CrmError::from_status(500, String::new())).should_ack());
        assert!(!HandlerError::from(CrmError::Transport("reset".into())).should_ack());
        assert!(!HandlerError::from(CrmError::Decode("eof".into())).should_ack());
    }

    #[test]
    fn test_throttling_and_auth_failures_are_retryable() {
        for status in [401, 408, 429] {
            let err = HandlerError::from(CrmError::from_status(status, "try later".into()));
            assert!(!err.should_ack(), "status {} should be retried", status);
        }
        assert!(HandlerError::from(CrmError::from_status(400, "bad".into())).should_ack());
        assert!(HandlerError::from(CrmError::from_status(403, "forbidden".into())).should_ack());
    }
}
