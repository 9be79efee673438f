use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error};

use super::{CrmError, IdentityClient, UserProfile};
use crate::config::IdentityConfig;

/// Identity service user lookup.
pub struct IdentityApiClient {
    client: Client,
    base_url: Url,
    token: String,
}

#[derive(Deserialize)]
struct Envelope {
    result: EnvelopeResult,
}

#[derive(Deserialize)]
struct EnvelopeResult {
    content: UserProfile,
}

impl IdentityApiClient {
    pub fn new(config: &IdentityConfig) -> Result<Self, CrmError> {
        let base_url = Url::parse(&format!("{}/", config.url.trim_end_matches('/')))
            .map_err(|e| CrmError::Transport(format!("Invalid identity URL: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CrmError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl IdentityClient for IdentityApiClient {
    async fn get_user(&self, user_id: i64) -> Result<UserProfile, CrmError> {
        let url = self
            .base_url
            .join(&format!("v3/users/{}", user_id))
            .map_err(|e| CrmError::Transport(format!("Invalid URL: {}", e)))?;
        debug!(user_id, "Fetching user from identity service");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CrmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!(user_id, status = status.as_u16(), "Identity lookup failed");
            return Err(CrmError::from_status(status.as_u16(), body));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| CrmError::Decode(e.to_string()))?;

        Ok(envelope.result.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"result":{"success":true,"content":{"firstName":"Ada","lastName":"Lovelace","email":"ada@example.com","handle":"ada"}}}"#,
        )
        .unwrap();

        assert_eq!(envelope.result.content.first_name, "Ada");
        assert_eq!(envelope.result.content.email, "ada@example.com");
    }
}
