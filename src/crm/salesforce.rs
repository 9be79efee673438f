//! # CRM REST client
//!
//! Thin client over the CRM's sObject REST API. Token acquisition happens
//! elsewhere; this client is handed a ready bearer token.

use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

use super::{CrmClient, CrmError};
use crate::config::CrmConfig;

pub struct SalesforceClient {
    client: Client,
    base_url: Url,
    access_token: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    records: Vec<Value>,
}

impl std::fmt::Debug for SalesforceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SalesforceClient")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl SalesforceClient {
    pub fn new(config: &CrmConfig) -> Result<Self, CrmError> {
        let base_url = Url::parse(&format!(
            "{}/services/data/{}/",
            config.instance_url.trim_end_matches('/'),
            config.api_version
        ))
        .map_err(|e| CrmError::Transport(format!("Invalid CRM instance URL: {}", e)))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!("crm-sync-worker/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CrmError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            access_token: config.access_token.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, CrmError> {
        self.base_url
            .join(path)
            .map_err(|e| CrmError::Transport(format!("Invalid URL: {}", e)))
    }

    async fn check(response: Response) -> Result<Response, CrmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        error!(status = status.as_u16(), body = %body, "CRM request failed");
        Err(CrmError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl CrmClient for SalesforceClient {
    async fn create_object(&self, object_type: &str, fields: Value) -> Result<String, CrmError> {
        let url = self.url(&format!("sobjects/{}/", object_type))?;
        debug!(object_type, "Creating CRM object");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&fields)
            .send()
            .await
            .map_err(|e| CrmError::Transport(e.to_string()))?;

        let created: CreateResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| CrmError::Decode(e.to_string()))?;

        debug!(object_type, id = %created.id, "CRM object created");
        Ok(created.id)
    }

    async fn query(&self, query: &str) -> Result<Vec<Value>, CrmError> {
        let mut url = self.url("query/")?;
        url.query_pairs_mut().append_pair("q", query);
        debug!(query, "Querying CRM");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| CrmError::Transport(e.to_string()))?;

        let result: QueryResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| CrmError::Decode(e.to_string()))?;

        Ok(result.records)
    }

    async fn delete_object(&self, object_type: &str, id: &str) -> Result<(), CrmError> {
        let url = self.url(&format!("sobjects/{}/{}", object_type, id))?;
        debug!(object_type, id, "Deleting CRM object");

        let response = self
            .client
            .delete(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| CrmError::Transport(e.to_string()))?;

        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(instance_url: &str) -> CrmConfig {
        CrmConfig {
            instance_url: instance_url.to_string(),
            access_token: "token".to_string(),
            api_version: "v44.0".to_string(),
            campaign_id: "campaign".to_string(),
            owner_id: "owner".to_string(),
        }
    }

    #[test]
    fn test_urls_built_under_api_version() {
        let client = SalesforceClient::new(&config("https://crm.example.com/")).unwrap();
        assert_eq!(
            client.url("sobjects/Lead/").unwrap().as_str(),
            "https://crm.example.com/services/data/v44.0/sobjects/Lead/"
        );
    }

    #[test]
    fn test_invalid_instance_url() {
        assert!(SalesforceClient::new(&config("not a url")).is_err());
    }
}
