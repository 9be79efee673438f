use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{CampaignSettings, quote};
use crate::contracts::{DecodedEvent, HandlerError};
use crate::crm::CrmClient;
use crate::messaging::EventHandler;

#[derive(Debug, Deserialize)]
struct ProjectEvent {
    original: ProjectRef,
    updated: Value,
}

#[derive(Debug, Deserialize)]
struct ProjectRef {
    id: i64,
}

/// Removes the project's lead from the campaign once the project moves on.
pub struct ProjectUpdatedHandler {
    crm: Arc<dyn CrmClient>,
    settings: CampaignSettings,
}

impl ProjectUpdatedHandler {
    pub fn new(crm: Arc<dyn CrmClient>, settings: CampaignSettings) -> Self {
        Self { crm, settings }
    }

    async fn first_id(&self, query: &str) -> Result<Option<String>, HandlerError> {
        let records = self.crm.query(query).await?;
        Ok(records
            .first()
            .and_then(|record| record.get("Id").or_else(|| record.get("id")))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[async_trait]
impl EventHandler for ProjectUpdatedHandler {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        let project_event: ProjectEvent = event
            .parse()
            .map_err(|e| HandlerError::permanent(format!("Invalid project event payload: {}", e)))?;
        let project_id = project_event.original.id;
        debug!(project_id, updated = %project_event.updated, "Handling project update");

        let lead_query = format!(
            "SELECT id FROM Lead WHERE TC_Connect_Project_Id__c = {}",
            quote(&project_id.to_string())
        );
        let Some(lead_id) = self.first_id(&lead_query).await? else {
            return Err(HandlerError::permanent(format!(
                "Cannot find Lead with TC_Connect_Project_Id__c = '{}'",
                project_id
            )));
        };

        let member_query = format!(
            "SELECT id FROM CampaignMember WHERE LeadId = {} AND CampaignId = {}",
            quote(&lead_id),
            quote(&self.settings.campaign_id)
        );
        let Some(member_id) = self.first_id(&member_query).await? else {
            return Err(HandlerError::permanent(format!(
                "Cannot find CampaignMember for Lead.TC_Connect_Project_Id__c = '{}'",
                project_id
            )));
        };

        self.crm.delete_object("CampaignMember", &member_id).await?;

        info!(project_id, lead_id = %lead_id, campaign_member_id = %member_id, "Campaign member removed");
        Ok(())
    }
}
