use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::CampaignSettings;
use crate::contracts::{DecodedEvent, HandlerError};
use crate::crm::{CrmClient, CrmError, IdentityClient};
use crate::messaging::EventHandler;

const MEMBER_ROLE: &str = "customer";
const LEAD_SOURCE: &str = "Connect";
const COMPANY: &str = "Unknown";
const DUPLICATE_PROJECT_ID: &str = "TC_Connect_Project_Id__c duplicates value on record";

#[derive(Debug, Deserialize)]
struct Project {
    id: i64,
    members: Vec<Member>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Member {
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    role: String,
    #[serde(default)]
    is_primary: bool,
}

/// Creates a CRM lead for the primary customer of a new project draft and
/// enrolls it in the campaign.
pub struct ProjectCreatedHandler {
    crm: Arc<dyn CrmClient>,
    identity: Arc<dyn IdentityClient>,
    settings: CampaignSettings,
}

impl ProjectCreatedHandler {
    pub fn new(
        crm: Arc<dyn CrmClient>,
        identity: Arc<dyn IdentityClient>,
        settings: CampaignSettings,
    ) -> Self {
        Self {
            crm,
            identity,
            settings,
        }
    }
}

#[async_trait]
impl EventHandler for ProjectCreatedHandler {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        let project: Project = event
            .parse()
            .map_err(|e| HandlerError::permanent(format!("Invalid project payload: {}", e)))?;

        let Some(member) = project
            .members
            .iter()
            .find(|m| m.role == MEMBER_ROLE && m.is_primary)
        else {
            warn!(project_id = project.id, members = ?project.members, "No primary customer on project");
            return Err(HandlerError::permanent("Cannot find primary customer"));
        };

        let Some(user_id) = member.user_id else {
            return Err(HandlerError::permanent(format!(
                "Primary customer of project {} has no userId",
                project.id
            )));
        };

        let user = self.identity.get_user(user_id).await?;

        let lead = json!({
            "FirstName": user.first_name,
            "LastName": user.last_name,
            "Email": user.email,
            "LeadSource": LEAD_SOURCE,
            "Company": COMPANY,
            "OwnerId": self.settings.owner_id,
            "TC_Connect_Project_Id__c": project.id,
        });

        let lead_id = match self.crm.create_object("Lead", lead).await {
            Ok(id) => id,
            Err(err) if is_duplicate_lead(&err) => {
                return Err(HandlerError::permanent(format!(
                    "Lead already existing for project {}",
                    project.id
                )));
            }
            Err(err) => return Err(err.into()),
        };

        let campaign_member = json!({
            "LeadId": lead_id,
            "CampaignId": self.settings.campaign_id,
        });
        self.crm
            .create_object("CampaignMember", campaign_member)
            .await?;

        info!(project_id = project.id, lead_id = %lead_id, "Lead created for project");
        Ok(())
    }
}

fn is_duplicate_lead(err: &CrmError) -> bool {
    err.body()
        .is_some_and(|body| body.contains(DUPLICATE_PROJECT_ID))
}
