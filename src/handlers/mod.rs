//! Production handlers, keyed by the routing keys they serve.

pub mod connect_event;
pub mod project_created;
pub mod project_updated;

use std::sync::Arc;

use crate::config::CrmConfig;
use crate::contracts::routing_key;
use crate::crm::{CrmClient, IdentityClient};
use crate::messaging::{EventHandler, HandlerMap};

pub use connect_event::{ConnectEventHandler, ConnectEventKind};
pub use project_created::ProjectCreatedHandler;
pub use project_updated::ProjectUpdatedHandler;

/// CRM settings shared by the project handlers.
#[derive(Debug, Clone)]
pub struct CampaignSettings {
    pub campaign_id: String,
    pub owner_id: String,
}

impl From<&CrmConfig> for CampaignSettings {
    fn from(config: &CrmConfig) -> Self {
        Self {
            campaign_id: config.campaign_id.clone(),
            owner_id: config.owner_id.clone(),
        }
    }
}

/// Every handler the worker serves, keyed by routing key.
pub fn default_handlers(
    crm: Arc<dyn CrmClient>,
    identity: Arc<dyn IdentityClient>,
    settings: CampaignSettings,
) -> HandlerMap {
    let created: Arc<dyn EventHandler> = Arc::new(ProjectCreatedHandler::new(
        crm.clone(),
        identity.clone(),
        settings.clone(),
    ));
    let updated: Arc<dyn EventHandler> =
        Arc::new(ProjectUpdatedHandler::new(crm.clone(), settings));

    let mut handlers = HandlerMap::from([
        (routing_key::PROJECT_DRAFT_CREATED.to_string(), created),
        (routing_key::PROJECT_UPDATED.to_string(), updated),
    ]);

    let connect_events = [
        (routing_key::USER_CREATED, ConnectEventKind::UserCreated),
        (routing_key::USER_TRAIT_UPDATED, ConnectEventKind::UserTraitUpdated),
        (routing_key::RESOURCE_BOOKING_CREATED, ConnectEventKind::ResourceBookingCreated),
        (routing_key::RESOURCE_BOOKING_UPDATED, ConnectEventKind::ResourceBookingUpdated),
        (routing_key::PROJECT_ACTION_CREATE, ConnectEventKind::ProjectMember),
        (routing_key::PROJECT_ACTION_UPDATE, ConnectEventKind::ProjectMember),
        (routing_key::PROJECT_ACTION_DELETE, ConnectEventKind::ProjectMember),
    ];
    for (key, kind) in connect_events {
        let handler: Arc<dyn EventHandler> = Arc::new(ConnectEventHandler::new(
            kind,
            key,
            crm.clone(),
            identity.clone(),
        ));
        handlers.insert(key.to_string(), handler);
    }

    handlers
}

/// Quotes a value for inclusion in a CRM query string literal.
pub(crate) fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::crm::{CrmClient, CrmError, IdentityClient, UserProfile};

    #[derive(Default)]
    pub struct FakeCrm {
        pub created: Mutex<Vec<(String, Value)>>,
        pub deleted: Mutex<Vec<(String, String)>>,
        pub queries: Mutex<Vec<String>>,
        /// Query results keyed by the object name in the FROM clause.
        pub records: Mutex<HashMap<String, Vec<Value>>>,
        /// Errors returned by `create_object`, keyed by object type.
        pub create_errors: Mutex<HashMap<String, CrmError>>,
    }

    #[async_trait]
    impl CrmClient for FakeCrm {
        async fn create_object(&self, object_type: &str, fields: Value) -> Result<String, CrmError> {
            if let Some(err) = self.create_errors.lock().unwrap().get(object_type) {
                return Err(err.clone());
            }
            let mut created = self.created.lock().unwrap();
            created.push((object_type.to_string(), fields));
            Ok(format!("{}-{}", object_type, created.len()))
        }

        async fn query(&self, query: &str) -> Result<Vec<Value>, CrmError> {
            self.queries.lock().unwrap().push(query.to_string());
            let object = query
                .split(" FROM ")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .unwrap_or_default();
            Ok(self
                .records
                .lock()
                .unwrap()
                .get(object)
                .cloned()
                .unwrap_or_default())
        }

        async fn delete_object(&self, object_type: &str, id: &str) -> Result<(), CrmError> {
            self.deleted
                .lock()
                .unwrap()
                .push((object_type.to_string(), id.to_string()));
            Ok(())
        }
    }

    pub struct FakeIdentity {
        pub result: Result<UserProfile, CrmError>,
    }

    #[async_trait]
    impl IdentityClient for FakeIdentity {
        async fn get_user(&self, _user_id: i64) -> Result<UserProfile, CrmError> {
            self.result.clone()
        }
    }
}
