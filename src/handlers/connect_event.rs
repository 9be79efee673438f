//! Forwards user, resource booking and project member events to the CRM as
//! `Connect_Event__c` records.
//!
//! Events arrive in the bus envelope `{ topic, originator, timestamp, payload }`.
//! Only `payload` is forwarded, enriched with the name and email of its
//! `createdBy` user when present.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::contracts::{DecodedEvent, HandlerError};
use crate::crm::{CrmClient, IdentityClient};
use crate::messaging::EventHandler;

const CONNECT_EVENT_OBJECT: &str = "Connect_Event__c";
const FORWARDED_TRAITS: [&str; 2] = ["basic_info", "connect_info"];
const PROJECT_MEMBER_RESOURCE: &str = "project.member";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    String,
    Number,
    Integer,
    Object,
}

impl Shape {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Object => value.is_object(),
        }
    }
}

/// Which event family a handler forwards, and the payload checks it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectEventKind {
    UserCreated,
    /// Forwarded only for the `basic_info` and `connect_info` traits.
    UserTraitUpdated,
    ResourceBookingCreated,
    ResourceBookingUpdated,
    /// Forwarded only when the action's resource is a project member.
    ProjectMember,
}

impl ConnectEventKind {
    fn required_fields(self) -> &'static [(&'static str, Shape)] {
        match self {
            Self::UserCreated => &[
                ("/id", Shape::String),
                ("/handle", Shape::String),
                ("/email", Shape::String),
                ("/firstName", Shape::String),
                ("/lastName", Shape::String),
            ],
            Self::UserTraitUpdated => &[
                ("/userId", Shape::Number),
                ("/traitId", Shape::String),
                ("/traits", Shape::Object),
            ],
            Self::ResourceBookingCreated => &[
                ("/currentUser", Shape::Object),
                ("/resourceBooking", Shape::Object),
                ("/resourceBooking/projectId", Shape::Integer),
                ("/resourceBooking/userId", Shape::String),
                ("/resourceBooking/rateType", Shape::String),
            ],
            Self::ResourceBookingUpdated => &[
                ("/currentUser", Shape::Object),
                ("/id", Shape::String),
                ("/data", Shape::Object),
            ],
            Self::ProjectMember => &[],
        }
    }

    /// `Ok(false)` means the event is valid but not of interest to the CRM.
    fn accepts(self, payload: &Value) -> Result<bool, HandlerError> {
        for (pointer, shape) in self.required_fields() {
            if !payload.pointer(pointer).is_some_and(|value| shape.matches(value)) {
                return Err(HandlerError::permanent(format!(
                    "Invalid {:?} payload: {} must be {:?}",
                    self,
                    pointer.trim_start_matches('/'),
                    shape
                )));
            }
        }

        Ok(match self {
            Self::UserTraitUpdated => payload["traitId"]
                .as_str()
                .is_some_and(|trait_id| FORWARDED_TRAITS.contains(&trait_id)),
            Self::ProjectMember => payload["resource"].as_str() == Some(PROJECT_MEMBER_RESOURCE),
            _ => true,
        })
    }
}

pub struct ConnectEventHandler {
    kind: ConnectEventKind,
    event_type: String,
    crm: Arc<dyn CrmClient>,
    identity: Arc<dyn IdentityClient>,
}

impl ConnectEventHandler {
    /// `event_type` is recorded as the CRM event's `Type__c`.
    pub fn new(
        kind: ConnectEventKind,
        event_type: impl Into<String>,
        crm: Arc<dyn CrmClient>,
        identity: Arc<dyn IdentityClient>,
    ) -> Self {
        Self {
            kind,
            event_type: event_type.into(),
            crm,
            identity,
        }
    }

    async fn enrich_creator(&self, payload: &mut Value) -> Result<(), HandlerError> {
        let Some(created_by) = payload.get("createdBy") else {
            return Ok(());
        };
        let user_id = match created_by {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            HandlerError::permanent(format!("Invalid createdBy: {}", created_by))
        })?;

        let user = self.identity.get_user(user_id).await?;
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("createdByEmail".to_string(), json!(user.email));
            fields.insert("createdByFirstName".to_string(), json!(user.first_name));
            fields.insert("createdByLastName".to_string(), json!(user.last_name));
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ConnectEventHandler {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        let Some(payload) = event.value().get("payload").filter(|p| p.is_object()) else {
            return Err(HandlerError::permanent(format!(
                "{} event has no payload object",
                self.event_type
            )));
        };

        if !self.kind.accepts(payload)? {
            debug!(event_type = %self.event_type, "Event not forwarded to CRM");
            return Ok(());
        }

        let mut payload = payload.clone();
        self.enrich_creator(&mut payload).await?;

        let record = json!({
            "Type__c": self.event_type,
            "Json__c": payload.to_string(),
        });
        let id = self.crm.create_object(CONNECT_EVENT_OBJECT, record).await?;

        info!(event_type = %self.event_type, connect_event_id = %id, "Connect event forwarded");
        Ok(())
    }
}
