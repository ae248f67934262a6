//! JSON request dispatch over [`RequisitionService`]
use crate::error::{ErrorKind, RequisitionError, kind_of};
use crate::model::Actor;
use crate::query::SearchFilters;
use crate::reconcile::{AssociationOutcome, FulfillmentEvent};
use crate::response::{Envelope, ResponseBuilder};
use crate::service::{CreateRequest, RequisitionService, UpdateRequest};
use crate::transition::{ProcessRequest, StatusChange};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Query,
    PendingApproval,
    ReadyToProcess,
    ProcessDetail,
    UpdateStatus,
    Process,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::Create,
        Operation::Update,
        Operation::Query,
        Operation::PendingApproval,
        Operation::ReadyToProcess,
        Operation::ProcessDetail,
        Operation::UpdateStatus,
        Operation::Process,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Query => "query",
            Operation::PendingApproval => "pendingApproval",
            Operation::ReadyToProcess => "readyToProcess",
            Operation::ProcessDetail => "processDetail",
            Operation::UpdateStatus => "updateStatus",
            Operation::Process => "process",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = RequisitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| RequisitionError::invalid(format!("unknown operation {s:?}")))
    }
}

#[derive(Deserialize)]
struct ById {
    #[serde(default)]
    id: String,
}

pub struct Handler {
    service: RequisitionService,
    responses: Arc<dyn ResponseBuilder>,
}

impl Handler {
    pub fn new(service: RequisitionService, responses: Arc<dyn ResponseBuilder>) -> Self {
        Self { service, responses }
    }

    pub fn service(&self) -> &RequisitionService {
        &self.service
    }

    /// Run one request end to end. Never fails: errors become envelopes.
    pub fn handle(&self, operation: Operation, actor: &Actor, body: &Value) -> Envelope {
        info!(%operation, actor = %actor.username, "request received");

        let envelope = match self.dispatch(operation, actor, body) {
            Ok(body) => self.responses.success(body),
            Err(err) => {
                match kind_of(&err) {
                    ErrorKind::InternalError => error!(%operation, error = ?err, "operation failed"),
                    _ => warn!(%operation, error = %err, "request refused"),
                }
                self.responses.failure(&err)
            }
        };

        info!(%operation, status = envelope.status_code, code = %envelope.status.code, "response sent");
        envelope
    }

    fn dispatch(&self, operation: Operation, actor: &Actor, body: &Value) -> anyhow::Result<Value> {
        let service = &self.service;
        let value = match operation {
            Operation::Create => serde_json::to_value(service.create(actor, decode::<CreateRequest>(body)?)?)?,
            Operation::Update => serde_json::to_value(service.update(actor, decode::<UpdateRequest>(body)?)?)?,
            Operation::Query => Value::Array(service.query(actor, &decode::<SearchFilters>(body)?)?),
            Operation::PendingApproval => Value::Array(service.pending_approval(actor)?),
            Operation::ReadyToProcess => Value::Array(service.ready_to_process(actor)?),
            Operation::ProcessDetail => service.process_detail(actor, &decode::<ById>(body)?.id)?,
            Operation::UpdateStatus => {
                serde_json::to_value(service.update_status(actor, decode::<StatusChange>(body)?)?)?
            }
            Operation::Process => serde_json::to_value(service.process(actor, decode::<ProcessRequest>(body)?)?)?,
        };
        Ok(value)
    }

    /// Consume one downstream movement event. There is no caller to answer, so errors are logged and returned.
    pub fn handle_event(&self, body: &Value) -> anyhow::Result<AssociationOutcome> {
        let result = decode::<FulfillmentEvent>(body).and_then(|event| {
            info!(
                requisition = %event.requisition,
                event = event.event_type.as_str(),
                lines = event.items.len(),
                "event received"
            );
            self.service.associate(&event)
        });

        match &result {
            Ok(outcome) => info!(
                requisition = %outcome.requisition,
                applied = outcome.applied,
                skipped = outcome.skipped,
                closed = outcome.closed,
                "event applied"
            ),
            Err(err) => error!(error = ?err, "event could not be applied"),
        }
        result
    }
}

fn decode<T: DeserializeOwned>(body: &Value) -> anyhow::Result<T> {
    T::deserialize(body).map_err(|e| RequisitionError::invalid(e.to_string()).into())
}
