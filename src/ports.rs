//! External services the requisition core talks to.
//!
//! Each port is called synchronously. Failures of ports that run after a
//! commit (audit, notification, budget, signed URLs) are logged by the caller
//! and never undo the committed change.
use crate::model::{Actor, RequisitionHeader, RequisitionItem};
use crate::status::RequisitionStatus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Permission actions checked against the permission table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Create,
    Update,
    Print,
    Report,
    Approve,
    Annul,
    Process,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Print => "PRINT",
            Action::Report => "REPORT",
            Action::Approve => "APPROVE",
            Action::Annul => "ANNUL",
            Action::Process => "PROCESS",
        }
    }
}

/// Row-level visibility granted by a permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    All,
    /// Only rows the caller created.
    Owns,
}

pub trait Authorizer: Send + Sync {
    /// Fail with [`crate::error::RequisitionError::Unauthorized`] when the actor
    /// holds none of `actions` on `entity`.
    fn authorize(&self, actor: &Actor, entity: &str, actions: &[Action]) -> anyhow::Result<Visibility>;
}

pub trait AuditLog: Send + Sync {
    fn record(&self, actor: &Actor, entity: &str, id: &str, action: Action) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlAccess {
    Read,
    Write,
}

pub trait UrlSigner: Send + Sync {
    fn signed_url(&self, key: &str, access: UrlAccess, ttl: Duration) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotice {
    pub requisition: String,
    pub project: String,
    pub from: RequisitionStatus,
    pub to: RequisitionStatus,
    pub actor: String,
    pub reason: Option<String>,
}

pub trait Notifier: Send + Sync {
    fn status_changed(&self, notice: &StatusNotice) -> anyhow::Result<()>;
}

pub trait BudgetLedger: Send + Sync {
    /// Give back what a rejected or canceled requisition had committed.
    fn release(&self, header: &RequisitionHeader, items: &[RequisitionItem]) -> anyhow::Result<()>;
}

/// One item and quantity of a movement or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftLine {
    pub item: String,
    pub quantity: u64,
}

/// Payload of a sibling outbound-movement or purchase-request creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamDraft {
    pub requisition: String,
    pub frame: Option<String>,
    pub project: String,
    pub require_date: String,
    pub motive: String,
    pub observations: Option<String>,
    pub file_extension: Option<String>,
    pub approver_name: Option<String>,
    pub approver_user: Option<String>,
    pub requester_name: String,
    pub requester_area_name: Option<String>,
    pub requester_position_name: Option<String>,
    pub cost_center: Option<String>,
    pub items: Vec<DraftLine>,
}

pub trait DocumentWorkflows: Send + Sync {
    /// Returns the id of the created outbound movement, if the workflow reported one.
    fn create_outbound(&self, draft: &DownstreamDraft) -> anyhow::Result<Option<String>>;
    /// Returns the id of the created purchase request, if the workflow reported one.
    fn create_purchase_request(&self, draft: &DownstreamDraft) -> anyhow::Result<Option<String>>;
}

#[derive(Clone)]
pub struct Ports {
    pub authorizer: Arc<dyn Authorizer>,
    pub audit: Arc<dyn AuditLog>,
    pub signer: Arc<dyn UrlSigner>,
    pub notifier: Arc<dyn Notifier>,
    pub budget: Arc<dyn BudgetLedger>,
    pub workflows: Arc<dyn DocumentWorkflows>,
}
