//! Fulfillment bookkeeping driven by downstream movement events.
//!
//! Each event line adds quantity to one requisition item. An item closes once
//! it has received its fulfillment target, and the requisition closes with
//! its last open item. Lines are identified by a digest of event kind,
//! movement and item; a line whose digest is already recorded on the item is
//! a redelivery and is skipped.
use crate::context::RequisitionContext;
use crate::coordinator::{Field, WriteOp};
use crate::error::RequisitionError;
use crate::model::{Actor, Record};
use crate::ports::DraftLine;
use crate::service::RequisitionService;
use crate::status::RequisitionStatus;
use crate::utils::fulfillment_token;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "outCreated")]
    OutCreated,
    #[serde(rename = "inCreated")]
    InCreated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OutCreated => "outCreated",
            EventKind::InCreated => "inCreated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentEvent {
    pub event_type: EventKind,
    pub requisition: String,
    #[serde(default)]
    pub out: Option<String>,
    #[serde(rename = "in", default)]
    pub inbound: Option<String>,
    pub items: Vec<DraftLine>,
}

impl FulfillmentEvent {
    /// Movement id matching the event kind.
    pub fn movement(&self) -> Option<&str> {
        let movement = match self.event_type {
            EventKind::OutCreated => self.out.as_deref(),
            EventKind::InCreated => self.inbound.as_deref(),
        };
        movement.filter(|id| !id.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationOutcome {
    pub requisition: String,
    pub applied: usize,
    pub skipped: usize,
    pub closed_items: Vec<String>,
    pub closed: bool,
}

impl RequisitionService {
    /// Apply one fulfillment event in a single transaction.
    pub fn associate(&self, event: &FulfillmentEvent) -> anyhow::Result<AssociationOutcome> {
        if event.requisition.trim().is_empty() {
            return Err(RequisitionError::NoId.into());
        }
        let movement = event.movement().ok_or_else(|| {
            RequisitionError::invalid(format!("{} event carries no movement id", event.event_type.as_str()))
        })?;

        let mut ctx = RequisitionContext::load(&self.table, &event.requisition)?;
        let mut outcome = AssociationOutcome {
            requisition: ctx.id().to_string(),
            ..Default::default()
        };

        // Resolve tokens first so a fully redelivered event is a no-op in any status
        let mut pending: Vec<(&DraftLine, String)> = Vec::with_capacity(event.items.len());
        for line in &event.items {
            let item = ctx.item(&line.item).ok_or_else(|| {
                RequisitionError::invalid(format!("{} is not an item of {}", line.item, ctx.id()))
            })?;
            let token = fulfillment_token(event.event_type.as_str(), movement, &line.item);
            if item.applied_events.contains(&token) || pending.iter().any(|(_, seen)| seen == &token) {
                warn!(requisition = %ctx.id(), item = %line.item, movement, "duplicate fulfillment line skipped");
                outcome.skipped += 1;
            } else {
                pending.push((line, token));
            }
        }
        if pending.is_empty() {
            return Ok(outcome);
        }
        if ctx.status() != RequisitionStatus::Process {
            return Err(RequisitionError::InvalidTransition {
                from: ctx.status(),
                to: RequisitionStatus::Closed,
            }
            .into());
        }

        let mut touched = BTreeSet::new();
        for (line, token) in pending {
            let Some(item) = ctx.item_mut(&line.item) else {
                continue;
            };
            if !item.associate.iter().any(|id| id == movement) {
                item.associate.push(movement.to_string());
            }
            item.associated_quantity = item.associated_quantity.saturating_add(line.quantity);
            item.applied_events.push(token);

            if !item.is_closed() && item.associated_quantity >= item.fulfillment_target() {
                item.relations = item
                    .relations
                    .with_status(RequisitionStatus::Process, RequisitionStatus::Closed)?;
                outcome.closed_items.push(item.sk.clone());
            }
            touched.insert(item.sk.clone());
            outcome.applied += 1;
        }
        if !ctx.header.associate.iter().any(|id| id == movement) {
            ctx.header.associate.push(movement.to_string());
        }

        let mut header_fields = vec![Field::Association];
        if ctx.open_items().next().is_none() {
            ctx.rewrite_status(RequisitionStatus::Closed)?;
            header_fields.extend([Field::Status, Field::Relations]);
            outcome.closed = true;
        }

        let mut ops = vec![ctx.header_op(&header_fields)];
        for item in &ctx.items {
            if touched.contains(&item.sk) || outcome.closed {
                ops.push(WriteOp::update(
                    Record::Item(item.clone()),
                    &[Field::Association, Field::Relations],
                ));
            }
        }
        if !self.writer.fits(ops.len()) {
            return Err(RequisitionError::invalid(format!(
                "{} has more items than one transaction holds",
                ctx.id()
            ))
            .into());
        }
        self.writer.write_transaction(&ops)?;
        info!(
            requisition = %ctx.id(),
            movement,
            applied = outcome.applied,
            closed = outcome.closed,
            "fulfillment associated"
        );

        if outcome.closed {
            let system = Actor {
                id: event.event_type.as_str().to_string(),
                username: event.event_type.as_str().to_string(),
                name: movement.to_string(),
                area: None,
                position: None,
            };
            self.notify(&ctx.header, RequisitionStatus::Process, &system, None);
        }
        Ok(outcome)
    }
}
