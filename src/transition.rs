//! Status transitions that need more than a relation rewrite: approval,
//! rejection, cancellation and processing into stock movements.
use crate::context::RequisitionContext;
use crate::coordinator::Field;
use crate::error::RequisitionError;
use crate::model::{Actor, BagItem, Entity, RequisitionHeader, Signature};
use crate::ports::{Action, DownstreamDraft, DraftLine};
use crate::service::{RequisitionService, bag_partition};
use crate::status::RequisitionStatus;
use crate::utils::in_bounded_batches;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub id: String,
    pub status: RequisitionStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChanged {
    pub id: String,
    pub from: RequisitionStatus,
    pub to: RequisitionStatus,
}

/// How much of one item leaves stock now (`out`) and gets purchased
/// (`request`). Whatever is left stays reserved in the bag.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessItem {
    pub item: String,
    #[serde(default)]
    pub out: u64,
    #[serde(default)]
    pub request: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRequest {
    pub id: String,
    pub items: Vec<ProcessItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantitySplit {
    pub out: u64,
    pub request: u64,
    pub bag: u64,
}

/// Split `quantity` three ways. `out + request` may not exceed it; the rest goes to the bag.
pub fn split_quantity(quantity: u64, out: u64, request: u64) -> Result<QuantitySplit, RequisitionError> {
    let routed = out
        .checked_add(request)
        .filter(|routed| *routed <= quantity)
        .ok_or_else(|| {
            RequisitionError::invalid(format!(
                "out {out} plus request {request} exceeds the requested {quantity}"
            ))
        })?;

    Ok(QuantitySplit {
        out,
        request,
        bag: quantity - routed,
    })
}

impl RequisitionService {
    /// Approve, reject or cancel a requisition.
    pub fn update_status(&self, actor: &Actor, change: StatusChange) -> anyhow::Result<StatusChanged> {
        if change.id.trim().is_empty() {
            return Err(RequisitionError::NoId.into());
        }
        let to = change.status;
        let action = match to {
            RequisitionStatus::Approved | RequisitionStatus::Rejected => Action::Approve,
            RequisitionStatus::Canceled => Action::Annul,
            other => {
                return Err(RequisitionError::invalid(format!(
                    "status {other} cannot be set directly"
                ))
                .into());
            }
        };
        self.ports
            .authorizer
            .authorize(actor, Entity::Requisition.as_str(), &[action])?;

        let mut ctx = RequisitionContext::load(&self.table, &change.id)?;
        if action == Action::Approve {
            self.ensure_controller(actor, &ctx.header)?;
        }
        let from = ctx.rewrite_status(to)?;

        let signature = Signature::of(actor, self.config.business_offset());
        let signed = match action {
            Action::Annul => {
                ctx.header.cancellation = Some(signature);
                Field::Cancellation
            }
            _ => {
                ctx.header.approval = Some(signature);
                Field::Approval
            }
        };
        let mut header_fields = vec![Field::Status, Field::Relations, signed];
        if to != RequisitionStatus::Approved {
            ctx.header.reason = change.reason.clone();
            header_fields.push(Field::Reason);
        }

        let mut ops = vec![ctx.header_op(&header_fields)];
        ops.extend(ctx.item_ops(&[Field::Relations]));
        if !self.writer.fits(ops.len()) {
            return Err(RequisitionError::invalid(format!(
                "{} has more items than one transaction holds",
                ctx.id()
            ))
            .into());
        }
        self.writer.write_transaction(&ops)?;
        info!(requisition = %ctx.id(), %from, %to, "status changed");

        if matches!(to, RequisitionStatus::Rejected | RequisitionStatus::Canceled) {
            let released = self.ports.budget.release(&ctx.header, &ctx.items);
            self.best_effort("budget release", ctx.id(), released);
        }
        self.notify(&ctx.header, from, actor, change.reason);
        self.audit(actor, ctx.id(), action);

        Ok(StatusChanged {
            id: ctx.id().to_string(),
            from,
            to,
        })
    }

    /// Route an APPROVED requisition into an outbound movement, a purchase
    /// request and the bag, then move it to PROCESS.
    pub fn process(&self, actor: &Actor, request: ProcessRequest) -> anyhow::Result<ProcessOutcome> {
        if request.id.trim().is_empty() {
            return Err(RequisitionError::NoId.into());
        }
        self.ports
            .authorizer
            .authorize(actor, Entity::Requisition.as_str(), &[Action::Process])?;

        let mut seen = HashSet::with_capacity(request.items.len());
        if let Some(line) = request.items.iter().find(|line| !seen.insert(line.item.as_str())) {
            return Err(RequisitionError::invalid(format!("item {} is duplicated", line.item)).into());
        }

        let mut ctx = RequisitionContext::load(&self.table, &request.id)?;
        if !ctx.status().can_transition_to(RequisitionStatus::Process) {
            return Err(RequisitionError::InvalidTransition {
                from: ctx.status(),
                to: RequisitionStatus::Process,
            }
            .into());
        }
        self.ensure_custodian(actor, &ctx.header)?;

        // Every stored item needs exactly one line
        let lines: HashMap<&str, &ProcessItem> =
            request.items.iter().map(|line| (line.item.as_str(), line)).collect();
        if let Some(extra) = request.items.iter().find(|line| ctx.item(&line.item).is_none()) {
            return Err(RequisitionError::invalid(format!("{} is not an item of {}", extra.item, ctx.id())).into());
        }
        let mut splits = Vec::with_capacity(ctx.items.len());
        for item in &ctx.items {
            let line = lines.get(item.item.as_str()).ok_or_else(|| {
                RequisitionError::invalid(format!("item {} has no processing line", item.item))
            })?;
            splits.push(split_quantity(item.quantity, line.out, line.request)?);
        }

        let ops_count = ctx.items.len() + 1;
        if !self.writer.fits(ops_count) {
            return Err(RequisitionError::invalid(format!(
                "{} has more items than one transaction holds",
                ctx.id()
            ))
            .into());
        }

        // Downstream documents are created before the commit; a failure aborts the operation
        let out_lines: Vec<DraftLine> = ctx
            .items
            .iter()
            .zip(&splits)
            .filter(|(_, split)| split.out > 0)
            .map(|(item, split)| DraftLine {
                item: item.item.clone(),
                quantity: split.out,
            })
            .collect();
        let request_lines: Vec<DraftLine> = ctx
            .items
            .iter()
            .zip(&splits)
            .filter(|(_, split)| split.request > 0)
            .map(|(item, split)| DraftLine {
                item: item.item.clone(),
                quantity: split.request,
            })
            .collect();

        let out = if out_lines.is_empty() {
            None
        } else {
            self.ports
                .workflows
                .create_outbound(&draft(&ctx.header, out_lines))
                .context("outbound movement workflow failed")?
        };
        let purchase = if request_lines.is_empty() {
            None
        } else {
            self.ports
                .workflows
                .create_purchase_request(&draft(&ctx.header, request_lines))
                .context("purchase request workflow failed")?
        };

        let from = ctx.rewrite_status(RequisitionStatus::Process)?;
        ctx.header.process = Some(Signature::of(actor, self.config.business_offset()));
        ctx.header.out = out.clone();
        ctx.header.request = purchase.clone();
        for (item, split) in ctx.items.iter_mut().zip(&splits) {
            if let Some(out) = out.as_ref().filter(|_| split.out > 0) {
                item.associate_out.push(out.clone());
            }
            if let Some(purchase) = purchase.as_ref().filter(|_| split.request > 0) {
                item.associate_request.push(purchase.clone());
            }
            item.bag_quantity = split.bag;
            // nothing left to deliver: no movement event will ever close it
            if item.fulfillment_target() == 0 {
                item.relations = item
                    .relations
                    .with_status(RequisitionStatus::Process, RequisitionStatus::Closed)?;
            }
        }
        let all_bagged = ctx.open_items().next().is_none();
        if all_bagged {
            ctx.rewrite_status(RequisitionStatus::Closed)?;
        }

        let mut ops = vec![ctx.header_op(&[
            Field::Status,
            Field::Relations,
            Field::Process,
            Field::Downstream,
        ])];
        ops.extend(ctx.item_ops(&[Field::Relations, Field::Downstream, Field::Bag]));
        self.writer.write_transaction(&ops)?;
        info!(requisition = %ctx.id(), out = ?out, request = ?purchase, "requisition processed");
        if all_bagged {
            info!(requisition = %ctx.id(), "every item stays in the bag, requisition closed");
        }

        self.fill_bags(&ctx);
        self.notify(&ctx.header, from, actor, None);
        self.audit(actor, ctx.id(), Action::Process);

        Ok(ProcessOutcome {
            id: ctx.id().to_string(),
            request: purchase,
            out,
        })
    }

    /// Add each item's unrouted share to the bag of its frame or project.
    fn fill_bags(&self, ctx: &RequisitionContext) {
        let Some(partition) = bag_partition(&ctx.header) else {
            warn!(requisition = %ctx.id(), "no bag partition for this scope");
            return;
        };
        let leftovers: Vec<BagItem> = ctx
            .items
            .iter()
            .filter(|item| item.bag_quantity > 0)
            .map(|item| BagItem {
                pk: partition.clone(),
                sk: item.item.clone(),
                project: ctx.header.project.clone(),
                snapshot: item.catalog.clone(),
                quantity: item.bag_quantity,
            })
            .collect();

        let results = in_bounded_batches(&leftovers, self.config.enrichment_batch_size, |bag| {
            self.table.increment_bag(bag, bag.quantity)
        });
        for (bag, result) in leftovers.iter().zip(results) {
            if let Some(total) = self.best_effort("bag increment", ctx.id(), result) {
                info!(requisition = %ctx.id(), bag = %bag.pk, item = %bag.sk, total, "bag increased");
            }
        }
    }
}

fn draft(header: &RequisitionHeader, items: Vec<DraftLine>) -> DownstreamDraft {
    DownstreamDraft {
        requisition: header.pk.clone(),
        frame: header.frame.clone(),
        project: header.project.clone(),
        require_date: header.require_date.to_string(),
        motive: header.motive.clone(),
        observations: header.observations.clone(),
        file_extension: header.file_extension.clone(),
        approver_name: header.approval.as_ref().map(|s| s.name.clone()),
        approver_user: header.approval.as_ref().map(|s| s.user.clone()),
        requester_name: header.creator_name.clone(),
        requester_area_name: header.creator_area.clone(),
        requester_position_name: header.creator_position.clone(),
        cost_center: header.cost_center.clone(),
        items,
    }
}
