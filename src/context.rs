//! A requisition header loaded together with its items
use crate::coordinator::{Field, WriteOp};
use crate::error::RequisitionError;
use crate::model::{Record, RequisitionHeader, RequisitionItem};
use crate::query::requisition_pk;
use crate::status::RequisitionStatus;
use crate::table::Table;

#[derive(Debug, Clone)]
pub struct RequisitionContext {
    pub header: RequisitionHeader,
    pub items: Vec<RequisitionItem>,
}

impl RequisitionContext {
    /// Load the whole partition of `id`. The header is the row whose SK equals its PK.
    pub fn load(table: &Table, id: &str) -> anyhow::Result<Self> {
        let id = id.trim();
        if id.is_empty() {
            return Err(RequisitionError::NoId.into());
        }
        let pk = requisition_pk(id);

        let mut header = None;
        let mut items = Vec::new();
        for record in table.partition(&pk)? {
            match record {
                Record::Requisition(h) if h.pk == h.sk => header = Some(h),
                Record::Item(item) => items.push(item),
                _ => {}
            }
        }

        match header {
            Some(header) => Ok(Self { header, items }),
            None => Err(RequisitionError::RequisitionNotFound(pk).into()),
        }
    }

    pub fn id(&self) -> &str {
        &self.header.pk
    }

    pub fn status(&self) -> RequisitionStatus {
        self.header.status
    }

    /// Move the header to `to` and rewrite the status token of the header and
    /// every item. Items already at `to` are left alone. Returns the previous status.
    pub fn rewrite_status(&mut self, to: RequisitionStatus) -> Result<RequisitionStatus, RequisitionError> {
        let from = self.header.status;
        if !from.can_transition_to(to) {
            return Err(RequisitionError::InvalidTransition { from, to });
        }

        let header_relations = self.header.relations.with_status(from, to)?;
        let item_relations = self
            .items
            .iter()
            .map(|item| match item.relations.status().unwrap_or(from) {
                current if current == to => Ok(item.relations.clone()),
                current => item.relations.with_status(current, to),
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.header.relations = header_relations;
        self.header.status = to;
        for (item, relations) in self.items.iter_mut().zip(item_relations) {
            item.relations = relations;
        }
        Ok(from)
    }

    pub fn item(&self, reference: &str) -> Option<&RequisitionItem> {
        self.items.iter().find(|item| item.item == reference)
    }

    pub fn item_mut(&mut self, reference: &str) -> Option<&mut RequisitionItem> {
        self.items.iter_mut().find(|item| item.item == reference)
    }

    pub fn open_items(&self) -> impl Iterator<Item = &RequisitionItem> {
        self.items.iter().filter(|item| !item.is_closed())
    }

    pub fn header_op(&self, fields: &[Field]) -> WriteOp {
        WriteOp::update(Record::Requisition(self.header.clone()), fields)
    }

    pub fn item_ops(&self, fields: &[Field]) -> Vec<WriteOp> {
        self.items
            .iter()
            .map(|item| WriteOp::update(Record::Item(item.clone()), fields))
            .collect()
    }
}
