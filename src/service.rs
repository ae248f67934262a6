//! Service layer API for requisition operations
use crate::config::RequisitionConfig;
use crate::context::RequisitionContext;
use crate::coordinator::{Field, TransactionWriter, WriteOp};
use crate::error::RequisitionError;
use crate::ids::IdAllocator;
use crate::model::{
    Actor, BusinessDate, CatalogSnapshot, Entity, Frame, Project, Record, RequisitionHeader,
    RequisitionItem, derive_partition,
};
use crate::ports::{Action, Ports, StatusNotice, UrlAccess, Visibility};
use crate::query::{self, Projection, QueryPlan, SearchFilters};
use crate::relation::{IndexName, RelationFields, RelationSet};
use crate::status::RequisitionStatus;
use crate::table::{KeyCondition, Table};
use crate::utils::in_bounded_batches;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One requested catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemLine {
    /// Existing item row when editing; absent for new lines.
    #[serde(rename = "SK", default)]
    pub sk: Option<String>,
    pub item: String,
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub project: String,
    pub require_date: String,
    pub motive: String,
    #[serde(default)]
    pub observations: Option<String>,
    #[serde(default)]
    pub file_extension: Option<String>,
    pub items: Vec<ItemLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub id: String,
    pub require_date: String,
    pub motive: String,
    #[serde(default)]
    pub observations: Option<String>,
    #[serde(default)]
    pub file_extension: Option<String>,
    pub items: Vec<ItemLine>,
}

/// Result of a create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequisitionReceipt {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_url: Option<String>,
}

#[derive(Clone)]
pub struct RequisitionService {
    pub(crate) table: Table,
    pub(crate) writer: TransactionWriter,
    pub(crate) ids: IdAllocator,
    pub(crate) config: Arc<RequisitionConfig>,
    pub(crate) ports: Ports,
}

impl RequisitionService {
    pub fn new(instance: Arc<sled::Db>, config: Arc<RequisitionConfig>, ports: Ports) -> anyhow::Result<Self> {
        let table = Table::open(instance)?;
        Ok(Self {
            writer: TransactionWriter::new(table.clone(), config.max_transaction_items),
            ids: table.ids(),
            table,
            config,
            ports,
        })
    }

    /// Open the database at `config.database_path`.
    pub fn open(config: Arc<RequisitionConfig>, ports: Ports) -> anyhow::Result<Self> {
        let db = sled::open(&config.database_path)
            .with_context(|| format!("opening requisition database at {}", config.database_path))?;
        Self::new(Arc::new(db), config, ports)
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn config(&self) -> &RequisitionConfig {
        &self.config
    }

    /// Load or refresh reference rows (projects, frames, catalog, inventory) owned by sibling services.
    pub fn import_reference(&self, records: Vec<Record>) -> anyhow::Result<()> {
        let ops: Vec<_> = records.into_iter().map(WriteOp::Replace).collect();
        self.writer.write_transaction(&ops)
    }

    /// Create a requisition with its items, PENDING_APPROVAL.
    pub fn create(&self, actor: &Actor, request: CreateRequest) -> anyhow::Result<RequisitionReceipt> {
        let entity = Entity::Requisition.as_str();
        self.ports.authorizer.authorize(actor, entity, &[Action::Create])?;

        if actor.name.trim().is_empty() {
            return Err(RequisitionError::NoName.into());
        }
        let Some(area) = actor.area.as_deref().filter(|area| !area.trim().is_empty()) else {
            return Err(RequisitionError::NoSector.into());
        };

        validate_lines(&request.items)?;
        if let Some(line) = request.items.iter().find(|line| line.sk.is_some()) {
            return Err(RequisitionError::invalid(format!(
                "new requisitions cannot reference existing row {:?}",
                line.sk
            ))
            .into());
        }
        if !self.writer.fits(request.items.len() + 1) {
            return Err(RequisitionError::invalid(format!(
                "a requisition holds at most {} items",
                self.writer.max_items() - 1
            ))
            .into());
        }

        let project = self.project(&request.project)?;
        let require_date = BusinessDate::parse(&request.require_date)?;
        let references: Vec<&str> = request.items.iter().map(|line| line.item.as_str()).collect();
        let snapshots = self.resolve_catalog(&project, &references)?;

        // Allocate ids
        let id = self.ids.allocate(Entity::Requisition)?;
        let item_ids = self.ids.allocate_batch(Entity::Item, request.items.len())?;

        let creation_date = BusinessDate::today(self.config.business_offset());
        let relations = RelationSet::build(&RelationFields {
            project: &project.pk,
            frame: project.frame.as_deref(),
            user: &actor.id,
            date: creation_date,
            status: RequisitionStatus::PendingApproval,
        })?;

        let header = RequisitionHeader {
            pk: id.clone(),
            sk: id.clone(),
            project: project.pk.clone(),
            project_name: project.name.clone(),
            cost_center: project.cost_center.clone(),
            frame: project.frame.clone(),
            creator_id: actor.id.clone(),
            creation_user: actor.username.clone(),
            creator_name: actor.name.clone(),
            creator_area: Some(area.to_string()),
            creator_position: actor.position.clone(),
            creation_date,
            require_date,
            motive: request.motive,
            observations: request.observations,
            file_extension: request.file_extension,
            status: RequisitionStatus::PendingApproval,
            relations,
            reason: None,
            approval: None,
            cancellation: None,
            process: None,
            out: None,
            request: None,
            associate: vec![],
            version: 0,
        };

        let mut ops = Vec::with_capacity(request.items.len() + 1);
        for ((line, snapshot), sk) in request.items.iter().zip(snapshots).zip(item_ids) {
            ops.push(WriteOp::Put(Record::Item(new_item(&header, sk, line, snapshot))));
        }
        ops.insert(0, WriteOp::Put(Record::Requisition(header.clone())));

        self.writer.write_transaction(&ops)?;
        info!(requisition = %id, items = request.items.len(), "requisition created");

        self.audit(actor, &id, Action::Create);
        let upload_url = self.upload_url(&header);
        Ok(RequisitionReceipt { id, upload_url })
    }

    /// Replace the items and editable header fields of a requisition.
    ///
    /// Lines carrying an `SK` update that row, lines without one are added, and
    /// stored items missing from the payload are deleted. A REJECTED
    /// requisition goes back to PENDING_APPROVAL.
    pub fn update(&self, actor: &Actor, request: UpdateRequest) -> anyhow::Result<RequisitionReceipt> {
        if request.id.trim().is_empty() {
            return Err(RequisitionError::NoId.into());
        }
        let visibility =
            self.ports
                .authorizer
                .authorize(actor, Entity::Requisition.as_str(), &[Action::Update])?;

        let mut ctx = RequisitionContext::load(&self.table, &request.id)?;
        if visibility == Visibility::Owns && ctx.header.creation_user != actor.username {
            return Err(RequisitionError::Unauthorized(format!(
                "{} was not created by {}",
                ctx.id(),
                actor.username
            ))
            .into());
        }
        if !self.config.allows_update(ctx.status()) {
            return Err(RequisitionError::invalid(format!(
                "{} cannot be edited while {}",
                ctx.id(),
                ctx.status()
            ))
            .into());
        }

        validate_lines(&request.items)?;
        let stored: HashSet<&str> = ctx.items.iter().map(|item| item.sk.as_str()).collect();
        if let Some(sk) = request
            .items
            .iter()
            .filter_map(|line| line.sk.as_deref())
            .find(|sk| !stored.contains(sk))
        {
            return Err(RequisitionError::invalid(format!("{sk} is not an item of {}", ctx.id())).into());
        }

        let project = self.project(&ctx.header.project)?;
        let references: Vec<&str> = request.items.iter().map(|line| line.item.as_str()).collect();
        let snapshots = self.resolve_catalog(&project, &references)?;

        // Resubmission
        let resubmitted = match ctx.status() {
            RequisitionStatus::Rejected => Some(ctx.rewrite_status(RequisitionStatus::PendingApproval)?),
            _ => None,
        };

        ctx.header.require_date = BusinessDate::parse(&request.require_date)?;
        ctx.header.motive = request.motive;
        ctx.header.observations = request.observations;
        ctx.header.file_extension = request.file_extension;

        let mut header_fields = vec![
            Field::RequireDate,
            Field::Motive,
            Field::Observations,
            Field::FileExtension,
        ];
        if resubmitted.is_some() {
            header_fields.extend([Field::Status, Field::Relations]);
        }

        let kept: HashSet<&str> = request.items.iter().filter_map(|line| line.sk.as_deref()).collect();
        let added = request.items.iter().filter(|line| line.sk.is_none()).count();
        let mut new_ids = self.ids.allocate_batch(Entity::Item, added)?.into_iter();

        let mut ops = vec![ctx.header_op(&header_fields)];
        for (line, snapshot) in request.items.iter().zip(snapshots) {
            match &line.sk {
                Some(sk) => {
                    let Some(item) = ctx.items.iter().find(|item| &item.sk == sk) else {
                        continue;
                    };
                    let mut item = item.clone();
                    item.item = line.item.clone();
                    item.catalog = snapshot;
                    item.quantity = line.quantity;
                    ops.push(WriteOp::update(
                        Record::Item(item),
                        &[Field::Quantity, Field::Catalog, Field::Relations],
                    ));
                }
                None => {
                    let sk = new_ids.next().context("item id batch ran short")?;
                    ops.push(WriteOp::Put(Record::Item(new_item(&ctx.header, sk, line, snapshot))));
                }
            }
        }
        for item in ctx.items.iter().filter(|item| !kept.contains(item.sk.as_str())) {
            ops.push(WriteOp::delete_item(item));
        }

        if !self.writer.fits(ops.len()) {
            return Err(RequisitionError::invalid(format!(
                "the change touches {} rows, more than one transaction holds",
                ops.len()
            ))
            .into());
        }
        self.writer.write_transaction(&ops)?;
        info!(requisition = %ctx.id(), rows = ops.len(), "requisition updated");

        self.audit(actor, ctx.id(), Action::Update);
        if let Some(from) = resubmitted {
            self.notify(&ctx.header, from, actor, None);
        }
        Ok(RequisitionReceipt {
            id: ctx.id().to_string(),
            upload_url: self.upload_url(&ctx.header),
        })
    }

    /// Search requisitions; attached files come back as read URLs under `fileUrl`.
    pub fn query(&self, actor: &Actor, filters: &SearchFilters) -> anyhow::Result<Vec<Value>> {
        let actions: &[Action] = if filters.is_report() {
            &[Action::Report]
        } else {
            &[Action::Update, Action::Print]
        };
        let visibility = self
            .ports
            .authorizer
            .authorize(actor, Entity::Requisition.as_str(), actions)?;

        let mut plan = query::plan(filters)?;
        if visibility == Visibility::Owns {
            plan = plan.restrict_to(&actor.username);
        }
        self.run(&plan)
    }

    /// PENDING_APPROVAL requisitions of every project the caller controls.
    pub fn pending_approval(&self, actor: &Actor) -> anyhow::Result<Vec<Value>> {
        self.ports
            .authorizer
            .authorize(actor, Entity::Requisition.as_str(), &[Action::Approve])?;

        let projects = self.table.scan(
            Some(IndexName::ByController),
            Entity::Project,
            &KeyCondition::Prefix(format!("{}|", actor.id)),
        )?;
        debug!(projects = projects.len(), controller = %actor.id, "listing pending approvals");

        let mut rows = Vec::new();
        for project in projects.into_iter().filter_map(Record::into_project) {
            let plan = QueryPlan::on_index(
                IndexName::ByStatusProject,
                Entity::Requisition,
                KeyCondition::Exact(format!("{}|{}", RequisitionStatus::PendingApproval, project.pk)),
                Projection::Summary,
            );
            rows.extend(query::execute(&self.table, &plan)?);
        }
        query::project(&rows, Projection::Summary)
    }

    /// APPROVED requisitions in every frame and project the caller keeps stock for.
    pub fn ready_to_process(&self, actor: &Actor) -> anyhow::Result<Vec<Value>> {
        self.ports
            .authorizer
            .authorize(actor, Entity::Requisition.as_str(), &[Action::Process])?;

        let custody = KeyCondition::Prefix(format!("{}|", actor.id));
        let frames = self.table.scan(Some(IndexName::ByCustodian), Entity::Frame, &custody)?;
        let projects = self.table.scan(Some(IndexName::ByCustodian), Entity::Project, &custody)?;

        let approved = RequisitionStatus::Approved;
        let mut plans = Vec::new();
        for frame in frames.into_iter().filter_map(Record::into_frame) {
            plans.push(QueryPlan::on_index(
                IndexName::ByStatusFrame,
                Entity::Requisition,
                KeyCondition::Exact(format!("{approved}|{}", frame.pk)),
                Projection::Summary,
            ));
        }
        for project in projects.into_iter().filter_map(Record::into_project) {
            plans.push(QueryPlan::on_index(
                IndexName::ByStatusProject,
                Entity::Requisition,
                KeyCondition::Exact(format!("{approved}|{}", project.pk)),
                Projection::Summary,
            ));
        }

        // A frame-scoped requisition also shows up under its project.
        let mut unique = BTreeMap::new();
        for plan in &plans {
            for record in query::execute(&self.table, plan)? {
                unique.entry(record.key().0.to_string()).or_insert(record);
            }
        }
        let rows: Vec<Record> = unique.into_values().collect();
        query::project(&rows, Projection::Summary)
    }

    /// Header and items of a requisition, each item with the stock on hand as `inventoryQuantity`.
    pub fn process_detail(&self, actor: &Actor, id: &str) -> anyhow::Result<Value> {
        self.ports
            .authorizer
            .authorize(actor, Entity::Requisition.as_str(), &[Action::Process])?;

        let ctx = RequisitionContext::load(&self.table, id)?;
        self.ensure_custodian(actor, &ctx.header)?;

        let inventory = inventory_partition(&ctx.header);
        let quantities = in_bounded_batches(&ctx.items, self.config.enrichment_batch_size, |item| {
            let Some(partition) = &inventory else {
                return Ok(0);
            };
            Ok(self
                .table
                .get(partition, &item.item)?
                .and_then(Record::into_inventory)
                .map(|row| row.quantity)
                .unwrap_or(0))
        });

        let mut items = Vec::with_capacity(ctx.items.len());
        for (item, quantity) in ctx.items.iter().zip(quantities) {
            let quantity = quantity.unwrap_or_else(|e| {
                warn!(requisition = %ctx.id(), item = %item.item, error = %e, "inventory lookup failed");
                0
            });
            let mut value = Record::Item(item.clone()).to_json()?;
            if let Some(object) = value.as_object_mut() {
                object.insert("inventoryQuantity".into(), quantity.into());
            }
            items.push(value);
        }

        let mut detail = Record::Requisition(ctx.header.clone()).to_json()?;
        if let Some(object) = detail.as_object_mut() {
            object.insert("items".into(), Value::Array(items));
        }
        Ok(detail)
    }

    pub(crate) fn run(&self, plan: &QueryPlan) -> anyhow::Result<Vec<Value>> {
        let records = query::execute(&self.table, plan)?;
        let mut rows = query::project(&records, plan.projection)?;

        for (record, row) in records.iter().zip(rows.iter_mut()) {
            let Record::Requisition(header) = record else {
                continue;
            };
            if let (Some(url), Some(object)) = (self.download_url(header), row.as_object_mut()) {
                object.insert("fileUrl".into(), url.into());
            }
        }
        Ok(rows)
    }

    pub(crate) fn project(&self, pk: &str) -> anyhow::Result<Project> {
        self.table
            .get(pk, pk)?
            .and_then(Record::into_project)
            .ok_or_else(|| RequisitionError::invalid(format!("project {pk} does not exist")).into())
    }

    fn frame(&self, pk: &str) -> anyhow::Result<Frame> {
        self.table
            .get(pk, pk)?
            .and_then(Record::into_frame)
            .ok_or_else(|| RequisitionError::invalid(format!("frame {pk} does not exist")).into())
    }

    /// The caller must be the project's controller.
    pub(crate) fn ensure_controller(&self, actor: &Actor, header: &RequisitionHeader) -> anyhow::Result<()> {
        let project = self.project(&header.project)?;
        if project.controller != actor.id {
            return Err(RequisitionError::Unauthorized(format!(
                "{} does not control project {}",
                actor.username, project.pk
            ))
            .into());
        }
        Ok(())
    }

    /// The caller must keep stock for the requisition's frame, or its project when it has none.
    pub(crate) fn ensure_custodian(&self, actor: &Actor, header: &RequisitionHeader) -> anyhow::Result<()> {
        let storer = match &header.frame {
            Some(frame) => Some(self.frame(frame)?.storer),
            None => self.project(&header.project)?.storer,
        };
        if storer.as_deref() != Some(actor.id.as_str()) {
            return Err(RequisitionError::Unauthorized(format!(
                "{} does not keep stock for {}",
                actor.username,
                header.frame.as_deref().unwrap_or(&header.project)
            ))
            .into());
        }
        Ok(())
    }

    /// Look catalog items up in bounded concurrent batches; any failure fails the whole call.
    fn resolve_catalog(&self, project: &Project, references: &[&str]) -> anyhow::Result<Vec<CatalogSnapshot>> {
        let results = in_bounded_batches(references, self.config.validation_batch_size, |reference| {
            let catalog = self
                .table
                .get(reference, reference)?
                .and_then(Record::into_catalog)
                .ok_or_else(|| RequisitionError::invalid(format!("catalog item {reference} does not exist")))?;

            if catalog.frame.is_some() && catalog.frame != project.frame {
                return Err(RequisitionError::invalid(format!(
                    "catalog item {reference} is outside the frame of project {}",
                    project.pk
                ))
                .into());
            }
            Ok(catalog.snapshot)
        });

        results.into_iter().collect()
    }

    fn upload_url(&self, header: &RequisitionHeader) -> Option<String> {
        let key = header.attachment_key()?;
        self.best_effort(
            "upload url",
            &header.pk,
            self.ports
                .signer
                .signed_url(&key, UrlAccess::Write, self.config.upload_url_ttl()),
        )
    }

    fn download_url(&self, header: &RequisitionHeader) -> Option<String> {
        let key = header.attachment_key()?;
        self.best_effort(
            "download url",
            &header.pk,
            self.ports
                .signer
                .signed_url(&key, UrlAccess::Read, self.config.download_url_ttl()),
        )
    }

    pub(crate) fn audit(&self, actor: &Actor, id: &str, action: Action) {
        let result = self
            .ports
            .audit
            .record(actor, Entity::Requisition.as_str(), id, action);
        self.best_effort("audit", id, result);
    }

    pub(crate) fn notify(
        &self,
        header: &RequisitionHeader,
        from: RequisitionStatus,
        actor: &Actor,
        reason: Option<String>,
    ) {
        let notice = StatusNotice {
            requisition: header.pk.clone(),
            project: header.project.clone(),
            from,
            to: header.status,
            actor: actor.username.clone(),
            reason,
        };
        let result = self.ports.notifier.status_changed(&notice);
        self.best_effort("notification", &header.pk, result);
    }

    /// Post-commit side effects: log failures, never undo the commit.
    pub(crate) fn best_effort<T>(&self, what: &str, requisition: &str, result: anyhow::Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(requisition, error = %e, "{what} failed after commit");
                None
            }
        }
    }
}

/// Reject empty payloads, zero quantities and repeated catalog references.
fn validate_lines(lines: &[ItemLine]) -> Result<(), RequisitionError> {
    if lines.is_empty() {
        return Err(RequisitionError::invalid("a requisition needs at least one item"));
    }
    let mut seen = HashSet::with_capacity(lines.len());
    for line in lines {
        if line.item.trim().is_empty() {
            return Err(RequisitionError::invalid("item reference is blank"));
        }
        if line.quantity == 0 {
            return Err(RequisitionError::invalid(format!("item {} has no quantity", line.item)));
        }
        if !seen.insert(line.item.as_str()) {
            return Err(RequisitionError::invalid(format!("item {} is duplicated", line.item)));
        }
    }
    Ok(())
}

fn new_item(header: &RequisitionHeader, sk: String, line: &ItemLine, catalog: CatalogSnapshot) -> RequisitionItem {
    RequisitionItem {
        pk: header.pk.clone(),
        sk,
        item: line.item.clone(),
        catalog,
        quantity: line.quantity,
        relations: header.relations.clone(),
        creator_id: header.creator_id.clone(),
        creation_user: header.creation_user.clone(),
        creator_name: header.creator_name.clone(),
        creation_date: header.creation_date,
        associate_out: vec![],
        associate_request: vec![],
        associate: vec![],
        associated_quantity: 0,
        bag_quantity: 0,
        applied_events: vec![],
        version: 0,
    }
}

/// `FRAM7` stocks from `INVF7`, a frameless `PROJ3` from `INVP3`.
pub(crate) fn inventory_partition(header: &RequisitionHeader) -> Option<String> {
    match &header.frame {
        Some(frame) => derive_partition(frame, Entity::Frame.as_str(), Entity::Inventory.as_str()),
        None => derive_partition(&header.project, Entity::Project.as_str(), "INVP"),
    }
}

/// `FRAM7` keeps leftovers in `BAGF7`, a frameless `PROJ3` in `BAGP3`.
pub(crate) fn bag_partition(header: &RequisitionHeader) -> Option<String> {
    match &header.frame {
        Some(frame) => derive_partition(frame, Entity::Frame.as_str(), Entity::Bag.as_str()),
        None => derive_partition(&header.project, Entity::Project.as_str(), "BAGP"),
    }
}
