//! Shared fixtures: a temp-dir database seeded with reference rows and
//! recording doubles for every port.
#![allow(dead_code)]

use requisition_ledger::model::{
    Actor, CatalogItem, CatalogSnapshot, Frame, InventoryItem, Project, Record, RequisitionHeader,
    RequisitionItem,
};
use requisition_ledger::ports::{
    Action, AuditLog, Authorizer, BudgetLedger, DocumentWorkflows, DownstreamDraft, Notifier,
    Ports, StatusNotice, UrlAccess, UrlSigner, Visibility,
};
use requisition_ledger::{RequisitionConfig, RequisitionError, RequisitionService};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

pub const CONTROLLER: &str = "USER_CTRL";
pub const STORER: &str = "USER_STORE";

/// Grants everything unless told otherwise.
#[derive(Default)]
pub struct TestAuthorizer {
    owns_only: Mutex<HashSet<String>>,
    denied: Mutex<HashSet<(String, Action)>>,
}

impl TestAuthorizer {
    pub fn restrict_to_own(&self, username: &str) {
        self.owns_only.lock().unwrap().insert(username.to_string());
    }

    pub fn deny(&self, username: &str, action: Action) {
        self.denied.lock().unwrap().insert((username.to_string(), action));
    }
}

impl Authorizer for TestAuthorizer {
    fn authorize(&self, actor: &Actor, entity: &str, actions: &[Action]) -> anyhow::Result<Visibility> {
        let denied = self.denied.lock().unwrap();
        if actions
            .iter()
            .all(|action| denied.contains(&(actor.username.clone(), *action)))
        {
            return Err(RequisitionError::Unauthorized(format!("{} on {entity}", actor.username)).into());
        }
        if self.owns_only.lock().unwrap().contains(&actor.username) {
            Ok(Visibility::Owns)
        } else {
            Ok(Visibility::All)
        }
    }
}

#[derive(Default)]
pub struct RecordingAudit {
    pub entries: Mutex<Vec<(String, Action)>>,
}

impl AuditLog for RecordingAudit {
    fn record(&self, _actor: &Actor, _entity: &str, id: &str, action: Action) -> anyhow::Result<()> {
        self.entries.lock().unwrap().push((id.to_string(), action));
        Ok(())
    }
}

pub struct FakeSigner;

impl UrlSigner for FakeSigner {
    fn signed_url(&self, key: &str, access: UrlAccess, ttl: Duration) -> anyhow::Result<String> {
        Ok(format!(
            "https://files.test/{key}?access={access:?}&ttl={}",
            ttl.as_secs()
        ))
    }
}

/// Records notices; can be told to fail to exercise best-effort handling.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<StatusNotice>>,
    pub fail: AtomicBool,
}

impl Notifier for RecordingNotifier {
    fn status_changed(&self, notice: &StatusNotice) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("mail relay unavailable");
        }
        self.notices.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBudget {
    pub released: Mutex<Vec<String>>,
}

impl BudgetLedger for RecordingBudget {
    fn release(&self, header: &RequisitionHeader, _items: &[RequisitionItem]) -> anyhow::Result<()> {
        self.released.lock().unwrap().push(header.pk.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeWorkflows {
    pub outbound: Mutex<Vec<DownstreamDraft>>,
    pub requests: Mutex<Vec<DownstreamDraft>>,
    pub fail: AtomicBool,
    issued: AtomicUsize,
}

impl FakeWorkflows {
    fn next(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.issued.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl DocumentWorkflows for FakeWorkflows {
    fn create_outbound(&self, draft: &DownstreamDraft) -> anyhow::Result<Option<String>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("outbound workflow timed out");
        }
        self.outbound.lock().unwrap().push(draft.clone());
        Ok(Some(self.next("OUMO")))
    }

    fn create_purchase_request(&self, draft: &DownstreamDraft) -> anyhow::Result<Option<String>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("purchase workflow timed out");
        }
        self.requests.lock().unwrap().push(draft.clone());
        Ok(Some(self.next("PURQ")))
    }
}

pub struct Harness {
    _dir: TempDir,
    pub service: RequisitionService,
    pub authorizer: Arc<TestAuthorizer>,
    pub audit: Arc<RecordingAudit>,
    pub notifier: Arc<RecordingNotifier>,
    pub budget: Arc<RecordingBudget>,
    pub workflows: Arc<FakeWorkflows>,
}

pub fn harness() -> anyhow::Result<Harness> {
    harness_with(RequisitionConfig::default())
}

pub fn harness_with(config: RequisitionConfig) -> anyhow::Result<Harness> {
    // sled locks its directory, so every test gets its own database
    let dir = tempdir()?;
    let db = Arc::new(sled::open(dir.path().join("requisitions.db"))?);

    let authorizer = Arc::new(TestAuthorizer::default());
    let audit = Arc::new(RecordingAudit::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let budget = Arc::new(RecordingBudget::default());
    let workflows = Arc::new(FakeWorkflows::default());
    let ports = Ports {
        authorizer: authorizer.clone(),
        audit: audit.clone(),
        signer: Arc::new(FakeSigner),
        notifier: notifier.clone(),
        budget: budget.clone(),
        workflows: workflows.clone(),
    };

    let service = RequisitionService::new(db, Arc::new(config), ports)?;
    service.import_reference(reference_rows())?;

    Ok(Harness {
        _dir: dir,
        service,
        authorizer,
        audit,
        notifier,
        budget,
        workflows,
    })
}

fn snapshot(code: &str, name: &str) -> CatalogSnapshot {
    CatalogSnapshot {
        family: "FAM1".into(),
        family_name: "Hardware".into(),
        group: "GRP1".into(),
        group_name: "Fasteners".into(),
        kind: "TYP1".into(),
        kind_name: "Consumable".into(),
        category: "CAT1".into(),
        category_name: "General".into(),
        code: code.into(),
        name: name.into(),
        unit: "UN".into(),
        unit_name: "Unit".into(),
        unit_value: 1_250,
        affects_budget: true,
    }
}

/// PROJ1 sits in frame FRAM1; PROJ2 has no frame and keeps its own stock.
fn reference_rows() -> Vec<Record> {
    vec![
        Record::Project(Project {
            pk: "PROJ1".into(),
            name: "North Bridge".into(),
            cost_center: Some("CC10".into()),
            frame: Some("FRAM1".into()),
            controller: CONTROLLER.into(),
            storer: None,
        }),
        Record::Project(Project {
            pk: "PROJ2".into(),
            name: "Depot Works".into(),
            cost_center: None,
            frame: None,
            controller: CONTROLLER.into(),
            storer: Some(STORER.into()),
        }),
        Record::Frame(Frame {
            pk: "FRAM1".into(),
            name: "Civil works 2024".into(),
            storer: STORER.into(),
        }),
        Record::Frame(Frame {
            pk: "FRAM2".into(),
            name: "Electrical 2024".into(),
            storer: "USER_OTHER".into(),
        }),
        Record::Catalog(CatalogItem {
            pk: "ITEM1".into(),
            frame: Some("FRAM1".into()),
            snapshot: snapshot("B-100", "Anchor bolt"),
        }),
        Record::Catalog(CatalogItem {
            pk: "ITEM2".into(),
            frame: Some("FRAM1".into()),
            snapshot: snapshot("W-200", "Washer"),
        }),
        Record::Catalog(CatalogItem {
            pk: "ITEM3".into(),
            frame: None,
            snapshot: snapshot("G-300", "Work gloves"),
        }),
        Record::Catalog(CatalogItem {
            pk: "ITEM9".into(),
            frame: Some("FRAM2".into()),
            snapshot: snapshot("C-900", "Cable tray"),
        }),
        Record::Inventory(InventoryItem {
            pk: "INVF1".into(),
            sk: "ITEM1".into(),
            quantity: 7,
        }),
    ]
}

pub fn actor(id: &str, username: &str) -> Actor {
    Actor {
        id: id.into(),
        username: username.into(),
        name: format!("{username} display"),
        area: Some("Works".into()),
        position: Some("Foreman".into()),
    }
}

pub fn requester() -> Actor {
    actor("USER_REQ", "rita")
}

pub fn controller() -> Actor {
    actor(CONTROLLER, "carl")
}

pub fn storer() -> Actor {
    actor(STORER, "sam")
}

/// The error kind behind a service failure.
pub fn error_of(err: &anyhow::Error) -> &RequisitionError {
    err.downcast_ref::<RequisitionError>()
        .unwrap_or_else(|| panic!("expected a requisition error, got {err:?}"))
}
