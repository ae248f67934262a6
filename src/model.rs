//! Row types of the requisition table and their CBOR codec
use crate::error::RequisitionError;
use crate::relation::{IndexName, RelationSet};
use crate::status::RequisitionStatus;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Separates partition and sort key inside row keys. Never part of an id.
pub(crate) const KEY_SEPARATOR: u8 = 0;

/// Entity discriminator. The string form prefixes generated ids.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
pub enum Entity {
    #[n(0)]
    Requisition,
    #[n(1)]
    Item,
    #[n(2)]
    Project,
    #[n(3)]
    Frame,
    #[n(4)]
    Catalog,
    #[n(5)]
    Inventory,
    #[n(6)]
    Bag,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Requisition => "REQI",
            Entity::Item => "ITRQ",
            Entity::Project => "PROJ",
            Entity::Frame => "FRAM",
            Entity::Catalog => "ITEM",
            Entity::Inventory => "INVF",
            Entity::Bag => "BAGF",
        }
    }
}

/// Swap the entity prefix of an id, e.g. `FRAM7` -> `BAGF7`.
pub fn derive_partition(id: &str, from: &str, to: &str) -> Option<String> {
    id.strip_prefix(from).map(|rest| format!("{to}{rest}"))
}

/// Calendar date in `YYYY-MM-DD`, the form embedded in relation strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessDate(NaiveDate);

impl BusinessDate {
    pub fn new(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(BusinessDate)
    }

    pub fn parse(raw: &str) -> Result<Self, RequisitionError> {
        NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map(BusinessDate)
            .map_err(|_| RequisitionError::invalid(format!("{raw:?} is not a YYYY-MM-DD date")))
    }

    pub fn today(offset: FixedOffset) -> Self {
        TimeStamp::new().business_date(offset)
    }

    pub fn next_day(&self) -> Option<Self> {
        self.0.succ_opt().map(BusinessDate)
    }
}

impl fmt::Display for BusinessDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl<C> minicbor::Encode<C> for BusinessDate {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.to_string())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for BusinessDate {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let raw = d.str()?;

        NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map(BusinessDate)
            .map_err(|_| minicbor::decode::Error::message("failed to parse business date"))
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeStamp(DateTime<Utc>);

impl Default for TimeStamp {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeStamp {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(TimeStamp)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    pub fn business_date(&self, offset: FixedOffset) -> BusinessDate {
        BusinessDate(self.0.with_timezone(&offset).date_naive())
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

/// Who did something to a requisition, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    #[n(0)]
    pub user: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub date: BusinessDate,
    #[n(3)]
    pub at: TimeStamp,
}

impl Signature {
    pub fn of(actor: &Actor, offset: FixedOffset) -> Self {
        let at = TimeStamp::new();
        Self {
            user: actor.username.clone(),
            name: actor.name.clone(),
            date: at.business_date(offset),
            at,
        }
    }
}

/// Catalog fields copied onto requisition items and bag rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    #[n(0)]
    pub family: String,
    #[n(1)]
    pub family_name: String,
    #[n(2)]
    pub group: String,
    #[n(3)]
    pub group_name: String,
    #[n(4)]
    #[serde(rename = "type")]
    pub kind: String,
    #[n(5)]
    #[serde(rename = "typeName")]
    pub kind_name: String,
    #[n(6)]
    pub category: String,
    #[n(7)]
    pub category_name: String,
    #[n(8)]
    pub code: String,
    #[n(9)]
    pub name: String,
    #[n(10)]
    pub unit: String,
    #[n(11)]
    pub unit_name: String,
    #[n(12)]
    pub unit_value: u64, // minor currency units
    #[n(13)]
    pub affects_budget: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct RequisitionHeader {
    #[n(0)]
    #[serde(rename = "PK")]
    pub pk: String,
    #[n(1)]
    #[serde(rename = "SK")]
    pub sk: String,
    #[n(2)]
    pub project: String,
    #[n(3)]
    pub project_name: String,
    #[n(4)]
    pub cost_center: Option<String>,
    #[n(5)]
    pub frame: Option<String>,
    #[n(6)]
    pub creator_id: String,
    #[n(7)]
    pub creation_user: String,
    #[n(8)]
    pub creator_name: String,
    #[n(9)]
    pub creator_area: Option<String>,
    #[n(10)]
    pub creator_position: Option<String>,
    #[n(11)]
    pub creation_date: BusinessDate,
    #[n(12)]
    pub require_date: BusinessDate,
    #[n(13)]
    pub motive: String,
    #[n(14)]
    pub observations: Option<String>,
    #[n(15)]
    pub file_extension: Option<String>,
    #[n(16)]
    pub status: RequisitionStatus,
    #[n(17)]
    pub relations: RelationSet,
    #[n(18)]
    pub reason: Option<String>,
    #[n(19)]
    pub approval: Option<Signature>,
    #[n(20)]
    pub cancellation: Option<Signature>,
    #[n(21)]
    pub process: Option<Signature>,
    #[n(22)]
    pub out: Option<String>,
    #[n(23)]
    pub request: Option<String>,
    #[n(24)]
    pub associate: Vec<String>,
    #[n(25)]
    pub version: u64,
}

impl RequisitionHeader {
    /// Object-store key of the optional attachment.
    pub fn attachment_key(&self) -> Option<String> {
        self.file_extension
            .as_ref()
            .map(|ext| attachment_key(&self.pk, ext))
    }
}

pub fn attachment_key(id: &str, extension: &str) -> String {
    format!("{}/{id}_{id}.{extension}", Entity::Requisition.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct RequisitionItem {
    #[n(0)]
    #[serde(rename = "PK")]
    pub pk: String,
    #[n(1)]
    #[serde(rename = "SK")]
    pub sk: String,
    #[n(2)]
    pub item: String, // catalog reference
    #[n(3)]
    #[serde(flatten)]
    pub catalog: CatalogSnapshot,
    #[n(4)]
    pub quantity: u64,
    #[n(5)]
    pub relations: RelationSet,
    #[n(6)]
    pub creator_id: String,
    #[n(7)]
    pub creation_user: String,
    #[n(8)]
    pub creator_name: String,
    #[n(9)]
    pub creation_date: BusinessDate,
    #[n(10)]
    pub associate_out: Vec<String>,
    #[n(11)]
    pub associate_request: Vec<String>,
    #[n(12)]
    pub associate: Vec<String>,
    #[n(13)]
    pub associated_quantity: u64,
    #[n(14)]
    pub bag_quantity: u64,
    #[n(15)]
    pub applied_events: Vec<String>,
    #[n(16)]
    pub version: u64,
}

impl RequisitionItem {
    /// Quantity that downstream movements must deliver; the bag share never moves.
    pub fn fulfillment_target(&self) -> u64 {
        self.quantity.saturating_sub(self.bag_quantity)
    }

    pub fn is_closed(&self) -> bool {
        self.relations.status() == Some(RequisitionStatus::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[n(0)]
    #[serde(rename = "PK")]
    pub pk: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub cost_center: Option<String>,
    #[n(3)]
    pub frame: Option<String>,
    #[n(4)]
    pub controller: String,
    #[n(5)]
    pub storer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[n(0)]
    #[serde(rename = "PK")]
    pub pk: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub storer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    #[n(0)]
    #[serde(rename = "PK")]
    pub pk: String,
    #[n(1)]
    pub frame: Option<String>,
    #[n(2)]
    #[serde(flatten)]
    pub snapshot: CatalogSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    #[n(0)]
    #[serde(rename = "PK")]
    pub pk: String,
    #[n(1)]
    #[serde(rename = "SK")]
    pub sk: String,
    #[n(2)]
    pub quantity: u64,
}

/// Reserved-but-unrouted quantity of one catalog item inside a bag partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
#[serde(rename_all = "camelCase")]
pub struct BagItem {
    #[n(0)]
    #[serde(rename = "PK")]
    pub pk: String,
    #[n(1)]
    #[serde(rename = "SK")]
    pub sk: String,
    #[n(2)]
    pub project: String,
    #[n(3)]
    #[serde(flatten)]
    pub snapshot: CatalogSnapshot,
    #[n(4)]
    pub quantity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Record {
    #[n(0)]
    Requisition(#[n(0)] RequisitionHeader),
    #[n(1)]
    Item(#[n(0)] RequisitionItem),
    #[n(2)]
    Project(#[n(0)] Project),
    #[n(3)]
    Frame(#[n(0)] Frame),
    #[n(4)]
    Catalog(#[n(0)] CatalogItem),
    #[n(5)]
    Inventory(#[n(0)] InventoryItem),
    #[n(6)]
    Bag(#[n(0)] BagItem),
}

impl Record {
    pub fn key(&self) -> (&str, &str) {
        match self {
            Record::Requisition(h) => (&h.pk, &h.sk),
            Record::Item(i) => (&i.pk, &i.sk),
            Record::Project(p) => (&p.pk, &p.pk),
            Record::Frame(f) => (&f.pk, &f.pk),
            Record::Catalog(c) => (&c.pk, &c.pk),
            Record::Inventory(i) => (&i.pk, &i.sk),
            Record::Bag(b) => (&b.pk, &b.sk),
        }
    }

    pub fn entity(&self) -> Entity {
        match self {
            Record::Requisition(_) => Entity::Requisition,
            Record::Item(_) => Entity::Item,
            Record::Project(_) => Entity::Project,
            Record::Frame(_) => Entity::Frame,
            Record::Catalog(_) => Entity::Catalog,
            Record::Inventory(_) => Entity::Inventory,
            Record::Bag(_) => Entity::Bag,
        }
    }

    /// Only requisition rows are version-checked.
    pub fn version(&self) -> Option<u64> {
        match self {
            Record::Requisition(h) => Some(h.version),
            Record::Item(i) => Some(i.version),
            _ => None,
        }
    }

    pub(crate) fn bump_version(&mut self) {
        match self {
            Record::Requisition(h) => h.version += 1,
            Record::Item(i) => i.version += 1,
            _ => {}
        }
    }

    pub fn creation_user(&self) -> Option<&str> {
        match self {
            Record::Requisition(h) => Some(&h.creation_user),
            Record::Item(i) => Some(&i.creation_user),
            _ => None,
        }
    }

    pub fn creator_id(&self) -> Option<&str> {
        match self {
            Record::Requisition(h) => Some(&h.creator_id),
            Record::Item(i) => Some(&i.creator_id),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<RequisitionStatus> {
        match self {
            Record::Requisition(h) => Some(h.status),
            Record::Item(i) => i.relations.status(),
            _ => None,
        }
    }

    /// Secondary-index entries this row projects into.
    pub fn index_entries(&self) -> Vec<(IndexName, String)> {
        match self {
            Record::Requisition(h) => h.relations.entries(),
            Record::Item(i) => i.relations.entries(),
            Record::Project(p) => {
                let mut entries = vec![(IndexName::ByController, format!("{}|{}", p.controller, p.pk))];
                if let Some(storer) = &p.storer {
                    entries.push((IndexName::ByCustodian, format!("{storer}|{}", p.pk)));
                }
                entries
            }
            Record::Frame(f) => vec![(IndexName::ByCustodian, format!("{}|{}", f.storer, f.pk))],
            Record::Catalog(_) | Record::Inventory(_) | Record::Bag(_) => vec![],
        }
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        let mut value = match self {
            Record::Requisition(h) => serde_json::to_value(h)?,
            Record::Item(i) => serde_json::to_value(i)?,
            Record::Project(p) => serde_json::to_value(p)?,
            Record::Frame(f) => serde_json::to_value(f)?,
            Record::Catalog(c) => serde_json::to_value(c)?,
            Record::Inventory(i) => serde_json::to_value(i)?,
            Record::Bag(b) => serde_json::to_value(b)?,
        };
        if let Some(object) = value.as_object_mut() {
            object.insert("entity".into(), self.entity().as_str().into());
        }
        Ok(value)
    }

    pub fn into_header(self) -> Option<RequisitionHeader> {
        match self {
            Record::Requisition(h) => Some(h),
            _ => None,
        }
    }

    pub fn into_item(self) -> Option<RequisitionItem> {
        match self {
            Record::Item(i) => Some(i),
            _ => None,
        }
    }

    pub fn into_project(self) -> Option<Project> {
        match self {
            Record::Project(p) => Some(p),
            _ => None,
        }
    }

    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Record::Frame(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_catalog(self) -> Option<CatalogItem> {
        match self {
            Record::Catalog(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_inventory(self) -> Option<InventoryItem> {
        match self {
            Record::Inventory(i) => Some(i),
            _ => None,
        }
    }

    pub fn into_bag(self) -> Option<BagItem> {
        match self {
            Record::Bag(b) => Some(b),
            _ => None,
        }
    }
}

pub fn row_key(pk: &str, sk: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(pk.len() + sk.len() + 1);
    key.extend_from_slice(pk.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(sk.as_bytes());
    key
}

pub fn partition_prefix(pk: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(pk.len() + 1);
    key.extend_from_slice(pk.as_bytes());
    key.push(KEY_SEPARATOR);
    key
}

pub fn encode_record(record: &Record) -> Result<Vec<u8>, RequisitionError> {
    minicbor::to_vec(record).map_err(|e| RequisitionError::Storage(e.to_string()))
}

pub fn decode_record(bytes: &[u8]) -> Result<Record, RequisitionError> {
    minicbor::decode(bytes).map_err(|e| RequisitionError::Storage(e.to_string()))
}
