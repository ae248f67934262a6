//! Single-table query planner.
//!
//! [`plan`] turns a bag of logical filters into one index lookup: which
//! secondary index to read, how to match its relation string, which columns to
//! return and which rows to drop after the fetch. Rules are tried in order and
//! the first one that matches wins.
use crate::error::RequisitionError;
use crate::model::{BusinessDate, Entity, Record};
use crate::relation::{DELIMITER, IndexName, RelationPart, encode_relation};
use crate::status::RequisitionStatus;
use crate::table::{KeyCondition, Table};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Filters accepted by the query operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    pub project: Option<String>,
    /// Creator user id.
    pub owner: Option<String>,
    pub status: Option<RequisitionStatus>,
    pub start_date: Option<BusinessDate>,
    pub finish_date: Option<BusinessDate>,
    /// Business-facing id, with or without the `REQI` prefix.
    pub id: Option<String>,
    #[serde(rename = "PK")]
    pub pk: Option<String>,
    /// `"R"` asks for the report projection.
    pub type_search: Option<String>,
}

impl SearchFilters {
    pub fn is_report(&self) -> bool {
        self.type_search.as_deref() == Some("R")
    }
}

/// Post-fetch restriction applied to every returned row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// `creationUser == username`, for callers that may only see their own rows.
    CreatedBy(String),
    /// Creator user id.
    Owner(String),
    Status(RequisitionStatus),
}

impl RowFilter {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            RowFilter::CreatedBy(username) => record.creation_user() == Some(username.as_str()),
            RowFilter::Owner(user) => record.creator_id() == Some(user.as_str()),
            RowFilter::Status(status) => record.status() == Some(*status),
        }
    }
}

const LIST_COLUMNS: &[&str] = &[
    "PK",
    "SK",
    "entity",
    "project",
    "projectName",
    "status",
    "creationDate",
    "requireDate",
    "creatorName",
    "creationUser",
    "motive",
    "fileExtension",
];

const REPORT_COLUMNS: &[&str] = &[
    "PK",
    "SK",
    "entity",
    "project",
    "projectName",
    "costCenter",
    "frame",
    "status",
    "creationDate",
    "requireDate",
    "creatorName",
    "creationUser",
    "creatorArea",
    "creatorPosition",
    "motive",
    "observations",
    "reason",
    "approval",
    "cancellation",
    "process",
    "out",
    "request",
    "associate",
    "item",
    "code",
    "name",
    "unit",
    "unitValue",
    "quantity",
    "associatedQuantity",
    "bagQuantity",
];

const SUMMARY_COLUMNS: &[&str] = &[
    "PK",
    "creationDate",
    "project",
    "status",
    "projectName",
    "creatorName",
];

/// Named column sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    List,
    /// Every stored attribute.
    Detail,
    Report,
    Summary,
}

impl Projection {
    fn columns(&self) -> Option<&'static [&'static str]> {
        match self {
            Projection::List => Some(LIST_COLUMNS),
            Projection::Detail => None,
            Projection::Report => Some(REPORT_COLUMNS),
            Projection::Summary => Some(SUMMARY_COLUMNS),
        }
    }

    /// Keep only the projected attributes of a serialized row.
    pub fn apply(&self, value: Value) -> Value {
        let (Some(columns), Value::Object(object)) = (self.columns(), &value) else {
            return value;
        };
        let projected: Map<String, Value> = columns
            .iter()
            .filter_map(|column| object.get(*column).map(|v| (column.to_string(), v.clone())))
            .collect();
        Value::Object(projected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    /// `None` reads the base table.
    pub index: Option<IndexName>,
    pub entity: Entity,
    pub key: KeyCondition,
    pub projection: Projection,
    pub row_filters: Vec<RowFilter>,
}

impl QueryPlan {
    pub fn on_index(index: IndexName, entity: Entity, key: KeyCondition, projection: Projection) -> Self {
        Self {
            index: Some(index),
            entity,
            key,
            projection,
            row_filters: vec![],
        }
    }

    /// Limit results to rows created by `username`.
    pub fn restrict_to(mut self, username: &str) -> Self {
        self.row_filters.push(RowFilter::CreatedBy(username.to_string()));
        self
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.row_filters.push(filter);
        self
    }

    fn keeps(&self, record: &Record) -> bool {
        self.row_filters.iter().all(|filter| filter.matches(record))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn prefix(part: RelationPart<'_>) -> String {
    format!("{}{DELIMITER}", encode_relation([Some(part)]))
}

fn between(lead: Option<RelationPart<'_>>, start: BusinessDate, end: BusinessDate) -> KeyCondition {
    KeyCondition::Between {
        from: encode_relation([lead, Some(RelationPart::Date(start))]),
        to: encode_relation([lead, Some(RelationPart::Date(end))]),
    }
}

/// Id as stored: `12` and `REQI12` both address `REQI12`.
pub fn requisition_pk(id: &str) -> String {
    let prefix = Entity::Requisition.as_str();
    if id.starts_with(prefix) {
        id.to_string()
    } else {
        format!("{prefix}{id}")
    }
}

/// Pick the index and key condition for `filters`.
pub fn plan(filters: &SearchFilters) -> Result<QueryPlan, RequisitionError> {
    let projection = if filters.is_report() {
        Projection::Report
    } else {
        Projection::List
    };
    let project = non_blank(&filters.project);
    let owner = non_blank(&filters.owner);
    let status = filters.status;

    let range = match (filters.start_date, filters.finish_date) {
        (Some(start), Some(finish)) => {
            if start > finish {
                return Err(RequisitionError::invalid(format!(
                    "startDate {start} is after finishDate {finish}"
                )));
            }
            // The end bound is the following day so rows dated `finish` are kept.
            let end = finish
                .next_day()
                .ok_or_else(|| RequisitionError::invalid("finishDate is out of range"))?;
            Some((start, end))
        }
        (None, None) => None,
        _ => {
            return Err(RequisitionError::invalid(
                "startDate and finishDate must be given together",
            ));
        }
    };

    let entity = Entity::Requisition;
    let plan = match (project, owner, status, range) {
        (Some(project), owner, Some(status), None) => {
            let key = KeyCondition::Exact(encode_relation([
                Some(RelationPart::Status(status)),
                Some(RelationPart::Project(project)),
            ]));
            let plan = QueryPlan::on_index(IndexName::ByStatusProject, entity, key, projection);
            match owner {
                Some(owner) => plan.with_filter(RowFilter::Owner(owner.to_string())),
                None => plan,
            }
        }
        (project, owner, status, Some((start, end))) => {
            let mut plan = match (project, owner) {
                (Some(project), owner) => {
                    let key = between(Some(RelationPart::Project(project)), start, end);
                    let plan = QueryPlan::on_index(IndexName::ByProjectDate, entity, key, projection);
                    match owner {
                        Some(owner) => plan.with_filter(RowFilter::Owner(owner.to_string())),
                        None => plan,
                    }
                }
                (None, Some(owner)) => {
                    let key = between(Some(RelationPart::User(owner)), start, end);
                    QueryPlan::on_index(IndexName::ByOwnerDate, entity, key, projection)
                }
                (None, None) => {
                    QueryPlan::on_index(IndexName::ByDate, entity, between(None, start, end), projection)
                }
            };
            if let Some(status) = status {
                plan = plan.with_filter(RowFilter::Status(status));
            }
            plan
        }
        (Some(project), owner, None, None) => {
            let key = KeyCondition::Prefix(prefix(RelationPart::Project(project)));
            let plan = QueryPlan::on_index(IndexName::ByProjectDate, entity, key, projection);
            match owner {
                Some(owner) => plan.with_filter(RowFilter::Owner(owner.to_string())),
                None => plan,
            }
        }
        (None, Some(owner), status, None) => {
            let key = KeyCondition::Prefix(prefix(RelationPart::User(owner)));
            let plan = QueryPlan::on_index(IndexName::ByOwnerDate, entity, key, projection);
            match status {
                Some(status) => plan.with_filter(RowFilter::Status(status)),
                None => plan,
            }
        }
        (None, None, Some(status), None) => {
            let key = KeyCondition::Prefix(prefix(RelationPart::Status(status)));
            QueryPlan::on_index(IndexName::ByStatusProject, entity, key, projection)
        }
        (None, None, None, None) => {
            if let Some(id) = non_blank(&filters.id) {
                let pk = requisition_pk(id);
                QueryPlan {
                    index: None,
                    entity,
                    key: KeyCondition::Partition {
                        sk: Some(pk.clone()),
                        pk,
                    },
                    projection,
                    row_filters: vec![],
                }
            } else if let Some(pk) = non_blank(&filters.pk) {
                QueryPlan {
                    index: None,
                    entity,
                    key: KeyCondition::Partition {
                        pk: pk.to_string(),
                        sk: None,
                    },
                    projection: if filters.is_report() {
                        Projection::Report
                    } else {
                        Projection::Detail
                    },
                    row_filters: vec![],
                }
            } else {
                return Err(RequisitionError::NoSearchParameters);
            }
        }
    };

    debug!(index = ?plan.index, key = ?plan.key, filters = plan.row_filters.len(), "query planned");
    Ok(plan)
}

/// Run a plan and drop the rows its filters reject.
pub fn execute(table: &Table, plan: &QueryPlan) -> anyhow::Result<Vec<Record>> {
    let records = table.scan(plan.index, plan.entity, &plan.key)?;
    Ok(records.into_iter().filter(|record| plan.keeps(record)).collect())
}

/// Serialize rows through the plan's projection.
pub fn project(records: &[Record], projection: Projection) -> anyhow::Result<Vec<Value>> {
    records
        .iter()
        .map(|record| Ok(projection.apply(record.to_json()?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use RequisitionStatus::*;

    fn date(y: i32, m: u32, d: u32) -> BusinessDate {
        BusinessDate::new(y, m, d).unwrap()
    }

    #[test]
    fn no_filters_is_refused() {
        assert!(matches!(
            plan(&SearchFilters::default()),
            Err(RequisitionError::NoSearchParameters)
        ));
        let blank = SearchFilters {
            project: Some("  ".into()),
            ..Default::default()
        };
        assert!(matches!(plan(&blank), Err(RequisitionError::NoSearchParameters)));
    }

    #[test]
    fn project_and_status_is_an_exact_match() {
        let filters = SearchFilters {
            project: Some("PROJ1".into()),
            status: Some(Approved),
            ..Default::default()
        };
        let plan = plan(&filters).unwrap();
        assert_eq!(plan.index, Some(IndexName::ByStatusProject));
        assert_eq!(plan.key, KeyCondition::Exact("APPROVED|PROJ1".into()));
        assert!(plan.row_filters.is_empty());
    }

    #[test]
    fn date_ranges_extend_to_the_next_day() {
        let filters = SearchFilters {
            project: Some("PROJ1".into()),
            owner: Some("USER2".into()),
            status: Some(Rejected),
            start_date: Some(date(2024, 2, 1)),
            finish_date: Some(date(2024, 2, 29)),
            ..Default::default()
        };
        let plan = plan(&filters).unwrap();
        assert_eq!(plan.index, Some(IndexName::ByProjectDate));
        assert_eq!(
            plan.key,
            KeyCondition::Between {
                from: "PROJ1|2024-02-01".into(),
                to: "PROJ1|2024-03-01".into(),
            }
        );
        assert_eq!(
            plan.row_filters,
            vec![RowFilter::Owner("USER2".into()), RowFilter::Status(Rejected)]
        );
    }

    #[test]
    fn owner_and_bare_ranges_pick_their_indexes() {
        let owner = SearchFilters {
            owner: Some("USER2".into()),
            start_date: Some(date(2024, 12, 1)),
            finish_date: Some(date(2024, 12, 31)),
            ..Default::default()
        };
        let plan_owner = plan(&owner).unwrap();
        assert_eq!(plan_owner.index, Some(IndexName::ByOwnerDate));
        assert_eq!(
            plan_owner.key,
            KeyCondition::Between {
                from: "USER2|2024-12-01".into(),
                to: "USER2|2025-01-01".into(),
            }
        );

        let bare = SearchFilters {
            owner: None,
            ..owner
        };
        assert_eq!(plan(&bare).unwrap().index, Some(IndexName::ByDate));
    }

    #[test]
    fn half_open_or_inverted_ranges_are_invalid() {
        let half = SearchFilters {
            start_date: Some(date(2024, 1, 1)),
            ..Default::default()
        };
        assert!(matches!(plan(&half), Err(RequisitionError::InvalidRequest(_))));

        let inverted = SearchFilters {
            start_date: Some(date(2024, 2, 1)),
            finish_date: Some(date(2024, 1, 1)),
            ..Default::default()
        };
        assert!(matches!(plan(&inverted), Err(RequisitionError::InvalidRequest(_))));
    }

    #[test]
    fn single_dimensions_are_prefix_scans() {
        let by_project = SearchFilters {
            project: Some("PROJ1".into()),
            ..Default::default()
        };
        assert_eq!(plan(&by_project).unwrap().key, KeyCondition::Prefix("PROJ1|".into()));

        let by_status = SearchFilters {
            status: Some(PendingApproval),
            ..Default::default()
        };
        let status_plan = plan(&by_status).unwrap();
        assert_eq!(status_plan.index, Some(IndexName::ByStatusProject));
        assert_eq!(status_plan.key, KeyCondition::Prefix("PENDING_APPROVAL|".into()));
    }

    #[test]
    fn ids_read_the_base_table() {
        let by_id = SearchFilters {
            id: Some("12".into()),
            ..Default::default()
        };
        let plan_id = plan(&by_id).unwrap();
        assert_eq!(plan_id.index, None);
        assert_eq!(
            plan_id.key,
            KeyCondition::Partition {
                pk: "REQI12".into(),
                sk: Some("REQI12".into()),
            }
        );

        let by_pk = SearchFilters {
            pk: Some("REQI12".into()),
            type_search: Some("R".into()),
            ..Default::default()
        };
        let plan_pk = plan(&by_pk).unwrap();
        assert_eq!(plan_pk.projection, Projection::Report);
        assert_eq!(
            plan_pk.key,
            KeyCondition::Partition {
                pk: "REQI12".into(),
                sk: None,
            }
        );
    }

    #[test]
    fn projections_drop_unlisted_columns() {
        let row = serde_json::json!({"PK": "REQI1", "status": "APPROVED", "relations": {}});
        let projected = Projection::Summary.apply(row.clone());
        assert_eq!(projected, serde_json::json!({"PK": "REQI1", "status": "APPROVED"}));
        assert_eq!(Projection::Detail.apply(row.clone()), row);
    }

    #[test]
    fn filters_deserialize_from_camel_case() {
        let filters: SearchFilters = serde_json::from_str(
            r#"{"project":"PROJ1","startDate":"2024-01-01","finishDate":"2024-01-31","typeSearch":"R"}"#,
        )
        .unwrap();
        assert!(filters.is_report());
        assert_eq!(filters.start_date, Some(date(2024, 1, 1)));
    }
}
