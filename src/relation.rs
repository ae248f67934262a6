//! Relation strings: the composite sort keys of the secondary indexes.
//!
//! Every requisition row carries the same [`RelationSet`]. Each relation packs
//! status, project, owner and creation date in a fixed order so that a prefix
//! scan selects a dimension and a lexicographic range over the embedded
//! `YYYY-MM-DD` date selects a period. All construction and all status
//! rewrites go through this module.
use crate::model::BusinessDate;
use crate::status::RequisitionStatus;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

pub const DELIMITER: char = '|';

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RelationError {
    #[error("relation {relation:?} does not embed status {status}")]
    StatusTokenMissing {
        relation: String,
        status: RequisitionStatus,
    },
    #[error("relation part {0:?} contains the reserved delimiter")]
    ReservedDelimiter(String),
}

/// Secondary indexes of the table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
pub enum IndexName {
    /// `project|date|user|status`
    #[n(0)]
    ByProjectDate,
    /// `date|user|status`
    #[n(1)]
    ByDate,
    /// `user|date|project|status`
    #[n(2)]
    ByOwnerDate,
    /// `status|project`
    #[n(3)]
    ByStatusProject,
    /// `status|frame`
    #[n(4)]
    ByStatusFrame,
    /// `controller|project`, over project rows
    #[n(5)]
    ByController,
    /// `storer|project-or-frame`, over project and frame rows
    #[n(6)]
    ByCustodian,
}

impl IndexName {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexName::ByProjectDate => "GSI1",
            IndexName::ByDate => "GSI2",
            IndexName::ByOwnerDate => "GSI3",
            IndexName::ByStatusProject => "GSI4",
            IndexName::ByStatusFrame => "GSI5",
            IndexName::ByController => "GSI6",
            IndexName::ByCustodian => "GSI7",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationPart<'a> {
    Project(&'a str),
    Frame(&'a str),
    User(&'a str),
    Status(RequisitionStatus),
    Date(BusinessDate),
}

impl RelationPart<'_> {
    fn render(&self) -> Cow<'_, str> {
        match self {
            RelationPart::Project(s) | RelationPart::Frame(s) | RelationPart::User(s) => {
                Cow::Borrowed(s)
            }
            RelationPart::Status(status) => Cow::Borrowed(status.as_str()),
            RelationPart::Date(date) => Cow::Owned(date.to_string()),
        }
    }
}

/// Join the present parts, in order, with [`DELIMITER`].
pub fn encode_relation<'a>(parts: impl IntoIterator<Item = Option<RelationPart<'a>>>) -> String {
    parts
        .into_iter()
        .flatten()
        .map(|part| part.render().into_owned())
        .collect::<Vec<_>>()
        .join("|")
}

/// Swap the `from` status token for `to`, leaving every other token in place.
pub fn replace_status(
    relation: &str,
    from: RequisitionStatus,
    to: RequisitionStatus,
) -> Result<String, RelationError> {
    let mut found = false;
    let tokens: Vec<&str> = relation
        .split(DELIMITER)
        .map(|token| {
            if token == from.as_str() {
                found = true;
                to.as_str()
            } else {
                token
            }
        })
        .collect();

    if !found {
        return Err(RelationError::StatusTokenMissing {
            relation: relation.to_string(),
            status: from,
        });
    }
    Ok(tokens.join("|"))
}

/// Inputs of a [`RelationSet`].
#[derive(Debug, Clone, Copy)]
pub struct RelationFields<'a> {
    pub project: &'a str,
    pub frame: Option<&'a str>,
    pub user: &'a str,
    pub date: BusinessDate,
    pub status: RequisitionStatus,
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
pub struct RelationSet {
    #[n(0)]
    #[serde(rename = "relation1")]
    pub by_project: String,
    #[n(1)]
    #[serde(rename = "relation2")]
    pub by_date: String,
    #[n(2)]
    #[serde(rename = "relation3")]
    pub by_owner: String,
    #[n(3)]
    #[serde(rename = "relation4")]
    pub by_status: String,
    #[n(4)]
    #[serde(rename = "relation5")]
    pub by_frame: Option<String>,
}

impl RelationSet {
    pub fn build(fields: &RelationFields<'_>) -> Result<Self, RelationError> {
        for part in [Some(fields.project), Some(fields.user), fields.frame]
            .into_iter()
            .flatten()
        {
            if part.contains(DELIMITER) {
                return Err(RelationError::ReservedDelimiter(part.to_string()));
            }
        }

        let project = Some(RelationPart::Project(fields.project));
        let user = Some(RelationPart::User(fields.user));
        let date = Some(RelationPart::Date(fields.date));
        let status = Some(RelationPart::Status(fields.status));

        Ok(Self {
            by_project: encode_relation([project, date, user, status]),
            by_date: encode_relation([date, user, status]),
            by_owner: encode_relation([user, date, project, status]),
            by_status: encode_relation([status, project]),
            by_frame: fields
                .frame
                .map(|frame| encode_relation([status, Some(RelationPart::Frame(frame))])),
        })
    }

    /// Status embedded in the set, read from the status-led relation.
    pub fn status(&self) -> Option<RequisitionStatus> {
        self.by_status
            .split(DELIMITER)
            .next()
            .and_then(|token| token.parse().ok())
    }

    pub fn with_status(
        &self,
        from: RequisitionStatus,
        to: RequisitionStatus,
    ) -> Result<Self, RelationError> {
        Ok(Self {
            by_project: replace_status(&self.by_project, from, to)?,
            by_date: replace_status(&self.by_date, from, to)?,
            by_owner: replace_status(&self.by_owner, from, to)?,
            by_status: replace_status(&self.by_status, from, to)?,
            by_frame: self
                .by_frame
                .as_deref()
                .map(|relation| replace_status(relation, from, to))
                .transpose()?,
        })
    }

    pub fn entries(&self) -> Vec<(IndexName, String)> {
        let mut entries = vec![
            (IndexName::ByProjectDate, self.by_project.clone()),
            (IndexName::ByDate, self.by_date.clone()),
            (IndexName::ByOwnerDate, self.by_owner.clone()),
            (IndexName::ByStatusProject, self.by_status.clone()),
        ];
        if let Some(by_frame) = &self.by_frame {
            entries.push((IndexName::ByStatusFrame, by_frame.clone()));
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RequisitionStatus::*;

    fn fields(frame: Option<&str>) -> RelationFields<'_> {
        RelationFields {
            project: "PROJ1",
            frame,
            user: "USER9",
            date: BusinessDate::new(2024, 5, 17).unwrap(),
            status: PendingApproval,
        }
    }

    #[test]
    fn builds_every_scheme() {
        let set = RelationSet::build(&fields(Some("FRAM2"))).unwrap();

        assert_eq!(set.by_project, "PROJ1|2024-05-17|USER9|PENDING_APPROVAL");
        assert_eq!(set.by_date, "2024-05-17|USER9|PENDING_APPROVAL");
        assert_eq!(set.by_owner, "USER9|2024-05-17|PROJ1|PENDING_APPROVAL");
        assert_eq!(set.by_status, "PENDING_APPROVAL|PROJ1");
        assert_eq!(set.by_frame.as_deref(), Some("PENDING_APPROVAL|FRAM2"));
        assert_eq!(set.status(), Some(PendingApproval));
    }

    #[test]
    fn absent_parts_are_omitted() {
        let relation = encode_relation([
            Some(RelationPart::Project("PROJ1")),
            None,
            Some(RelationPart::Status(Approved)),
        ]);
        assert_eq!(relation, "PROJ1|APPROVED");
    }

    #[test]
    fn status_rewrite_is_token_exact() {
        let set = RelationSet::build(&fields(None)).unwrap();
        let approved = set.with_status(PendingApproval, Approved).unwrap();
        let process = approved.with_status(Approved, Process).unwrap();

        assert_eq!(process.by_project, "PROJ1|2024-05-17|USER9|PROCESS");
        assert_eq!(process.by_status, "PROCESS|PROJ1");
        assert_eq!(process.by_frame, None);
        assert!(!process.by_owner.contains("APPROVED"));
        assert_eq!(process.status(), Some(Process));
    }

    #[test]
    fn missing_status_token_fails_loudly() {
        let set = RelationSet::build(&fields(None)).unwrap();
        let err = set.with_status(Approved, Process).unwrap_err();
        assert!(matches!(
            err,
            RelationError::StatusTokenMissing { status: Approved, .. }
        ));
    }

    #[test]
    fn delimiter_is_reserved() {
        let mut bad = fields(None);
        bad.project = "PROJ|1";
        assert_eq!(
            RelationSet::build(&bad),
            Err(RelationError::ReservedDelimiter("PROJ|1".into()))
        );
    }
}
