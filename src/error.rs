//! Error catalog for requisition operations
use crate::relation::RelationError;
use crate::status::RequisitionStatus;
use serde::Serialize;

#[derive(thiserror::Error, Debug)]
pub enum RequisitionError {
    #[error("No valid parameters for the search")]
    NoSearchParameters,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Requisition cannot move from {from} to {to}")]
    InvalidTransition {
        from: RequisitionStatus,
        to: RequisitionStatus,
    },
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("No id was supplied")]
    NoId,
    #[error("The caller has no registered name")]
    NoName,
    #[error("The caller has no registered sector")]
    NoSector,
    #[error("Requisition {0} was not found")]
    RequisitionNotFound(String),
    #[error("Row {0} already exists")]
    DuplicateId(String),
    #[error("Row {pk}/{sk} was modified concurrently")]
    Conflict { pk: String, sk: String },
    #[error(transparent)]
    Relation(#[from] RelationError),
    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Symbolic error kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Success,
    InternalError,
    NoSearchParametersFound,
    InvalidRequest,
    UnauthorizeRequest,
    NoIdFound,
    NoNameFound,
    NoSectorFound,
    ReqiNoFound,
    IdFound,
    Conflict,
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::Success => 200,
            ErrorKind::InternalError => 500,
            ErrorKind::NoSearchParametersFound => 404,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::UnauthorizeRequest => 401,
            ErrorKind::Conflict => 409,
            ErrorKind::NoIdFound
            | ErrorKind::NoNameFound
            | ErrorKind::NoSectorFound
            | ErrorKind::ReqiNoFound
            | ErrorKind::IdFound => 422,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Success => "REQI00",
            ErrorKind::InternalError => "REQI50",
            ErrorKind::NoSearchParametersFound => "REQI40",
            ErrorKind::InvalidRequest => "REQI41",
            ErrorKind::UnauthorizeRequest => "REQI42",
            ErrorKind::NoIdFound => "REQI42",
            ErrorKind::NoNameFound => "REQI43",
            ErrorKind::NoSectorFound => "REQI44",
            ErrorKind::ReqiNoFound => "REQI45",
            ErrorKind::IdFound => "REQI46",
            ErrorKind::Conflict => "REQI47",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::Success => "Success",
            ErrorKind::InternalError => "Internal Error in the service",
            ErrorKind::NoSearchParametersFound => "No valid parameters for the search",
            ErrorKind::InvalidRequest => "The suplied parameters are invalid",
            ErrorKind::UnauthorizeRequest => "You can´t access this function.",
            ErrorKind::NoIdFound => "No id register",
            ErrorKind::NoNameFound => "No name register",
            ErrorKind::NoSectorFound => "No sector register",
            ErrorKind::ReqiNoFound => "Invalid id of requisition",
            ErrorKind::IdFound => "Id already exist",
            ErrorKind::Conflict => "The requisition was modified concurrently",
        }
    }
}

impl RequisitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RequisitionError::NoSearchParameters => ErrorKind::NoSearchParametersFound,
            RequisitionError::InvalidRequest(_) | RequisitionError::InvalidTransition { .. } => {
                ErrorKind::InvalidRequest
            }
            RequisitionError::Unauthorized(_) => ErrorKind::UnauthorizeRequest,
            RequisitionError::NoId => ErrorKind::NoIdFound,
            RequisitionError::NoName => ErrorKind::NoNameFound,
            RequisitionError::NoSector => ErrorKind::NoSectorFound,
            RequisitionError::RequisitionNotFound(_) => ErrorKind::ReqiNoFound,
            RequisitionError::DuplicateId(_) => ErrorKind::IdFound,
            RequisitionError::Conflict { .. } => ErrorKind::Conflict,
            RequisitionError::Relation(_) | RequisitionError::Storage(_) => ErrorKind::InternalError,
        }
    }

    /// An illegal transition is well-formed input the current state refuses, hence 422.
    pub fn status_code(&self) -> u16 {
        match self {
            RequisitionError::InvalidTransition { .. } => 422,
            other => other.kind().status_code(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        RequisitionError::InvalidRequest(reason.into())
    }
}

/// Classify any error raised by a service operation.
pub fn kind_of(err: &anyhow::Error) -> ErrorKind {
    err.downcast_ref::<RequisitionError>()
        .map(RequisitionError::kind)
        .unwrap_or(ErrorKind::InternalError)
}

/// HTTP-style status code of any error raised by a service operation.
pub fn status_code_of(err: &anyhow::Error) -> u16 {
    err.downcast_ref::<RequisitionError>()
        .map(RequisitionError::status_code)
        .unwrap_or(500)
}
