pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod handler;
pub mod ids;
pub mod model;
pub mod ports;
pub mod query;
pub mod reconcile;
pub mod relation;
pub mod response;
pub mod service;
pub mod status;
pub mod table;
pub mod telemetry;
pub mod transition;
pub mod utils;

pub use config::RequisitionConfig;
pub use error::{ErrorKind, RequisitionError};
pub use handler::{Handler, Operation};
pub use model::{Actor, Record};
pub use ports::Ports;
pub use service::RequisitionService;
pub use status::RequisitionStatus;
