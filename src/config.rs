//! Immutable service configuration.
//!
//! Loaded once from `config/requisition.toml` with `REQUISITION__*`
//! environment overrides (e.g. `REQUISITION__MAX_TRANSACTION_ITEMS=50`),
//! then shared behind an `Arc`.
use crate::status::RequisitionStatus;
use chrono::{FixedOffset, Offset, Utc};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

const CONFIG_FILE: &str = "config/requisition.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequisitionConfig {
    pub database_path: String,
    pub max_transaction_items: usize,
    pub validation_batch_size: usize,
    pub enrichment_batch_size: usize,
    pub allowed_update_statuses: Vec<RequisitionStatus>,
    pub upload_url_ttl_secs: u64,
    pub download_url_ttl_secs: u64,
    pub utc_offset_hours: i32,
}

impl Default for RequisitionConfig {
    fn default() -> Self {
        Self {
            database_path: "data/requisitions.db".to_string(),
            max_transaction_items: 24,
            validation_batch_size: 5,
            enrichment_batch_size: 10,
            allowed_update_statuses: vec![
                RequisitionStatus::PendingApproval,
                RequisitionStatus::Rejected,
            ],
            upload_url_ttl_secs: 360,
            download_url_ttl_secs: 12 * 60 * 60,
            utc_offset_hours: -5,
        }
    }
}

impl RequisitionConfig {
    /// Load from the optional config file and the environment; missing keys keep their defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(
                Environment::with_prefix("REQUISITION")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("allowed_update_statuses")
                    .try_parsing(true),
            )
            .build()?;

        settings
            .try_deserialize::<RequisitionConfig>()
            .map_err(|e| {
                ConfigError::Message(format!("requisition configuration could not be loaded: {e}"))
            })?
            .validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.max_transaction_items < 2 {
            return Err(ConfigError::Message(
                "max_transaction_items must leave room for a header and one item".into(),
            ));
        }
        if self.utc_offset().is_none() {
            return Err(ConfigError::Message(format!(
                "utc_offset_hours {} is out of range",
                self.utc_offset_hours
            )));
        }
        Ok(self)
    }

    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours.checked_mul(3600)?)
    }

    /// Business timezone; UTC when the configured offset is unusable.
    pub fn business_offset(&self) -> FixedOffset {
        self.utc_offset().unwrap_or_else(|| Utc.fix())
    }

    pub fn allows_update(&self, status: RequisitionStatus) -> bool {
        self.allowed_update_statuses.contains(&status)
    }

    pub fn upload_url_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_url_ttl_secs)
    }

    pub fn download_url_ttl(&self) -> Duration {
        Duration::from_secs(self.download_url_ttl_secs)
    }
}
