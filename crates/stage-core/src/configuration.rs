//! Typed stage configuration, loaded from the environment variables listed
//! in spec §6. Missing/invalid values are a `Config` error, fatal at
//! startup (spec §7).

use std::time::Duration;

use serde::Deserialize;

use crate::error::CoreError;
use crate::model::Filter;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub start_ledger: u32,
    pub end_ledger: u32,
    pub batch_size: usize,
    pub commit_interval_seconds: u64,
    pub network_passphrase: String,
    pub source_endpoint: String,
    pub port: u16,
    pub health_port: u16,
    pub enable_flowctl: bool,
    pub flowctl_endpoint: String,
    pub flowctl_heartbeat_interval_seconds: u64,
    pub filter_contract_ids: Vec<String>,
    pub filter_event_types: Vec<String>,
    pub filter_asset_codes: Vec<String>,
    pub filter_asset_issuers: Vec<String>,
    pub include_failed: bool,
    pub include_deleted: bool,
    pub include_diagnostics: bool,
    pub checkpoint_path: String,
    pub component_id: String,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            start_ledger: 0,
            end_ledger: 0,
            batch_size: 1000,
            commit_interval_seconds: 30,
            network_passphrase: String::new(),
            source_endpoint: String::new(),
            port: 8080,
            health_port: 8081,
            enable_flowctl: false,
            flowctl_endpoint: String::new(),
            flowctl_heartbeat_interval_seconds: 10,
            filter_contract_ids: Vec::new(),
            filter_event_types: Vec::new(),
            filter_asset_codes: Vec::new(),
            filter_asset_issuers: Vec::new(),
            include_failed: false,
            include_deleted: false,
            include_diagnostics: false,
            checkpoint_path: "./checkpoint.json".to_string(),
            component_id: "stage".to_string(),
        }
    }
}

impl StageConfig {
    /// Loads configuration from the process environment, applying the
    /// documented defaults for everything but `START_LEDGER` on a bounded
    /// run.
    pub fn from_env() -> Result<Self, CoreError> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("filter_contract_ids")
                    .with_list_parse_key("filter_event_types")
                    .with_list_parse_key("filter_asset_codes")
                    .with_list_parse_key("filter_asset_issuers"),
            )
            .build()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        let mut parsed: StageConfig = config
            .try_deserialize()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&mut self) -> Result<(), CoreError> {
        if self.start_ledger == 0 {
            return Err(CoreError::Config(
                "START_LEDGER is required and must be > 0".to_string(),
            ));
        }
        if self.end_ledger != 0 && self.end_ledger < self.start_ledger {
            return Err(CoreError::Config(
                "END_LEDGER must be 0 or >= START_LEDGER".to_string(),
            ));
        }
        if self.component_id.is_empty() {
            self.component_id = format!("stage-{}", uuid_like_suffix());
        }
        Ok(())
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_seconds)
    }

    pub fn flowctl_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.flowctl_heartbeat_interval_seconds)
    }

    /// Compiles the filter env vars into a [`Filter`].
    pub fn filter(&self) -> Filter {
        Filter {
            event_types: self.filter_event_types.clone(),
            contract_ids: self.filter_contract_ids.clone(),
            asset_codes: self.filter_asset_codes.clone(),
            asset_issuers: self.filter_asset_issuers.clone(),
            include_failed: self.include_failed,
            include_deleted: self.include_deleted,
            include_diagnostics: self.include_diagnostics,
        }
    }
}

fn uuid_like_suffix() -> String {
    use rand::Rng;
    let n: u32 = rand::thread_rng().gen();
    format!("{n:08x}")
}
