use std::path::PathBuf;

use dvt_api::{BypassPlugins, OperationKind};
use dvt_error::{DvResult, ErrorCode, err};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// How first-pass rows are written to the target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    #[default]
    Create,
    Update,
    Upsert,
}

impl ImportMode {
    pub fn operation(&self) -> OperationKind {
        match self {
            ImportMode::Create => OperationKind::Create,
            ImportMode::Update => OperationKind::Update,
            ImportMode::Upsert => OperationKind::Upsert,
        }
    }
}

/// The CLI-to-orchestrator contract for one import run.
#[derive(Debug, Clone)]
pub struct OrchestratorRequest {
    pub source_env_url: Option<String>,
    pub target_env_url: String,
    pub schema_path: PathBuf,
    pub data_archive_path: PathBuf,
    pub import_mode: ImportMode,
    pub bypass_plugins: BypassPlugins,
    pub bypass_flows: bool,
    pub continue_on_error: bool,
    pub user_mapping_path: Option<PathBuf>,
    pub strip_owner_fields: bool,
    pub skip_missing_columns: bool,
    pub batch_size: usize,
    pub parallelism: usize,
    pub output_base_path: PathBuf,
    /// One more attempt for rows that failed only on pool exhaustion.
    pub retry_pool_exhaustion: bool,
}

impl OrchestratorRequest {
    pub fn new(
        target_env_url: impl Into<String>,
        schema_path: impl Into<PathBuf>,
        data_archive_path: impl Into<PathBuf>,
        output_base_path: impl Into<PathBuf>,
    ) -> Self {
        OrchestratorRequest {
            source_env_url: None,
            target_env_url: target_env_url.into(),
            schema_path: schema_path.into(),
            data_archive_path: data_archive_path.into(),
            import_mode: ImportMode::default(),
            bypass_plugins: BypassPlugins::default(),
            bypass_flows: false,
            continue_on_error: false,
            user_mapping_path: None,
            strip_owner_fields: false,
            skip_missing_columns: false,
            batch_size: 1000,
            parallelism: 4,
            output_base_path: output_base_path.into(),
            retry_pool_exhaustion: true,
        }
    }

    /// Fails before any I/O on malformed options (CLI exit code 2).
    pub fn validate(&self) -> DvResult<()> {
        if self.target_env_url.is_empty() {
            return err!(ErrorCode::MissingArgument, "target environment url is required");
        }
        if self.batch_size == 0 {
            return err!(ErrorCode::InvalidArgument, "batch size must be greater than zero");
        }
        if self.parallelism == 0 {
            return err!(ErrorCode::InvalidArgument, "parallelism must be greater than zero");
        }
        Ok(())
    }

    /// The flags line recorded in the summary's execution context.
    pub fn flag_summary(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.bypass_plugins != BypassPlugins::None {
            flags.push(format!("--bypass-plugins={}", self.bypass_plugins));
        }
        if self.bypass_flows {
            flags.push("--bypass-flows".to_string());
        }
        if self.continue_on_error {
            flags.push("--continue-on-error".to_string());
        }
        if self.strip_owner_fields {
            flags.push("--strip-owner-fields".to_string());
        }
        if self.skip_missing_columns {
            flags.push("--skip-missing-columns".to_string());
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OrchestratorRequest {
        OrchestratorRequest::new(
            "https://target.crm.dynamics.com",
            "schema.json",
            "archive",
            "out/run",
        )
    }

    #[test]
    fn test_validate_rejects_bad_numbers() {
        let mut bad = request();
        bad.batch_size = 0;
        assert_eq!(bad.validate().unwrap_err().code, ErrorCode::InvalidArgument);

        let mut bad = request();
        bad.parallelism = 0;
        assert!(bad.validate().is_err());

        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_import_mode_mapping() {
        assert_eq!(ImportMode::Create.operation(), OperationKind::Create);
        assert_eq!(ImportMode::Upsert.operation(), OperationKind::Upsert);
        assert_eq!("upsert".parse::<ImportMode>().unwrap(), ImportMode::Upsert);
    }

    #[test]
    fn test_flag_summary() {
        let mut req = request();
        req.continue_on_error = true;
        req.bypass_flows = true;
        assert_eq!(req.flag_summary(), vec!["--bypass-flows", "--continue-on-error"]);
    }
}
