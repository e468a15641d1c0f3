//! Runner context for a session.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Adapter selected when `RUNNER_ADAPTER` is unset.
pub const DEFAULT_ADAPTER: &str = "claude";

/// Heartbeat interval used when `HEARTBEAT_INTERVAL_SECS` is unset.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;

/// Buffered lines that trigger a flush when `FLUSH_THRESHOLD` is unset.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10;

/// Configuration error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Runtime context shared with the orchestrator and adapters.
///
/// Everything is supplied by the host environment before the session starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerContext {
    pub session_id: String,
    pub workflow_id: Option<String>,
    pub workspace_slug: Option<String>,
    pub runner_adapter: String,

    /// Control channel address.
    pub ws_url: String,
    /// Bearer credential for the control channel.
    pub auth_token: String,

    /// S3 bucket holding session archives.
    pub s3_bucket: Option<String>,
    /// Key prefix inside the bucket.
    pub s3_prefix: Option<String>,
    /// Custom S3-compatible endpoint, e.g. a MinIO URL.
    pub s3_endpoint: Option<String>,
    pub aws_region: Option<String>,
    pub aws_access_key_id: Option<String>,
    #[serde(skip_serializing, default)]
    pub aws_secret_access_key: Option<String>,

    /// Local archive root, used when S3 archiving is not configured.
    pub archive_dir: Option<PathBuf>,
    /// Key prefix inside the local archive.
    pub archive_prefix: String,

    pub input_repo: Option<String>,
    pub input_branch: Option<String>,
    pub output_repo: Option<String>,
    pub output_branch: Option<String>,

    pub heartbeat_interval: Duration,
    pub flush_threshold: usize,
}

impl RunnerContext {
    /// Create a context with only the required fields set.
    #[must_use]
    pub fn new(session_id: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            workflow_id: None,
            workspace_slug: None,
            runner_adapter: DEFAULT_ADAPTER.to_string(),
            ws_url: ws_url.into(),
            auth_token: String::new(),
            s3_bucket: None,
            s3_prefix: None,
            s3_endpoint: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            archive_dir: None,
            archive_prefix: String::new(),
            input_repo: None,
            input_branch: None,
            output_repo: None,
            output_branch: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    /// Read the context from process environment variables.
    ///
    /// # Errors
    /// Returns error if a required variable is missing or a number is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the context from an arbitrary variable lookup.
    ///
    /// Blank values are treated as unset.
    ///
    /// # Errors
    /// Returns error if a required variable is missing or a number is malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let session_id = get("SESSION_ID").ok_or(ConfigError::Missing("SESSION_ID"))?;
        let ws_url = get("WS_URL").ok_or(ConfigError::Missing("WS_URL"))?;

        let heartbeat_secs = match get("HEARTBEAT_INTERVAL_SECS") {
            Some(raw) => parse_number::<u64>("HEARTBEAT_INTERVAL_SECS", &raw)?,
            None => DEFAULT_HEARTBEAT_SECS,
        };
        let flush_threshold = match get("FLUSH_THRESHOLD") {
            Some(raw) => parse_number::<usize>("FLUSH_THRESHOLD", &raw)?,
            None => DEFAULT_FLUSH_THRESHOLD,
        };
        if flush_threshold == 0 {
            return Err(ConfigError::Invalid {
                name: "FLUSH_THRESHOLD",
                value: "0".into(),
            });
        }

        Ok(Self {
            session_id,
            workflow_id: get("WORKFLOW_ID"),
            workspace_slug: get("WORKSPACE_SLUG"),
            runner_adapter: get("RUNNER_ADAPTER").unwrap_or_else(|| DEFAULT_ADAPTER.to_string()),
            ws_url,
            auth_token: get("AUTH_TOKEN").unwrap_or_default(),
            s3_bucket: get("S3_BUCKET"),
            s3_prefix: get("S3_PREFIX"),
            s3_endpoint: get("S3_ENDPOINT"),
            aws_region: get("AWS_REGION"),
            aws_access_key_id: get("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: get("AWS_SECRET_ACCESS_KEY"),
            archive_dir: get("ARCHIVE_DIR").map(PathBuf::from),
            archive_prefix: get("ARCHIVE_PREFIX").unwrap_or_default(),
            input_repo: get("INPUT_REPO"),
            input_branch: get("INPUT_BRANCH"),
            output_repo: get("OUTPUT_REPO"),
            output_branch: get("OUTPUT_BRANCH"),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            flush_threshold,
        })
    }

    /// Bucket and prefix of the S3 archive; `None` unless both are set.
    #[must_use]
    pub fn s3_archive(&self) -> Option<(&str, &str)> {
        Some((self.s3_bucket.as_deref()?, self.s3_prefix.as_deref()?))
    }

    /// Payload of the session's `init` envelope.
    #[must_use]
    pub fn init_payload(&self, runner_version: &str) -> Value {
        json!({
            "runnerVersion": runner_version,
            "adapter": self.runner_adapter,
            "repo": self.input_repo,
            "branch": self.input_branch,
            "outputRepo": self.output_repo,
            "outputBranch": self.output_branch,
            "workflowId": self.workflow_id,
            "workspaceSlug": self.workspace_slug,
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Invalid {
        name,
        value: raw.to_string(),
    })
}
