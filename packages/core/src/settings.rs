use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Where the artifact goes and which commands produce and activate it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    /// File the rendered artifact is written to
    pub target: PathBuf,

    /// Reads the expanded document on stdin, writes the artifact to stdout
    pub transform: String,

    /// Checks the candidate artifact, whose path is in `$FILE`
    #[serde(default)]
    pub validate: Option<String>,

    /// Activates the written artifact
    #[serde(default)]
    pub reload: Option<String>,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Shell used to run command lines, `$SHELL` or `/bin/sh` if unset
    #[serde(default)]
    pub shell: Option<String>,
}

fn default_command_timeout_secs() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

impl PipelineSettings {
    pub fn new(target: impl Into<PathBuf>, transform: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            transform: transform.into(),
            validate: None,
            reload: None,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            shell: None,
        }
    }

    pub fn with_validate(mut self, command: impl Into<String>) -> Self {
        self.validate = Some(command.into());
        self
    }

    pub fn with_reload(mut self, command: impl Into<String>) -> Self {
        self.reload = Some(command.into());
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_secs = timeout.as_secs();
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Validate command, treating a blank one as absent
    pub fn validate_command(&self) -> Option<&str> {
        non_blank(self.validate.as_deref())
    }

    /// Reload command, treating a blank one as absent
    pub fn reload_command(&self) -> Option<&str> {
        non_blank(self.reload.as_deref())
    }

    /// Reject settings the pipeline can never run with
    pub fn check(&self) -> ConfigResult<()> {
        if self.transform.trim().is_empty() {
            return Err(ConfigError::Settings(
                "transform command must not be empty".to_string(),
            ));
        }
        if self.target.as_os_str().is_empty() {
            return Err(ConfigError::Settings(
                "target path must not be empty".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Settings(
                "command timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_blank(command: Option<&str>) -> Option<&str> {
    command.filter(|command| !command.trim().is_empty())
}
