//! Command descriptor configuration, validation, and one-time provisioning.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_COMMAND_TIMEOUT: &str = "10s";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `CommandDescriptor` used across Tau exec components.
///
/// Wire names mirror the handler configuration surface: `command`, `args`,
/// `directory`, `timeout`, `foreground`, `stream`, `pass_thru`.
pub struct CommandDescriptor {
    #[serde(rename = "command")]
    pub program: String,
    #[serde(default, rename = "args")]
    pub arg_templates: Vec<String>,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub foreground: bool,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub pass_thru: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Enumerates configuration errors raised while validating a descriptor.
pub enum DescriptorError {
    #[error("command is required")]
    EmptyProgram,
    #[error("invalid timeout '{value}': {reason}")]
    InvalidTimeout { value: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates the three mutually exclusive delivery strategies.
pub enum DeliveryMode {
    Detached,
    Collected,
    Streamed,
}

impl DeliveryMode {
    /// Streaming wins over foreground; neither flag means fire-and-forget.
    pub fn from_flags(stream: bool, foreground: bool) -> Self {
        if stream {
            Self::Streamed
        } else if foreground {
            Self::Collected
        } else {
            Self::Detached
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detached => "detached",
            Self::Collected => "collected",
            Self::Streamed => "streamed",
        }
    }
}

impl CommandDescriptor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arg_templates = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.program.trim().is_empty() {
            return Err(DescriptorError::EmptyProgram);
        }
        self.parse_timeout()?;
        Ok(())
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::from_flags(self.stream, self.foreground)
    }

    fn parse_timeout(&self) -> Result<Option<Duration>, DescriptorError> {
        let raw = self.timeout.as_deref().unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let parsed = parse_timeout(raw).map_err(|reason| DescriptorError::InvalidTimeout {
            value: raw.to_string(),
            reason,
        })?;
        Ok((!parsed.is_zero()).then_some(parsed))
    }
}

/// Parses duration strings such as `"250ms"`, `"1m30s"`, or `"2h 15min"`.
///
/// A bare `"0"` is accepted without a unit and means unbounded.
pub fn parse_timeout(raw: &str) -> Result<Duration, String> {
    let trimmed = raw.trim();
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(trimmed).map_err(|error| error.to_string())
}

#[derive(Debug, Clone)]
/// A validated descriptor with its timeout computed and its log identity bound.
///
/// Built once per configuration load and shared read-only across triggers.
pub struct ProvisionedCommand {
    handler: String,
    descriptor: CommandDescriptor,
    timeout: Option<Duration>,
}

impl ProvisionedCommand {
    pub fn provision(
        handler: impl Into<String>,
        descriptor: CommandDescriptor,
    ) -> Result<Self, DescriptorError> {
        descriptor.validate()?;
        let timeout = descriptor.parse_timeout()?;
        let handler = handler.into();
        tracing::debug!(
            handler = %handler,
            program = %descriptor.program,
            mode = descriptor.delivery_mode().as_str(),
            pass_thru = descriptor.pass_thru,
            timeout_ms = timeout.map(|value| value.as_millis() as u64).unwrap_or(0),
            "provisioned exec handler"
        );
        Ok(Self {
            handler,
            descriptor,
            timeout,
        })
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    pub fn program(&self) -> &str {
        &self.descriptor.program
    }

    pub fn arg_templates(&self) -> &[String] {
        &self.descriptor.arg_templates
    }

    /// `None` when the working directory is inherited from the host.
    pub fn directory(&self) -> Option<PathBuf> {
        let directory = self.descriptor.directory.trim();
        (!directory.is_empty()).then(|| PathBuf::from(directory))
    }

    /// `None` means the run is unbounded.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.descriptor.delivery_mode()
    }

    pub fn pass_thru(&self) -> bool {
        self.descriptor.pass_thru
    }
}
