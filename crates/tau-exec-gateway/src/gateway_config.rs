//! JSON route configuration for the exec gateway.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::http::{HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use tau_exec::{CommandDescriptor, ProvisionedCommand};

pub const EXEC_GATEWAY_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_EXEC_GATEWAY_BIND: &str = "127.0.0.1:8787";
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

fn default_bind() -> String {
    DEFAULT_EXEC_GATEWAY_BIND.to_string()
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

fn default_respond_status() -> u16 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `ExecGatewayConfig` used across Tau exec components.
pub struct ExecGatewayConfig {
    pub schema_version: u32,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub status_endpoint: Option<String>,
    #[serde(default)]
    pub routes: Vec<ExecRouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One path bound to one command descriptor.
pub struct ExecRouteConfig {
    pub path: String,
    pub command: CommandDescriptor,
    /// Response of the inner handler reached through pass-through.
    #[serde(default)]
    pub respond: Option<RouteResponseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `RouteResponseConfig` used across Tau exec components.
pub struct RouteResponseConfig {
    #[serde(default = "default_respond_status")]
    pub status: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl Default for RouteResponseConfig {
    fn default() -> Self {
        Self {
            status: default_respond_status(),
            body: String::new(),
            content_type: None,
        }
    }
}

#[derive(Debug, Clone)]
/// A route whose descriptor has been validated and provisioned.
pub struct ProvisionedRoute {
    pub path: String,
    pub command: ProvisionedCommand,
    pub respond: RouteResponseConfig,
}

impl ExecGatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != EXEC_GATEWAY_SCHEMA_VERSION {
            bail!(
                "unsupported exec gateway schema_version {} (expected {})",
                self.schema_version,
                EXEC_GATEWAY_SCHEMA_VERSION
            );
        }
        self.bind_addr()?;
        if self.routes.is_empty() {
            bail!("exec gateway config must declare at least one route");
        }

        let mut seen = BTreeSet::new();
        for route in &self.routes {
            validate_path("route path", &route.path)?;
            if !seen.insert(route.path.as_str()) {
                bail!("duplicate route path '{}'", route.path);
            }
            route
                .command
                .validate()
                .with_context(|| format!("invalid command for route '{}'", route.path))?;
            if let Some(respond) = &route.respond {
                validate_respond(&route.path, respond)?;
            }
        }

        if let Some(status_endpoint) = &self.status_endpoint {
            validate_path("status_endpoint", status_endpoint)?;
            if seen.contains(status_endpoint.as_str()) {
                bail!("status_endpoint '{status_endpoint}' collides with a route path");
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid exec gateway bind '{}'", self.bind))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Provisions every route once; the result is shared read-only by all triggers.
    pub fn provision_routes(&self) -> Result<Vec<ProvisionedRoute>> {
        self.routes
            .iter()
            .map(|route| {
                let command = ProvisionedCommand::provision(&route.path, route.command.clone())
                    .with_context(|| format!("failed to provision route '{}'", route.path))?;
                Ok(ProvisionedRoute {
                    path: route.path.clone(),
                    command,
                    respond: route.respond.clone().unwrap_or_default(),
                })
            })
            .collect()
    }
}

fn validate_path(label: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("{label} '{path}' must start with '/'");
    }
    Ok(())
}

fn validate_respond(path: &str, respond: &RouteResponseConfig) -> Result<()> {
    if StatusCode::from_u16(respond.status).is_err() {
        bail!(
            "invalid respond.status {} for route '{}'",
            respond.status,
            path
        );
    }
    if let Some(content_type) = &respond.content_type {
        HeaderValue::from_str(content_type).with_context(|| {
            format!("invalid respond.content_type '{content_type}' for route '{path}'")
        })?;
    }
    Ok(())
}

pub fn parse_exec_gateway_config(raw: &str) -> Result<ExecGatewayConfig> {
    let parsed = serde_json::from_str::<ExecGatewayConfig>(raw)
        .context("failed to parse exec gateway config")?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn load_exec_gateway_config(path: &Path) -> Result<ExecGatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read exec gateway config {}", path.display()))?;
    parse_exec_gateway_config(&raw)
        .with_context(|| format!("invalid exec gateway config {}", path.display()))
}
