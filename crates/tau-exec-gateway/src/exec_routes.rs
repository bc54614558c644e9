//! Router assembly: one exec middleware per configured route.

use anyhow::Result;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use tau_exec::{ActiveRunSnapshot, CommandDispatcher, ProcessRegistry};

use crate::exec_middleware::exec_middleware;
use crate::gateway_config::{ExecGatewayConfig, ProvisionedRoute, RouteResponseConfig};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Public struct `ExecStatusReport` used across Tau exec components.
pub struct ExecStatusReport {
    pub active_runs: usize,
    pub runs: Vec<ActiveRunSnapshot>,
}

#[derive(Debug, Clone)]
/// Provisioned routes plus the registry every route's runs are tracked in.
pub struct ExecGateway {
    routes: Vec<ProvisionedRoute>,
    status_endpoint: Option<String>,
    registry: ProcessRegistry,
}

impl ExecGateway {
    pub fn from_config(config: &ExecGatewayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            routes: config.provision_routes()?,
            status_endpoint: config.status_endpoint.clone(),
            registry: ProcessRegistry::new(),
        })
    }

    pub fn routes(&self) -> &[ProvisionedRoute] {
        &self.routes
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new();
        for route in &self.routes {
            let dispatcher = CommandDispatcher::new(route.command.clone(), self.registry.clone());
            let respond = route.respond.clone();
            let inner = any(move || {
                let respond = respond.clone();
                async move { route_response(&respond) }
            });
            router = router.route(
                &route.path,
                inner.layer(middleware::from_fn_with_state(dispatcher, exec_middleware)),
            );
        }
        if let Some(status_endpoint) = &self.status_endpoint {
            router = router.route(
                status_endpoint,
                get(handle_exec_status).with_state(self.registry.clone()),
            );
        }
        router
    }
}

async fn handle_exec_status(State(registry): State<ProcessRegistry>) -> Json<ExecStatusReport> {
    let runs = registry.snapshot();
    Json(ExecStatusReport {
        active_runs: runs.len(),
        runs,
    })
}

fn route_response(respond: &RouteResponseConfig) -> Response {
    let status = StatusCode::from_u16(respond.status).unwrap_or(StatusCode::OK);
    let mut response = (status, respond.body.clone()).into_response();
    if let Some(content_type) = respond
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type);
    }
    response
}
