//! axum host surface for request-triggered command execution.
pub mod exec_middleware;
pub mod exec_routes;
pub mod gateway_config;
pub mod request_placeholders;
pub mod server_bootstrap;

pub use exec_middleware::*;
pub use exec_routes::*;
pub use gateway_config::*;
pub use request_placeholders::*;
pub use server_bootstrap::*;
