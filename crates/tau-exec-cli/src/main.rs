mod cli_args;

use anyhow::{Context, Result};
use clap::Parser;
use tau_exec_gateway::{load_exec_gateway_config, run_exec_gateway_server, ExecGatewayConfig};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli_args::Cli;

fn init_tracing(default_level: &str) {
    let default_directive = default_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn resolve_gateway_config(cli: &Cli) -> Result<ExecGatewayConfig> {
    let mut config = load_exec_gateway_config(&cli.config)?;
    if let Some(bind) = &cli.bind {
        config.bind = bind.clone();
    }
    if let Some(shutdown_grace_ms) = cli.shutdown_grace_ms {
        config.shutdown_grace_ms = shutdown_grace_ms;
    }
    config
        .validate()
        .context("invalid exec gateway config after applying command-line overrides")?;
    info!(
        config = %cli.config.display(),
        bind = %config.bind,
        routes = config.routes.len(),
        "loaded exec gateway config"
    );
    Ok(config)
}

fn render_config_summary(config: &ExecGatewayConfig) -> Result<String> {
    let routes = config.provision_routes()?;
    let mut lines = vec![format!(
        "exec gateway config ok: bind={} routes={} shutdown_grace_ms={} status_endpoint={}",
        config.bind,
        routes.len(),
        config.shutdown_grace_ms,
        config.status_endpoint.as_deref().unwrap_or("none")
    )];
    for route in &routes {
        lines.push(format!(
            "route: path={} program={} mode={} pass_thru={} timeout_ms={}",
            route.path,
            route.command.program(),
            route.command.delivery_mode().as_str(),
            route.command.pass_thru(),
            route
                .command
                .timeout()
                .map(|timeout| timeout.as_millis())
                .unwrap_or(0)
        ));
    }
    Ok(lines.join("\n"))
}

async fn run_cli(cli: Cli) -> Result<()> {
    let config = resolve_gateway_config(&cli)?;
    if cli.validate_only {
        println!("{}", render_config_summary(&config)?);
        return Ok(());
    }
    run_exec_gateway_server(config).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    run_cli(cli).await
}
