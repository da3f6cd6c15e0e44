use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{client, config::AppConfig, gateway};

use super::cert;
use super::config::{check_config, check_config_file_permissions, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template {
            template_type,
            output,
        } => {
            template::generate_config_template(template_type, output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
        Commands::Client { config } => {
            run_client(config).await?;
        }
        Commands::Gateway { config } => {
            run_gateway(config).await?;
        }
    }

    Ok(())
}

/// 收到 Ctrl+C 时取消返回的令牌
fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
        token.cancel();
    });
    shutdown
}

/// Run tunnel client
async fn run_client(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    check_config_file_permissions(&config_path)?;

    info!("Loading client configuration from: {}", config_path);
    let client_config = AppConfig::load_client_config(&config_path)?;

    client::run_client(client_config, shutdown_on_ctrl_c())
        .await
        .context("Tunnel client failed")?;
    Ok(())
}

/// Run tunnel gateway
async fn run_gateway(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;
    check_config_file_permissions(&config_path)?;

    info!("Loading gateway configuration from: {}", config_path);
    let gateway_config = AppConfig::load_gateway_config(&config_path)?;

    gateway::run_gateway(gateway_config, shutdown_on_ctrl_c()).await
}
