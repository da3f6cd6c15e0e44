use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::config::{AppConfig, ClientConfig, GatewayConfig};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // o+r 或 g+r
    if mode & 0o044 != 0 {
        warn!(
            "Config file '{}' is readable by group or others (permissions: {:o}); \
             it contains session credentials. Consider: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    config_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = crate::config::expand_path(Path::new(path));

    if expanded.is_absolute() {
        Ok(expanded.to_string_lossy().into_owned())
    } else {
        Ok(std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&expanded)
            .to_string_lossy()
            .into_owned())
    }
}

/// 配置文件类型：含 `[gateway]` 表即为网关配置
fn detect_config_type(config_path: &str) -> Result<&'static str> {
    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read configuration file '{}'", config_path))?;
    let table: toml::Table = toml::from_str(&content).context("Invalid TOML")?;
    Ok(if table.contains_key("gateway") {
        "gateway"
    } else {
        "client"
    })
}

fn client_details(config: &ClientConfig) -> serde_json::Value {
    serde_json::json!({
        "mode": config.tunnel.mode,
        "proxy": format!("{}:{}", config.tunnel.proxy_host, config.tunnel.proxy_port),
        "target": format!("{}:{}", config.tunnel.target_host, config.tunnel.target_port),
        "sni": config.tunnel.sni_host(),
        "username": config.session.username,
        "socks": config.socks.listen_addr(),
    })
}

fn gateway_details(config: &GatewayConfig) -> serde_json::Value {
    serde_json::json!({
        "listen": config.listen_addr(),
        "username": config.username,
        "payload_blocks": config.payload_blocks,
        "tls": config.tls,
        "cert_mode": match (&config.cert_path, &config.key_path) {
            (Some(_), Some(_)) => "files",
            _ => "auto-generate",
        },
    })
}

fn print_details(details: &serde_json::Value) {
    if let Some(map) = details.as_object() {
        for (key, value) in map {
            match value {
                serde_json::Value::String(s) => println!("✓ {}: {}", key, s),
                other => println!("✓ {}: {}", key, other),
            }
        }
    }
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    if !Path::new(config_path).exists() {
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    let config_type = detect_config_type(config_path)?;
    let loaded = match config_type {
        "gateway" => AppConfig::load_gateway_config(config_path).map(|c| gateway_details(&c)),
        _ => AppConfig::load_client_config(config_path).map(|c| client_details(&c)),
    };

    let (valid, error, details) = match loaded {
        Ok(details) => (true, None, details),
        Err(e) => (false, Some(format!("{:#}", e)), serde_json::json!({})),
    };

    if format == "json" {
        let result = CheckResult {
            valid,
            config_type: config_type.to_string(),
            error: error.clone(),
            details,
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if valid {
        println!("✓ Configuration type: {}", config_type);
        print_details(&details);
        println!("\n✓ Configuration is valid!");
    } else if let Some(e) = &error {
        println!("✗ {}", e);
    }

    match error {
        Some(e) => anyhow::bail!("Invalid {} configuration: {}", config_type, e),
        None => Ok(()),
    }
}
