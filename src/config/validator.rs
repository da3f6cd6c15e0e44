use anyhow::{bail, Result};
use tracing::warn;

use super::{ClientConfig, GatewayConfig, SessionCredentials, SocksConfig, TunnelConfig};
use crate::transport::Mode;

/// 配置验证器 - 负责所有配置验证逻辑，不做任何网络 I/O
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证超时大于 0
    pub fn validate_timeout(secs: u64, context: &str) -> Result<()> {
        if secs == 0 {
            bail!("{}: timeout must be greater than 0", context);
        }
        Ok(())
    }

    /// 验证隧道配置
    pub fn validate_tunnel_config(config: &TunnelConfig) -> Result<()> {
        let mode: Mode = config.mode.parse()?;

        Self::validate_address(&config.target_host, "tunnel.target_host")?;
        Self::validate_port(config.target_port, "tunnel.target_port")?;
        Self::validate_timeout(config.connect_timeout_secs, "tunnel.connect_timeout_secs")?;
        Self::validate_timeout(
            config.handshake_timeout_secs,
            "tunnel.handshake_timeout_secs",
        )?;

        if config.ca_cert_path.is_some() && config.skip_verify {
            warn!("tunnel.ca_cert_path is ignored because skip_verify is enabled");
        }

        match mode {
            Mode::Direct => {
                if !config.payload.is_empty() {
                    warn!("tunnel.payload is ignored in direct mode");
                }
            }
            Mode::HttpPayload | Mode::SniFronted => {
                Self::validate_address(&config.proxy_host, "tunnel.proxy_host")?;
                Self::validate_port(config.proxy_port, "tunnel.proxy_port")?;
                if config.payload.trim().is_empty() {
                    bail!("tunnel.payload cannot be empty in {} mode", mode);
                }
                if !config.payload.contains("[host]") {
                    warn!("tunnel.payload has no [host] placeholder; the target will not be named");
                }
                if mode == Mode::SniFronted && config.proxy_tls {
                    warn!("tunnel.proxy_tls is ignored in sni_fronted mode");
                }
            }
        }

        if mode != Mode::SniFronted && config.front_domain.is_some() {
            warn!("tunnel.front_domain is only used in sni_fronted mode");
        }

        Ok(())
    }

    /// 验证会话认证信息
    pub fn validate_credentials(creds: &SessionCredentials) -> Result<()> {
        if creds.username.trim().is_empty() {
            bail!("session.username cannot be empty");
        }
        Self::validate_timeout(creds.channel_timeout_secs, "session.channel_timeout_secs")?;
        Ok(())
    }

    /// 验证 SOCKS 监听配置
    pub fn validate_socks_config(config: &SocksConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "socks.bind_addr")?;
        Self::validate_port(config.port, "socks.port")?;
        Self::validate_timeout(config.handshake_timeout_secs, "socks.handshake_timeout_secs")?;
        Ok(())
    }

    /// 验证客户端完整配置
    pub fn validate_client_config(config: &ClientConfig) -> Result<()> {
        Self::validate_tunnel_config(&config.tunnel)?;
        Self::validate_credentials(&config.session)?;
        Self::validate_socks_config(&config.socks)?;
        Ok(())
    }

    /// 验证网关配置
    pub fn validate_gateway_config(config: &GatewayConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "gateway.bind_addr")?;
        Self::validate_port(config.bind_port, "gateway.bind_port")?;
        if config.username.trim().is_empty() {
            bail!("gateway.username cannot be empty");
        }
        Self::validate_timeout(
            config.handshake_timeout_secs,
            "gateway.handshake_timeout_secs",
        )?;

        match (&config.cert_path, &config.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted to auto-generate"),
        }

        if !config.tls && (config.cert_path.is_some() || config.key_path.is_some()) {
            warn!("gateway certificates are configured but tls is disabled");
        }

        Ok(())
    }
}
