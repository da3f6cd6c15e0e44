// 策略工厂 - 根据配置选择隧道建立方式

use super::{DirectStrategy, HttpPayloadStrategy, Mode, SniFrontedStrategy, TunnelStrategy};
use crate::config::{expand_path, TunnelConfig};
use crate::error::{Result, TunnelError};
use crate::handshake::HandshakeEngine;
use crate::tls;
use tokio_rustls::TlsConnector;

/// 根据配置创建隧道策略
///
/// 只做配置解析与 TLS 配置加载，不进行任何网络 I/O；未知的 mode 立即报错。
pub fn create_strategy(config: &TunnelConfig) -> Result<TunnelStrategy> {
    let mode = config.mode()?;

    let strategy = match mode {
        Mode::Direct => TunnelStrategy::Direct(DirectStrategy::new(
            config.target_host.clone(),
            config.target_port,
            config.connect_timeout(),
        )),
        Mode::HttpPayload => {
            let connector = if config.proxy_tls {
                Some(build_connector(config)?)
            } else {
                None
            };
            TunnelStrategy::HttpPayload(HttpPayloadStrategy::new(
                config.proxy_host.clone(),
                config.proxy_port,
                config.connect_timeout(),
                build_engine(config),
                connector,
            ))
        }
        Mode::SniFronted => TunnelStrategy::SniFronted(SniFrontedStrategy::new(
            config.proxy_host.clone(),
            config.proxy_port,
            config.sni_host().to_string(),
            config.connect_timeout(),
            build_engine(config),
            build_connector(config)?,
        )),
    };

    Ok(strategy)
}

fn build_engine(config: &TunnelConfig) -> HandshakeEngine {
    HandshakeEngine::new(
        config.target_host.clone(),
        config.target_port,
        config.payload.clone(),
        config.handshake_timeout(),
    )
}

fn build_connector(config: &TunnelConfig) -> Result<TlsConnector> {
    let ca_path = config.ca_cert_path.as_deref().map(expand_path);
    tls::client_connector(ca_path.as_deref(), config.skip_verify)
        .map_err(|e| TunnelError::tls(format!("{:#}", e)))
}
