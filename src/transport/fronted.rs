use super::{dial, TunnelStream};
use crate::error::{Result, TunnelError};
use crate::handshake::{HandshakeEngine, TlsWrap};
use crate::tls;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::info;

/// 域名前置策略
///
/// TCP 连接代理后以 `sni` 完成 TLS 握手（受连接超时约束），再在加密通道上执行伪装握手。
/// 握手引擎不会再次包装 TLS。
#[derive(Clone)]
pub struct SniFrontedStrategy {
    proxy_host: String,
    proxy_port: u16,
    sni: String,
    connect_timeout: Duration,
    engine: HandshakeEngine,
    connector: TlsConnector,
}

impl SniFrontedStrategy {
    pub fn new(
        proxy_host: String,
        proxy_port: u16,
        sni: String,
        connect_timeout: Duration,
        engine: HandshakeEngine,
        connector: TlsConnector,
    ) -> Self {
        Self {
            proxy_host,
            proxy_port,
            sni,
            connect_timeout,
            engine,
            connector,
        }
    }

    pub fn sni(&self) -> &str {
        &self.sni
    }

    pub async fn establish(&self) -> Result<TunnelStream> {
        info!(
            "Connecting to proxy {}:{} with SNI {}",
            self.proxy_host, self.proxy_port, self.sni
        );
        let stream = dial(&self.proxy_host, self.proxy_port, self.connect_timeout).await?;
        let tls_stream = match tokio::time::timeout(
            self.connect_timeout,
            tls::connect(&self.connector, &self.sni, stream),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(TunnelError::tls(format!(
                    "TLS handshake with SNI '{}' timed out after {:?}",
                    self.sni, self.connect_timeout
                )))
            }
        };

        self.engine
            .perform(TunnelStream::encrypted(tls_stream), TlsWrap::None)
            .await
    }
}

impl std::fmt::Debug for SniFrontedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniFrontedStrategy")
            .field("proxy_host", &self.proxy_host)
            .field("proxy_port", &self.proxy_port)
            .field("sni", &self.sni)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
