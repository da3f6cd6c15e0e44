use super::{dial, TunnelStream};
use crate::error::Result;
use crate::handshake::{HandshakeEngine, TlsWrap};
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::info;

/// HTTP payload 策略：TCP 连接代理，随后执行伪装握手
///
/// 设置了 `tls` 时，握手引擎先以代理主机名为 SNI 包装 TLS。
#[derive(Clone)]
pub struct HttpPayloadStrategy {
    proxy_host: String,
    proxy_port: u16,
    connect_timeout: Duration,
    engine: HandshakeEngine,
    tls: Option<TlsConnector>,
}

impl HttpPayloadStrategy {
    pub fn new(
        proxy_host: String,
        proxy_port: u16,
        connect_timeout: Duration,
        engine: HandshakeEngine,
        tls: Option<TlsConnector>,
    ) -> Self {
        Self {
            proxy_host,
            proxy_port,
            connect_timeout,
            engine,
            tls,
        }
    }

    pub async fn establish(&self) -> Result<TunnelStream> {
        info!(
            "Connecting to proxy {}:{} (tls: {})",
            self.proxy_host,
            self.proxy_port,
            self.tls.is_some()
        );
        let stream = dial(&self.proxy_host, self.proxy_port, self.connect_timeout).await?;

        let wrap = match &self.tls {
            Some(connector) => TlsWrap::Tls {
                connector: connector.clone(),
                server_name: self.proxy_host.clone(),
            },
            None => TlsWrap::None,
        };

        self.engine.perform(TunnelStream::plain(stream), wrap).await
    }
}

impl std::fmt::Debug for HttpPayloadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPayloadStrategy")
            .field("proxy_host", &self.proxy_host)
            .field("proxy_port", &self.proxy_port)
            .field("engine", &self.engine)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
