//! 网关：隧道的远端
//!
//! 应答伪装的 HTTP 升级请求，认证会话，然后为每个 yamux 通道拨号目标并转发。

use crate::config::{expand_path, GatewayConfig};
use crate::error::{Result, TunnelError};
use crate::forward::forward;
use crate::handshake::read_headers;
use crate::session::protocol;
use crate::stats::ConnectionStats;
use crate::tls;
use crate::transport::{dial, BoxedStream};
use futures::future::poll_fn;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

/// 读取通道请求的超时（防止慢速攻击）
const CHANNEL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// 拨号目标的超时
const TARGET_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const SWITCHING_RESPONSE: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

/// 网关服务
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    acceptor: Option<TlsAcceptor>,
    stats: ConnectionStats,
}

impl Gateway {
    pub fn new(config: GatewayConfig, acceptor: Option<TlsAcceptor>) -> Self {
        Self {
            config: Arc::new(config),
            acceptor,
            stats: ConnectionStats::new(),
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    /// 绑定配置中的监听地址
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| TunnelError::bind(addr, e))
    }

    /// 在给定的监听器上接受会话，直到 `shutdown` 被取消
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Gateway listening on {} (tls: {}, payload blocks: {})",
            listener.local_addr()?,
            self.acceptor.is_some(),
            self.config.payload_blocks
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Gateway shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    let gateway = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_session(stream, peer_addr, shutdown).await {
                            warn!("Session from {} ended with error: {}", peer_addr, e);
                        }
                    });
                }
            }
        }

        Ok(())
    }

    async fn handle_session(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<()> {
        stream.set_nodelay(true).ok();

        let mut stream: BoxedStream = match &self.acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| TunnelError::tls(format!("TLS accept failed: {}", e)))?;
                let sni = tls_stream.get_ref().1.server_name().unwrap_or("<none>");
                debug!("TLS session from {} with SNI {}", peer_addr, sni);
                Box::pin(tls_stream)
            }
            None => Box::pin(stream),
        };

        let timeout = self.config.handshake_timeout();
        let username = match tokio::time::timeout(timeout, async {
            answer_upgrade(&mut stream, self.config.payload_blocks).await?;
            authenticate_client(&mut stream, &self.config).await
        })
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(TunnelError::handshake(format!(
                "client did not finish the upgrade within {:?}",
                timeout
            ))),
        };

        info!("Session from {} authenticated as '{}'", peer_addr, username);

        let mut yamux_conn = YamuxConnection::new(
            TokioAsyncReadCompatExt::compat(stream),
            YamuxConfig::default(),
            YamuxMode::Server,
        );

        let session_shutdown = shutdown.child_token();
        loop {
            tokio::select! {
                _ = session_shutdown.cancelled() => {
                    if let Err(e) = poll_fn(|cx| yamux_conn.poll_close(cx)).await {
                        debug!("Error while closing session: {}", e);
                    }
                    break;
                }
                inbound = poll_fn(|cx| yamux_conn.poll_next_inbound(cx)) => {
                    match inbound {
                        Some(Ok(stream)) => {
                            let stats = self.stats.clone();
                            let shutdown = session_shutdown.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_channel(stream, stats, shutdown).await {
                                    debug!("Channel ended with error: {}", e);
                                }
                            });
                        }
                        Some(Err(e)) => {
                            error!("Session from {} failed: {}", peer_addr, e);
                            break;
                        }
                        None => {
                            info!("Session from {} closed", peer_addr);
                            break;
                        }
                    }
                }
            }
        }

        // 会话结束时关闭它的所有通道
        session_shutdown.cancel();
        Ok(())
    }
}

/// 应答伪装的升级请求
///
/// `blocks` 为客户端会发送的非空请求块数；0 表示没有升级交换。
pub async fn answer_upgrade<S>(stream: &mut S, blocks: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if blocks == 0 {
        return Ok(());
    }

    let request = read_headers(stream).await?;
    debug!(
        "Upgrade request: {}",
        String::from_utf8_lossy(request.split(|&b| b == b'\r').next().unwrap_or_default())
    );

    let first = if blocks > 1 {
        CONTINUE_RESPONSE
    } else {
        ESTABLISHED_RESPONSE
    };
    stream.write_all(first).await?;
    stream.flush().await?;

    for _ in 1..blocks {
        read_headers(stream).await?;
    }

    stream.write_all(SWITCHING_RESPONSE).await?;
    stream.flush().await?;
    Ok(())
}

async fn authenticate_client<S>(stream: &mut S, config: &GatewayConfig) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match protocol::read_auth_request(stream).await {
        Ok(request) => request,
        Err(e) => {
            protocol::send_error(stream, "malformed authentication request")
                .await
                .ok();
            return Err(e);
        }
    };

    if request.version != protocol::PROTOCOL_VERSION {
        let message = format!(
            "unsupported protocol version {} (expected {})",
            request.version,
            protocol::PROTOCOL_VERSION
        );
        protocol::send_error(stream, &message).await.ok();
        return Err(TunnelError::auth(message));
    }

    if request.username != config.username || request.password != config.password {
        warn!("Authentication failed for user '{}'", request.username);
        protocol::send_error(stream, "invalid credentials").await.ok();
        return Err(TunnelError::auth("invalid credentials"));
    }

    protocol::send_ok(stream).await?;
    Ok(request.username)
}

async fn handle_channel(
    stream: yamux::Stream,
    stats: ConnectionStats,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut stream = FuturesAsyncReadCompatExt::compat(stream);

    let (host, port) =
        match tokio::time::timeout(CHANNEL_REQUEST_TIMEOUT, protocol::read_channel_request(&mut stream))
            .await
        {
            Ok(request) => request?,
            Err(_) => return Err(TunnelError::timeout(CHANNEL_REQUEST_TIMEOUT)),
        };

    let target = match dial(&host, port, TARGET_CONNECT_TIMEOUT).await {
        Ok(target) => target,
        Err(e) => {
            warn!("Channel to {}:{} refused: {}", host, port, e);
            protocol::send_error(&mut stream, &e.to_string()).await.ok();
            return Err(TunnelError::channel(e.to_string()));
        }
    };

    protocol::send_ok(&mut stream).await?;
    debug!("Channel to {}:{} established", host, port);

    let _guard = stats.connection_started();
    let summary = forward(stream, target, stats.clone(), &shutdown).join().await;
    debug!(
        "Channel to {}:{} closed (sent {} bytes, received {} bytes)",
        host, port, summary.sent, summary.received
    );
    Ok(())
}

/// 准备网关的 TLS 接受器；未配置证书时生成临时自签名证书
pub fn build_acceptor(config: &GatewayConfig) -> anyhow::Result<Option<TlsAcceptor>> {
    if !config.tls {
        return Ok(None);
    }
    let (cert_path, key_path) = ensure_gateway_certs(config)?;
    Ok(Some(tls::server_acceptor(&cert_path, &key_path)?))
}

fn ensure_gateway_certs(config: &GatewayConfig) -> anyhow::Result<(PathBuf, PathBuf)> {
    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => Ok((expand_path(cert), expand_path(key))),
        (None, None) => {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let temp_dir = std::env::temp_dir();
            let cert_path = temp_dir.join(format!("payload-tunnel-cert-{}.pem", ts));
            let key_path = temp_dir.join(format!("payload-tunnel-key-{}.pem", ts));

            // 使用绑定地址作为 CN/SAN（若为 0.0.0.0 则回退 localhost）
            let cn = if config.bind_addr == "0.0.0.0" {
                "localhost"
            } else {
                config.bind_addr.as_str()
            };
            tls::generate_self_signed_cert(cn, &[cn.to_string()], &cert_path, &key_path)?;

            info!(
                "Generated self-signed gateway certificate at {:?} and key at {:?}",
                cert_path, key_path
            );
            Ok((cert_path, key_path))
        }
        _ => anyhow::bail!(
            "Both cert_path and key_path must be set, or leave both empty to auto-generate"
        ),
    }
}

/// 按配置绑定并运行网关
pub async fn run_gateway(config: GatewayConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let acceptor = build_acceptor(&config)?;
    let gateway = Gateway::new(config, acceptor);
    let listener = gateway.bind().await?;
    gateway.serve(listener, shutdown).await?;

    let snapshot = gateway.stats().snapshot();
    info!(
        "Gateway stopped: {}",
        serde_json::to_string(&snapshot).unwrap_or_default()
    );
    Ok(())
}
