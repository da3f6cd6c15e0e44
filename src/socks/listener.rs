use super::{detect_version, negotiate, ReplyOutcome};
use crate::config::SocksConfig;
use crate::error::{Result, TunnelError};
use crate::forward::forward;
use crate::session::Session;
use crate::stats::ConnectionStats;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// listen(2) 的 backlog
const LISTEN_BACKLOG: u32 = 100;

/// accept 失败后的退避时间（如文件描述符耗尽）
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// 本地 SOCKS 监听器
pub struct SocksListener {
    listener: TcpListener,
    session: Arc<dyn Session>,
    stats: ConnectionStats,
    handshake_timeout: Duration,
}

impl SocksListener {
    /// 绑定监听地址（开启 SO_REUSEADDR）
    pub async fn bind(
        config: &SocksConfig,
        session: Arc<dyn Session>,
        stats: ConnectionStats,
    ) -> Result<Self> {
        let listen_addr = config.listen_addr();
        let addr = resolve_bind_addr(&config.bind_addr, config.port).await?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| TunnelError::bind(&listen_addr, e))?;

        socket
            .set_reuseaddr(true)
            .map_err(|e| TunnelError::bind(&listen_addr, e))?;
        socket
            .bind(addr)
            .map_err(|e| TunnelError::bind(&listen_addr, e))?;
        let listener = socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| TunnelError::bind(&listen_addr, e))?;

        Ok(Self {
            listener,
            session,
            stats,
            handshake_timeout: config.handshake_timeout(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 接受连接直到 `shutdown` 被取消，每个客户端一个任务
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("SOCKS proxy listening on {}", self.listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SOCKS listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted SOCKS connection from {}", peer_addr);
                            let session = self.session.clone();
                            let stats = self.stats.clone();
                            let shutdown = shutdown.clone();
                            let handshake_timeout = self.handshake_timeout;
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(
                                    stream,
                                    peer_addr,
                                    session,
                                    stats,
                                    handshake_timeout,
                                    shutdown,
                                )
                                .await
                                {
                                    warn!("SOCKS client {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept SOCKS connection: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

async fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let listen_addr = format!("{}:{}", host, port);
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| TunnelError::bind(&listen_addr, e))?;
    addrs.next().ok_or_else(|| {
        TunnelError::bind(
            &listen_addr,
            std::io::Error::new(std::io::ErrorKind::NotFound, "no address to bind"),
        )
    })
}

/// 处理单个 SOCKS 客户端：协商 → 打开通道 → 应答 → 转发
async fn handle_client(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    session: Arc<dyn Session>,
    stats: ConnectionStats,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let _guard = stats.connection_started();
    stream.set_nodelay(true).ok();

    let request = match tokio::time::timeout(handshake_timeout, async {
        let version = detect_version(&stream).await?;
        negotiate(&mut stream, version).await
    })
    .await
    {
        Ok(request) => request?,
        Err(_) => return Err(TunnelError::timeout(handshake_timeout)),
    };

    let host = request.host();
    let port = request.port;
    debug!("{} requested {}", peer_addr, request);

    let channel = match session.open_channel(&host, port).await {
        Ok(channel) => channel,
        Err(e) => {
            let outcome = if e.is_channel() {
                ReplyOutcome::Refused
            } else {
                ReplyOutcome::Failed
            };
            request.reply(&mut stream, outcome).await.ok();
            return Err(e);
        }
    };

    request.reply(&mut stream, ReplyOutcome::Granted).await?;
    info!("{} connected to {}:{}", peer_addr, host, port);

    let summary = forward(stream, channel, stats.clone(), &shutdown)
        .join()
        .await;
    debug!(
        "{} <-> {}:{} closed (sent {} bytes, received {} bytes)",
        peer_addr, host, port, summary.sent, summary.received
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::SOCKS_CMD_BIND;
    use crate::transport::BoxedStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// 直接拨号目标的会话，用于测试监听器
    struct DialSession {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl Session for DialSession {
        async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| TunnelError::channel(e.to_string()))?;
            Ok(Box::pin(stream))
        }
    }

    async fn start_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn start_listener(session: Arc<DialSession>) -> (SocketAddr, CancellationToken) {
        let config = SocksConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            handshake_timeout_secs: 1,
        };
        let listener = SocksListener::bind(&config, session, ConnectionStats::new())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(listener.run(shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_socks5_connect_and_echo() {
        let echo = start_echo().await;
        let session = Arc::new(DialSession {
            opened: AtomicUsize::new(0),
        });
        let (addr, shutdown) = start_listener(session.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
        request.extend_from_slice(&echo.port().to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        client.write_all(b"through the tunnel").await.unwrap();
        let mut buf = [0u8; 18];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the tunnel");

        assert_eq!(session.opened.load(Ordering::SeqCst), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_socks5_bind_opens_no_channel() {
        let session = Arc::new(DialSession {
            opened: AtomicUsize::new(0),
        });
        let (addr, shutdown) = start_listener(session.clone()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        client
            .write_all(&[0x05, SOCKS_CMD_BIND, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x07);

        // 连接随后被关闭
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(session.opened.load(Ordering::SeqCst), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unsupported_version_closes() {
        let session = Arc::new(DialSession {
            opened: AtomicUsize::new(0),
        });
        let (addr, shutdown) = start_listener(session).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_idle_client_times_out() {
        let session = Arc::new(DialSession {
            opened: AtomicUsize::new(0),
        });
        let (addr, shutdown) = start_listener(session).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05]).await.unwrap();

        // handshake_timeout_secs = 1
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("listener should drop the idle client")
            .ok();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_refused_channel_reports_socks4_rejection() {
        let session = Arc::new(DialSession {
            opened: AtomicUsize::new(0),
        });
        let (addr, shutdown) = start_listener(session).await;

        // 找一个没有监听的端口
        let closed_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut request = vec![0x04, 0x01];
        request.extend_from_slice(&closed_port.to_be_bytes());
        request.extend_from_slice(&[127, 0, 0, 1, 0x00]);
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5B);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = SocksConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: taken.local_addr().unwrap().port(),
            handshake_timeout_secs: 1,
        };
        let session = Arc::new(DialSession {
            opened: AtomicUsize::new(0),
        });

        let err = SocksListener::bind(&config, session, ConnectionStats::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TunnelError::Bind { .. }));
    }
}
