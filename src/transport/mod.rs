mod direct;
mod factory;
mod fronted;
mod payload;

pub use direct::DirectStrategy;
pub use factory::create_strategy;
pub use fronted::SniFrontedStrategy;
pub use payload::HttpPayloadStrategy;

use crate::error::{Result, TunnelError};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Keepalive 首次探测时间
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
/// Keepalive 探测间隔
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// 双向字节流抽象
///
/// 原始 TCP、TLS 包装后的连接以及多路复用的子通道都实现该 trait，
/// 各层之间只传递这一种类型。
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 类型擦除后的双向流
pub type BoxedStream = Pin<Box<dyn Transport>>;

/// 隧道建立方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 直接 TCP 连接目标
    Direct,
    /// TCP 连接代理后发送伪装 payload
    HttpPayload,
    /// TLS（伪造 SNI）连接代理后发送伪装 payload
    SniFronted,
}

impl Mode {
    pub const VALID: &'static [&'static str] = &["direct", "http_payload", "sni_fronted"];
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Direct => write!(f, "direct"),
            Mode::HttpPayload => write!(f, "http_payload"),
            Mode::SniFronted => write!(f, "sni_fronted"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "http_payload" => Ok(Self::HttpPayload),
            "sni_fronted" => Ok(Self::SniFronted),
            _ => Err(TunnelError::config(format!(
                "Unknown mode '{}'. Valid choices: {}",
                s,
                Mode::VALID.join(", ")
            ))),
        }
    }
}

/// 隧道建立策略的输出：一条原始隧道流
///
/// 记录该流是否已经过 TLS 加密，握手引擎据此拒绝重复包装。
pub struct TunnelStream {
    inner: BoxedStream,
    encrypted: bool,
}

impl TunnelStream {
    /// 未加密的流
    pub fn plain<T: Transport>(stream: T) -> Self {
        Self {
            inner: Box::pin(stream),
            encrypted: false,
        }
    }

    /// 已完成 TLS 握手的流
    pub fn encrypted<T: Transport>(stream: T) -> Self {
        Self {
            inner: Box::pin(stream),
            encrypted: true,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

/// 隧道建立策略
///
/// 启动时根据 mode 选定，除所持配置外无状态。
#[derive(Debug)]
pub enum TunnelStrategy {
    Direct(DirectStrategy),
    HttpPayload(HttpPayloadStrategy),
    SniFronted(SniFrontedStrategy),
}

impl TunnelStrategy {
    /// 建立隧道，返回可直接承载会话的原始流
    pub async fn establish(&self) -> Result<TunnelStream> {
        match self {
            TunnelStrategy::Direct(strategy) => strategy.establish().await,
            TunnelStrategy::HttpPayload(strategy) => strategy.establish().await,
            TunnelStrategy::SniFronted(strategy) => strategy.establish().await,
        }
    }

    pub fn mode(&self) -> Mode {
        match self {
            TunnelStrategy::Direct(_) => Mode::Direct,
            TunnelStrategy::HttpPayload(_) => Mode::HttpPayload,
            TunnelStrategy::SniFronted(_) => Mode::SniFronted,
        }
    }
}

/// 建立 TCP 连接，带超时并开启 TCP_NODELAY 与 keepalive
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    debug!("Dialing {}", addr);

    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(TunnelError::connect(addr, e)),
        Err(_) => {
            return Err(TunnelError::connect(
                addr,
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", timeout),
                ),
            ))
        }
    };

    stream.set_nodelay(true)?;
    enable_keepalive(&stream);

    Ok(stream)
}

fn enable_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_mode_from_str() {
        assert_eq!("direct".parse::<Mode>().unwrap(), Mode::Direct);
        assert_eq!("HTTP_PAYLOAD".parse::<Mode>().unwrap(), Mode::HttpPayload);
        assert_eq!("Sni_Fronted".parse::<Mode>().unwrap(), Mode::SniFronted);
    }

    #[test]
    fn test_mode_is_not_trimmed() {
        assert!(" direct ".parse::<Mode>().unwrap_err().is_config());
    }

    #[test]
    fn test_unknown_mode_lists_choices() {
        let err = "socks".parse::<Mode>().unwrap_err();
        assert!(err.is_config());
        assert_eq!(
            err.to_string(),
            "Configuration error: Unknown mode 'socks'. Valid choices: direct, http_payload, sni_fronted"
        );
    }

    #[test]
    fn test_mode_display_roundtrip() {
        for mode in [Mode::Direct, Mode::HttpPayload, Mode::SniFronted] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
    }

    #[tokio::test]
    async fn test_tunnel_stream_passthrough() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut stream = TunnelStream::plain(a);
        assert!(!stream.is_encrypted());

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_dial_refused_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dial("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Connect { .. }));
    }
}
