/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，启动阶段的错误会终止进程，
/// 单个 SOCKS 客户端的错误只影响该连接
use std::io;
use thiserror::Error;

/// Payload Tunnel 的主要错误类型
#[derive(Error, Debug)]
pub enum TunnelError {
    /// 建立 TCP 连接失败
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// TLS 握手、证书或 SNI 错误
    #[error("TLS error: {0}")]
    Tls(String),

    /// 伪装的 HTTP 升级握手未完成
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// 会话认证失败
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// SOCKS 请求格式错误或不支持
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 远端拒绝或无法路由通道
    #[error("Channel error: {0}")]
    Channel(String),

    /// 监听端口绑定失败
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, TunnelError>;

impl TunnelError {
    /// 创建连接失败错误
    pub fn connect(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            addr: addr.into(),
            source,
        }
    }

    /// 创建绑定失败错误
    pub fn bind(addr: impl Into<String>, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            source,
        }
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为认证失败
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// 检查是否为配置错误
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }

    pub fn is_channel(&self) -> bool {
        matches!(self, Self::Channel(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// 启动阶段出现即终止进程的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::Tls(_)
                | Self::Handshake(_)
                | Self::Auth(_)
                | Self::Bind { .. }
                | Self::Config(_)
        )
    }
}
