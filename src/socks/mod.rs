//! 本地 SOCKS4/4a/5 代理
//!
//! 只支持 CONNECT 命令；SOCKS5 不做认证。

mod listener;
pub mod v4;
pub mod v5;

pub use listener::SocksListener;

use crate::error::{Result, TunnelError};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;

pub const SOCKS_VER_4: u8 = 4;
pub const SOCKS_VER_5: u8 = 5;
pub const SOCKS_CMD_CONNECT: u8 = 1;
pub const SOCKS_CMD_BIND: u8 = 2;
pub const SOCKS_CMD_UDP_ASSOCIATE: u8 = 3;

/// 命令字节的可读名称，用于拒绝时的错误信息
pub fn command_name(command: u8) -> &'static str {
    match command {
        SOCKS_CMD_CONNECT => "CONNECT",
        SOCKS_CMD_BIND => "BIND",
        SOCKS_CMD_UDP_ASSOCIATE => "UDP ASSOCIATE",
        _ => "unknown",
    }
}

/// NUL 结尾字段（user-id、4a 域名）的最大长度
pub const MAX_NUL_FIELD: usize = 255;

/// 目标地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    /// 传给会话 `open_channel` 的主机名
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip) => ip.to_string(),
            TargetAddr::Ipv6(ip) => ip.to_string(),
            TargetAddr::Domain(domain) => domain.clone(),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Ipv6(ip) => write!(f, "[{}]", ip),
            TargetAddr::Domain(domain) => write!(f, "{}", domain),
        }
    }
}

/// 解析后的 CONNECT 请求
///
/// `dst_ip` 保留 SOCKS4 请求头中的原始 4 字节地址，用于应答。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: u8,
    pub addr: TargetAddr,
    pub port: u16,
    pub dst_ip: [u8; 4],
}

/// 应答结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Granted,
    /// 通道被远端拒绝
    Refused,
    /// 其他失败
    Failed,
}

impl SocksRequest {
    pub fn host(&self) -> String {
        self.addr.host()
    }

    /// 发送应答；消费请求本身，保证每个连接只应答一次
    pub async fn reply<S>(self, stream: &mut S, outcome: ReplyOutcome) -> Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        match self.version {
            SOCKS_VER_4 => {
                let granted = outcome == ReplyOutcome::Granted;
                v4::send_reply(stream, granted, self.port, self.dst_ip).await
            }
            _ => {
                let rep = match outcome {
                    ReplyOutcome::Granted => v5::REP_SUCCEEDED,
                    ReplyOutcome::Refused => v5::REP_CONNECTION_REFUSED,
                    ReplyOutcome::Failed => v5::REP_GENERAL_FAILURE,
                };
                v5::send_reply(stream, rep).await
            }
        }
    }
}

impl fmt::Display for SocksRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SOCKS{} {}:{}", self.version, self.addr, self.port)
    }
}

/// 在不消费数据的前提下读取第一个字节（协议版本）
pub async fn detect_version(stream: &TcpStream) -> Result<u8> {
    let mut buf = [0u8; 1];
    let n = stream.peek(&mut buf).await?;
    if n == 0 {
        return Err(TunnelError::protocol("client closed before sending a version"));
    }
    Ok(buf[0])
}

/// 按版本号分发到对应的协议解析
pub async fn negotiate<S>(stream: &mut S, version: u8) -> Result<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match version {
        SOCKS_VER_4 => v4::read_request(stream).await,
        SOCKS_VER_5 => {
            v5::negotiate_methods(stream).await?;
            v5::read_request(stream).await
        }
        other => Err(TunnelError::protocol(format!(
            "unsupported SOCKS version {:#04x}",
            other
        ))),
    }
}

/// 读取 NUL 结尾的字段，不包含结尾的 NUL
pub(crate) async fn read_nul_terminated<S>(stream: &mut S, what: &str) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut field = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(field);
        }
        if field.len() >= MAX_NUL_FIELD {
            return Err(TunnelError::protocol(format!(
                "{} exceeds {} bytes",
                what, MAX_NUL_FIELD
            )));
        }
        field.push(byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_target_addr_display() {
        assert_eq!(TargetAddr::Ipv4(Ipv4Addr::new(1, 2, 3, 4)).to_string(), "1.2.3.4");
        assert_eq!(TargetAddr::Ipv6(Ipv6Addr::LOCALHOST).to_string(), "[::1]");
        assert_eq!(TargetAddr::Ipv6(Ipv6Addr::LOCALHOST).host(), "::1");
        assert_eq!(
            TargetAddr::Domain("example.com".into()).host(),
            "example.com"
        );
    }

    #[test]
    fn test_command_names() {
        assert_eq!(command_name(SOCKS_CMD_CONNECT), "CONNECT");
        assert_eq!(command_name(SOCKS_CMD_BIND), "BIND");
        assert_eq!(command_name(SOCKS_CMD_UDP_ASSOCIATE), "UDP ASSOCIATE");
        assert_eq!(command_name(0x09), "unknown");
    }

    #[tokio::test]
    async fn test_negotiate_rejects_unknown_version() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x47, 0x45, 0x54]).await.unwrap();
        let err = negotiate(&mut server, 0x47).await.unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_nul_field_limit() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[b'a'; MAX_NUL_FIELD + 1]).await.unwrap();
        let err = read_nul_terminated(&mut server, "user-id")
            .await
            .unwrap_err();
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_detect_version_peeks() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        client.write_all(&[SOCKS_VER_5, 1, 0]).await.unwrap();
        assert_eq!(detect_version(&server).await.unwrap(), SOCKS_VER_5);

        // 版本字节仍在缓冲区中
        let mut server = server;
        assert_eq!(server.read_u8().await.unwrap(), SOCKS_VER_5);
    }
}
