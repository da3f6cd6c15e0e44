//! 伪装 HTTP 升级握手
//!
//! 将 payload 模板中的占位符替换后按空行拆分为多个请求块，依次发送，
//! 在第一块与其余块之间检查代理的响应。握手完成后原连接即作为原始隧道使用。

use crate::error::{Result, TunnelError};
use crate::tls;
use crate::transport::TunnelStream;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// 请求块之间的分隔符，也是每个响应的结束标记
pub const BLOCK_TERMINATOR: &[u8] = b"\r\n\r\n";

/// 单段 HTTP 头允许的最大字节数
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const HOST_PLACEHOLDER: &str = "[host]";
const CRLF_PLACEHOLDER: &str = "[crlf]";
const CONTINUE_MARKER: &[u8] = b"100 Continue";

/// 替换模板中的占位符
///
/// `[host]` 替换为 `host:port`，`[crlf]` 替换为 CRLF，其余内容保持不变。
pub fn substitute_placeholders(template: &str, host: &str, port: u16) -> String {
    template
        .replace(HOST_PLACEHOLDER, &format!("{}:{}", host, port))
        .replace(CRLF_PLACEHOLDER, "\r\n")
}

/// 按 CRLF-CRLF 拆分 payload，结果至少包含一个块
pub fn split_blocks(payload: &[u8]) -> Vec<&[u8]> {
    let mut blocks = Vec::new();
    let mut rest = payload;

    while let Some(pos) = find(rest, BLOCK_TERMINATOR) {
        blocks.push(&rest[..pos]);
        rest = &rest[pos + BLOCK_TERMINATOR.len()..];
    }
    blocks.push(rest);

    blocks
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn is_blank(block: &[u8]) -> bool {
    block.iter().all(u8::is_ascii_whitespace)
}

/// 逐字节读取一段 HTTP 头，直到遇到 CRLF-CRLF
///
/// 只读取到结束标记为止，之后的字节留给隧道使用。
pub async fn read_headers<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TunnelError::handshake(format!(
                "connection closed after {} bytes without a complete header block",
                response.len()
            )));
        }

        response.push(byte[0]);
        if response.ends_with(BLOCK_TERMINATOR) {
            return Ok(response);
        }

        if response.len() >= MAX_HEADER_SIZE {
            return Err(TunnelError::handshake(format!(
                "header block exceeds {} bytes without a terminator",
                MAX_HEADER_SIZE
            )));
        }
    }
}

async fn send_block<S>(stream: &mut S, block: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let mut frame = Vec::with_capacity(block.len() + BLOCK_TERMINATOR.len());
    frame.extend_from_slice(block);
    frame.extend_from_slice(BLOCK_TERMINATOR);

    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

fn status_line(response: &[u8]) -> String {
    let end = find(response, b"\r\n").unwrap_or(response.len());
    String::from_utf8_lossy(&response[..end]).into_owned()
}

/// 握手前是否需要对连接再包一层 TLS
#[derive(Clone)]
pub enum TlsWrap {
    /// 直接在给定连接上握手
    None,
    /// 先以 `server_name` 为 SNI 完成 TLS 握手
    Tls {
        connector: TlsConnector,
        server_name: String,
    },
}

impl std::fmt::Debug for TlsWrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsWrap::None => write!(f, "None"),
            TlsWrap::Tls { server_name, .. } => f
                .debug_struct("Tls")
                .field("server_name", server_name)
                .finish_non_exhaustive(),
        }
    }
}

/// 握手引擎
#[derive(Debug, Clone)]
pub struct HandshakeEngine {
    target_host: String,
    target_port: u16,
    template: String,
    timeout: Duration,
}

impl HandshakeEngine {
    pub fn new(
        target_host: impl Into<String>,
        target_port: u16,
        template: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
            template: template.into(),
            timeout,
        }
    }

    /// 执行伪装握手，成功后返回同一条连接
    ///
    /// 整个过程（包括可选的 TLS 包装）受 `timeout` 约束，超时视为握手失败。
    pub async fn perform(&self, stream: TunnelStream, wrap: TlsWrap) -> Result<TunnelStream> {
        match tokio::time::timeout(self.timeout, self.perform_inner(stream, wrap)).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::handshake(format!(
                "upgrade exchange timed out after {:?}",
                self.timeout
            ))),
        }
    }

    async fn perform_inner(&self, stream: TunnelStream, wrap: TlsWrap) -> Result<TunnelStream> {
        let mut stream = match wrap {
            TlsWrap::None => stream,
            TlsWrap::Tls {
                connector,
                server_name,
            } => {
                if stream.is_encrypted() {
                    return Err(TunnelError::tls(
                        "refusing to wrap an already encrypted stream in TLS",
                    ));
                }
                debug!("Wrapping proxy connection in TLS (SNI: {})", server_name);
                let tls_stream = tls::connect(&connector, &server_name, stream).await?;
                TunnelStream::encrypted(tls_stream)
            }
        };

        self.exchange(&mut stream).await?;
        Ok(stream)
    }

    async fn exchange(&self, stream: &mut TunnelStream) -> Result<()> {
        let payload = substitute_placeholders(&self.template, &self.target_host, self.target_port);
        let blocks = split_blocks(payload.as_bytes());
        let (first, rest) = match blocks.split_first() {
            Some(split) => split,
            None => return Err(TunnelError::handshake("payload produced no blocks")),
        };

        debug!(
            "Sending payload for {}:{} in {} block(s)",
            self.target_host,
            self.target_port,
            blocks.len()
        );

        send_block(stream, first).await?;
        let first_response = read_headers(stream).await?;
        debug!("First response: {}", status_line(&first_response));

        if find(&first_response, CONTINUE_MARKER).is_some() {
            debug!("Proxy answered 100 Continue, sending remaining blocks");
            Self::send_remaining(stream, rest).await?;
        } else {
            // TODO: decide whether a final first response should skip the remaining blocks
            debug!("Proxy did not answer 100 Continue, sending remaining blocks anyway");
            Self::send_remaining(stream, rest).await?;
        }

        let second_response = read_headers(stream).await?;
        info!("Tunnel upgrade completed: {}", status_line(&second_response));

        Ok(())
    }

    async fn send_remaining(stream: &mut TunnelStream, blocks: &[&[u8]]) -> Result<()> {
        for block in blocks.iter().filter(|block| !is_blank(block)) {
            send_block(stream, block).await?;
        }
        Ok(())
    }
}
