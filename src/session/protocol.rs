//! 会话线协议
//!
//! 认证帧：4 字节大端长度 + JSON；应答 1 字节状态，失败时附带 2 字节长度的错误消息。
//! 通道请求：2 字节长度 + 主机名 + 2 字节端口；应答格式同上。

use crate::config::SessionCredentials;
use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 协议版本（JSON 帧）
pub const PROTOCOL_VERSION: u8 = 1;

pub const STATUS_OK: u8 = 1;
pub const STATUS_ERROR: u8 = 0;

/// 认证帧最大长度
pub const MAX_AUTH_FRAME: usize = 4096;
/// 错误消息最大长度
pub const MAX_ERROR_MESSAGE: usize = 4096;
/// 通道主机名最大长度
pub const MAX_HOST_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub version: u8,
    pub username: String,
    pub password: String,
}

impl AuthRequest {
    pub fn from_credentials(creds: &SessionCredentials) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            username: creds.username.clone(),
            password: creds.password.clone(),
        }
    }
}

pub async fn write_auth_request<S>(stream: &mut S, request: &AuthRequest) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(request)
        .map_err(|e| TunnelError::auth(format!("Failed to encode credentials: {}", e)))?;
    let len = json.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&json).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_auth_request<S>(stream: &mut S) -> Result<AuthRequest>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len > MAX_AUTH_FRAME {
        return Err(TunnelError::auth(format!(
            "authentication frame too long ({} bytes, max {})",
            len, MAX_AUTH_FRAME
        )));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf)
        .map_err(|e| TunnelError::auth(format!("malformed authentication frame: {}", e)))
}

/// 发送成功状态
pub async fn send_ok<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[STATUS_OK]).await?;
    stream.flush().await?;
    Ok(())
}

/// 发送失败状态与错误消息
pub async fn send_error<S>(stream: &mut S, message: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let msg_bytes = &message.as_bytes()[..message.len().min(MAX_ERROR_MESSAGE)];
    let msg_len = (msg_bytes.len() as u16).to_be_bytes();
    stream.write_all(&[STATUS_ERROR]).await?;
    stream.write_all(&msg_len).await?;
    stream.write_all(msg_bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// 读取对端返回的错误消息
pub async fn read_error_message<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let msg_len = stream.read_u16().await? as usize;
    if msg_len > MAX_ERROR_MESSAGE {
        return Err(TunnelError::protocol("error message too long"));
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;
    Ok(String::from_utf8_lossy(&msg_buf).into_owned())
}

/// 读取状态字节；失败时返回对端给出的错误消息
pub async fn read_status<S>(stream: &mut S) -> Result<std::result::Result<(), String>>
where
    S: AsyncRead + Unpin,
{
    match stream.read_u8().await? {
        STATUS_OK => Ok(Ok(())),
        _ => Ok(Err(read_error_message(stream).await?)),
    }
}

pub async fn write_channel_request<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if host.is_empty() || host.len() > MAX_HOST_LEN {
        return Err(TunnelError::channel(format!(
            "invalid channel host length {}",
            host.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + host.len());
    frame.extend_from_slice(&(host.len() as u16).to_be_bytes());
    frame.extend_from_slice(host.as_bytes());
    frame.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_channel_request<S>(stream: &mut S) -> Result<(String, u16)>
where
    S: AsyncRead + Unpin,
{
    let host_len = stream.read_u16().await? as usize;
    if host_len == 0 || host_len > MAX_HOST_LEN {
        return Err(TunnelError::protocol(format!(
            "invalid channel host length {}",
            host_len
        )));
    }

    let mut host_buf = vec![0u8; host_len];
    stream.read_exact(&mut host_buf).await?;
    let host = String::from_utf8(host_buf)
        .map_err(|_| TunnelError::protocol("channel host is not valid UTF-8"))?;
    let port = stream.read_u16().await?;

    Ok((host, port))
}
