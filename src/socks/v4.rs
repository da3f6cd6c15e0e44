//! SOCKS4 / SOCKS4a

use super::{
    command_name, read_nul_terminated, SocksRequest, TargetAddr, SOCKS_CMD_CONNECT, SOCKS_VER_4,
};
use crate::error::{Result, TunnelError};
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const STATUS_GRANTED: u8 = 0x5A;
pub const STATUS_REJECTED: u8 = 0x5B;

/// 编码 8 字节应答：`00 STATUS DSTPORT DSTIP`
pub fn encode_reply(granted: bool, port: u16, ip: [u8; 4]) -> [u8; 8] {
    let status = if granted {
        STATUS_GRANTED
    } else {
        STATUS_REJECTED
    };
    let port = port.to_be_bytes();
    [0x00, status, port[0], port[1], ip[0], ip[1], ip[2], ip[3]]
}

pub async fn send_reply<S>(stream: &mut S, granted: bool, port: u16, ip: [u8; 4]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(granted, port, ip)).await?;
    stream.flush().await?;
    Ok(())
}

/// 0.0.0.x（x 非 0）表示 SOCKS4a，域名跟在 user-id 之后
fn is_socks4a(ip: [u8; 4]) -> bool {
    ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0
}

/// 解析 SOCKS4/4a 请求
///
/// 非 CONNECT 命令会先发送拒绝应答再返回错误。
pub async fn read_request<S>(stream: &mut S) -> Result<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;

    let [version, command, port_hi, port_lo, a, b, c, d] = header;
    if version != SOCKS_VER_4 {
        return Err(TunnelError::protocol(format!(
            "expected SOCKS4 version byte, got {:#04x}",
            version
        )));
    }
    let port = u16::from_be_bytes([port_hi, port_lo]);
    let dst_ip = [a, b, c, d];

    // user-id 不做校验
    read_nul_terminated(stream, "SOCKS4 user-id").await?;

    let addr = if is_socks4a(dst_ip) {
        let domain = read_nul_terminated(stream, "SOCKS4a domain").await?;
        let domain = String::from_utf8(domain)
            .map_err(|_| TunnelError::protocol("SOCKS4a domain is not valid UTF-8"))?;
        TargetAddr::Domain(domain)
    } else {
        TargetAddr::Ipv4(Ipv4Addr::from(dst_ip))
    };

    if command != SOCKS_CMD_CONNECT {
        send_reply(stream, false, port, dst_ip).await?;
        return Err(TunnelError::protocol(format!(
            "unsupported SOCKS4 command {} ({:#04x})",
            command_name(command),
            command
        )));
    }

    Ok(SocksRequest {
        version: SOCKS_VER_4,
        addr,
        port,
        dst_ip,
    })
}
