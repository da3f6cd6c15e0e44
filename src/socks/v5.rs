//! SOCKS5（RFC 1928，仅 CONNECT、无认证）

use super::{command_name, SocksRequest, TargetAddr, SOCKS_CMD_CONNECT, SOCKS_VER_5};
use crate::error::{Result, TunnelError};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const AUTH_NONE: u8 = 0x00;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// 编码应答，绑定地址固定为 0.0.0.0:0
pub fn encode_reply(rep: u8) -> [u8; 10] {
    [SOCKS_VER_5, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

pub async fn send_reply<S>(stream: &mut S, rep: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(rep)).await?;
    stream.flush().await?;
    Ok(())
}

/// 方法协商：读取客户端提供的方法列表，无条件选择“无需认证”
pub async fn negotiate_methods<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VER_5 {
        return Err(TunnelError::protocol(format!(
            "expected SOCKS5 version byte, got {:#04x}",
            header[0]
        )));
    }

    // 方法列表不做检查
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[SOCKS_VER_5, AUTH_NONE]).await?;
    stream.flush().await?;
    Ok(())
}

/// 解析 CONNECT 请求
///
/// 不支持的命令回复 0x07，不支持的地址类型回复 0x08，随后返回错误。
pub async fn read_request<S>(stream: &mut S) -> Result<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    let [version, command, _reserved, atyp] = header;
    if version != SOCKS_VER_5 {
        return Err(TunnelError::protocol(format!(
            "expected SOCKS5 version byte, got {:#04x}",
            version
        )));
    }

    if command != SOCKS_CMD_CONNECT {
        send_reply(stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(TunnelError::protocol(format!(
            "unsupported SOCKS5 command {} ({:#04x})",
            command_name(command),
            command
        )));
    }

    let addr = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| TunnelError::protocol("SOCKS5 domain is not valid UTF-8"))?;
            TargetAddr::Domain(domain)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        other => {
            send_reply(stream, REP_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Err(TunnelError::protocol(format!(
                "unsupported SOCKS5 address type {:#04x}",
                other
            )));
        }
    };

    let port = stream.read_u16().await?;

    Ok(SocksRequest {
        version: SOCKS_VER_5,
        addr,
        port,
        dst_ip: [0; 4],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::{ReplyOutcome, SOCKS_CMD_BIND, SOCKS_CMD_UDP_ASSOCIATE};
    use tokio::io::duplex;

    #[test]
    fn test_success_reply_bytes() {
        assert_eq!(
            encode_reply(REP_SUCCEEDED),
            [0x05, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn test_domain_connect() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        negotiate_methods(&mut server).await.unwrap();
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [0x05, 0x00]);

        let parsed = read_request(&mut server).await.unwrap();
        assert_eq!(parsed.addr, TargetAddr::Domain("example.com".into()));
        assert_eq!(parsed.port, 443);

        parsed
            .reply(&mut server, ReplyOutcome::Granted)
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_methods_not_inspected() {
        let (mut client, mut server) = duplex(64);
        // 只提供用户名/密码认证，依然选择无认证
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        negotiate_methods(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_ipv4_and_ipv6_connect() {
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x1F, 0x90])
            .await
            .unwrap();
        let parsed = read_request(&mut server).await.unwrap();
        assert_eq!(parsed.addr, TargetAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(parsed.port, 8080);

        let mut request = vec![0x05, 0x01, 0x00, 0x04];
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&[0x00, 0x16]);
        client.write_all(&request).await.unwrap();
        let parsed = read_request(&mut server).await.unwrap();
        assert_eq!(parsed.addr, TargetAddr::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(parsed.port, 22);
    }

    #[tokio::test]
    async fn test_bind_command_not_supported() {
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[0x05, SOCKS_CMD_BIND, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert!(err.is_protocol());

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_udp_associate_not_supported() {
        let (mut client, mut server) = duplex(256);
        client
            .write_all(&[0x05, SOCKS_CMD_UDP_ASSOCIATE, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("UDP ASSOCIATE"));

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_partial_reads_tolerated() {
        let (mut client, mut server) = duplex(256);
        let reader = tokio::spawn(async move {
            negotiate_methods(&mut server).await?;
            read_request(&mut server).await
        });

        for chunk in [&[0x05u8][..], &[0x02, 0x00], &[0x02]] {
            client.write_all(chunk).await.unwrap();
            tokio::task::yield_now().await;
        }
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [0x05, 0x00]);

        let chunks: [&[u8]; 5] = [
            &[0x05, 0x01],
            &[0x00, 0x03, 11, b'e', b'x'],
            b"ample.",
            b"com",
            &[0x01, 0xBB],
        ];
        for chunk in chunks {
            client.write_all(chunk).await.unwrap();
            tokio::task::yield_now().await;
        }

        let request = reader.await.unwrap().unwrap();
        assert_eq!(request.addr, TargetAddr::Domain("example.com".into()));
        assert_eq!(request.port, 443);
    }

    #[tokio::test]
    async fn test_unknown_address_type() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&[0x05, 0x01, 0x00, 0x09]).await.unwrap();

        let err = read_request(&mut server).await.unwrap_err();
        assert!(err.is_protocol());

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_ADDRESS_TYPE_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_refused_reply() {
        let request = SocksRequest {
            version: SOCKS_VER_5,
            addr: TargetAddr::Domain("blocked.example".into()),
            port: 80,
            dst_ip: [0; 4],
        };
        let (mut client, mut server) = duplex(64);
        request
            .reply(&mut server, ReplyOutcome::Refused)
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_CONNECTION_REFUSED);
    }
}
