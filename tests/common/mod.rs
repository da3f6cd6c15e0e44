//! Common utilities for integration tests
#![allow(dead_code)]

use payload_tunnel::config::{
    ClientConfig, GatewayConfig, SessionCredentials, SocksConfig, TunnelConfig,
};
use payload_tunnel::gateway::Gateway;
use payload_tunnel::stats::ConnectionStats;
use payload_tunnel::TunnelClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

pub const USERNAME: &str = "tester";
pub const PASSWORD: &str = "open-sesame";

/// 单块 payload
pub const ONE_BLOCK_PAYLOAD: &str =
    "GET / HTTP/1.1[crlf]Host: [host][crlf]Upgrade: websocket[crlf]Connection: Upgrade[crlf][crlf]";

/// 两块 payload，第二块在代理回应 100 Continue 后发送
pub const TWO_BLOCK_PAYLOAD: &str = "POST / HTTP/1.1[crlf]Host: [host][crlf]Expect: 100-continue[crlf][crlf]\
     GET /ws HTTP/1.1[crlf]Host: [host][crlf]Upgrade: websocket[crlf][crlf]";

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use payload_tunnel::tls;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });

    addr
}

/// 返回一个当前无人监听的端口
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn gateway_config(payload_blocks: usize) -> GatewayConfig {
    GatewayConfig {
        bind_addr: "127.0.0.1".to_string(),
        bind_port: 0,
        username: USERNAME.to_string(),
        password: PASSWORD.to_string(),
        payload_blocks,
        tls: false,
        cert_path: None,
        key_path: None,
        handshake_timeout_secs: 5,
    }
}

/// 在随机端口上启动网关
pub async fn start_gateway(
    config: GatewayConfig,
    acceptor: Option<TlsAcceptor>,
) -> (SocketAddr, CancellationToken, ConnectionStats) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = Gateway::new(config, acceptor);
    let stats = gateway.stats();
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = gateway.serve(listener, token).await;
    });

    (addr, shutdown, stats)
}

/// 经中间代理（此处即网关本身）建立隧道的客户端配置
pub fn client_config(mode: &str, proxy: SocketAddr, payload: &str) -> ClientConfig {
    ClientConfig {
        tunnel: TunnelConfig {
            mode: mode.to_string(),
            proxy_host: proxy.ip().to_string(),
            proxy_port: proxy.port(),
            target_host: "gateway.internal".to_string(),
            target_port: 8080,
            front_domain: None,
            payload: payload.to_string(),
            proxy_tls: false,
            skip_verify: false,
            ca_cert_path: None,
            connect_timeout_secs: 5,
            handshake_timeout_secs: 5,
        },
        session: SessionCredentials::new(USERNAME, PASSWORD),
        socks: SocksConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            handshake_timeout_secs: 5,
        },
    }
}

/// 直连网关的客户端配置
pub fn direct_client_config(gateway: SocketAddr) -> ClientConfig {
    let mut config = client_config("direct", gateway, "");
    config.tunnel.proxy_host = String::new();
    config.tunnel.proxy_port = 0;
    config.tunnel.target_host = gateway.ip().to_string();
    config.tunnel.target_port = gateway.port();
    config
}

/// 连接并在后台运行客户端，返回 SOCKS 地址
pub async fn start_client(
    config: &ClientConfig,
) -> (
    SocketAddr,
    CancellationToken,
    tokio::task::JoinHandle<payload_tunnel::Result<()>>,
) {
    let client = TunnelClient::connect(config)
        .await
        .expect("Failed to connect tunnel client");
    let socks_addr = client.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(client.run(shutdown.clone()));
    (socks_addr, shutdown, handle)
}

/// SOCKS5 握手并发送 CONNECT 请求，返回连接与 REP 字段
pub async fn socks5_connect(proxy: SocketAddr, host: &str, port: u16) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00];
    match host.parse::<std::net::Ipv4Addr>() {
        Ok(ip) => {
            request.push(0x01);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            request.push(0x03);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply[1])
}

/// SOCKS4 CONNECT（IPv4），返回连接与状态字节
pub async fn socks4_connect(proxy: SocketAddr, ip: [u8; 4], port: u16) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&ip);
    request.extend_from_slice(b"tester\0");
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply[1])
}

/// SOCKS4a CONNECT（域名），返回连接与状态字节
pub async fn socks4a_connect(proxy: SocketAddr, host: &str, port: u16) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&[0, 0, 0, 1]);
    request.extend_from_slice(b"\0");
    request.extend_from_slice(host.as_bytes());
    request.push(0);
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply[1])
}

/// 写入数据并读回同样长度的回显
pub async fn echo_roundtrip(stream: &mut TcpStream, data: &[u8]) -> Vec<u8> {
    stream.write_all(data).await.unwrap();
    let mut buf = vec![0u8; data.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("Timeout waiting for echo")
        .unwrap();
    buf
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}
