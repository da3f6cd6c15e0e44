// 配置管理模块 - 使用模块化设计

mod validator;

pub use validator::ConfigValidator;

use crate::transport::Mode;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_connect_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    15
}

fn default_channel_timeout() -> u64 {
    30
}

fn default_socks_handshake_timeout() -> u64 {
    10
}

fn default_socks_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_socks_port() -> u16 {
    1080
}

fn default_gateway_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_payload_blocks() -> usize {
    1
}

/// 隧道配置（对应 `[tunnel]` 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// 建立方式：direct / http_payload / sni_fronted（不区分大小写）
    pub mode: String,
    /// 中间代理地址
    #[serde(default)]
    pub proxy_host: String,
    /// 中间代理端口
    #[serde(default)]
    pub proxy_port: u16,
    /// 最终目标地址（写入 payload 的 `[host]`）
    pub target_host: String,
    /// 最终目标端口
    pub target_port: u16,
    /// 伪造的 SNI 域名，未设置时回退为 proxy_host
    #[serde(default)]
    pub front_domain: Option<String>,
    /// HTTP payload 模板，支持 `[host]` 与 `[crlf]` 占位符
    #[serde(default)]
    pub payload: String,
    /// http_payload 模式下是否对代理连接再包一层 TLS（SNI = proxy_host）
    #[serde(default)]
    pub proxy_tls: bool,
    /// 是否跳过证书验证
    #[serde(default)]
    pub skip_verify: bool,
    /// CA 证书路径（可选）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// TCP 连接超时（秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// 伪装握手超时（秒）
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl TunnelConfig {
    /// 解析 mode 字段
    pub fn mode(&self) -> crate::Result<Mode> {
        self.mode.parse()
    }

    /// 实际使用的 SNI：front_domain 优先，否则为 proxy_host
    pub fn sni_host(&self) -> &str {
        match self.front_domain.as_deref() {
            Some(domain) if !domain.trim().is_empty() => domain,
            _ => &self.proxy_host,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_tunnel_config(self)
    }
}

/// 会话认证信息（对应 `[session]` 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub username: String,
    pub password: String,
    /// 等待网关应答的超时（秒），同时约束会话认证与每次打开通道的确认
    #[serde(default = "default_channel_timeout")]
    pub channel_timeout_secs: u64,
}

impl SessionCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            channel_timeout_secs: default_channel_timeout(),
        }
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }
}

/// 本地 SOCKS 监听配置（对应 `[socks]` 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksConfig {
    #[serde(default = "default_socks_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_socks_port")]
    pub port: u16,
    /// SOCKS 协商阶段的读超时（秒）
    #[serde(default = "default_socks_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_socks_bind_addr(),
            port: default_socks_port(),
            handshake_timeout_secs: default_socks_handshake_timeout(),
        }
    }
}

impl SocksConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// 客户端完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub tunnel: TunnelConfig,
    pub session: SessionCredentials,
    #[serde(default)]
    pub socks: SocksConfig,
}

impl ClientConfig {
    /// 验证配置（不做任何网络 I/O）
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_client_config(self)
    }
}

/// 网关配置（对应 `[gateway]` 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_bind_addr")]
    pub bind_addr: String,
    pub bind_port: u16,
    pub username: String,
    pub password: String,
    /// 期望的 payload 块数，0 表示不做伪装握手（direct 模式）
    #[serde(default = "default_payload_blocks")]
    pub payload_blocks: usize,
    /// 是否在 TCP 之上终止 TLS
    #[serde(default)]
    pub tls: bool,
    /// TLS 证书路径
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// 等待握手与认证数据的超时（秒）
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_gateway_config(self)
    }
}

/// 应用配置加载入口
pub struct AppConfig;

impl AppConfig {
    /// 从文件加载客户端配置
    pub fn load_client_config(path: &str) -> anyhow::Result<ClientConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file '{}'", path))?;
        let config: ClientConfig =
            toml::from_str(&content).context("Failed to parse client configuration")?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载网关配置
    pub fn load_gateway_config(path: &str) -> anyhow::Result<GatewayConfig> {
        #[derive(Deserialize)]
        struct GatewayConfigWrapper {
            gateway: GatewayConfig,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file '{}'", path))?;
        let wrapper: GatewayConfigWrapper =
            toml::from_str(&content).context("Failed to parse gateway configuration")?;
        wrapper
            .gateway
            .validate()
            .context("Gateway configuration validation failed")?;
        Ok(wrapper.gateway)
    }
}

/// 展开路径中的 `~` 与环境变量
pub fn expand_path(path: &std::path::Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}
