/// Payload Tunnel 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod handshake;
pub mod session;
pub mod socks;
pub mod stats;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use client::{run_client, TunnelClient};
pub use config::{AppConfig, ClientConfig, GatewayConfig, SessionCredentials, SocksConfig, TunnelConfig};
pub use error::{Result, TunnelError};
pub use gateway::{run_gateway, Gateway};
pub use session::{MuxSession, Session};
pub use stats::{ConnectionStats, StatsSnapshot};
pub use transport::{create_strategy, Mode, TunnelStrategy, TunnelStream};
