use crate::config::ClientConfig;
use crate::error::{Result, TunnelError};
use crate::session::MuxSession;
use crate::socks::SocksListener;
use crate::stats::ConnectionStats;
use crate::transport::create_strategy;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 环境变量前缀
const ENV_PREFIX: &str = "PAYLOAD_TUNNEL_";

/// 退出时等待活动连接结束的时间（秒）- 可通过环境变量 PAYLOAD_TUNNEL_DRAIN_TIMEOUT_SECS 覆盖
const DRAIN_TIMEOUT_SECS: u64 = 5;

fn get_drain_timeout() -> Duration {
    let secs = std::env::var(format!("{}DRAIN_TIMEOUT_SECS", ENV_PREFIX))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DRAIN_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// 隧道客户端：一条隧道、一个会话、一个本地 SOCKS 监听器
pub struct TunnelClient {
    session: Arc<MuxSession>,
    listener: SocksListener,
    stats: ConnectionStats,
}

impl TunnelClient {
    /// 建立隧道并认证会话，然后绑定本地 SOCKS 端口
    ///
    /// 任何一步失败都直接返回，不会进入服务状态。
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let strategy = create_strategy(&config.tunnel)?;
        info!("Establishing tunnel ({} mode)", strategy.mode());

        let stream = strategy.establish().await?;
        info!(
            "Tunnel established (encrypted: {})",
            stream.is_encrypted()
        );

        let session = Arc::new(MuxSession::authenticate(stream, &config.session).await?);

        let stats = ConnectionStats::new();
        let listener = SocksListener::bind(&config.socks, session.clone(), stats.clone()).await?;

        Ok(Self {
            session,
            listener,
            stats,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    /// 服务 SOCKS 客户端，直到 `shutdown` 被取消或会话断开
    ///
    /// 退出前等待活动连接结束（有上限），然后关闭会话。
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            session,
            listener,
            stats,
        } = self;

        let serving = shutdown.child_token();
        let mut listener_task = tokio::spawn(listener.run(serving.clone()));

        let session_lost = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                false
            }
            _ = session.closed() => {
                warn!("Session lost, stopping SOCKS listener");
                true
            }
            result = &mut listener_task => {
                match result {
                    Ok(Err(e)) => warn!("SOCKS listener stopped: {}", e),
                    Err(e) => warn!("SOCKS listener task failed: {}", e),
                    Ok(Ok(())) => {}
                }
                false
            }
        };

        serving.cancel();
        if !listener_task.is_finished() {
            listener_task.await.ok();
        }

        let drain_timeout = get_drain_timeout();
        if stats.active_connections() > 0 {
            info!(
                "Waiting up to {:?} for {} active connection(s)",
                drain_timeout,
                stats.active_connections()
            );
            if !stats.wait_idle(drain_timeout).await {
                warn!(
                    "{} connection(s) still active after {:?}",
                    stats.active_connections(),
                    drain_timeout
                );
            }
        }

        session.close();
        info!(
            "Client stopped: {}",
            serde_json::to_string(&stats.snapshot()).unwrap_or_default()
        );

        if session_lost {
            return Err(TunnelError::channel("session closed by gateway"));
        }
        Ok(())
    }
}

/// 按配置运行客户端
pub async fn run_client(config: ClientConfig, shutdown: CancellationToken) -> Result<()> {
    let client = TunnelClient::connect(&config).await?;
    client.run(shutdown).await
}
