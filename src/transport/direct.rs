use super::{dial, TunnelStream};
use crate::error::Result;
use std::time::Duration;
use tracing::info;

/// 直连策略：TCP 连接目标，不做握手
#[derive(Debug, Clone)]
pub struct DirectStrategy {
    target_host: String,
    target_port: u16,
    connect_timeout: Duration,
}

impl DirectStrategy {
    pub fn new(target_host: String, target_port: u16, connect_timeout: Duration) -> Self {
        Self {
            target_host,
            target_port,
            connect_timeout,
        }
    }

    pub async fn establish(&self) -> Result<TunnelStream> {
        info!(
            "Connecting directly to {}:{}",
            self.target_host, self.target_port
        );
        let stream = dial(&self.target_host, self.target_port, self.connect_timeout).await?;
        Ok(TunnelStream::plain(stream))
    }
}
