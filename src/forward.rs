//! 双向转发
//!
//! 每个本地客户端对应一对拷贝任务（客户端→通道、通道→客户端）。
//! 任一方向遇到 EOF 或 I/O 错误时，两条流都会被关闭。

use crate::stats::ConnectionStats;
use crate::transport::Transport;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 单次读取的最大字节数
pub const COPY_BUFFER_SIZE: usize = 8192;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// 客户端 → 通道
    Upstream,
    /// 通道 → 客户端
    Downstream,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upstream => write!(f, "client -> channel"),
            Direction::Downstream => write!(f, "channel -> client"),
        }
    }
}

/// 转发结束后的字节统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardSummary {
    pub sent: u64,
    pub received: u64,
}

/// 一个客户端对应的两条拷贝任务
#[derive(Debug)]
pub struct ForwardingPair {
    upstream: JoinHandle<io::Result<u64>>,
    downstream: JoinHandle<io::Result<u64>>,
}

impl ForwardingPair {
    /// 等待两条任务结束；任务的错误与 panic 只记录日志，不向上传播
    pub async fn join(self) -> ForwardSummary {
        let sent = Self::settle(self.upstream.await, Direction::Upstream);
        let received = Self::settle(self.downstream.await, Direction::Downstream);
        ForwardSummary { sent, received }
    }

    fn settle(
        result: std::result::Result<io::Result<u64>, tokio::task::JoinError>,
        direction: Direction,
    ) -> u64 {
        match result {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                debug!("Copy {} ended with error: {}", direction, e);
                0
            }
            Err(e) if e.is_panic() => {
                warn!("Copy task {} panicked: {}", direction, e);
                0
            }
            Err(e) => {
                debug!("Copy task {} cancelled: {}", direction, e);
                0
            }
        }
    }
}

/// 启动双向转发
///
/// 两条流的所有权移交给转发任务，任务结束时一并关闭。
/// `shutdown` 被取消时所有转发立即终止。
pub fn forward<C, R>(
    client: C,
    channel: R,
    stats: ConnectionStats,
    shutdown: &CancellationToken,
) -> ForwardingPair
where
    C: Transport,
    R: Transport,
{
    let cancel = shutdown.child_token();
    let (client_read, client_write) = tokio::io::split(client);
    let (channel_read, channel_write) = tokio::io::split(channel);

    let upstream = tokio::spawn(copy_direction(
        client_read,
        channel_write,
        cancel.clone(),
        stats.clone(),
        Direction::Upstream,
    ));
    let downstream = tokio::spawn(copy_direction(
        channel_read,
        client_write,
        cancel,
        stats,
        Direction::Downstream,
    ));

    ForwardingPair {
        upstream,
        downstream,
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
    stats: ConnectionStats,
    direction: Direction,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = copy_chunks(&mut reader, &mut writer, &cancel, &stats, direction).await;

    // 任一方向结束都终止另一方向
    cancel.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;

    result
}

async fn copy_chunks<R, W>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
    stats: &ConnectionStats,
    direction: Direction,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            n = reader.read(&mut buf) => n?,
        };
        if n == 0 {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            written = writer.write_all(&buf[..n]) => written?,
        }

        total += n as u64;
        match direction {
            Direction::Upstream => stats.add_bytes_sent(n as u64),
            Direction::Downstream => stats.add_bytes_received(n as u64),
        }
    }

    writer.flush().await?;
    Ok(total)
}
