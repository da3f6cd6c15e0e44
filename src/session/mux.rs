use super::protocol::{self, AuthRequest};
use super::Session;
use crate::config::SessionCredentials;
use crate::error::{Result, TunnelError};
use crate::transport::{BoxedStream, TunnelStream};
use async_trait::async_trait;
use futures::future::poll_fn;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

type OpenReply = oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>;

/// 基于 yamux 的会话
///
/// yamux 连接由单独的驱动任务持有，打开通道的请求经 mpsc 串行化，
/// 通道建立后的读写互不影响。
pub struct MuxSession {
    open_tx: mpsc::Sender<OpenReply>,
    closed: CancellationToken,
    channel_timeout: Duration,
}

impl MuxSession {
    /// 在隧道流上认证，成功后启动 yamux 驱动任务
    ///
    /// 认证往返与打开通道共用 `channel_timeout_secs` 作为超时。
    pub async fn authenticate(stream: TunnelStream, creds: &SessionCredentials) -> Result<Self> {
        let mut stream = stream;
        let timeout = creds.channel_timeout();

        let status = tokio::time::timeout(timeout, async {
            protocol::write_auth_request(&mut stream, &AuthRequest::from_credentials(creds))
                .await?;
            protocol::read_status(&mut stream).await
        })
        .await;

        match status {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(message))) => return Err(TunnelError::auth(message)),
            Ok(Err(TunnelError::Io(e))) => {
                return Err(TunnelError::auth(format!(
                    "connection lost during authentication: {}",
                    e
                )))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TunnelError::auth(format!(
                    "no authentication response within {:?}",
                    timeout
                )))
            }
        }

        info!("Session authenticated as '{}'", creds.username);

        let yamux_conn = YamuxConnection::new(
            TokioAsyncReadCompatExt::compat(stream),
            YamuxConfig::default(),
            YamuxMode::Client,
        );
        let (open_tx, open_rx) = mpsc::channel(64);
        let closed = CancellationToken::new();

        tokio::spawn(run_yamux_driver(yamux_conn, open_rx, closed.clone()));

        Ok(Self {
            open_tx,
            closed,
            channel_timeout: timeout,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 等待会话关闭（网关断开或调用 `close`）
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// 关闭会话，所有通道随之失效
    pub fn close(&self) {
        self.closed.cancel();
    }

    async fn new_stream(&self) -> Result<yamux::Stream> {
        if self.is_closed() {
            return Err(TunnelError::channel("session is closed"));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx
            .send(reply_tx)
            .await
            .map_err(|_| TunnelError::channel("session is closed"))?;

        reply_rx
            .await
            .map_err(|_| TunnelError::channel("session is closed"))?
            .map_err(|e| TunnelError::channel(format!("failed to open stream: {}", e)))
    }
}

#[async_trait]
impl Session for MuxSession {
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let mut stream = FuturesAsyncReadCompatExt::compat(self.new_stream().await?);

        let confirm = tokio::time::timeout(self.channel_timeout, async {
            protocol::write_channel_request(&mut stream, host, port).await?;
            protocol::read_status(&mut stream).await
        })
        .await;

        match confirm {
            Ok(Ok(Ok(()))) => {
                debug!("Channel to {}:{} opened", host, port);
                Ok(Box::pin(stream))
            }
            Ok(Ok(Err(message))) => Err(TunnelError::channel(format!(
                "gateway refused {}:{}: {}",
                host, port, message
            ))),
            Ok(Err(e)) => Err(TunnelError::channel(format!(
                "failed to open channel to {}:{}: {}",
                host, port, e
            ))),
            Err(_) => Err(TunnelError::channel(format!(
                "gateway did not confirm {}:{} within {:?}",
                host, port, self.channel_timeout
            ))),
        }
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// 运行 yamux 连接的 poll 循环
async fn run_yamux_driver<T>(
    mut yamux_conn: YamuxConnection<T>,
    mut open_rx: mpsc::Receiver<OpenReply>,
    closed: CancellationToken,
) where
    T: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                if let Err(e) = poll_fn(|cx| yamux_conn.poll_close(cx)).await {
                    debug!("Error while closing session: {}", e);
                }
                break;
            }
            req = open_rx.recv() => {
                match req {
                    Some(reply_tx) => {
                        let result = poll_fn(|cx| yamux_conn.poll_new_outbound(cx)).await;
                        if reply_tx.send(result).is_err() {
                            debug!("Channel requester went away before the stream was ready");
                        }
                    }
                    None => {
                        debug!("Session handle dropped");
                        break;
                    }
                }
            }
            inbound = poll_fn(|cx| yamux_conn.poll_next_inbound(cx)) => {
                match inbound {
                    Some(Ok(stream)) => {
                        warn!("Rejecting unexpected inbound stream from gateway");
                        drop(stream);
                    }
                    Some(Err(e)) => {
                        error!("Session connection error: {}", e);
                        break;
                    }
                    None => {
                        info!("Session closed by gateway");
                        break;
                    }
                }
            }
        }
    }

    closed.cancel();
    info!("Session driver stopped");
}
