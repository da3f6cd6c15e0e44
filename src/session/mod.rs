//! 会话适配层
//!
//! 在隧道流上完成一次认证，之后按需打开到任意 host:port 的通道。
//! 进程内只有一个会话，所有 SOCKS 客户端共享。

mod mux;
pub mod protocol;

pub use mux::MuxSession;

use crate::error::Result;
use crate::transport::BoxedStream;
use async_trait::async_trait;

/// 已认证的会话
#[async_trait]
pub trait Session: Send + Sync {
    /// 打开一条到 `host:port` 的通道；可并发调用
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxedStream>;
}
