use serde::{Deserialize, Serialize};

/// SDK 错误类型
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocPairError {
    /// 监听连接中断（通过 reconnect 事件通知，可恢复）
    #[error("Connection lost")]
    ConnectionLost,

    /// 服务端拒绝了提交的 mutation（原样重试无意义）
    #[error("Mutation rejected: {reason}")]
    RejectedMutation { reason: String },

    /// 传输层暂时不可用（队列保留，可再次 commit）
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// patch 路径无法解析
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("JSON error: {0}")]
    Json(String),

    /// 通道或任务已关闭
    #[error("Closed: {0}")]
    Closed(String),
}

impl From<serde_json::Error> for DocPairError {
    fn from(error: serde_json::Error) -> Self {
        DocPairError::Json(error.to_string())
    }
}

/// commit 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitFailureKind {
    /// 服务端拒绝 - 不重试，需调用方修正或清空队列
    Rejected,
    /// 传输失败 - 队列保留，可重试
    Transport,
}

impl DocPairError {
    /// 判断是否可以重新 commit
    pub fn is_retryable(&self) -> bool {
        match self {
            DocPairError::TransportUnavailable(_) => true,
            DocPairError::ConnectionLost => true,
            DocPairError::RejectedMutation { .. } => false,
            DocPairError::InvalidArgument(_) => false,
            DocPairError::InvalidPath(_) => false,
            DocPairError::Json(_) => false,
            DocPairError::Closed(_) => false,
        }
    }

    /// 获取 commit 失败分类（非 commit 相关错误返回 None）
    pub fn failure_kind(&self) -> Option<CommitFailureKind> {
        match self {
            DocPairError::RejectedMutation { .. } => Some(CommitFailureKind::Rejected),
            DocPairError::TransportUnavailable(_) | DocPairError::ConnectionLost => {
                Some(CommitFailureKind::Transport)
            }
            _ => None,
        }
    }

    /// 创建拒绝错误
    pub fn rejected<S: Into<String>>(reason: S) -> Self {
        DocPairError::RejectedMutation {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DocPairError>;
