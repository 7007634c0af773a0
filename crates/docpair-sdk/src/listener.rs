use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::mutation::Mutation;
use crate::types::{Document, IdPair};

/// 远端 mutation 对文档可见性的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationTransition {
    /// 文档被修改
    Update,
    /// 文档出现（创建）
    Appear,
    /// 文档消失（删除）
    Disappear,
}

/// 重连事件（不属于任何文档）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectEvent {
    /// 事件时间（UTC毫秒时间戳）
    pub timestamp: i64,
}

impl ReconnectEvent {
    pub fn now() -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 监听源推送的原始事件
///
/// 原始流内的顺序是监听源唯一提供的顺序保证。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ListenerEvent {
    /// 连接中断后重新建立，之前的事件可能有遗漏
    Reconnect,
    /// 某个文档上提交了一个事务
    #[serde(rename_all = "camelCase")]
    Mutation {
        document_id: String,
        transaction_id: String,
        /// 该事务作用在此文档上的 mutation
        effects: Vec<Mutation>,
        /// 应用前的文档版本
        #[serde(default)]
        previous_revision: Option<String>,
        /// 应用后的文档版本
        #[serde(default)]
        result_revision: Option<String>,
        #[serde(default = "default_transition")]
        transition: MutationTransition,
    },
    /// 文档的完整快照（None 表示文档不存在）
    #[serde(rename_all = "camelCase")]
    Snapshot {
        document_id: String,
        document: Option<Document>,
        revision: Option<String>,
    },
}

fn default_transition() -> MutationTransition {
    MutationTransition::Update
}

impl ListenerEvent {
    /// 事件所属文档（reconnect 返回 None）
    pub fn document_id(&self) -> Option<&str> {
        match self {
            ListenerEvent::Reconnect => None,
            ListenerEvent::Mutation { document_id, .. }
            | ListenerEvent::Snapshot { document_id, .. } => Some(document_id),
        }
    }

    pub fn is_reconnect(&self) -> bool {
        matches!(self, ListenerEvent::Reconnect)
    }

    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            ListenerEvent::Reconnect => "reconnect",
            ListenerEvent::Mutation { .. } => "mutation",
            ListenerEvent::Snapshot { .. } => "snapshot",
        }
    }
}

/// 监听源（由传输层实现，负责协议、心跳与断线检测）
///
/// 要求：
/// - 连接恢复时推送 `Reconnect`
/// - 其余事件必须带上来源文档的 ID
/// - 返回的流在被 drop 时释放底层连接
pub trait ListenerSource: Send + Sync + std::fmt::Debug {
    /// 为 ID 对打开一条事件流
    fn listen(&self, id_pair: &IdPair) -> BoxStream<'static, ListenerEvent>;
}
