//! 事件系统模块 - 每个版本对外的三条输出流
//!
//! 功能包括：
//! - 文档事件（本地编辑、远端 mutation、重连、提交结果）
//! - 远端快照事件
//! - 一致性变化
//! - 基于 broadcast 的事件分发和带租约的订阅流

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::CommitFailureKind;
use crate::listener::MutationTransition;
use crate::multiplexer::ListenerLease;
use crate::mutation::Mutation;
use crate::types::{Document, DocumentVersionKind};

/// 远端 mutation 的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOrigin {
    /// 本地提交的事务回显
    Local,
    /// 其他客户端的编辑
    Remote,
}

/// 远端快照的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    /// 监听源推送的完整快照
    Snapshot,
    /// 应用远端 mutation 后的结果
    RemoteMutation,
}

/// 单个版本上发生的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentEvent {
    /// 本地 mutate() 已应用到本地快照
    LocalMutation {
        transaction_id: String,
        mutations: Vec<Mutation>,
    },
    /// 远端 mutation 已应用到远端基线
    RemoteMutation {
        transaction_id: String,
        result_revision: Option<String>,
        origin: MutationOrigin,
        transition: MutationTransition,
    },
    /// 待确认事务已在新的远端基线上重放
    Rebased { pending: usize },
    /// 收到完整快照
    Snapshot {
        revision: Option<String>,
        exists: bool,
    },
    /// 快照已包含这些待确认事务，它们的回显不会再到达
    SnapshotAcknowledged { transaction_ids: Vec<String> },
    /// 监听连接已恢复，期间可能漏掉了事件
    Reconnect,
    /// 检测到版本号不连续，等待新的快照
    RevisionGap {
        transaction_id: String,
        expected: Option<String>,
        received: Option<String>,
    },
    /// commit 已被提交器接受
    Committed { transaction_ids: Vec<String> },
    /// commit 失败，队列保留
    CommitFailed {
        transaction_ids: Vec<String>,
        kind: CommitFailureKind,
        message: String,
    },
    /// 调用方清空了待确认队列
    PendingCleared { discarded: usize },
}

impl DocumentEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            DocumentEvent::LocalMutation { .. } => "local_mutation",
            DocumentEvent::RemoteMutation { .. } => "remote_mutation",
            DocumentEvent::Rebased { .. } => "rebased",
            DocumentEvent::Snapshot { .. } => "snapshot",
            DocumentEvent::SnapshotAcknowledged { .. } => "snapshot_acknowledged",
            DocumentEvent::Reconnect => "reconnect",
            DocumentEvent::RevisionGap { .. } => "revision_gap",
            DocumentEvent::Committed { .. } => "committed",
            DocumentEvent::CommitFailed { .. } => "commit_failed",
            DocumentEvent::PendingCleared { .. } => "pending_cleared",
        }
    }
}

/// 带版本标签的文档事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEvent {
    pub version: DocumentVersionKind,
    pub event: DocumentEvent,
    /// UTC毫秒时间戳
    pub timestamp: i64,
}

/// 远端权威文档内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshotEvent {
    /// None 表示文档不存在
    pub document: Option<Document>,
    pub revision: Option<String>,
    pub origin: SnapshotOrigin,
}

/// 带版本标签的远端快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSnapshotVersionEvent {
    pub version: DocumentVersionKind,
    pub snapshot: RemoteSnapshotEvent,
    pub timestamp: i64,
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 远端快照数
    pub remote_snapshots: u64,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 单个版本的事件分发器
pub struct VersionEventHub {
    version: DocumentVersionKind,
    events: broadcast::Sender<VersionEvent>,
    snapshots: broadcast::Sender<RemoteSnapshotVersionEvent>,
    consistency: broadcast::Sender<bool>,
    stats: RwLock<EventStats>,
}

impl std::fmt::Debug for VersionEventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionEventHub")
            .field("version", &self.version)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl VersionEventHub {
    pub fn new(version: DocumentVersionKind, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (snapshots, _) = broadcast::channel(capacity);
        let (consistency, _) = broadcast::channel(capacity);

        Self {
            version,
            events,
            snapshots,
            consistency,
            stats: RwLock::new(EventStats::default()),
        }
    }

    pub fn version(&self) -> DocumentVersionKind {
        self.version
    }

    /// 发布文档事件
    pub fn emit(&self, event: DocumentEvent) {
        debug!("[{}] emitting event: {}", self.version, event.event_type());
        let timestamp = chrono::Utc::now().timestamp_millis();

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(timestamp);
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.events.send(VersionEvent {
            version: self.version,
            event,
            timestamp,
        }) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    /// 发布远端快照
    pub fn emit_snapshot(&self, snapshot: RemoteSnapshotEvent) {
        self.stats.write().remote_snapshots += 1;
        let event = RemoteSnapshotVersionEvent {
            version: self.version,
            snapshot,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.snapshots.send(event) {
            debug!("Failed to broadcast remote snapshot (no active receivers): {}", e);
        }
    }

    /// 发布一致性变化
    pub fn emit_consistency(&self, consistent: bool) {
        debug!("[{}] consistency -> {}", self.version, consistent);
        let _ = self.consistency.send(consistent);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<VersionEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<RemoteSnapshotVersionEvent> {
        self.snapshots.subscribe()
    }

    pub fn subscribe_consistency(&self) -> broadcast::Receiver<bool> {
        self.consistency.subscribe()
    }

    /// 获取事件统计
    pub fn stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 事件流的活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

/// 把 broadcast 接收器转换成流，落后的订阅者跳过丢失的事件继续接收
///
/// 跳过的事件不会重放，只记录一条 warn。被跳过的可能是 `CommitFailed` 或 `RevisionGap`，
/// 需要准确状态时以 `pending_count()`、`is_consistent()` 和 `commit()` 的返回值为准。
pub fn broadcast_stream<T>(
    receiver: broadcast::Receiver<T>,
    label: &'static str,
) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(receiver, move |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(item) => return Some((item, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{} 订阅者处理过慢，跳过 {} 个事件", label, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// 消费者持有的输出流
///
/// 流存活期间持有共享监听的租约，drop 时释放。
pub struct VersionStream<T> {
    inner: BoxStream<'static, T>,
    _lease: ListenerLease,
}

impl<T> VersionStream<T> {
    pub fn new(inner: BoxStream<'static, T>, lease: ListenerLease) -> Self {
        Self {
            inner,
            _lease: lease,
        }
    }
}

impl<T> std::fmt::Debug for VersionStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionStream")
            .field("lease", &self._lease)
            .finish()
    }
}

impl<T> Stream for VersionStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_tags_version_and_updates_stats() {
        let hub = VersionEventHub::new(DocumentVersionKind::Draft, 8);
        let mut rx = hub.subscribe_events();

        hub.emit(DocumentEvent::Reconnect);
        hub.emit(DocumentEvent::Rebased { pending: 2 });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.version, DocumentVersionKind::Draft);
        assert_eq!(first.event, DocumentEvent::Reconnect);
        assert!(first.timestamp > 0);

        let stats = hub.stats();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.events_by_type.get("rebased"), Some(&1));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let hub = VersionEventHub::new(DocumentVersionKind::Published, 8);
        hub.emit(DocumentEvent::Reconnect);
        hub.emit_consistency(false);
        hub.emit_snapshot(RemoteSnapshotEvent {
            document: None,
            revision: None,
            origin: SnapshotOrigin::Snapshot,
        });
        assert_eq!(hub.stats().remote_snapshots, 1);
    }

    #[tokio::test]
    async fn test_lagging_stream_skips_and_continues() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = broadcast_stream(rx, "test");

        for i in 0..5 {
            tx.send(i).unwrap();
        }
        drop(tx);

        let received: Vec<i32> = stream.by_ref().collect().await;
        assert_eq!(received, vec![3, 4]);
    }

    #[test]
    fn test_event_wire_format() {
        let event = DocumentEvent::CommitFailed {
            transaction_ids: vec!["t1".into()],
            kind: CommitFailureKind::Transport,
            message: "offline".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "commit_failed",
                "transaction_ids": ["t1"],
                "kind": "Transport",
                "message": "offline"
            })
        );
    }
}
