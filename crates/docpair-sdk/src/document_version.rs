//! 单个版本（草稿或发布）的对外接口

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info};

use crate::buffered_doc::BufferedDocument;
use crate::committer::{CommitOptions, CommitRequest, MutationCommitter};
use crate::error::{CommitFailureKind, Result};
use crate::events::{
    broadcast_stream, DocumentEvent, EventStats, RemoteSnapshotVersionEvent, VersionEvent,
    VersionStream,
};
use crate::multiplexer::ListenerMultiplexer;
use crate::mutation::{DeleteMutation, Mutation, PatchMutation, PatchOperations};
use crate::types::{Document, DocumentVersionKind};

/// 单个版本
///
/// 克隆开销很小，所有克隆共享同一个缓冲文档和 commit 锁。
#[derive(Clone)]
pub struct DocumentVersion {
    version: DocumentVersionKind,
    document: Arc<BufferedDocument>,
    mux: Arc<ListenerMultiplexer>,
    committer: Arc<dyn MutationCommitter>,
    commit_options: CommitOptions,
    /// 保证同一版本同时最多一个 commit 在进行
    commit_lock: Arc<AsyncMutex<()>>,
}

impl std::fmt::Debug for DocumentVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentVersion")
            .field("version", &self.version)
            .field("document", &self.document)
            .finish()
    }
}

impl DocumentVersion {
    pub(crate) fn new(
        document: Arc<BufferedDocument>,
        mux: Arc<ListenerMultiplexer>,
        committer: Arc<dyn MutationCommitter>,
        commit_options: CommitOptions,
    ) -> Self {
        Self {
            version: document.version(),
            document,
            mux,
            committer,
            commit_options,
            commit_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    pub fn version(&self) -> DocumentVersionKind {
        self.version
    }

    /// 本版本的文档 ID
    pub fn document_id(&self) -> &str {
        self.document.document_id()
    }

    // ========== mutation 构造 ==========

    /// 每组 patch 操作生成一个针对本文档的 patch mutation
    pub fn patch(&self, operations: Vec<PatchOperations>) -> Vec<Mutation> {
        operations
            .into_iter()
            .map(|operations| {
                Mutation::Patch(PatchMutation {
                    id: self.document_id().to_string(),
                    operations,
                })
            })
            .collect()
    }

    pub fn create(&self, document: Document) -> Mutation {
        Mutation::Create(self.with_id(document))
    }

    pub fn create_if_not_exists(&self, document: Document) -> Mutation {
        Mutation::CreateIfNotExists(self.with_id(document))
    }

    pub fn create_or_replace(&self, document: Document) -> Mutation {
        Mutation::CreateOrReplace(self.with_id(document))
    }

    pub fn delete(&self) -> Mutation {
        Mutation::Delete(DeleteMutation {
            id: self.document_id().to_string(),
        })
    }

    fn with_id(&self, mut document: Document) -> Document {
        if let Some(map) = document.as_object_mut() {
            map.insert("_id".to_string(), Value::String(self.document_id().to_string()));
        }
        document
    }

    // ========== 编辑与提交 ==========

    /// 同步应用到本地快照并加入待确认队列，返回事务 ID
    pub fn mutate(&self, mutations: Vec<Mutation>) -> Result<String> {
        self.document.mutate(mutations)
    }

    /// 提交所有未提交的事务
    ///
    /// 失败时事务回到未提交状态，可以再次 commit；成功后事务仍在队列中，直到回显到达。
    pub async fn commit(&self) -> Result<()> {
        let _guard = self.commit_lock.lock().await;

        let transactions = self.document.take_unsubmitted();
        if transactions.is_empty() {
            debug!("[{}] 没有需要提交的事务", self.version);
            return Ok(());
        }

        let request = CommitRequest {
            transactions,
            options: self.commit_options.clone(),
        };
        let transaction_ids = request.transaction_ids();
        info!(
            "[{}] 提交 {} 个事务: {}",
            self.version,
            transaction_ids.len(),
            self.document_id()
        );

        match self.committer.commit(request).await {
            Ok(()) => {
                self.document
                    .hub()
                    .emit(DocumentEvent::Committed { transaction_ids });
                Ok(())
            }
            Err(e) => {
                error!("[{}] commit 失败: {}, error={}", self.version, self.document_id(), e);
                self.document.restore_unsubmitted(&transaction_ids);
                self.document.hub().emit(DocumentEvent::CommitFailed {
                    transaction_ids,
                    kind: e.failure_kind().unwrap_or(CommitFailureKind::Rejected),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// 丢弃全部待确认事务（例如 commit 被拒绝后），返回丢弃数量
    pub fn clear_pending(&self) -> usize {
        self.document.clear_pending()
    }

    // ========== 输出流 ==========

    /// 本版本的事件流
    ///
    /// 缓冲区大小由 `event_buffer_size` 决定。消费过慢时溢出的事件会被跳过（记录 warn），
    /// 其中可能包括 `CommitFailed` 和 `RevisionGap`。事件流只用于观察过程，
    /// 判断状态请使用 `pending_count()`、`is_consistent()` 以及 `commit()` 的返回值。
    pub fn events(&self) -> VersionStream<VersionEvent> {
        let receiver = self.document.hub().subscribe_events();
        let lease = self.mux.acquire();
        VersionStream::new(broadcast_stream(receiver, "events"), lease)
    }

    /// 远端权威文档的快照流
    pub fn remote_snapshots(&self) -> VersionStream<RemoteSnapshotVersionEvent> {
        let receiver = self.document.hub().subscribe_snapshots();
        let lease = self.mux.acquire();
        VersionStream::new(broadcast_stream(receiver, "remote_snapshots"), lease)
    }

    /// 一致性流：先给出当前值，之后只在变化时产生
    pub fn consistency(&self) -> VersionStream<bool> {
        let (current, receiver) = self.document.watch_consistency();
        let lease = self.mux.acquire();
        let inner = stream::once(async move { current })
            .chain(broadcast_stream(receiver, "consistency"))
            .scan(None, |last: &mut Option<bool>, value| {
                let changed = *last != Some(value);
                *last = Some(value);
                futures::future::ready(Some(changed.then_some(value)))
            })
            .filter_map(futures::future::ready)
            .boxed();
        VersionStream::new(inner, lease)
    }

    // ========== 状态查询 ==========

    /// 本地快照（含未确认的编辑）
    pub fn snapshot(&self) -> Option<Document> {
        self.document.snapshot()
    }

    /// 远端基线
    pub fn remote_document(&self) -> Option<Document> {
        self.document.remote_document()
    }

    pub fn remote_revision(&self) -> Option<String> {
        self.document.remote_revision()
    }

    pub fn pending_count(&self) -> usize {
        self.document.pending_count()
    }

    pub fn pending_transaction_ids(&self) -> Vec<String> {
        self.document.pending_transaction_ids()
    }

    pub fn is_consistent(&self) -> bool {
        self.document.is_consistent()
    }

    pub fn is_gapless(&self) -> bool {
        self.document.is_gapless()
    }

    pub fn has_remote(&self) -> bool {
        self.document.has_remote()
    }

    pub fn event_stats(&self) -> EventStats {
        self.document.hub().stats()
    }
}
