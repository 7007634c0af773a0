//! 缓冲文档引擎
//!
//! 每个版本一个实例，维护：
//! - 远端基线（最后一次观察到的权威文档）
//! - 本地快照 = 基线 + 按顺序重放的待确认事务
//! - 待确认事务队列
//!
//! 调和规则：
//! 1. 回显（事务 ID 命中队列）：出队，把远端效果应用到基线，再重新投影。
//!    远端内容优先，本地事务不会被应用两次
//! 2. 外部编辑：应用到基线，在其上重放待确认事务
//! 3. reconnect：标记投递不再连续
//! 4. previous_revision 与基线版本不一致：不应用，等待新快照修复
//! 5. 快照：替换基线，恢复连续投递。快照版本（或文档 `_rev`）等于某个待确认事务的 ID 时，
//!    该事务及之前的事务都已包含在快照中，一并出队
//!
//! 状态更新是同步的，事件在持有状态锁时发出，因此订阅方看到的顺序与状态变化顺序一致。

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{DocPairError, Result};
use crate::events::{
    DocumentEvent, MutationOrigin, RemoteSnapshotEvent, SnapshotOrigin, VersionEventHub,
};
use crate::listener::{ListenerEvent, MutationTransition, ReconnectEvent};
use crate::multiplexer::ReconnectHandler;
use crate::mutation::{apply_all, Mutation, Transaction};
use crate::types::{document_revision, Document, DocumentVersionKind};

#[derive(Debug, Clone)]
struct PendingTransaction {
    transaction: Transaction,
    /// 是否已交给提交器
    submitted: bool,
}

#[derive(Debug)]
struct BufferedState {
    /// 远端基线
    base: Option<Document>,
    /// 基线对应的版本
    remote_revision: Option<String>,
    /// 最新观察到的远端版本（出现缺口时领先于 remote_revision）
    latest_revision: Option<String>,
    /// 本地快照
    snapshot: Option<Document>,
    pending: VecDeque<PendingTransaction>,
    /// 缺口期间被确认的本地事务，新快照到达前继续投影
    acknowledged_in_gap: Vec<Transaction>,
    consistent: bool,
    gapless: bool,
    has_remote: bool,
}

impl BufferedState {
    fn new() -> Self {
        Self {
            base: None,
            remote_revision: None,
            latest_revision: None,
            snapshot: None,
            pending: VecDeque::new(),
            acknowledged_in_gap: Vec::new(),
            consistent: true,
            gapless: true,
            has_remote: false,
        }
    }

    fn reproject(&mut self) {
        let doc = self
            .acknowledged_in_gap
            .iter()
            .fold(self.base.clone(), |doc, tx| tx.apply(doc));
        self.snapshot = self
            .pending
            .iter()
            .fold(doc, |doc, pending| pending.transaction.apply(doc));
    }

    /// 丢弃已包含在快照中的待确认事务，返回它们的 ID
    ///
    /// commit 按 mutate 顺序串行提交，命中的事务之前的事务也已被服务端应用。
    fn acknowledge_through(&mut self, revisions: &[&str]) -> Vec<String> {
        let Some(index) = self
            .pending
            .iter()
            .rposition(|p| p.submitted && revisions.contains(&p.transaction.id.as_str()))
        else {
            return Vec::new();
        };
        self.pending
            .drain(..=index)
            .map(|p| p.transaction.id)
            .collect()
    }

    fn compute_consistent(&self) -> bool {
        self.pending.is_empty() && self.remote_revision == self.latest_revision
    }
}

/// 缓冲文档
pub struct BufferedDocument {
    version: DocumentVersionKind,
    document_id: String,
    hub: VersionEventHub,
    state: Mutex<BufferedState>,
}

impl std::fmt::Debug for BufferedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedDocument")
            .field("version", &self.version)
            .field("document_id", &self.document_id)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl BufferedDocument {
    pub fn new<S: Into<String>>(
        version: DocumentVersionKind,
        document_id: S,
        event_buffer_size: usize,
    ) -> Self {
        Self {
            version,
            document_id: document_id.into(),
            hub: VersionEventHub::new(version, event_buffer_size),
            state: Mutex::new(BufferedState::new()),
        }
    }

    pub fn version(&self) -> DocumentVersionKind {
        self.version
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn hub(&self) -> &VersionEventHub {
        &self.hub
    }

    /// 应用本地 mutation，返回事务 ID
    ///
    /// 任何一个 mutation 的目标不是本文档时整体拒绝，不产生任何效果。
    pub fn mutate(&self, mutations: Vec<Mutation>) -> Result<String> {
        if mutations.is_empty() {
            return Err(DocPairError::InvalidArgument("mutations 不能为空".to_string()));
        }
        for mutation in &mutations {
            mutation.validate_for(&self.document_id)?;
        }

        let transaction = Transaction::new(mutations);
        let transaction_id = transaction.id.clone();

        let mut state = self.state.lock();
        state.snapshot = transaction.apply(state.snapshot.take());
        state.pending.push_back(PendingTransaction {
            transaction: transaction.clone(),
            submitted: false,
        });
        debug!(
            "[{}] 本地事务入队: {}, pending={}",
            self.version,
            transaction_id,
            state.pending.len()
        );

        self.hub.emit(DocumentEvent::LocalMutation {
            transaction_id: transaction_id.clone(),
            mutations: transaction.mutations,
        });
        self.update_consistency(&mut state);

        Ok(transaction_id)
    }

    /// 处理一条路由到本版本的监听事件
    pub fn apply_listener_event(&self, event: ListenerEvent) {
        match event {
            ListenerEvent::Reconnect => self.handle_reconnect(),
            ListenerEvent::Snapshot {
                document_id,
                document,
                revision,
            } => {
                if document_id != self.document_id {
                    warn!("[{}] 忽略不属于本文档的快照: {}", self.version, document_id);
                    return;
                }
                self.handle_snapshot(document, revision);
            }
            ListenerEvent::Mutation {
                document_id,
                transaction_id,
                effects,
                previous_revision,
                result_revision,
                transition,
            } => {
                if document_id != self.document_id {
                    warn!("[{}] 忽略不属于本文档的 mutation: {}", self.version, document_id);
                    return;
                }
                self.handle_remote_mutation(
                    transaction_id,
                    effects,
                    previous_revision,
                    result_revision,
                    transition,
                );
            }
        }
    }

    fn handle_reconnect(&self) {
        let mut state = self.state.lock();
        state.gapless = false;
        info!("[{}] 监听重连，投递可能不连续: {}", self.version, self.document_id);
        self.hub.emit(DocumentEvent::Reconnect);
    }

    fn handle_snapshot(&self, document: Option<Document>, revision: Option<String>) {
        let mut state = self.state.lock();
        debug!(
            "[{}] 收到快照: {}, revision={:?}",
            self.version, self.document_id, revision
        );

        let acknowledged = {
            let mut revisions: Vec<&str> = revision.iter().map(String::as_str).collect();
            revisions.extend(document.as_ref().and_then(document_revision));
            state.acknowledge_through(&revisions)
        };

        state.base = document.clone();
        state.remote_revision = revision.clone();
        state.latest_revision = revision.clone();
        state.acknowledged_in_gap.clear();
        state.gapless = true;
        state.has_remote = true;
        state.reproject();

        self.hub.emit(DocumentEvent::Snapshot {
            revision: revision.clone(),
            exists: document.is_some(),
        });
        if !acknowledged.is_empty() {
            info!(
                "[{}] 快照已包含 {} 个待确认事务: {}",
                self.version,
                acknowledged.len(),
                self.document_id
            );
            self.hub.emit(DocumentEvent::SnapshotAcknowledged {
                transaction_ids: acknowledged,
            });
        }
        self.hub.emit_snapshot(RemoteSnapshotEvent {
            document,
            revision,
            origin: SnapshotOrigin::Snapshot,
        });
        if !state.pending.is_empty() {
            self.hub.emit(DocumentEvent::Rebased {
                pending: state.pending.len(),
            });
        }
        self.update_consistency(&mut state);
    }

    fn handle_remote_mutation(
        &self,
        transaction_id: String,
        effects: Vec<Mutation>,
        previous_revision: Option<String>,
        result_revision: Option<String>,
        transition: MutationTransition,
    ) {
        let mut state = self.state.lock();

        let echo_index = state
            .pending
            .iter()
            .position(|p| p.transaction.id == transaction_id);

        if previous_revision.is_some() && previous_revision != state.remote_revision {
            warn!(
                "[{}] 版本不连续: {}, expected={:?}, received={:?}, tx={}",
                self.version,
                self.document_id,
                state.remote_revision,
                previous_revision,
                transaction_id
            );
            state.latest_revision = result_revision.or_else(|| Some(transaction_id.clone()));
            // 已被服务端确认的本地事务不再等待回显，由下一次快照包含
            if let Some(index) = echo_index {
                if let Some(acknowledged) = state.pending.remove(index) {
                    state.acknowledged_in_gap.push(acknowledged.transaction);
                }
            }
            self.hub.emit(DocumentEvent::RevisionGap {
                transaction_id,
                expected: state.remote_revision.clone(),
                received: previous_revision,
            });
            self.update_consistency(&mut state);
            return;
        }

        let origin = match echo_index {
            Some(index) => {
                state.pending.remove(index);
                MutationOrigin::Local
            }
            None => MutationOrigin::Remote,
        };

        let revision = result_revision.clone().unwrap_or_else(|| transaction_id.clone());
        let base = state.base.take();
        state.base = apply_all(base, &effects, &revision);
        state.remote_revision = Some(revision.clone());
        state.latest_revision = Some(revision);
        state.has_remote = true;
        state.reproject();

        debug!(
            "[{}] 应用远端 mutation: {}, origin={:?}, pending={}",
            self.version,
            transaction_id,
            origin,
            state.pending.len()
        );

        self.hub.emit(DocumentEvent::RemoteMutation {
            transaction_id,
            result_revision: state.remote_revision.clone(),
            origin,
            transition,
        });
        self.hub.emit_snapshot(RemoteSnapshotEvent {
            document: state.base.clone(),
            revision: state.remote_revision.clone(),
            origin: SnapshotOrigin::RemoteMutation,
        });
        if origin == MutationOrigin::Remote && !state.pending.is_empty() {
            self.hub.emit(DocumentEvent::Rebased {
                pending: state.pending.len(),
            });
        }
        self.update_consistency(&mut state);
    }

    fn update_consistency(&self, state: &mut BufferedState) {
        let consistent = state.compute_consistent();
        if consistent != state.consistent {
            state.consistent = consistent;
            self.hub.emit_consistency(consistent);
        }
    }

    /// 取出所有未提交的事务并标记为已提交
    pub fn take_unsubmitted(&self) -> Vec<Transaction> {
        let mut state = self.state.lock();
        state
            .pending
            .iter_mut()
            .filter(|p| !p.submitted)
            .map(|p| {
                p.submitted = true;
                p.transaction.clone()
            })
            .collect()
    }

    /// commit 失败后把事务恢复为未提交状态
    pub fn restore_unsubmitted(&self, transaction_ids: &[String]) {
        let mut state = self.state.lock();
        for pending in state.pending.iter_mut() {
            if transaction_ids.contains(&pending.transaction.id) {
                pending.submitted = false;
            }
        }
    }

    /// 丢弃全部待确认事务，本地快照回到远端基线
    pub fn clear_pending(&self) -> usize {
        let mut state = self.state.lock();
        let discarded = state.pending.len();
        state.pending.clear();
        state.reproject();
        info!("[{}] 清空待确认队列: {}, discarded={}", self.version, self.document_id, discarded);
        self.hub.emit(DocumentEvent::PendingCleared { discarded });
        self.update_consistency(&mut state);
        discarded
    }

    /// 当前一致性及后续变化的订阅（在同一把锁内完成，不会漏掉变化）
    pub fn watch_consistency(&self) -> (bool, broadcast::Receiver<bool>) {
        let state = self.state.lock();
        (state.consistent, self.hub.subscribe_consistency())
    }

    /// 本地快照（含待确认编辑）
    pub fn snapshot(&self) -> Option<Document> {
        self.state.lock().snapshot.clone()
    }

    /// 远端基线
    pub fn remote_document(&self) -> Option<Document> {
        self.state.lock().base.clone()
    }

    pub fn remote_revision(&self) -> Option<String> {
        self.state.lock().remote_revision.clone()
    }

    /// 是否收到过远端快照或 mutation
    pub fn has_remote(&self) -> bool {
        self.state.lock().has_remote
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 待确认事务 ID（按 mutate 顺序）
    pub fn pending_transaction_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|p| p.transaction.id.clone())
            .collect()
    }

    pub fn is_consistent(&self) -> bool {
        self.state.lock().consistent
    }

    pub fn is_gapless(&self) -> bool {
        self.state.lock().gapless
    }
}

impl ReconnectHandler for BufferedDocument {
    fn on_reconnect(&self, _event: &ReconnectEvent) {
        self.handle_reconnect();
    }
}
