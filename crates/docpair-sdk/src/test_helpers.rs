//! 内存版监听源与提交器，供单元测试和 demo 使用

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::committer::{CommitRequest, MutationCommitter};
use crate::error::{DocPairError, Result};
use crate::listener::{ListenerEvent, ListenerSource, MutationTransition};
use crate::mutation::Mutation;
use crate::types::{Document, IdPair};

#[derive(Default)]
struct MemoryListenerInner {
    senders: Mutex<Vec<mpsc::UnboundedSender<ListenerEvent>>>,
    opened: AtomicUsize,
    released: Arc<AtomicUsize>,
    listened: Mutex<Vec<IdPair>>,
}

/// 内存监听源：测试代码通过 `emit` 推送事件
#[derive(Clone, Default)]
pub struct MemoryListener {
    inner: Arc<MemoryListenerInner>,
}

impl std::fmt::Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener")
            .field("opened", &self.opened())
            .field("released", &self.released())
            .finish()
    }
}

/// 流被 drop 或自然结束时计数
struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl MemoryListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// 向所有打开的流推送事件，返回送达的流数量
    pub fn emit(&self, event: ListenerEvent) -> usize {
        let mut senders = self.inner.senders.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }

    /// 打开过的流数量
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// 已释放的流数量
    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// 当前仍打开的流数量
    pub fn open_streams(&self) -> usize {
        self.opened() - self.released()
    }

    /// 被监听过的 ID 对
    pub fn listened(&self) -> Vec<IdPair> {
        self.inner.listened.lock().clone()
    }

    /// 结束所有打开的流（模拟监听源关闭）
    pub fn close_all(&self) {
        self.inner.senders.lock().clear();
    }
}

impl ListenerSource for MemoryListener {
    fn listen(&self, id_pair: &IdPair) -> BoxStream<'static, ListenerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.senders.lock().push(tx);
        self.inner.listened.lock().push(id_pair.clone());
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        debug!("MemoryListener 打开流: {}", id_pair);

        let guard = ReleaseGuard(self.inner.released.clone());
        stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|event| (event, (rx, guard)))
        })
        .boxed()
    }
}

/// 构造快照事件
pub fn snapshot_event(
    document_id: &str,
    document: Option<Document>,
    revision: Option<&str>,
) -> ListenerEvent {
    ListenerEvent::Snapshot {
        document_id: document_id.to_string(),
        document,
        revision: revision.map(str::to_string),
    }
}

/// 构造 mutation 事件
pub fn mutation_event(
    document_id: &str,
    transaction_id: &str,
    effects: Vec<Mutation>,
    previous_revision: Option<&str>,
    result_revision: Option<&str>,
) -> ListenerEvent {
    ListenerEvent::Mutation {
        document_id: document_id.to_string(),
        transaction_id: transaction_id.to_string(),
        effects,
        previous_revision: previous_revision.map(str::to_string),
        result_revision: result_revision.map(str::to_string),
        transition: MutationTransition::Update,
    }
}

/// 轮询直到条件成立（最多约 2 秒）
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// 记录所有 commit 请求的提交器
#[derive(Debug, Default)]
pub struct RecordingCommitter {
    requests: Mutex<Vec<CommitRequest>>,
    failures: Mutex<VecDeque<DocPairError>>,
    latency: Option<Duration>,
}

impl RecordingCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次 commit 先等待一段时间
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// 下一次 commit 返回指定错误
    pub fn fail_next(&self, error: DocPairError) {
        self.failures.lock().push_back(error);
    }

    pub fn requests(&self) -> Vec<CommitRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl MutationCommitter for RecordingCommitter {
    async fn commit(&self, request: CommitRequest) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.requests.lock().push(request);
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// 模拟服务端：提交成功后把事务作为 mutation 事件回显到监听源
#[derive(Debug)]
pub struct EchoCommitter {
    listener: MemoryListener,
    recorder: RecordingCommitter,
    /// 每个文档的当前版本号
    revisions: Mutex<HashMap<String, String>>,
}

impl EchoCommitter {
    pub fn new(listener: MemoryListener) -> Self {
        Self {
            listener,
            recorder: RecordingCommitter::new(),
            revisions: Mutex::new(HashMap::new()),
        }
    }

    /// 设置文档的当前版本号（与初始快照保持一致）
    pub fn seed_revision(&self, document_id: &str, revision: &str) {
        self.revisions
            .lock()
            .insert(document_id.to_string(), revision.to_string());
    }

    pub fn fail_next(&self, error: DocPairError) {
        self.recorder.fail_next(error);
    }

    pub fn requests(&self) -> Vec<CommitRequest> {
        self.recorder.requests()
    }

    fn echo(&self, request: &CommitRequest) {
        let mut revisions = self.revisions.lock();
        for transaction in &request.transactions {
            let mut by_document: Vec<(String, Vec<Mutation>)> = Vec::new();
            for mutation in &transaction.mutations {
                let Some(id) = mutation.document_id() else {
                    continue;
                };
                match by_document.iter_mut().find(|(doc_id, _)| doc_id == id) {
                    Some((_, effects)) => effects.push(mutation.clone()),
                    None => by_document.push((id.to_string(), vec![mutation.clone()])),
                }
            }

            for (document_id, effects) in by_document {
                let transition = match effects.last() {
                    Some(Mutation::Delete(_)) => MutationTransition::Disappear,
                    Some(Mutation::Create(_)) => MutationTransition::Appear,
                    _ => MutationTransition::Update,
                };
                let previous = revisions.insert(document_id.clone(), transaction.id.clone());
                self.listener.emit(ListenerEvent::Mutation {
                    document_id,
                    transaction_id: transaction.id.clone(),
                    effects,
                    previous_revision: previous,
                    result_revision: Some(transaction.id.clone()),
                    transition,
                });
            }
        }
    }
}

#[async_trait]
impl MutationCommitter for EchoCommitter {
    async fn commit(&self, request: CommitRequest) -> Result<()> {
        self.recorder.commit(request.clone()).await?;
        self.echo(&request);
        Ok(())
    }
}
