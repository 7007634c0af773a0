//! 草稿/发布文档对
//!
//! `Pair::checkout` 组装一条共享监听、两个缓冲文档和两个版本 worker：
//!
//! ```text
//! ListenerSource ─▶ ListenerMultiplexer ─┬─▶ draft worker ─────▶ BufferedDocument(draft)
//!                                        └─▶ published worker ─▶ BufferedDocument(published)
//! ```
//!
//! worker 按到达顺序逐条处理本版本的事件；配置了 `mutation_event_delay` 的版本在处理
//! mutation 事件前先等待，后续事件排在其后，顺序不变。
//!
//! 两个缓冲文档同时注册为重连处理器。重连由监听任务直接通知，不经过 worker，
//! 因此不受延迟影响，两个版本在下一条事件路由前都已标记投递不连续。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::buffered_doc::BufferedDocument;
use crate::committer::MutationCommitter;
use crate::config::PairConfig;
use crate::document_version::DocumentVersion;
use crate::events::{broadcast_stream, VersionStream};
use crate::listener::{ListenerEvent, ListenerSource, ReconnectEvent};
use crate::multiplexer::{ListenerMultiplexer, ListenerStats};
use crate::types::{DocumentVersionKind, IdPair};

/// 一次编辑会话中的文档对
#[derive(Debug)]
pub struct Pair {
    id_pair: IdPair,
    draft: DocumentVersion,
    published: DocumentVersion,
    mux: Arc<ListenerMultiplexer>,
}

impl Pair {
    /// 检出文档对（需要在 Tokio 运行时内调用）
    ///
    /// 此时不会打开监听，第一个订阅输出流的消费者才会打开。
    pub fn checkout(
        id_pair: IdPair,
        source: Arc<dyn ListenerSource>,
        committer: Arc<dyn MutationCommitter>,
        config: PairConfig,
    ) -> Self {
        info!("检出文档对: {}", id_pair);

        let (mux, outputs) =
            ListenerMultiplexer::subscribe(id_pair.clone(), source, config.event_buffer_size);

        let draft = Self::spawn_version(
            DocumentVersionKind::Draft,
            &id_pair,
            outputs.draft,
            &mux,
            &committer,
            &config,
        );
        let published = Self::spawn_version(
            DocumentVersionKind::Published,
            &id_pair,
            outputs.published,
            &mux,
            &committer,
            &config,
        );

        Self {
            id_pair,
            draft,
            published,
            mux,
        }
    }

    fn spawn_version(
        version: DocumentVersionKind,
        id_pair: &IdPair,
        route: mpsc::UnboundedReceiver<ListenerEvent>,
        mux: &Arc<ListenerMultiplexer>,
        committer: &Arc<dyn MutationCommitter>,
        config: &PairConfig,
    ) -> DocumentVersion {
        let document = Arc::new(BufferedDocument::new(
            version,
            id_pair.id_for(version),
            config.event_buffer_size,
        ));
        let delay = config.version(version).mutation_event_delay;

        mux.add_reconnect_handler(document.clone());
        tokio::spawn(run_version_worker(route, document.clone(), delay));

        DocumentVersion::new(
            document,
            mux.clone(),
            committer.clone(),
            config.commit_options.clone(),
        )
    }

    pub fn id_pair(&self) -> &IdPair {
        &self.id_pair
    }

    pub fn draft(&self) -> &DocumentVersion {
        &self.draft
    }

    pub fn published(&self) -> &DocumentVersion {
        &self.published
    }

    pub fn version(&self, version: DocumentVersionKind) -> &DocumentVersion {
        match version {
            DocumentVersionKind::Draft => &self.draft,
            DocumentVersionKind::Published => &self.published,
        }
    }

    /// 重连通知流
    pub fn reconnects(&self) -> VersionStream<ReconnectEvent> {
        let receiver = self.mux.subscribe_reconnects();
        let lease = self.mux.acquire();
        VersionStream::new(broadcast_stream(receiver, "reconnects"), lease)
    }

    /// 共享监听的统计信息
    pub fn listener_stats(&self) -> ListenerStats {
        self.mux.stats()
    }

    /// 共享监听是否在运行
    pub fn is_listening(&self) -> bool {
        self.mux.is_active()
    }

    /// 没有输出流消费者，也没有待确认的本地编辑
    pub fn is_detached(&self) -> bool {
        self.mux.consumer_count() == 0
            && self.draft.pending_count() == 0
            && self.published.pending_count() == 0
    }
}

async fn run_version_worker(
    mut route: mpsc::UnboundedReceiver<ListenerEvent>,
    document: Arc<BufferedDocument>,
    mutation_event_delay: Option<Duration>,
) {
    let version = document.version();
    while let Some(event) = route.recv().await {
        if let (Some(delay), ListenerEvent::Mutation { transaction_id, .. }) =
            (mutation_event_delay, &event)
        {
            debug!("[{}] 延迟 {:?} 处理 mutation: {}", version, delay, transaction_id);
            tokio::time::sleep(delay).await;
        }
        document.apply_listener_event(event);
    }
    debug!("[{}] 路由关闭，worker 退出: {}", version, document.document_id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CommitFailureKind, DocPairError};
    use crate::events::{DocumentEvent, SnapshotOrigin, VersionEvent};
    use crate::mutation::PatchOperations;
    use crate::test_helpers::{
        mutation_event, snapshot_event, wait_until, EchoCommitter, MemoryListener,
        RecordingCommitter,
    };
    use futures::{Stream, StreamExt};
    use serde_json::json;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, task};

    fn checkout_with(
        committer: Arc<dyn MutationCommitter>,
        config: PairConfig,
    ) -> (MemoryListener, Pair) {
        let listener = MemoryListener::new();
        let pair = Pair::checkout(
            IdPair::new("drafts.abc", "abc"),
            Arc::new(listener.clone()),
            committer,
            config,
        );
        (listener, pair)
    }

    async fn next<S, T>(stream: &mut S) -> T
    where
        S: Stream<Item = T> + Unpin,
    {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for stream item")
            .expect("stream ended")
    }

    async fn next_matching<S, F>(stream: &mut S, predicate: F) -> VersionEvent
    where
        S: Stream<Item = VersionEvent> + Unpin,
        F: Fn(&DocumentEvent) -> bool,
    {
        loop {
            let event = next(stream).await;
            if predicate(&event.event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_local_create_becomes_consistent_after_echo() {
        let committer = Arc::new(RecordingCommitter::new());
        let (listener, pair) = checkout_with(committer.clone(), PairConfig::default());
        let draft = pair.draft();

        let mut consistency = draft.consistency();
        assert!(next(&mut consistency).await);

        let create = draft.create(json!({"title": "hello"}));
        assert_eq!(create.document_id(), Some("drafts.abc"));

        let tx_id = draft.mutate(vec![create.clone()]).unwrap();
        assert!(!next(&mut consistency).await);

        draft.commit().await.unwrap();
        let requests = committer.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].transaction_ids(), vec![tx_id.clone()]);
        assert_eq!(requests[0].options.tag, "document.commit");

        listener.emit(mutation_event("drafts.abc", &tx_id, vec![create], None, Some(&tx_id)));
        assert!(next(&mut consistency).await);
        assert_eq!(draft.pending_count(), 0);
        assert_eq!(draft.snapshot().unwrap()["title"], json!("hello"));
    }

    #[tokio::test]
    async fn test_remote_snapshot_keeps_published_consistent() {
        let (listener, pair) =
            checkout_with(Arc::new(RecordingCommitter::new()), PairConfig::default());
        let published = pair.published();

        let mut consistency = published.consistency();
        let mut snapshots = published.remote_snapshots();
        assert!(next(&mut consistency).await);

        let body = json!({"_id": "abc", "_rev": "R2", "title": "live"});
        listener.emit(snapshot_event("abc", Some(body.clone()), Some("R2")));

        let received = next(&mut snapshots).await;
        assert_eq!(received.version, DocumentVersionKind::Published);
        assert_eq!(received.snapshot.document, Some(body));
        assert_eq!(received.snapshot.revision.as_deref(), Some("R2"));
        assert_eq!(received.snapshot.origin, SnapshotOrigin::Snapshot);

        let mut pending = task::spawn(consistency.next());
        assert_pending!(pending.poll());
        assert!(published.is_consistent());
    }

    #[tokio::test]
    async fn test_reconnect_reaches_both_versions_first() {
        let (listener, pair) =
            checkout_with(Arc::new(RecordingCommitter::new()), PairConfig::default());
        let mut draft_events = pair.draft().events();
        let mut published_events = pair.published().events();
        let mut reconnects = pair.reconnects();

        listener.emit(ListenerEvent::Reconnect);
        listener.emit(snapshot_event("drafts.abc", None, Some("d1")));
        listener.emit(snapshot_event("abc", None, Some("p1")));

        for events in [&mut draft_events, &mut published_events] {
            let first = next(&mut *events).await;
            assert_eq!(first.event, DocumentEvent::Reconnect);
            let second = next(&mut *events).await;
            assert_eq!(second.event.event_type(), "snapshot");
        }

        assert!(next(&mut reconnects).await.timestamp > 0);
        assert_eq!(pair.listener_stats().reconnects, 1);
        assert!(pair.draft().is_gapless());
    }

    #[tokio::test]
    async fn test_reconnect_is_not_held_back_by_delayed_version() {
        let config = PairConfig::builder()
            .mutation_event_delay(DocumentVersionKind::Published, Duration::from_millis(500))
            .build();
        let (listener, pair) = checkout_with(Arc::new(RecordingCommitter::new()), config);
        let mut draft_events = pair.draft().events();
        let mut published_events = pair.published().events();

        listener.emit(mutation_event(
            "abc",
            "t1",
            vec![crate::mutation::Mutation::CreateOrReplace(json!({"_id": "abc"}))],
            None,
            Some("p1"),
        ));
        listener.emit(ListenerEvent::Reconnect);
        listener.emit(snapshot_event("drafts.abc", None, Some("d1")));

        let snapshot = next_matching(&mut draft_events, |event| {
            matches!(event, DocumentEvent::Snapshot { .. })
        })
        .await;
        assert_eq!(snapshot.version, DocumentVersionKind::Draft);
        assert!(pair.draft().is_gapless());
        // published 的 worker 仍在等待 t1，重连已经送达
        assert!(!pair.published().is_gapless());
        assert!(!pair.published().has_remote());

        let first = timeout(Duration::from_millis(200), published_events.next())
            .await
            .expect("reconnect held behind delayed mutation")
            .expect("stream ended");
        assert_eq!(first.event, DocumentEvent::Reconnect);

        let applied = next_matching(&mut published_events, |event| {
            matches!(event, DocumentEvent::RemoteMutation { .. })
        })
        .await;
        assert_eq!(applied.version, DocumentVersionKind::Published);
        assert!(!pair.published().is_gapless());
    }

    #[tokio::test]
    async fn test_detached_after_streams_drop() {
        let (_listener, pair) =
            checkout_with(Arc::new(RecordingCommitter::new()), PairConfig::default());
        assert!(pair.is_detached());

        let events = pair.draft().events();
        assert!(!pair.is_detached());
        drop(events);
        assert!(pair.is_detached());

        let draft = pair.draft();
        draft.mutate(vec![draft.create(json!({}))]).unwrap();
        assert!(!pair.is_detached());
        draft.clear_pending();
        assert!(pair.is_detached());
    }

    #[tokio::test]
    async fn test_events_are_version_tagged() {
        let (listener, pair) =
            checkout_with(Arc::new(RecordingCommitter::new()), PairConfig::default());
        let mut draft_events = pair.draft().events();
        let mut published_events = pair.published().events();

        listener.emit(snapshot_event("abc", None, Some("p1")));
        listener.emit(snapshot_event("drafts.abc", None, Some("d1")));

        let published = next(&mut published_events).await;
        assert_eq!(published.version, DocumentVersionKind::Published);
        let draft = next(&mut draft_events).await;
        assert_eq!(draft.version, DocumentVersionKind::Draft);
        assert_eq!(
            draft.event,
            DocumentEvent::Snapshot {
                revision: Some("d1".into()),
                exists: false
            }
        );
    }

    #[tokio::test]
    async fn test_teardown_releases_subscription_once() {
        let (listener, pair) =
            checkout_with(Arc::new(RecordingCommitter::new()), PairConfig::default());
        assert_eq!(listener.opened(), 0);

        let draft_events = pair.draft().events();
        let draft_consistency = pair.draft().consistency();
        let published_snapshots = pair.published().remote_snapshots();
        assert_eq!(listener.opened(), 1);
        assert!(pair.is_listening());

        drop(draft_events);
        drop(published_snapshots);
        assert!(pair.is_listening());
        drop(draft_consistency);

        assert!(wait_until(|| listener.released() == 1).await);
        assert!(!pair.is_listening());
        assert_eq!(listener.opened(), 1);

        let _again = pair.published().events();
        assert_eq!(listener.opened(), 2);
        assert_eq!(pair.listener_stats().subscriptions_released, 1);
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_queue() {
        let committer = Arc::new(RecordingCommitter::new());
        let (_listener, pair) = checkout_with(committer.clone(), PairConfig::default());
        let draft = pair.draft();
        let mut events = draft.events();

        let tx_id = draft
            .mutate(vec![draft.create(json!({"title": "offline"}))])
            .unwrap();
        committer.fail_next(DocPairError::TransportUnavailable("connection refused".into()));

        let err = draft.commit().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(draft.pending_transaction_ids(), vec![tx_id.clone()]);
        assert!(!draft.is_consistent());

        let failed = next_matching(&mut events, |e| e.event_type() == "commit_failed").await;
        match failed.event {
            DocumentEvent::CommitFailed {
                transaction_ids,
                kind,
                ..
            } => {
                assert_eq!(transaction_ids, vec![tx_id.clone()]);
                assert_eq!(kind, CommitFailureKind::Transport);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        draft.commit().await.unwrap();
        let requests = committer.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].transaction_ids(), vec![tx_id]);
        next_matching(&mut events, |e| e.event_type() == "committed").await;
    }

    #[tokio::test]
    async fn test_state_queries_survive_skipped_commit_failure() {
        let committer = Arc::new(RecordingCommitter::new());
        let config = PairConfig::builder().event_buffer_size(2).build();
        let (_listener, pair) = checkout_with(committer.clone(), config);
        let draft = pair.draft();
        let mut events = draft.events();

        draft.mutate(vec![draft.create(json!({}))]).unwrap();
        committer.fail_next(DocPairError::TransportUnavailable("connection refused".into()));
        assert!(draft.commit().await.is_err());
        for n in 0..3 {
            draft
                .mutate(draft.patch(vec![PatchOperations::new().set("n", json!(n))]))
                .unwrap();
        }

        // 缓冲区溢出，CommitFailed 已被跳过
        for _ in 0..2 {
            assert_eq!(next(&mut events).await.event.event_type(), "local_mutation");
        }
        assert!(timeout(Duration::from_millis(50), events.next()).await.is_err());

        assert_eq!(draft.pending_count(), 4);
        assert!(!draft.is_consistent());
        let stats = draft.event_stats();
        assert_eq!(stats.events_by_type.get("commit_failed"), Some(&1));
    }

    #[tokio::test]
    async fn test_rejected_commit_then_clear_pending() {
        let committer = Arc::new(RecordingCommitter::new());
        let (listener, pair) = checkout_with(committer.clone(), PairConfig::default());
        let draft = pair.draft();
        let _events = draft.events();

        listener.emit(snapshot_event(
            "drafts.abc",
            Some(json!({"_id": "drafts.abc", "title": "server"})),
            Some("r1"),
        ));
        assert!(wait_until(|| draft.has_remote()).await);

        draft
            .mutate(draft.patch(vec![PatchOperations::new().set("title", json!("bad"))]))
            .unwrap();
        committer.fail_next(DocPairError::rejected("permission denied"));

        let err = draft.commit().await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(draft.pending_count(), 1);

        assert_eq!(draft.clear_pending(), 1);
        assert!(draft.is_consistent());
        assert_eq!(draft.snapshot().unwrap()["title"], json!("server"));
    }

    #[tokio::test]
    async fn test_concurrent_commits_are_serialized() {
        let committer = Arc::new(RecordingCommitter::with_latency(Duration::from_millis(50)));
        let (_listener, pair) = checkout_with(committer.clone(), PairConfig::default());
        let draft = pair.draft().clone();

        draft
            .mutate(vec![draft.create_if_not_exists(json!({}))])
            .unwrap();

        let other = draft.clone();
        let (first, second) = tokio::join!(draft.commit(), other.commit());
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(committer.request_count(), 1);
    }

    #[tokio::test]
    async fn test_echo_round_trip_through_listener() {
        let listener = MemoryListener::new();
        let committer = Arc::new(EchoCommitter::new(listener.clone()));
        let pair = Pair::checkout(
            IdPair::new("drafts.abc", "abc"),
            Arc::new(listener.clone()),
            committer.clone(),
            PairConfig::default(),
        );
        let draft = pair.draft();
        let _events = draft.events();

        listener.emit(snapshot_event(
            "drafts.abc",
            Some(json!({"_id": "drafts.abc", "count": 1})),
            Some("r1"),
        ));
        committer.seed_revision("drafts.abc", "r1");
        assert!(wait_until(|| draft.has_remote()).await);

        draft
            .mutate(draft.patch(vec![PatchOperations::new().inc("count", json!(1))]))
            .unwrap();
        draft
            .mutate(draft.patch(vec![PatchOperations::new().inc("count", json!(1))]))
            .unwrap();
        assert_eq!(draft.snapshot().unwrap()["count"], json!(3));

        draft.commit().await.unwrap();
        assert!(wait_until(|| draft.is_consistent()).await);
        assert_eq!(draft.snapshot().unwrap()["count"], json!(3));
        assert_eq!(draft.remote_document().unwrap()["count"], json!(3));
        assert_eq!(committer.requests()[0].transactions.len(), 2);
    }

    #[tokio::test]
    async fn test_mutation_event_delay_applies_to_one_version() {
        let config = PairConfig::builder()
            .mutation_event_delay(DocumentVersionKind::Published, Duration::from_millis(200))
            .build();
        let (listener, pair) = checkout_with(Arc::new(RecordingCommitter::new()), config);
        let _draft_events = pair.draft().events();
        let _published_events = pair.published().events();

        let touch = |id: &str| {
            crate::mutation::Mutation::CreateOrReplace(json!({"_id": id, "touched": true}))
        };
        listener.emit(mutation_event("abc", "t1", vec![touch("abc")], None, Some("p1")));
        listener.emit(mutation_event(
            "drafts.abc",
            "t2",
            vec![touch("drafts.abc")],
            None,
            Some("d1"),
        ));

        assert!(wait_until(|| pair.draft().has_remote()).await);
        assert!(!pair.published().has_remote());
        assert!(wait_until(|| pair.published().has_remote()).await);
        assert_eq!(pair.published().remote_revision().as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_no_delay_by_default() {
        let (listener, pair) =
            checkout_with(Arc::new(RecordingCommitter::new()), PairConfig::default());
        let mut snapshots = pair.published().remote_snapshots();

        listener.emit(mutation_event(
            "abc",
            "t1",
            vec![crate::mutation::Mutation::CreateOrReplace(json!({"_id": "abc"}))],
            None,
            Some("p1"),
        ));

        let received = timeout(Duration::from_millis(100), snapshots.next())
            .await
            .expect("mutation should be forwarded without delay")
            .unwrap();
        assert_eq!(received.snapshot.origin, SnapshotOrigin::RemoteMutation);
    }
}
