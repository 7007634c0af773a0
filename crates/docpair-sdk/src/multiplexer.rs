//! 共享监听多路复用器
//!
//! 核心设计：
//! - 每个 ID 对只持有一条到监听源的订阅，不论有多少消费者
//! - 按 document_id 把原始事件分发到 draft / published 两条路由
//! - reconnect 在 pump 内同步交给所有 `ReconnectHandler`，之后才路由下一条事件，
//!   不经过版本路由，因此不会排在某个版本积压的事件之后
//! - 消费者持有 `ListenerLease`，最后一个 lease 释放时取消订阅；之后再有消费者会透明地重新订阅
//! - 仍有消费者时监听流结束会立即重新打开，并按 reconnect 通知
//!
//! 路由通道是无界的，一个版本处理慢不会阻塞另一个版本的投递。

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::listener::{ListenerEvent, ListenerSource, ReconnectEvent};
use crate::types::{DocumentVersionKind, IdPair};

/// 监听源结束后连续重新打开但一个事件都没收到的次数上限
const MAX_EMPTY_REOPENS: u32 = 3;

/// reconnect 处理器（每个版本的缓冲文档各注册一个）
///
/// 在 pump 任务内同步调用，实现中不能阻塞。
pub trait ReconnectHandler: Send + Sync {
    fn on_reconnect(&self, event: &ReconnectEvent);
}

/// 多路复用器统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// 打开底层订阅的次数
    pub subscriptions_opened: u64,
    /// 释放底层订阅的次数
    pub subscriptions_released: u64,
    pub draft_events: u64,
    pub published_events: u64,
    pub reconnects: u64,
    /// 不属于这两个版本而被丢弃的事件数
    pub dropped_events: u64,
    /// 监听源结束后重新打开的次数
    pub source_reopens: u64,
    /// 监听源反复结束后放弃重开的次数
    pub source_failures: u64,
}

/// 多路复用器的输出通道
pub struct ListenerOutputs {
    /// 草稿版本的事件
    pub draft: mpsc::UnboundedReceiver<ListenerEvent>,
    /// 发布版本的事件
    pub published: mpsc::UnboundedReceiver<ListenerEvent>,
    /// 单独的 reconnect 广播
    pub reconnect: broadcast::Receiver<ReconnectEvent>,
}

#[derive(Clone)]
struct Routes {
    id_pair: IdPair,
    draft: mpsc::UnboundedSender<ListenerEvent>,
    published: mpsc::UnboundedSender<ListenerEvent>,
    reconnect: broadcast::Sender<ReconnectEvent>,
    handlers: Arc<RwLock<Vec<Arc<dyn ReconnectHandler>>>>,
    stats: Arc<RwLock<ListenerStats>>,
}

impl Routes {
    fn dispatch(&self, event: ListenerEvent) {
        if event.is_reconnect() {
            self.notify_reconnect();
            return;
        }

        let version = event
            .document_id()
            .and_then(|id| self.id_pair.version_of(id));

        match version {
            Some(version) => {
                {
                    let mut stats = self.stats.write();
                    match version {
                        DocumentVersionKind::Draft => stats.draft_events += 1,
                        DocumentVersionKind::Published => stats.published_events += 1,
                    }
                }
                self.send(version, event);
            }
            None => {
                trace!(
                    "丢弃不属于 {} 的事件: type={}, document_id={:?}",
                    self.id_pair,
                    event.event_type(),
                    event.document_id()
                );
                self.stats.write().dropped_events += 1;
            }
        }
    }

    fn notify_reconnect(&self) {
        info!("监听连接已恢复，通知两个版本: {}", self.id_pair);
        self.stats.write().reconnects += 1;
        let event = ReconnectEvent::now();
        for handler in self.handlers.read().iter() {
            handler.on_reconnect(&event);
        }
        if let Err(e) = self.reconnect.send(event) {
            debug!("Failed to broadcast reconnect (no active receivers): {}", e);
        }
    }

    fn send(&self, version: DocumentVersionKind, event: ListenerEvent) {
        let route = match version {
            DocumentVersionKind::Draft => &self.draft,
            DocumentVersionKind::Published => &self.published,
        };
        if route.send(event).is_err() {
            debug!("{} 路由已关闭，事件被丢弃: {}", version, self.id_pair);
        }
    }
}

#[derive(Default)]
struct ShareState {
    /// 当前消费者数量
    consumers: usize,
    /// 运行中的订阅（取消令牌）
    active: Option<CancellationToken>,
    /// 每次打开订阅递增，用于区分已结束的旧订阅
    generation: u64,
}

/// 共享监听多路复用器
pub struct ListenerMultiplexer {
    id_pair: IdPair,
    source: Arc<dyn ListenerSource>,
    routes: Routes,
    state: Arc<Mutex<ShareState>>,
}

impl std::fmt::Debug for ListenerMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerMultiplexer")
            .field("id_pair", &self.id_pair)
            .field("consumers", &self.consumer_count())
            .field("active", &self.is_active())
            .finish()
    }
}

impl ListenerMultiplexer {
    /// 为 ID 对创建多路复用器
    ///
    /// 此时不会打开底层订阅，第一个 [`ListenerMultiplexer::acquire`] 时才打开。
    pub fn subscribe(
        id_pair: IdPair,
        source: Arc<dyn ListenerSource>,
        reconnect_capacity: usize,
    ) -> (Arc<Self>, ListenerOutputs) {
        let (draft_tx, draft_rx) = mpsc::unbounded_channel();
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = broadcast::channel(reconnect_capacity.max(1));

        let mux = Arc::new(Self {
            routes: Routes {
                id_pair: id_pair.clone(),
                draft: draft_tx,
                published: published_tx,
                reconnect: reconnect_tx,
                handlers: Arc::new(RwLock::new(Vec::new())),
                stats: Arc::new(RwLock::new(ListenerStats::default())),
            },
            id_pair,
            source,
            state: Arc::new(Mutex::new(ShareState::default())),
        });

        let outputs = ListenerOutputs {
            draft: draft_rx,
            published: published_rx,
            reconnect: reconnect_rx,
        };

        (mux, outputs)
    }

    pub fn id_pair(&self) -> &IdPair {
        &self.id_pair
    }

    /// 登记一个消费者
    ///
    /// 没有运行中的订阅时打开一条新订阅，需要在 Tokio 运行时内调用。
    pub fn acquire(self: &Arc<Self>) -> ListenerLease {
        let mut state = self.state.lock();
        state.consumers += 1;

        if state.active.is_none() {
            state.generation += 1;
            let generation = state.generation;
            let token = CancellationToken::new();
            let stream = self.source.listen(&self.id_pair);

            tokio::spawn(run_pump(
                stream,
                Pump {
                    source: self.source.clone(),
                    routes: self.routes.clone(),
                    token: token.clone(),
                    state: self.state.clone(),
                    generation,
                },
            ));

            state.active = Some(token);
            self.routes.stats.write().subscriptions_opened += 1;
            info!(
                "打开共享监听: {}, generation={}, consumers={}",
                self.id_pair, generation, state.consumers
            );
        } else {
            debug!("复用共享监听: {}, consumers={}", self.id_pair, state.consumers);
        }

        ListenerLease { mux: self.clone() }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.consumers = state.consumers.saturating_sub(1);

        if state.consumers > 0 {
            debug!("消费者离开: {}, 剩余 {}", self.id_pair, state.consumers);
            return;
        }

        if let Some(token) = state.active.take() {
            token.cancel();
            self.routes.stats.write().subscriptions_released += 1;
            info!("最后一个消费者离开，释放共享监听: {}", self.id_pair);
        }
    }

    /// 注册 reconnect 处理器
    pub fn add_reconnect_handler(&self, handler: Arc<dyn ReconnectHandler>) {
        self.routes.handlers.write().push(handler);
    }

    /// 订阅 reconnect 广播
    pub fn subscribe_reconnects(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.routes.reconnect.subscribe()
    }

    /// 当前消费者数量
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers
    }

    /// 底层订阅是否在运行
    pub fn is_active(&self) -> bool {
        self.state.lock().active.is_some()
    }

    /// 获取统计信息
    pub fn stats(&self) -> ListenerStats {
        self.routes.stats.read().clone()
    }
}

/// 消费者对共享订阅的引用，drop 时释放
pub struct ListenerLease {
    mux: Arc<ListenerMultiplexer>,
}

impl std::fmt::Debug for ListenerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerLease")
            .field("id_pair", &self.mux.id_pair)
            .finish()
    }
}

impl Drop for ListenerLease {
    fn drop(&mut self) {
        self.mux.release();
    }
}

struct Pump {
    source: Arc<dyn ListenerSource>,
    routes: Routes,
    token: CancellationToken,
    state: Arc<Mutex<ShareState>>,
    generation: u64,
}

impl Pump {
    /// 监听流结束后决定是否重新打开
    ///
    /// 返回 false 表示本代订阅已结束。
    fn should_reopen(&self, empty_reopens: u32) -> bool {
        let mut state = self.state.lock();
        if state.generation != self.generation || state.active.is_none() {
            return false;
        }
        if state.consumers == 0 {
            state.active = None;
            self.routes.stats.write().subscriptions_released += 1;
            return false;
        }
        if empty_reopens >= MAX_EMPTY_REOPENS {
            error!(
                "监听流连续 {} 次打开后立即结束，放弃重开: {}",
                empty_reopens,
                self.routes.id_pair
            );
            state.active = None;
            let mut stats = self.routes.stats.write();
            stats.subscriptions_released += 1;
            stats.source_failures += 1;
            return false;
        }
        true
    }
}

async fn run_pump(mut stream: BoxStream<'static, ListenerEvent>, pump: Pump) {
    let id_pair = pump.routes.id_pair.clone();
    let mut received = false;
    let mut empty_reopens = 0u32;

    loop {
        let next = tokio::select! {
            biased;
            _ = pump.token.cancelled() => {
                debug!("共享监听已取消: {}, generation={}", id_pair, pump.generation);
                break;
            }
            next = stream.next() => next,
        };

        match next {
            Some(event) => {
                received = true;
                pump.routes.dispatch(event);
            }
            None => {
                empty_reopens = if received { 0 } else { empty_reopens + 1 };
                if !pump.should_reopen(empty_reopens) {
                    break;
                }
                warn!("监听流意外结束，重新打开: {}, generation={}", id_pair, pump.generation);
                stream = pump.source.listen(&id_pair);
                received = false;
                {
                    let mut stats = pump.routes.stats.write();
                    stats.subscriptions_released += 1;
                    stats.subscriptions_opened += 1;
                    stats.source_reopens += 1;
                }
                // 中断期间的事件可能已丢失
                pump.routes.notify_reconnect();
            }
        }
    }
}
