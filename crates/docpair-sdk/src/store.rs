//! 文档存储：持有注入的监听源与提交器，按 ID 对复用 Pair
//!
//! 同一文档被多个编辑界面检出时共享同一个 Pair，因此也共享同一条监听订阅。
//!
//! 只被存储自身引用、没有输出流消费者、也没有待确认编辑的 Pair 会在下一次检出时回收。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::committer::MutationCommitter;
use crate::config::PairConfig;
use crate::error::Result;
use crate::listener::ListenerSource;
use crate::pair::Pair;
use crate::types::IdPair;

/// 文档存储
pub struct DocumentStore {
    source: Arc<dyn ListenerSource>,
    committer: Arc<dyn MutationCommitter>,
    config: PairConfig,
    pairs: Mutex<HashMap<IdPair, Arc<Pair>>>,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("source", &self.source)
            .field("committer", &self.committer)
            .field("pairs", &self.len())
            .finish()
    }
}

impl DocumentStore {
    pub fn new(
        source: Arc<dyn ListenerSource>,
        committer: Arc<dyn MutationCommitter>,
        config: PairConfig,
    ) -> Self {
        Self {
            source,
            committer,
            config,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// 按文档 ID（草稿或发布形式均可）检出文档对
    pub fn checkout(&self, document_id: &str) -> Result<Arc<Pair>> {
        let id_pair = IdPair::from_document_id(document_id)?;
        Ok(self.checkout_pair(id_pair))
    }

    /// 检出文档对，已存在时复用
    pub fn checkout_pair(&self, id_pair: IdPair) -> Arc<Pair> {
        let mut pairs = self.pairs.lock();
        Self::prune_locked(&mut pairs, Some(&id_pair));
        if let Some(pair) = pairs.get(&id_pair) {
            debug!("复用文档对: {}", id_pair);
            return pair.clone();
        }

        let pair = Arc::new(Pair::checkout(
            id_pair.clone(),
            self.source.clone(),
            self.committer.clone(),
            self.config.clone(),
        ));
        pairs.insert(id_pair, pair.clone());
        pair
    }

    /// 移除文档对，返回是否存在
    ///
    /// 已检出的 Pair 仍可继续使用，之后的 checkout 会创建新的 Pair。
    pub fn evict(&self, id_pair: &IdPair) -> bool {
        let removed = self.pairs.lock().remove(id_pair).is_some();
        if removed {
            info!("移除文档对: {}", id_pair);
        }
        removed
    }

    /// 回收不再使用的文档对，返回回收数量
    pub fn prune(&self) -> usize {
        Self::prune_locked(&mut self.pairs.lock(), None)
    }

    fn prune_locked(pairs: &mut HashMap<IdPair, Arc<Pair>>, keep: Option<&IdPair>) -> usize {
        let before = pairs.len();
        pairs.retain(|id_pair, pair| {
            Some(id_pair) == keep || Arc::strong_count(pair) > 1 || !pair.is_detached()
        });
        let pruned = before - pairs.len();
        if pruned > 0 {
            debug!("回收文档对: {}, 剩余 {}", pruned, pairs.len());
        }
        pruned
    }

    pub fn contains(&self, id_pair: &IdPair) -> bool {
        self.pairs.lock().contains_key(id_pair)
    }

    pub fn len(&self) -> usize {
        self.pairs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.lock().is_empty()
    }

    pub fn config(&self) -> &PairConfig {
        &self.config
    }
}
