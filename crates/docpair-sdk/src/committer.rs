use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::mutation::{Mutation, Transaction};

/// 提交后的读可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// 等待全局可读后返回
    Sync,
    /// 返回时不保证全局可读
    Async,
    /// 不等待
    Deferred,
}

/// commit 请求选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOptions {
    pub visibility: Visibility,
    /// 是否要求服务端返回更新后的文档
    pub return_documents: bool,
    /// 请求标签
    pub tag: String,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            visibility: Visibility::Async,
            return_documents: false,
            tag: "document.commit".to_string(),
        }
    }
}

/// 一次 commit 提交的有序批次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    /// 按 mutate 顺序排列的事务
    pub transactions: Vec<Transaction>,
    pub options: CommitOptions,
}

impl CommitRequest {
    /// 所有事务 ID
    pub fn transaction_ids(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.id.clone()).collect()
    }

    /// 展开后的 mutation（保持顺序）
    pub fn mutations(&self) -> impl Iterator<Item = &Mutation> {
        self.transactions.iter().flat_map(|tx| tx.mutations.iter())
    }
}

/// mutation 提交器（由 HTTP/RPC 客户端实现）
///
/// 同一个请求内的事务与 mutation 必须按顺序提交。
#[async_trait]
pub trait MutationCommitter: Send + Sync + std::fmt::Debug {
    /// 提交一个批次，完成时不返回文档内容
    ///
    /// 服务端拒绝返回 `DocPairError::RejectedMutation`，
    /// 网络问题返回 `DocPairError::TransportUnavailable`。
    async fn commit(&self, request: CommitRequest) -> Result<()>;
}
