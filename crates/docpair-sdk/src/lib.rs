//! DocPair SDK - 草稿/发布双版本文档的实时镜像
//!
//! 本 SDK 把一条共享、可能中断的监听事件流转换成两个各自一致的版本视图：
//! - 📡 共享监听：每个文档对只有一条订阅，按版本分发，重连通知两个版本
//! - ✏️ 乐观编辑：本地 mutation 立即生效，排队等待服务端确认
//! - 🔁 调和：回显去重、外部编辑上重放本地事务、版本缺口检测
//! - ✅ 一致性：随时知道本地快照是否与服务端一致
//!
//! # 快速开始
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use docpair_sdk::{DocumentStore, PairConfig, PatchOperations};
//! use futures::StreamExt;
//!
//! let store = DocumentStore::new(listener, committer, PairConfig::default());
//! let pair = store.checkout("abc")?;
//! let draft = pair.draft();
//!
//! let mut consistency = draft.consistency();
//! draft.mutate(draft.patch(vec![PatchOperations::new().set("title", "Hello".into())]))?;
//! draft.commit().await?;
//!
//! while let Some(consistent) = consistency.next().await {
//!     println!("draft 一致: {}", consistent);
//! }
//! ```

// 导出核心模块
pub mod buffered_doc;
pub mod committer;
pub mod config;
pub mod document_version;
pub mod error;
pub mod events;
pub mod listener;
pub mod multiplexer;
pub mod mutation;
pub mod pair;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

// 重新导出核心类型，方便使用
pub use buffered_doc::BufferedDocument;
pub use committer::{CommitOptions, CommitRequest, MutationCommitter, Visibility};
pub use config::{PairConfig, PairConfigBuilder, VersionConfig};
pub use document_version::DocumentVersion;
pub use error::{CommitFailureKind, DocPairError, Result};
pub use events::{
    DocumentEvent, EventStats, MutationOrigin, RemoteSnapshotEvent, RemoteSnapshotVersionEvent,
    SnapshotOrigin, VersionEvent, VersionStream,
};
pub use listener::{ListenerEvent, ListenerSource, MutationTransition, ReconnectEvent};
pub use multiplexer::{
    ListenerLease, ListenerMultiplexer, ListenerOutputs, ListenerStats, ReconnectHandler,
};
pub use mutation::{Mutation, MutationKind, PatchOperations, Transaction};
pub use pair::Pair;
pub use store::DocumentStore;
pub use types::{Document, DocumentVersionKind, IdPair};
