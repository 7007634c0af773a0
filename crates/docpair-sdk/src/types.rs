//! 基础类型：文档 ID 对、版本标识、文档体

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DocPairError, Result};

/// 草稿 ID 前缀
pub const DRAFTS_PREFIX: &str = "drafts.";

/// 文档体（JSON 对象，带 `_id` / `_rev` 系统字段）
pub type Document = Value;

/// 判断是否为草稿 ID
pub fn is_draft_id(id: &str) -> bool {
    id.starts_with(DRAFTS_PREFIX)
}

/// 获取文档对应的草稿 ID
pub fn draft_id_of(id: &str) -> String {
    if is_draft_id(id) {
        id.to_string()
    } else {
        format!("{}{}", DRAFTS_PREFIX, id)
    }
}

/// 获取文档对应的发布 ID
pub fn published_id_of(id: &str) -> String {
    id.strip_prefix(DRAFTS_PREFIX).unwrap_or(id).to_string()
}

/// 读取文档的 `_id`
pub fn document_id(document: &Document) -> Option<&str> {
    document.get("_id").and_then(|v| v.as_str())
}

/// 读取文档的 `_rev`
pub fn document_revision(document: &Document) -> Option<&str> {
    document.get("_rev").and_then(|v| v.as_str())
}

/// 同一逻辑文档的两个版本 ID
///
/// 在 Pair 生命周期内不可变。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdPair {
    pub draft_id: String,
    pub published_id: String,
}

impl IdPair {
    pub fn new<D: Into<String>, P: Into<String>>(draft_id: D, published_id: P) -> Self {
        Self {
            draft_id: draft_id.into(),
            published_id: published_id.into(),
        }
    }

    /// 从任意一个版本的 ID 推导出 ID 对
    ///
    /// `"abc"` 与 `"drafts.abc"` 都得到 `{draft_id: "drafts.abc", published_id: "abc"}`。
    pub fn from_document_id(id: &str) -> Result<Self> {
        let published_id = published_id_of(id);
        if published_id.is_empty() {
            return Err(DocPairError::InvalidArgument(format!(
                "无法从 {:?} 推导文档 ID",
                id
            )));
        }
        Ok(Self {
            draft_id: draft_id_of(&published_id),
            published_id,
        })
    }

    /// 获取指定版本的 ID
    pub fn id_for(&self, version: DocumentVersionKind) -> &str {
        match version {
            DocumentVersionKind::Draft => &self.draft_id,
            DocumentVersionKind::Published => &self.published_id,
        }
    }

    /// 根据 ID 判断属于哪个版本（都不匹配返回 None）
    pub fn version_of(&self, id: &str) -> Option<DocumentVersionKind> {
        if id == self.draft_id {
            Some(DocumentVersionKind::Draft)
        } else if id == self.published_id {
            Some(DocumentVersionKind::Published)
        } else {
            None
        }
    }
}

impl std::fmt::Display for IdPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.draft_id, self.published_id)
    }
}

/// 文档版本标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentVersionKind {
    Draft,
    Published,
}

impl DocumentVersionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentVersionKind::Draft => "draft",
            DocumentVersionKind::Published => "published",
        }
    }
}

impl std::fmt::Display for DocumentVersionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
