//! Mutation 模块
//!
//! 职责：
//! - 描述针对单个文档的原子操作（create / createIfNotExists / createOrReplace / patch / delete）
//! - 纯函数方式把 mutation 应用到文档快照上
//! - 把一次 `mutate()` 调用打包成带事务 ID 的 Transaction

pub mod patch;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DocPairError, Result};
use crate::types::{document_id, Document};

pub use patch::{parse_path, PatchOperations, PathSegment};

/// patch mutation 的载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchMutation {
    pub id: String,
    #[serde(flatten)]
    pub operations: PatchOperations,
}

/// delete mutation 的载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMutation {
    pub id: String,
}

/// 单个原子操作，只作用于一个文档
///
/// 序列化格式与服务端 mutate 接口一致，例如 `{"create": {...}}`、
/// `{"patch": {"id": "abc", "set": {...}}}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mutation {
    Create(Document),
    CreateIfNotExists(Document),
    CreateOrReplace(Document),
    Patch(PatchMutation),
    Delete(DeleteMutation),
}

/// mutation 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    Create,
    CreateIfNotExists,
    CreateOrReplace,
    Patch,
    Delete,
}

impl Mutation {
    /// 目标文档 ID
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Mutation::Create(doc)
            | Mutation::CreateIfNotExists(doc)
            | Mutation::CreateOrReplace(doc) => document_id(doc),
            Mutation::Patch(patch) => Some(&patch.id),
            Mutation::Delete(delete) => Some(&delete.id),
        }
    }

    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::Create(_) => MutationKind::Create,
            Mutation::CreateIfNotExists(_) => MutationKind::CreateIfNotExists,
            Mutation::CreateOrReplace(_) => MutationKind::CreateOrReplace,
            Mutation::Patch(_) => MutationKind::Patch,
            Mutation::Delete(_) => MutationKind::Delete,
        }
    }

    /// 校验 mutation 是否可以作用于 `target_id`
    pub fn validate_for(&self, target_id: &str) -> Result<()> {
        match self.document_id() {
            Some(id) if id == target_id => {}
            Some(id) => {
                return Err(DocPairError::InvalidArgument(format!(
                    "mutation 目标 {} 与文档 {} 不一致",
                    id, target_id
                )))
            }
            None => {
                return Err(DocPairError::InvalidArgument(format!(
                    "{:?} mutation 缺少 _id",
                    self.kind()
                )))
            }
        }

        match self {
            Mutation::Create(doc)
            | Mutation::CreateIfNotExists(doc)
            | Mutation::CreateOrReplace(doc) => {
                if !doc.is_object() {
                    return Err(DocPairError::InvalidArgument(
                        "文档必须是 JSON 对象".to_string(),
                    ));
                }
            }
            Mutation::Patch(patch) => patch.operations.validate()?,
            Mutation::Delete(_) => {}
        }
        Ok(())
    }

    /// 把 mutation 应用到文档上（纯函数）
    ///
    /// `revision` 会写入结果文档的 `_rev`。文档不存在时 patch 不生效；
    /// create 作用于已存在的文档时保持原文档不变（服务端会拒绝该操作）。
    pub fn apply(&self, document: Option<Document>, revision: &str) -> Option<Document> {
        let next = match self {
            Mutation::Create(doc) => match document {
                Some(existing) => return Some(existing),
                None => Some(doc.clone()),
            },
            Mutation::CreateIfNotExists(doc) => match document {
                Some(existing) => return Some(existing),
                None => Some(doc.clone()),
            },
            Mutation::CreateOrReplace(doc) => Some(doc.clone()),
            Mutation::Delete(_) => None,
            Mutation::Patch(patch) => document.map(|mut doc| {
                patch.operations.apply(&mut doc);
                doc
            }),
        };

        next.map(|mut doc| {
            if let Some(map) = doc.as_object_mut() {
                map.insert("_rev".to_string(), Value::String(revision.to_string()));
            }
            doc
        })
    }
}

/// 按顺序把一组 mutation 折叠到文档上
pub fn apply_all<'a, I>(
    document: Option<Document>,
    mutations: I,
    revision: &str,
) -> Option<Document>
where
    I: IntoIterator<Item = &'a Mutation>,
{
    mutations
        .into_iter()
        .fold(document, |doc, mutation| mutation.apply(doc, revision))
}

/// 一次 `mutate()` 调用产生的事务
///
/// `id` 即服务端回显时携带的 transaction id。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub mutations: Vec<Mutation>,
}

impl Transaction {
    /// 使用新生成的事务 ID 创建事务
    pub fn new(mutations: Vec<Mutation>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            mutations,
        }
    }

    /// 应用到文档上，`_rev` 为本事务 ID
    pub fn apply(&self, document: Option<Document>) -> Option<Document> {
        apply_all(document, &self.mutations, &self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(id: &str, operations: PatchOperations) -> Mutation {
        Mutation::Patch(PatchMutation {
            id: id.to_string(),
            operations,
        })
    }

    #[test]
    fn test_wire_format() {
        let create = Mutation::Create(json!({"_id": "abc", "title": "hi"}));
        assert_eq!(
            serde_json::to_value(&create).unwrap(),
            json!({"create": {"_id": "abc", "title": "hi"}})
        );

        let patch = patch("abc", PatchOperations::new().set("title", json!("x")));
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({"patch": {"id": "abc", "set": {"title": "x"}}})
        );

        let delete: Mutation = serde_json::from_value(json!({"delete": {"id": "abc"}})).unwrap();
        assert_eq!(delete.kind(), MutationKind::Delete);
        assert_eq!(delete.document_id(), Some("abc"));

        let cir: Mutation =
            serde_json::from_value(json!({"createIfNotExists": {"_id": "abc"}})).unwrap();
        assert_eq!(cir.kind(), MutationKind::CreateIfNotExists);
    }

    #[test]
    fn test_apply_semantics() {
        let existing = Some(json!({"_id": "abc", "_rev": "r0", "title": "old"}));

        let create = Mutation::Create(json!({"_id": "abc", "title": "new"}));
        assert_eq!(create.apply(existing.clone(), "t1"), existing);
        assert_eq!(
            create.apply(None, "t1"),
            Some(json!({"_id": "abc", "_rev": "t1", "title": "new"}))
        );

        let replace = Mutation::CreateOrReplace(json!({"_id": "abc", "title": "new"}));
        assert_eq!(
            replace.apply(existing.clone(), "t2"),
            Some(json!({"_id": "abc", "_rev": "t2", "title": "new"}))
        );

        let delete = Mutation::Delete(DeleteMutation { id: "abc".into() });
        assert_eq!(delete.apply(existing.clone(), "t3"), None);

        let set_title = patch("abc", PatchOperations::new().set("title", json!("patched")));
        assert_eq!(set_title.apply(None, "t4"), None);
        assert_eq!(
            set_title.apply(existing, "t4"),
            Some(json!({"_id": "abc", "_rev": "t4", "title": "patched"}))
        );
    }

    #[test]
    fn test_validate_for_target() {
        let create = Mutation::Create(json!({"_id": "drafts.abc"}));
        assert!(create.validate_for("drafts.abc").is_ok());
        assert!(create.validate_for("abc").is_err());

        let missing_id = Mutation::Create(json!({"title": "no id"}));
        assert!(missing_id.validate_for("abc").is_err());

        let bad_path = patch("abc", PatchOperations::new().unset("a..b"));
        assert!(matches!(
            bad_path.validate_for("abc"),
            Err(DocPairError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_transaction_fold_is_in_order() {
        let tx = Transaction::new(vec![
            Mutation::CreateIfNotExists(json!({"_id": "abc", "count": 0})),
            patch("abc", PatchOperations::new().inc("count", json!(2))),
            patch("abc", PatchOperations::new().set("count", json!(10))),
            patch("abc", PatchOperations::new().dec("count", json!(1))),
        ]);

        let doc = tx.apply(None).unwrap();
        assert_eq!(doc["count"], json!(9));
        assert_eq!(doc["_rev"], json!(tx.id));
    }
}
