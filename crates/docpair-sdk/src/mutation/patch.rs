//! Patch 操作与属性路径
//!
//! 路径语法：
//! - `title`、`author.name` - 对象属性
//! - `tags[0]`、`tags[-1]` - 数组下标（负数从末尾计）
//! - `body[_key=="a1"].text` - 按 `_key` 定位数组元素
//!
//! 同一个 patch 内操作按 set → setIfMissing → unset → inc → dec 的顺序执行。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::warn;

use crate::error::{DocPairError, Result};

/// 路径片段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(i64),
    KeyedItem(String),
}

/// 解析属性路径
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let invalid = || DocPairError::InvalidPath(path.to_string());

    if path.is_empty() {
        return Err(invalid());
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut after_bracket = false;
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if current.is_empty() {
                    if !after_bracket {
                        return Err(invalid());
                    }
                } else {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                after_bracket = false;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                } else if segments.is_empty() {
                    return Err(invalid());
                }

                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return Err(invalid());
                }
                segments.push(parse_bracket(inner.trim()).ok_or_else(invalid)?);
                after_bracket = true;
            }
            ']' => return Err(invalid()),
            _ => {
                if after_bracket {
                    return Err(invalid());
                }
                current.push(c);
            }
        }
    }

    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    } else if !after_bracket {
        // 以 '.' 结尾
        return Err(invalid());
    }

    Ok(segments)
}

fn parse_bracket(inner: &str) -> Option<PathSegment> {
    if let Some(rest) = inner.strip_prefix("_key") {
        let key = rest.trim_start().strip_prefix("==")?.trim();
        let unquoted = key
            .strip_prefix('"')
            .and_then(|k| k.strip_suffix('"'))
            .or_else(|| key.strip_prefix('\'').and_then(|k| k.strip_suffix('\'')))?;
        return Some(PathSegment::KeyedItem(unquoted.to_string()));
    }
    inner.parse::<i64>().ok().map(PathSegment::Index)
}

fn resolve_index(len: usize, index: i64) -> Option<usize> {
    let resolved = if index < 0 {
        len as i64 + index
    } else {
        index
    };
    if resolved >= 0 && (resolved as usize) < len {
        Some(resolved as usize)
    } else {
        None
    }
}

fn has_key(item: &Value, key: &str) -> bool {
    item.get("_key").and_then(Value::as_str) == Some(key)
}

fn descend<'a>(value: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    match segment {
        PathSegment::Key(key) => value.as_object()?.get(key),
        PathSegment::Index(index) => {
            let items = value.as_array()?;
            items.get(resolve_index(items.len(), *index)?)
        }
        PathSegment::KeyedItem(key) => value.as_array()?.iter().find(|item| has_key(item, key)),
    }
}

fn descend_mut<'a>(
    value: &'a mut Value,
    segment: &PathSegment,
    create: bool,
) -> Option<&'a mut Value> {
    match segment {
        PathSegment::Key(key) => {
            let map = value.as_object_mut()?;
            if !create {
                return map.get_mut(key);
            }
            let slot = map
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            Some(slot)
        }
        PathSegment::Index(index) => {
            let items = value.as_array_mut()?;
            let position = resolve_index(items.len(), *index)?;
            items.get_mut(position)
        }
        PathSegment::KeyedItem(key) => value
            .as_array_mut()?
            .iter_mut()
            .find(|item| has_key(item, key)),
    }
}

fn parent_mut<'a, 'p>(
    root: &'a mut Value,
    path: &'p [PathSegment],
    create: bool,
) -> Option<(&'a mut Value, &'p PathSegment)> {
    let (last, init) = path.split_last()?;
    let mut current = root;
    for segment in init {
        current = descend_mut(current, segment, create)?;
    }
    Some((current, last))
}

/// 读取路径上的值
pub fn get_at<'a>(root: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    path.iter().try_fold(root, |current, segment| descend(current, segment))
}

/// 写入路径上的值（对象中间节点不存在时自动创建）
pub fn set_at(root: &mut Value, path: &[PathSegment], value: Value) {
    let Some((parent, last)) = parent_mut(root, path, true) else {
        return;
    };
    match last {
        PathSegment::Key(key) => {
            if let Some(map) = parent.as_object_mut() {
                map.insert(key.clone(), value);
            }
        }
        _ => {
            if let Some(slot) = descend_mut(parent, last, false) {
                *slot = value;
            }
        }
    }
}

/// 删除路径上的值
pub fn unset_at(root: &mut Value, path: &[PathSegment]) {
    let Some((parent, last)) = parent_mut(root, path, false) else {
        return;
    };
    match last {
        PathSegment::Key(key) => {
            if let Some(map) = parent.as_object_mut() {
                map.remove(key);
            }
        }
        PathSegment::Index(index) => {
            if let Some(items) = parent.as_array_mut() {
                if let Some(position) = resolve_index(items.len(), *index) {
                    items.remove(position);
                }
            }
        }
        PathSegment::KeyedItem(key) => {
            if let Some(items) = parent.as_array_mut() {
                items.retain(|item| !has_key(item, key));
            }
        }
    }
}

fn add_numbers(current: &Value, delta: &Value, negate: bool) -> Option<Value> {
    if let (Some(a), Some(b)) = (current.as_i64(), delta.as_i64()) {
        let b = if negate { b.checked_neg()? } else { b };
        return a.checked_add(b).map(Value::from);
    }
    let b = delta.as_f64()?;
    let result = current.as_f64()? + if negate { -b } else { b };
    Number::from_f64(result).map(Value::Number)
}

/// 单个 patch 的操作集合
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperations {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set_if_missing: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unset: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inc: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dec: BTreeMap<String, Value>,
}

impl PatchOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<P: Into<String>>(mut self, path: P, value: Value) -> Self {
        self.set.insert(path.into(), value);
        self
    }

    pub fn set_if_missing<P: Into<String>>(mut self, path: P, value: Value) -> Self {
        self.set_if_missing.insert(path.into(), value);
        self
    }

    pub fn unset<P: Into<String>>(mut self, path: P) -> Self {
        self.unset.push(path.into());
        self
    }

    pub fn inc<P: Into<String>>(mut self, path: P, amount: Value) -> Self {
        self.inc.insert(path.into(), amount);
        self
    }

    pub fn dec<P: Into<String>>(mut self, path: P, amount: Value) -> Self {
        self.dec.insert(path.into(), amount);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.set_if_missing.is_empty()
            && self.unset.is_empty()
            && self.inc.is_empty()
            && self.dec.is_empty()
    }

    /// 校验所有路径与数值参数
    pub fn validate(&self) -> Result<()> {
        for path in self
            .set
            .keys()
            .chain(self.set_if_missing.keys())
            .chain(self.unset.iter())
        {
            parse_path(path)?;
        }
        for (path, amount) in self.inc.iter().chain(self.dec.iter()) {
            parse_path(path)?;
            if !amount.is_number() {
                return Err(DocPairError::InvalidArgument(format!(
                    "inc/dec 的参数必须是数字: {}={}",
                    path, amount
                )));
            }
        }
        Ok(())
    }

    /// 把操作应用到文档上
    ///
    /// 无法解析的路径会被跳过；提交前应先调用 [`PatchOperations::validate`]。
    pub fn apply(&self, document: &mut Value) {
        for (path, value) in &self.set {
            if let Some(path) = parsed(path) {
                set_at(document, &path, value.clone());
            }
        }
        for (path, value) in &self.set_if_missing {
            if let Some(path) = parsed(path) {
                if get_at(document, &path).is_none() {
                    set_at(document, &path, value.clone());
                }
            }
        }
        for path in &self.unset {
            if let Some(path) = parsed(path) {
                unset_at(document, &path);
            }
        }
        for (ops, negate) in [(&self.inc, false), (&self.dec, true)] {
            for (path, amount) in ops {
                let Some(path) = parsed(path) else { continue };
                let next = get_at(document, &path)
                    .and_then(|current| add_numbers(current, amount, negate));
                if let Some(next) = next {
                    set_at(document, &path, next);
                }
            }
        }
    }
}

fn parsed(path: &str) -> Option<Vec<PathSegment>> {
    match parse_path(path) {
        Ok(segments) => Some(segments),
        Err(e) => {
            warn!("跳过无效的 patch 路径: {}", e);
            None
        }
    }
}
