//! Pair 配置

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::committer::CommitOptions;
use crate::types::DocumentVersionKind;

/// 单个版本的配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionConfig {
    /// 转发远端 mutation 事件前的人为延迟（仅用于测试，默认不延迟）
    pub mutation_event_delay: Option<Duration>,
}

/// Pair 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    /// 每个输出流的广播缓冲区大小
    pub event_buffer_size: usize,
    /// commit 请求选项
    pub commit_options: CommitOptions,
    /// 草稿版本配置
    pub draft: VersionConfig,
    /// 发布版本配置
    pub published: VersionConfig,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 256,
            commit_options: CommitOptions::default(),
            draft: VersionConfig::default(),
            published: VersionConfig::default(),
        }
    }
}

impl PairConfig {
    pub fn builder() -> PairConfigBuilder {
        PairConfigBuilder::new()
    }

    /// 获取指定版本的配置
    pub fn version(&self, version: DocumentVersionKind) -> &VersionConfig {
        match version {
            DocumentVersionKind::Draft => &self.draft,
            DocumentVersionKind::Published => &self.published,
        }
    }
}

/// Pair 配置构建器
pub struct PairConfigBuilder {
    config: PairConfig,
}

impl Default for PairConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PairConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PairConfig::default(),
        }
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size.max(1);
        self
    }

    pub fn commit_options(mut self, options: CommitOptions) -> Self {
        self.config.commit_options = options;
        self
    }

    /// 设置 commit 请求的标签
    pub fn commit_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.config.commit_options.tag = tag.into();
        self
    }

    /// 为某个版本注入 mutation 事件延迟（测试用）
    pub fn mutation_event_delay(mut self, version: DocumentVersionKind, delay: Duration) -> Self {
        let target = match version {
            DocumentVersionKind::Draft => &mut self.config.draft,
            DocumentVersionKind::Published => &mut self.config.published,
        };
        target.mutation_event_delay = Some(delay);
        self
    }

    pub fn build(self) -> PairConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committer::Visibility;

    #[test]
    fn test_defaults_forward_immediately() {
        let config = PairConfig::default();
        assert_eq!(config.event_buffer_size, 256);
        assert_eq!(config.draft.mutation_event_delay, None);
        assert_eq!(config.published.mutation_event_delay, None);
        assert_eq!(config.commit_options.visibility, Visibility::Async);
        assert!(!config.commit_options.return_documents);
        assert_eq!(config.commit_options.tag, "document.commit");
    }

    #[test]
    fn test_builder() {
        let config = PairConfig::builder()
            .event_buffer_size(0)
            .commit_tag("desk.commit")
            .mutation_event_delay(DocumentVersionKind::Published, Duration::from_millis(50))
            .build();

        assert_eq!(config.event_buffer_size, 1);
        assert_eq!(config.commit_options.tag, "desk.commit");
        assert_eq!(
            config.version(DocumentVersionKind::Published).mutation_event_delay,
            Some(Duration::from_millis(50))
        );
        assert_eq!(config.version(DocumentVersionKind::Draft).mutation_event_delay, None);

        let json = serde_json::to_string(&config).unwrap();
        let restored: PairConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }
}
