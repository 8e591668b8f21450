use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DispatchError, DispatchResult};

/// 能力标签
///
/// 只能通过 [`CapabilityCatalog`] 解析得到，未声明的标签在注册或提交时就会被拒绝，
/// 不会因为拼写错误导致任务永远匹配不到Worker。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 能力集合，按集合包含关系匹配
pub type CapabilitySet = BTreeSet<Capability>;

/// 部署内封闭的能力标签目录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityCatalog {
    known: BTreeSet<String>,
}

impl CapabilityCatalog {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            known: tags
                .into_iter()
                .map(|t| normalize(t.as_ref()))
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// 解析单个标签，大小写和首尾空白不敏感
    pub fn parse(&self, tag: &str) -> DispatchResult<Capability> {
        let normalized = normalize(tag);
        if self.known.contains(&normalized) {
            Ok(Capability(normalized))
        } else {
            Err(DispatchError::UnknownCapability(tag.to_string()))
        }
    }

    pub fn parse_set<I, S>(&self, tags: I) -> DispatchResult<CapabilitySet>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tags.into_iter().map(|t| self.parse(t.as_ref())).collect()
    }

    /// 检查已有集合是否全部属于本目录（反序列化得到的能力同样需要校验）
    pub fn validate(&self, set: &CapabilitySet) -> DispatchResult<()> {
        match set.iter().find(|c| !self.known.contains(c.as_str())) {
            Some(unknown) => Err(DispatchError::UnknownCapability(unknown.to_string())),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.known.iter().map(String::as_str)
    }
}

fn normalize(tag: &str) -> String {
    tag.trim().to_lowercase()
}
