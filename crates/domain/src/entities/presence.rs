//! 在线成员集合
//!
//! 集合始终等于“最近一次事件为 enter 且之后没有 leave”的客户端ID集合。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::{PresenceAction, PresenceEvent};

/// 在线成员
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMember {
    pub client_id: String,
}

impl PresenceMember {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }
}

/// 以 clientId 为键的在线成员集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSet {
    members: BTreeMap<String, PresenceMember>,
}

impl PresenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入成员；重复进入视为替换
    pub fn enter(&mut self, member: PresenceMember) {
        self.members.insert(member.client_id.clone(), member);
    }

    /// 移除成员；不存在时为空操作
    pub fn leave(&mut self, client_id: &str) -> bool {
        self.members.remove(client_id).is_some()
    }

    /// 应用一条增量事件
    pub fn apply(&mut self, event: &PresenceEvent) {
        match event.action {
            PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                self.enter(PresenceMember::new(event.client_id.clone()));
            }
            PresenceAction::Leave => {
                self.leave(&event.client_id);
            }
        }
    }

    /// 用权威快照整体替换
    pub fn replace_with(&mut self, snapshot: impl IntoIterator<Item = PresenceMember>) {
        self.members = snapshot
            .into_iter()
            .map(|member| (member.client_id.clone(), member))
            .collect();
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.members.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn members(&self) -> impl Iterator<Item = &PresenceMember> {
        self.members.values()
    }

    /// 按字典序排列的客户端ID
    pub fn client_ids(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }
}

impl FromIterator<PresenceMember> for PresenceSet {
    fn from_iter<T: IntoIterator<Item = PresenceMember>>(iter: T) -> Self {
        let mut set = Self::new();
        set.replace_with(iter);
        set
    }
}
