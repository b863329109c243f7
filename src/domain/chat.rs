use serde::{Deserialize, Serialize};

/// How the operator identified a chat when creating a job. Resolved once,
/// at job start, into an `Entity` via `Transport::resolve_entity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRef {
    Id(i64),
    Handle(String),
    DeepLink(String),
}

impl std::fmt::Display for ChatRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRef::Id(id) => write!(f, "{id}"),
            ChatRef::Handle(h) => write!(f, "@{h}"),
            ChatRef::DeepLink(link) => write!(f, "{link}"),
        }
    }
}

/// Resolution result of a `ChatRef`. Immutable snapshot taken at job start;
/// re-resolution only happens on supervisor recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub title: String,
    pub kind: EntityKind,
    pub is_forum: bool,
    pub linked_chat_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    BroadcastChannel,
    Group,
    Supergroup,
}

impl Entity {
    /// Topic id to use when sending into this entity /
    /// §8: forum targets use topic 1, non-forum targets use none.
    pub fn topic_id(&self) -> Option<i64> {
        self.is_forum.then_some(1)
    }
}
