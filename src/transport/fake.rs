//! An in-memory `Transport` used by unit and integration tests. Multiple
//! `FakeTransport`s (one per account) can share a `FakeWorld` so tests can
//! assert on what was actually sent and script failures per account.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::domain::{Account, AccountId, ChatRef, Entity};
use crate::error::{TransportError, TransportResult};

use super::{Ack, MediaRef, MessageKind, SourceMessage, Transport, TransportFactory};

#[derive(Debug, Clone)]
pub struct SentRecord {
    pub account_id: AccountId,
    pub target_entity_id: i64,
    pub source_message_id: i64,
    pub topic_id: Option<i64>,
    pub as_media: bool,
}

#[derive(Default)]
struct FakeWorldInner {
    entities: HashMap<i64, Entity>,
    chat_ref_to_entity_id: HashMap<String, i64>,
    messages: HashMap<i64, Vec<SourceMessage>>,
    sent: Vec<SentRecord>,
    flood_wait_once: HashMap<AccountId, u64>,
    write_denied: std::collections::HashSet<AccountId>,
    unauthorized: std::collections::HashSet<AccountId>,
    transient_fail_once: std::collections::HashSet<AccountId>,
    next_target_message_id: i64,
}

/// Shared in-memory state for a set of `FakeTransport`s.
#[derive(Clone, Default)]
pub struct FakeWorld(Arc<Mutex<FakeWorldInner>>);

impl FakeWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(&self, chat_ref: ChatRef, entity: Entity) {
        let mut inner = self.0.lock().unwrap();
        inner
            .chat_ref_to_entity_id
            .insert(chat_ref.to_string(), entity.id);
        inner.entities.insert(entity.id, entity);
    }

    pub fn seed_messages(&self, entity_id: i64, messages: Vec<SourceMessage>) {
        self.0
            .lock()
            .unwrap()
            .messages
            .entry(entity_id)
            .or_default()
            .extend(messages);
    }

    /// Make the next send attempted by `account_id` fail with `FloodWait`.
    pub fn arm_flood_wait(&self, account_id: impl Into<AccountId>, seconds: u64) {
        self.0
            .lock()
            .unwrap()
            .flood_wait_once
            .insert(account_id.into(), seconds);
    }

    pub fn deny_write(&self, account_id: impl Into<AccountId>) {
        self.0
            .lock()
            .unwrap()
            .write_denied
            .insert(account_id.into());
    }

    pub fn deauthorize(&self, account_id: impl Into<AccountId>) {
        self.0
            .lock()
            .unwrap()
            .unauthorized
            .insert(account_id.into());
    }

    pub fn arm_transient_failure(&self, account_id: impl Into<AccountId>) {
        self.0
            .lock()
            .unwrap()
            .transient_fail_once
            .insert(account_id.into());
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.0.lock().unwrap().sent.clone()
    }

    pub fn transport_for(&self, account_id: impl Into<AccountId>) -> FakeTransport {
        FakeTransport {
            account_id: account_id.into(),
            world: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct FakeTransport {
    account_id: AccountId,
    world: FakeWorld,
}

impl FakeTransport {
    pub fn new(account_id: impl Into<AccountId>, world: FakeWorld) -> Self {
        Self {
            account_id: account_id.into(),
            world,
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    async fn resolve_entity(&self, chat_ref: &ChatRef) -> TransportResult<Entity> {
        let inner = self.world.0.lock().unwrap();
        let id = inner
            .chat_ref_to_entity_id
            .get(&chat_ref.to_string())
            .copied()
            .ok_or(TransportError::NotFound)?;
        inner
            .entities
            .get(&id)
            .cloned()
            .ok_or(TransportError::NotFound)
    }

    async fn fetch_window(
        &self,
        entity: &Entity,
        after_id: i64,
        limit: usize,
    ) -> TransportResult<Vec<SourceMessage>> {
        let inner = self.world.0.lock().unwrap();
        let mut all = inner.messages.get(&entity.id).cloned().unwrap_or_default();
        all.sort_by_key(|m| m.id);
        Ok(all
            .into_iter()
            .filter(|m| m.id > after_id)
            .take(limit)
            .collect())
    }

    async fn send_text(
        &self,
        target: &Entity,
        _text: &str,
        topic_id: Option<i64>,
    ) -> TransportResult<Ack> {
        self.check_and_record(target, topic_id, false)
    }

    async fn send_file(
        &self,
        target: &Entity,
        _media: &MediaRef,
        _caption: &str,
        topic_id: Option<i64>,
    ) -> TransportResult<Ack> {
        self.check_and_record(target, topic_id, true)
    }
}

impl FakeTransport {
    fn check_and_record(&self, target: &Entity, topic_id: Option<i64>, as_media: bool) -> TransportResult<Ack> {
        let mut inner = self.world.0.lock().unwrap();

        if inner.unauthorized.contains(&self.account_id) {
            return Err(TransportError::NotAuthorized);
        }
        if inner.write_denied.contains(&self.account_id) {
            return Err(TransportError::WritePermissionDenied);
        }
        if let Some(seconds) = inner.flood_wait_once.remove(&self.account_id) {
            return Err(TransportError::FloodWait(seconds));
        }
        if inner.transient_fail_once.remove(&self.account_id) {
            return Err(TransportError::Transient("simulated blip".into()));
        }

        inner.next_target_message_id += 1;
        let target_message_id = inner.next_target_message_id;
        inner.sent.push(SentRecord {
            account_id: self.account_id.clone(),
            target_entity_id: target.id,
            source_message_id: target_message_id,
            topic_id,
            as_media,
        });
        Ok(Ack { target_message_id })
    }
}

/// Connects every account to the same `FakeWorld`.
pub struct FakeTransportFactory {
    pub world: FakeWorld,
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn connect(&self, account: &Account) -> TransportResult<Arc<dyn Transport>> {
        if !account.is_usable() {
            return Err(TransportError::NotAuthorized);
        }
        Ok(Arc::new(self.world.transport_for(account.id.clone())))
    }
}

/// Convenience constructor used throughout tests for a plain text message.
pub fn text_message(id: i64, text: impl Into<String>) -> SourceMessage {
    SourceMessage {
        id,
        kind: MessageKind::TextOnly { text: text.into() },
    }
}

pub fn photo_message(id: i64) -> SourceMessage {
    SourceMessage {
        id,
        kind: MessageKind::Photo {
            media: MediaRef(format!("photo-{id}")),
            caption: None,
        },
    }
}

pub fn document_message(id: i64, mime_type: &str, file_name: Option<&str>) -> SourceMessage {
    SourceMessage {
        id,
        kind: MessageKind::Document {
            media: MediaRef(format!("doc-{id}")),
            caption: None,
            mime_type: mime_type.to_string(),
            file_name: file_name.map(str::to_string),
        },
    }
}
