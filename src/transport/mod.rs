//! The narrow capability the rest of the engine consumes from the
//! underlying messaging service. This crate implements the trait
//! boundary plus a `FakeTransport` test double; a real implementation
//! against the upstream wire protocol is out of scope.

pub mod fake;

pub use fake::FakeTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Account, AccountId, ChatRef, Entity};
use crate::error::TransportResult;

/// Opaque handle to media on the source message that lets a real
/// implementation ask the server to copy it without a local
/// download/upload round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef(pub String);

/// Tagged variant of what a source message actually is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageKind {
    TextOnly {
        text: String,
    },
    Photo {
        media: MediaRef,
        caption: Option<String>,
    },
    Document {
        media: MediaRef,
        caption: Option<String>,
        mime_type: String,
        file_name: Option<String>,
    },
    Empty,
}

/// One message fetched from the source chat, in ascending id order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: i64,
    pub kind: MessageKind,
}

/// Acknowledgement of a successful send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub target_message_id: i64,
}

/// Live connection for one account. Ascending message iteration is
/// realized here as a windowed fetch (`fetch_window`) rather than an
/// unbounded async stream: the worker always consumes it in bounded
/// batches, so the stream abstraction would just be re-chunked
/// immediately — the windowed call is the actual contract exercised.
#[async_trait]
pub trait Transport: Send + Sync {
    fn account_id(&self) -> &AccountId;

    /// Resolve a chat reference into an immutable `Entity` snapshot.
    async fn resolve_entity(&self, chat_ref: &ChatRef) -> TransportResult<Entity>;

    /// Fetch up to `limit` messages strictly after `after_id`, in
    /// ascending id order.
    async fn fetch_window(
        &self,
        entity: &Entity,
        after_id: i64,
        limit: usize,
    ) -> TransportResult<Vec<SourceMessage>>;

    async fn send_text(
        &self,
        target: &Entity,
        text: &str,
        topic_id: Option<i64>,
    ) -> TransportResult<Ack>;

    async fn send_file(
        &self,
        target: &Entity,
        media: &MediaRef,
        caption: &str,
        topic_id: Option<i64>,
    ) -> TransportResult<Ack>;
}

/// Produces live `Transport` handles for accounts. The only thing the
/// Account Pool needs beyond the trait above — kept separate so
/// `Transport` itself stays a pure per-connection capability.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, account: &Account) -> TransportResult<std::sync::Arc<dyn Transport>>;
}
