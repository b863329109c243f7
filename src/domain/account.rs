use serde::{Deserialize, Serialize};

/// Identifies an `Account` across the store, the pool, and the bus.
pub type AccountId = String;

/// Persistent credentials for one user account on the upstream service.
///
/// A given `session_blob` is used by at most one live `Transport` handle
/// process-wide — the `Account Pool` is the
/// component that enforces this, not this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub api_id: i32,
    pub api_hash: String,
    pub session_blob: Option<String>,
    pub phone: Option<String>,
    pub status: AccountStatus,
    /// Routing hint only; the engine does not implement Tor transport.
    pub use_tor: bool,
    pub auth_attempts: u32,
    pub last_active: Option<chrono::DateTime<chrono::Utc>>,
}

impl Account {
    pub fn new(id: AccountId, api_id: i32, api_hash: String, phone: Option<String>) -> Self {
        Self {
            id,
            api_id,
            api_hash,
            session_blob: None,
            phone,
            status: AccountStatus::Created,
            use_tor: false,
            auth_attempts: 0,
            last_active: None,
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.status, AccountStatus::Authenticated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Created,
    Authenticating,
    Authenticated,
    Failed,
    Disconnected,
}
