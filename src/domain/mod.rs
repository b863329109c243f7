//! Core data model shared by every component of the forwarding engine.
//!
//! Types here are deliberately dumb: no I/O, no locking. Components hold
//! `Arc`s around these where sharing is needed.

mod account;
mod chat;
mod job;
mod log;

pub use account::{Account, AccountId, AccountStatus};
pub use chat::{ChatRef, Entity, EntityKind};
pub use job::{FilterPolicy, Job, JobId, JobStatus, ProgressCursor, RateParams};
pub use log::{LogEntry, LogLevel};
