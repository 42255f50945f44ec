//! The transactional outbox table and its dead-letter sibling.
//!
//! [`OutboxRepository`] is the only thing that ever reads/writes the
//! `outbox` table; [`DlqWriter`] is the only thing that writes `outbox_dlq`.
//! Both are plain Postgres, no framework, following the `FOR UPDATE SKIP
//! LOCKED` batch-pick pattern used for every other poll-based queue in this
//! codebase.

mod dlq;
mod repository;

pub use dlq::{DlqEntry, DlqWriter};
pub use repository::{OutboxRepository, OutboxRow, OutboxStatus};
