//! Payflow Store: persistence for payments, refunds, idempotency records
//! and the transactional outbox.
//!
//! Two backends implement every storage trait:
//! - [`PgStore`]: PostgreSQL via sqlx. Business writes and their outbox rows
//!   share one transaction; claims use `FOR UPDATE SKIP LOCKED`.
//! - [`InMemoryStore`]: a single mutex over all tables, for local runs and
//!   tests. Each trait call is atomic.

pub mod memory;
pub mod pg_idempotency;
pub mod pg_outbox;
pub mod pg_store;

pub use memory::InMemoryStore;
pub use pg_store::PgStore;
