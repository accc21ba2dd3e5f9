//! Database layer for the voice relay.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization
//! and embedded SQL migrations. Agents, conversations and conversation
//! messages are all created through versioned migrations owned by this crate.
//!
//! - **SQLite with WAL mode**: one relay process owns its database; WAL
//!   allows the many concurrent readers (history lookups) alongside the
//!   single writer per session.
//! - **`r2d2` connection pool**: bounded connection reuse shared by every
//!   session's blocking store calls.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` and cannot drift from the code that queries them.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
