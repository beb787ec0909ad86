//! Sqlite-backed session persistence.

pub mod sessions;

pub use sessions::{migrate, open_session_pool, DbPool, SqliteSessionStore};
