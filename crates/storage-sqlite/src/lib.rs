#![forbid(unsafe_code)]

//! SQLite-backed [`runq_storage::Store`].

mod store;

pub use store::SqliteStore;
