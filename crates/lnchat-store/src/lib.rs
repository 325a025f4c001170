//! # lnchat-store
//!
//! Local storage for lnchat, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! model, plus a cloneable [`Store`] that shares one database between the
//! background event loops and the RPC handlers.

pub mod contacts;
pub mod database;
pub mod discussions;
pub mod invoices;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod payments;
pub mod raw_messages;
pub mod store;

mod columns;
mod error;

pub use database::{Database, TxError};
pub use error::StoreError;
pub use models::*;
pub use store::Store;
