//! # lnchat-shared
//!
//! Types shared by every lnchat crate: node addresses, the error taxonomy,
//! payment-node records, the chat payload codec and payload signatures.

pub mod constants;
pub mod error;
pub mod ln;
pub mod payload;
pub mod serde_hex;
pub mod signature;
pub mod types;

pub use error::{ChatError, ErrorKind, Result};
pub use types::{Address, MessageOptions, Node, PageOptions, PaymentOptions};
