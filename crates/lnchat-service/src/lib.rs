// Chat over Lightning payments: turns settled invoices and finished
// payments into discussions and messages, and sends messages as payments.

pub mod assembler;
pub mod pump;
pub mod resolver;
pub mod send;
pub mod service;
pub mod subscribers;

pub use send::{SendOutcome, SendRequest};
pub use service::{ChatService, Version};
pub use subscribers::{Subscribers, Subscription};
