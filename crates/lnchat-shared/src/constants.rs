/// Application name
pub const APP_NAME: &str = "lnchat";

/// Length of a node address: 33-byte compressed pubkey as lowercase hex
pub const ADDRESS_LEN: usize = 66;

/// Compact recoverable signature size in bytes (header + r + s)
pub const SIGNATURE_SIZE: usize = 65;

/// Prefix prepended to every signed payload before hashing
pub const SIGNED_MESSAGE_PREFIX: &[u8] = b"Lightning Signed Message:";

/// TLV record carrying the keysend preimage
pub const KEYSEND_PREIMAGE_RECORD: u64 = 5_482_373_484;

/// TLV record carrying the composite chat payload
pub const PAYLOAD_RECORD: u64 = 34_349_334;

/// TLV record carrying the sender's signature over the payload
pub const SIGNATURE_RECORD: u64 = 34_349_337;

/// TLV record carrying the sender's address (33 raw bytes)
pub const SENDER_RECORD: u64 = 34_349_339;

/// TLV record carrying the send timestamp (unix nanoseconds, big endian)
pub const TIMESTAMP_RECORD: u64 = 34_349_343;

/// Default CLTV delta for the final hop of a chat payment
pub const DEFAULT_FINAL_CLTV_DELTA: i32 = 20;

/// Default time budget for one payment, in seconds
pub const DEFAULT_PAYMENT_TIMEOUT_SECS: i32 = 30;

/// Default routing fee budget, in millisatoshis
pub const DEFAULT_FEE_LIMIT_MSAT: i64 = 3_000;

/// Default page size for key-set pagination
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Per-subscriber queue capacity for incoming message fan-out
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 16;
