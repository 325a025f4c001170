use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{
    ADDRESS_LEN, DEFAULT_FEE_LIMIT_MSAT, DEFAULT_FINAL_CLTV_DELTA, DEFAULT_PAGE_SIZE,
    DEFAULT_PAYMENT_TIMEOUT_SECS,
};
use crate::error::ChatError;

// Node address = 33-byte compressed secp256k1 pubkey, 66 lowercase hex chars
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Validate against `^[a-z0-9]{66}$`.
    pub fn parse(s: &str) -> Result<Self, ChatError> {
        let valid = s.len() == ADDRESS_LEN
            && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
        if !valid {
            return Err(ChatError::invalid_address(s));
        }
        Ok(Self(s.to_string()))
    }

    pub fn from_pubkey_bytes(bytes: &[u8; 33]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw pubkey bytes. Fails for addresses that are well-formed on the
    /// wire but not hex.
    pub fn to_pubkey_bytes(&self) -> Result<[u8; 33], ChatError> {
        let bytes = hex::decode(&self.0).map_err(|e| {
            ChatError::invalid_address(&self.0).with_source(e)
        })?;
        let mut arr = [0u8; 33];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }

    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = ChatError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.0
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A payment network node as known to the local node's graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub alias: String,
    pub address: Address,
}

/// Per-discussion sending options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageOptions {
    #[serde(default = "default_fee_limit")]
    pub fee_limit_msat: i64,
    #[serde(default)]
    pub anonymous: bool,
}

fn default_fee_limit() -> i64 {
    DEFAULT_FEE_LIMIT_MSAT
}

impl Default for MessageOptions {
    fn default() -> Self {
        Self {
            fee_limit_msat: DEFAULT_FEE_LIMIT_MSAT,
            anonymous: false,
        }
    }
}

impl MessageOptions {
    pub fn payment_options(&self) -> PaymentOptions {
        PaymentOptions {
            fee_limit_msat: self.fee_limit_msat,
            ..PaymentOptions::default()
        }
    }
}

/// Options handed to the node for a single payment or probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOptions {
    pub fee_limit_msat: i64,
    pub final_cltv_delta: i32,
    pub timeout_secs: i32,
}

impl Default for PaymentOptions {
    fn default() -> Self {
        Self {
            fee_limit_msat: DEFAULT_FEE_LIMIT_MSAT,
            final_cltv_delta: DEFAULT_FINAL_CLTV_DELTA,
            timeout_secs: DEFAULT_PAYMENT_TIMEOUT_SECS,
        }
    }
}

/// Key-set pagination over store ids.
///
/// `last_id == 0` starts from the first row (or the last one when
/// `reverse`), and `page_size == 0` selects the default page size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOptions {
    #[serde(default)]
    pub last_id: u64,
    #[serde(default)]
    pub page_size: u32,
    #[serde(default)]
    pub reverse: bool,
}

impl PageOptions {
    pub fn effective_size(&self) -> u32 {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }
}
