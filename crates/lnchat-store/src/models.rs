//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the RPC layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lnchat_shared::ln::{LnInvoice, LnPayment, Route};
use lnchat_shared::{serde_hex, Address, MessageOptions, Node};

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// A known node with a local display name. Unique by node address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub id: u64,
    pub display_name: String,
    pub node: Node,
}

// ---------------------------------------------------------------------------
// Discussion
// ---------------------------------------------------------------------------

/// A conversation defined by its participant set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Discussion {
    pub id: u64,
    /// Participants in the order they were first given.
    pub participants: Vec<Address>,
    /// Last message the user has read (0 = none).
    pub last_read_id: u64,
    /// Newest message in this discussion (0 = none).
    pub last_message_id: u64,
    pub options: MessageOptions,
}

impl Discussion {
    /// The order-independent identity of this discussion.
    pub fn participants_key(&self) -> String {
        participants_key(&self.participants)
    }
}

/// Sorted, de-duplicated, comma-joined participant addresses.
pub fn participants_key(participants: &[Address]) -> String {
    let mut sorted: Vec<&str> = participants.iter().map(Address::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

/// Aggregates over the messages of one discussion.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscussionStatistics {
    pub amt_msat_sent: i64,
    pub amt_msat_fees: i64,
    pub amt_msat_received: i64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

// ---------------------------------------------------------------------------
// RawMessage
// ---------------------------------------------------------------------------

/// On-wire payload bytes plus the bookkeeping that links them to the
/// invoice or payments that carried them.
///
/// Exactly one of `invoice_settle_index > 0` or a non-empty
/// `payment_indexes` holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawMessage {
    pub id: u64,
    /// 0 while the discussion is not resolved yet.
    pub discussion_id: u64,
    #[serde(with = "serde_hex")]
    pub raw_payload: Vec<u8>,
    pub sender: Option<Address>,
    #[serde(with = "serde_hex")]
    pub signature: Vec<u8>,
    pub signature_verified: bool,
    pub invoice_settle_index: u64,
    pub payment_indexes: Vec<u64>,
    pub timestamp: DateTime<Utc>,
}

impl RawMessage {
    pub fn is_incoming(&self) -> bool {
        self.invoice_settle_index > 0
    }

    pub fn is_well_formed(&self) -> bool {
        (self.invoice_settle_index > 0) != !self.payment_indexes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Invoice / Payment
// ---------------------------------------------------------------------------

/// An invoice seen on the local node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invoice {
    pub id: u64,
    pub creator_address: Address,
    #[serde(flatten)]
    pub invoice: LnInvoice,
}

/// An outgoing payment made by the local node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payment {
    pub id: u64,
    pub payer_address: Address,
    pub payee_address: Option<Address>,
    #[serde(flatten)]
    pub payment: LnPayment,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A user-visible chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: u64,
    pub discussion_id: u64,
    /// 0 for messages that were never persisted (estimates).
    pub raw_message_id: u64,
    pub payload: String,
    pub amt_msat: i64,
    pub sender: Option<Address>,
    pub receiver: Option<Address>,
    pub sender_verified: bool,
    pub sent_time_ns: i64,
    pub received_time_ns: i64,
    /// Settle index (incoming) or payment index (single-recipient outgoing).
    pub index: u64,
    pub total_fees_msat: i64,
    pub routes: Vec<Route>,
    #[serde(with = "serde_hex")]
    pub preimage_hash: Vec<u8>,
    #[serde(with = "serde_hex")]
    pub preimage: Vec<u8>,
    pub pay_req: String,
    pub success_prob: f64,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            id: 0,
            discussion_id: 0,
            raw_message_id: 0,
            payload: String::new(),
            amt_msat: 0,
            sender: None,
            receiver: None,
            sender_verified: false,
            sent_time_ns: 0,
            received_time_ns: 0,
            index: 0,
            total_fees_msat: 0,
            routes: Vec::new(),
            preimage_hash: Vec::new(),
            preimage: Vec::new(),
            pay_req: String::new(),
            success_prob: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(c: char) -> Address {
        Address::parse(&format!("03{}", c.to_string().repeat(64))).unwrap()
    }

    #[test]
    fn test_participants_key_is_order_independent() {
        let ab = participants_key(&[addr('a'), addr('b')]);
        let ba = participants_key(&[addr('b'), addr('a')]);
        assert_eq!(ab, ba);
        assert_eq!(ab, format!("{},{}", addr('a'), addr('b')));
        assert_eq!(participants_key(&[addr('a'), addr('a')]), addr('a').to_string());
    }

    #[test]
    fn test_raw_message_shape() {
        let mut raw = RawMessage {
            id: 0,
            discussion_id: 0,
            raw_payload: Vec::new(),
            sender: None,
            signature: Vec::new(),
            signature_verified: false,
            invoice_settle_index: 3,
            payment_indexes: Vec::new(),
            timestamp: Utc::now(),
        };
        assert!(raw.is_well_formed());
        raw.payment_indexes.push(1);
        assert!(!raw.is_well_formed());
        raw.invoice_settle_index = 0;
        assert!(raw.is_well_formed());
        raw.payment_indexes.clear();
        assert!(!raw.is_well_formed());
    }
}
