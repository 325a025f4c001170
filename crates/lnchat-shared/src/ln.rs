//! Records exchanged with the payment node.
//!
//! These mirror what a Lightning node reports for invoices, payments and
//! routes. Hashes and preimages travel as lowercase hex strings, exactly as
//! the node emits them; decoding to bytes happens where they are consumed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Address, PaymentOptions};

/// TLV custom records attached to an HTLC, keyed by record type.
pub type CustomRecords = BTreeMap<u64, Vec<u8>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceState {
    #[default]
    Open,
    Settled,
    Canceled,
    Accepted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Unknown,
    InFlight,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Succeeded | PaymentStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HtlcStatus {
    #[default]
    InFlight,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    #[default]
    None,
    Timeout,
    NoRoute,
    Error,
    IncorrectPaymentDetails,
    InsufficientBalance,
}

/// One hop of a route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub chan_id: u64,
    pub chan_capacity_sat: i64,
    pub amt_to_forward_msat: i64,
    pub fee_msat: i64,
    pub expiry: u32,
    pub pub_key: String,
}

/// A route taken (or proposed) by one HTLC.
///
/// `total_amt_msat` includes `total_fees_msat`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub total_time_lock: u32,
    pub total_fees_msat: i64,
    pub total_amt_msat: i64,
    pub hops: Vec<Hop>,
}

impl Route {
    /// Amount delivered to the final hop.
    pub fn amt_msat(&self) -> i64 {
        self.total_amt_msat - self.total_fees_msat
    }
}

/// One attempt to deliver (part of) a payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcAttempt {
    pub attempt_id: u64,
    pub status: HtlcStatus,
    pub route: Route,
    pub attempt_time_ns: i64,
    pub resolve_time_ns: i64,
}

/// An HTLC received as part of an invoice settlement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceHtlc {
    pub chan_id: u64,
    pub amt_msat: i64,
    pub accept_time: i64,
    pub resolve_time: i64,
    #[serde(default)]
    pub custom_records: CustomRecords,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnInvoice {
    pub memo: String,
    /// Hex preimage; empty while unknown.
    pub r_preimage: String,
    /// Hex payment hash.
    pub r_hash: String,
    pub value_msat: i64,
    /// Unix seconds.
    pub creation_date: i64,
    /// Unix seconds, 0 while unsettled.
    pub settle_date: i64,
    pub payment_request: String,
    pub expiry: i64,
    pub private: bool,
    pub add_index: u64,
    pub settle_index: u64,
    pub amt_paid_msat: i64,
    pub state: InvoiceState,
    pub is_keysend: bool,
    #[serde(default)]
    pub htlcs: Vec<InvoiceHtlc>,
}

impl LnInvoice {
    pub fn is_settled(&self) -> bool {
        self.state == InvoiceState::Settled && self.settle_index > 0
    }

    /// First occurrence of a custom record across the settled HTLCs.
    pub fn custom_record(&self, key: u64) -> Option<&[u8]> {
        self.htlcs
            .iter()
            .find_map(|h| h.custom_records.get(&key))
            .map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnPayment {
    /// Hex payment hash.
    pub payment_hash: String,
    pub value_msat: i64,
    pub fee_msat: i64,
    /// Hex preimage; empty until the payment succeeded.
    pub payment_preimage: String,
    pub payment_request: String,
    pub status: PaymentStatus,
    pub creation_time_ns: i64,
    pub payment_index: u64,
    pub htlcs: Vec<HtlcAttempt>,
    pub failure_reason: FailureReason,
}

impl LnPayment {
    pub fn successful_htlcs(&self) -> impl Iterator<Item = &HtlcAttempt> {
        self.htlcs
            .iter()
            .filter(|h| h.status == HtlcStatus::Succeeded)
    }
}

/// A decoded BOLT11 payment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayReq {
    pub destination: Address,
    pub payment_hash: String,
    pub num_msat: i64,
    pub timestamp: i64,
    pub expiry: i64,
    pub description: String,
}

/// What to pay: either a BOLT11 request or a keysend to `dest`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendPaymentRequest {
    pub dest: Option<Address>,
    pub amt_msat: i64,
    pub payment_request: Option<String>,
    pub custom_records: CustomRecords,
    pub options: PaymentOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub chain: String,
    pub network: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfInfo {
    pub address: Address,
    pub alias: String,
    pub version: String,
    pub chains: Vec<Chain>,
    pub block_height: u32,
    pub num_active_channels: u32,
    pub num_peers: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfBalance {
    pub wallet_confirmed_sat: i64,
    pub wallet_unconfirmed_sat: i64,
    pub channel_local_msat: i64,
    pub channel_remote_msat: i64,
    pub pending_open_local_msat: i64,
    pub pending_open_remote_msat: i64,
    pub unsettled_local_msat: i64,
    pub unsettled_remote_msat: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    pub address: Address,
    pub amt_msat: i64,
    #[serde(default)]
    pub push_msat: i64,
    #[serde(default)]
    pub min_input_confs: i32,
    #[serde(default)]
    pub target_conf: i32,
    #[serde(default)]
    pub sat_per_vbyte: u64,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPoint {
    pub funding_txid: String,
    pub output_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_record_lookup_spans_htlcs() {
        let mut records = CustomRecords::new();
        records.insert(7, b"hello".to_vec());
        let invoice = LnInvoice {
            htlcs: vec![
                InvoiceHtlc::default(),
                InvoiceHtlc {
                    custom_records: records,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(invoice.custom_record(7), Some(&b"hello"[..]));
        assert_eq!(invoice.custom_record(8), None);
    }

    #[test]
    fn test_route_amount_excludes_fees() {
        let route = Route {
            total_amt_msat: 610,
            total_fees_msat: 10,
            ..Default::default()
        };
        assert_eq!(route.amt_msat(), 600);
    }

    #[test]
    fn test_terminal_status() {
        assert!(PaymentStatus::Succeeded.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(!PaymentStatus::InFlight.is_terminal());
    }
}
