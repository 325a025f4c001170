//! JSON shapes of the LND REST gateway.
//!
//! The gateway renders 64-bit integers as strings and `bytes` fields as
//! standard base64; these structs accept both numeric forms and convert into
//! the shared records.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::{self, Deserializer, Error as _};
use serde::{Deserialize, Serialize};

use lnchat_shared::ln::{
    Chain, CustomRecords, FailureReason, Hop, HtlcAttempt, HtlcStatus, InvoiceHtlc, InvoiceState,
    LnInvoice, LnPayment, PayReq, PaymentStatus, Route,
};
use lnchat_shared::{Address, Node};

use super::LndError;

// ---------------------------------------------------------------------------
// Field decoders
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Text(String),
    Signed(i64),
}

fn int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match Option::<Number>::deserialize(d)? {
        None => Ok(0),
        Some(Number::Signed(n)) => Ok(n),
        Some(Number::Text(s)) if s.is_empty() => Ok(0),
        Some(Number::Text(s)) => s.parse().map_err(de::Error::custom),
    }
}

fn uint<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    match Option::<Number>::deserialize(d)? {
        None => Ok(0),
        Some(Number::Signed(n)) => u64::try_from(n).map_err(de::Error::custom),
        Some(Number::Text(s)) if s.is_empty() => Ok(0),
        Some(Number::Text(s)) => s.parse().map_err(de::Error::custom),
    }
}

/// base64 on the wire, lowercase hex in our records.
fn b64_hex<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let raw = Option::<String>::deserialize(d)?.unwrap_or_default();
    let bytes = BASE64.decode(raw.as_bytes()).map_err(D::Error::custom)?;
    Ok(hex::encode(bytes))
}

fn records<'de, D: Deserializer<'de>>(d: D) -> Result<CustomRecords, D::Error> {
    let raw = Option::<HashMap<String, String>>::deserialize(d)?.unwrap_or_default();
    raw.into_iter()
        .map(|(key, value)| {
            let key: u64 = key.parse().map_err(D::Error::custom)?;
            let value = BASE64.decode(value.as_bytes()).map_err(D::Error::custom)?;
            Ok((key, value))
        })
        .collect()
}

pub(crate) fn encode_records(records: &CustomRecords) -> HashMap<String, String> {
    records
        .iter()
        .map(|(key, value)| (key.to_string(), BASE64.encode(value)))
        .collect()
}

pub(crate) fn b64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

fn address(raw: &str) -> Result<Address, LndError> {
    Address::parse(raw).map_err(|_| LndError::Decode(format!("invalid node pubkey {raw:?}")))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RpcStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

#[derive(Deserialize)]
pub(crate) struct StreamItem<T> {
    pub result: Option<T>,
    pub error: Option<RpcStatus>,
}

// ---------------------------------------------------------------------------
// Node info
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(crate) struct GetInfoResponse {
    pub identity_pubkey: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub chains: Vec<Chain>,
    #[serde(default)]
    pub block_height: u32,
    #[serde(default)]
    pub num_active_channels: u32,
    #[serde(default)]
    pub num_peers: u32,
}

#[derive(Deserialize)]
pub(crate) struct WalletBalanceResponse {
    #[serde(default, deserialize_with = "int")]
    pub confirmed_balance: i64,
    #[serde(default, deserialize_with = "int")]
    pub unconfirmed_balance: i64,
}

#[derive(Default, Deserialize)]
pub(crate) struct Amount {
    #[serde(default, deserialize_with = "int")]
    pub msat: i64,
}

#[derive(Deserialize)]
pub(crate) struct ChannelBalanceResponse {
    #[serde(default)]
    pub local_balance: Amount,
    #[serde(default)]
    pub remote_balance: Amount,
    #[serde(default)]
    pub unsettled_local_balance: Amount,
    #[serde(default)]
    pub unsettled_remote_balance: Amount,
    #[serde(default)]
    pub pending_open_local_balance: Amount,
    #[serde(default)]
    pub pending_open_remote_balance: Amount,
}

#[derive(Deserialize)]
pub(crate) struct GraphNode {
    pub pub_key: String,
    #[serde(default)]
    pub alias: String,
}

#[derive(Deserialize)]
pub(crate) struct GraphResponse {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
}

impl GraphResponse {
    /// Nodes with a well-formed pubkey; malformed entries are skipped.
    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
            .into_iter()
            .filter_map(|n| {
                address(&n.pub_key).ok().map(|address| Node {
                    alias: n.alias,
                    address,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Peers and channels
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub(crate) struct LightningAddress<'a> {
    pub pubkey: &'a str,
    pub host: &'a str,
}

#[derive(Serialize)]
pub(crate) struct ConnectPeerRequest<'a> {
    pub addr: LightningAddress<'a>,
    pub perm: bool,
    pub timeout: u64,
}

#[derive(Serialize)]
pub(crate) struct OpenChannelBody {
    pub node_pubkey: String,
    pub local_funding_amount: String,
    pub push_sat: String,
    pub min_confs: i32,
    pub spend_unconfirmed: bool,
    pub target_conf: i32,
    pub sat_per_vbyte: String,
    pub private: bool,
}

#[derive(Deserialize)]
pub(crate) struct ChannelPointResponse {
    #[serde(default)]
    pub funding_txid_bytes: Option<String>,
    #[serde(default)]
    pub funding_txid_str: Option<String>,
    #[serde(default)]
    pub output_index: u32,
}

impl ChannelPointResponse {
    /// Display form of the funding txid (byte-reversed hex).
    pub fn txid(&self) -> Result<String, LndError> {
        if let Some(txid) = self.funding_txid_str.as_ref().filter(|s| !s.is_empty()) {
            return Ok(txid.clone());
        }
        let raw = self.funding_txid_bytes.as_deref().unwrap_or_default();
        let mut bytes = BASE64
            .decode(raw.as_bytes())
            .map_err(|e| LndError::Decode(format!("funding txid: {e}")))?;
        bytes.reverse();
        Ok(hex::encode(bytes))
    }
}

// ---------------------------------------------------------------------------
// Invoices
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub(crate) struct AddInvoiceBody<'a> {
    pub memo: &'a str,
    pub value_msat: String,
    pub expiry: String,
    pub private: bool,
}

#[derive(Deserialize)]
pub(crate) struct AddInvoiceResponse {
    #[serde(default, deserialize_with = "b64_hex")]
    pub r_hash: String,
}

#[derive(Deserialize)]
pub(crate) struct InvoiceHtlcWire {
    #[serde(default, deserialize_with = "uint")]
    pub chan_id: u64,
    #[serde(default, deserialize_with = "int")]
    pub amt_msat: i64,
    #[serde(default, deserialize_with = "int")]
    pub accept_time: i64,
    #[serde(default, deserialize_with = "int")]
    pub resolve_time: i64,
    #[serde(default, deserialize_with = "records")]
    pub custom_records: CustomRecords,
}

#[derive(Deserialize)]
pub(crate) struct InvoiceWire {
    #[serde(default)]
    pub memo: String,
    #[serde(default, deserialize_with = "b64_hex")]
    pub r_preimage: String,
    #[serde(default, deserialize_with = "b64_hex")]
    pub r_hash: String,
    #[serde(default, deserialize_with = "int")]
    pub value_msat: i64,
    #[serde(default, deserialize_with = "int")]
    pub creation_date: i64,
    #[serde(default, deserialize_with = "int")]
    pub settle_date: i64,
    #[serde(default)]
    pub payment_request: String,
    #[serde(default, deserialize_with = "int")]
    pub expiry: i64,
    #[serde(default)]
    pub private: bool,
    #[serde(default, deserialize_with = "uint")]
    pub add_index: u64,
    #[serde(default, deserialize_with = "uint")]
    pub settle_index: u64,
    #[serde(default, deserialize_with = "int")]
    pub amt_paid_msat: i64,
    #[serde(default)]
    pub state: InvoiceState,
    #[serde(default)]
    pub is_keysend: bool,
    #[serde(default)]
    pub htlcs: Vec<InvoiceHtlcWire>,
}

impl From<InvoiceWire> for LnInvoice {
    fn from(w: InvoiceWire) -> Self {
        LnInvoice {
            memo: w.memo,
            r_preimage: w.r_preimage,
            r_hash: w.r_hash,
            value_msat: w.value_msat,
            creation_date: w.creation_date,
            settle_date: w.settle_date,
            payment_request: w.payment_request,
            expiry: w.expiry,
            private: w.private,
            add_index: w.add_index,
            settle_index: w.settle_index,
            amt_paid_msat: w.amt_paid_msat,
            state: w.state,
            is_keysend: w.is_keysend,
            htlcs: w
                .htlcs
                .into_iter()
                .map(|h| InvoiceHtlc {
                    chan_id: h.chan_id,
                    amt_msat: h.amt_msat,
                    accept_time: h.accept_time,
                    resolve_time: h.resolve_time,
                    custom_records: h.custom_records,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct ListInvoicesResponse {
    #[serde(default)]
    pub invoices: Vec<InvoiceWire>,
    #[serde(default, deserialize_with = "uint")]
    pub last_index_offset: u64,
}

#[derive(Deserialize)]
pub(crate) struct PayReqWire {
    pub destination: String,
    #[serde(default)]
    pub payment_hash: String,
    #[serde(default, deserialize_with = "int")]
    pub num_msat: i64,
    #[serde(default, deserialize_with = "int")]
    pub timestamp: i64,
    #[serde(default, deserialize_with = "int")]
    pub expiry: i64,
    #[serde(default)]
    pub description: String,
}

impl TryFrom<PayReqWire> for PayReq {
    type Error = LndError;

    fn try_from(w: PayReqWire) -> Result<Self, Self::Error> {
        Ok(PayReq {
            destination: address(&w.destination)?,
            payment_hash: w.payment_hash,
            num_msat: w.num_msat,
            timestamp: w.timestamp,
            expiry: w.expiry,
            description: w.description,
        })
    }
}

// ---------------------------------------------------------------------------
// Payments and routes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub(crate) struct SendPaymentBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    pub amt_msat: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_request: Option<String>,
    pub dest_custom_records: HashMap<String, String>,
    pub fee_limit_msat: String,
    pub final_cltv_delta: i32,
    pub timeout_seconds: i32,
    pub no_inflight_updates: bool,
}

#[derive(Deserialize)]
pub(crate) struct HopWire {
    #[serde(default, deserialize_with = "uint")]
    pub chan_id: u64,
    #[serde(default, deserialize_with = "int")]
    pub chan_capacity: i64,
    #[serde(default, deserialize_with = "int")]
    pub amt_to_forward_msat: i64,
    #[serde(default, deserialize_with = "int")]
    pub fee_msat: i64,
    #[serde(default)]
    pub expiry: u32,
    #[serde(default)]
    pub pub_key: String,
}

#[derive(Deserialize)]
pub(crate) struct RouteWire {
    #[serde(default)]
    pub total_time_lock: u32,
    #[serde(default, deserialize_with = "int")]
    pub total_fees_msat: i64,
    #[serde(default, deserialize_with = "int")]
    pub total_amt_msat: i64,
    #[serde(default)]
    pub hops: Vec<HopWire>,
}

impl From<RouteWire> for Route {
    fn from(w: RouteWire) -> Self {
        Route {
            total_time_lock: w.total_time_lock,
            total_fees_msat: w.total_fees_msat,
            total_amt_msat: w.total_amt_msat,
            hops: w
                .hops
                .into_iter()
                .map(|h| Hop {
                    chan_id: h.chan_id,
                    chan_capacity_sat: h.chan_capacity,
                    amt_to_forward_msat: h.amt_to_forward_msat,
                    fee_msat: h.fee_msat,
                    expiry: h.expiry,
                    pub_key: h.pub_key,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct HtlcAttemptWire {
    #[serde(default, deserialize_with = "uint")]
    pub attempt_id: u64,
    #[serde(default)]
    pub status: String,
    pub route: Option<RouteWire>,
    #[serde(default, deserialize_with = "int")]
    pub attempt_time_ns: i64,
    #[serde(default, deserialize_with = "int")]
    pub resolve_time_ns: i64,
}

#[derive(Deserialize)]
pub(crate) struct PaymentWire {
    #[serde(default)]
    pub payment_hash: String,
    #[serde(default, deserialize_with = "int")]
    pub value_msat: i64,
    #[serde(default, deserialize_with = "int")]
    pub fee_msat: i64,
    #[serde(default)]
    pub payment_preimage: String,
    #[serde(default)]
    pub payment_request: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "int")]
    pub creation_time_ns: i64,
    #[serde(default, deserialize_with = "uint")]
    pub payment_index: u64,
    #[serde(default)]
    pub htlcs: Vec<HtlcAttemptWire>,
    #[serde(default)]
    pub failure_reason: String,
}

fn payment_status(raw: &str) -> PaymentStatus {
    match raw {
        "IN_FLIGHT" | "INITIATED" => PaymentStatus::InFlight,
        "SUCCEEDED" => PaymentStatus::Succeeded,
        "FAILED" => PaymentStatus::Failed,
        _ => PaymentStatus::Unknown,
    }
}

fn htlc_status(raw: &str) -> HtlcStatus {
    match raw {
        "SUCCEEDED" => HtlcStatus::Succeeded,
        "FAILED" => HtlcStatus::Failed,
        _ => HtlcStatus::InFlight,
    }
}

fn failure_reason(raw: &str) -> FailureReason {
    match raw {
        "FAILURE_REASON_TIMEOUT" => FailureReason::Timeout,
        "FAILURE_REASON_NO_ROUTE" => FailureReason::NoRoute,
        "FAILURE_REASON_ERROR" => FailureReason::Error,
        "FAILURE_REASON_INCORRECT_PAYMENT_DETAILS" => FailureReason::IncorrectPaymentDetails,
        "FAILURE_REASON_INSUFFICIENT_BALANCE" => FailureReason::InsufficientBalance,
        _ => FailureReason::None,
    }
}

impl From<PaymentWire> for LnPayment {
    fn from(w: PaymentWire) -> Self {
        LnPayment {
            payment_hash: w.payment_hash,
            value_msat: w.value_msat,
            fee_msat: w.fee_msat,
            // All zeroes until the payment succeeded.
            payment_preimage: if w.payment_preimage.bytes().all(|b| b == b'0') {
                String::new()
            } else {
                w.payment_preimage
            },
            payment_request: w.payment_request,
            status: payment_status(&w.status),
            creation_time_ns: w.creation_time_ns,
            payment_index: w.payment_index,
            htlcs: w
                .htlcs
                .into_iter()
                .map(|h| HtlcAttempt {
                    attempt_id: h.attempt_id,
                    status: htlc_status(&h.status),
                    route: h.route.map(Route::from).unwrap_or_default(),
                    attempt_time_ns: h.attempt_time_ns,
                    resolve_time_ns: h.resolve_time_ns,
                })
                .collect(),
            failure_reason: failure_reason(&w.failure_reason),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct ListPaymentsResponse {
    #[serde(default)]
    pub payments: Vec<PaymentWire>,
    #[serde(default, deserialize_with = "uint")]
    pub last_index_offset: u64,
}

#[derive(Deserialize)]
pub(crate) struct QueryRoutesResponse {
    #[serde(default)]
    pub routes: Vec<RouteWire>,
    #[serde(default)]
    pub success_prob: f64,
}

#[derive(Serialize)]
pub(crate) struct SignMessageBody {
    pub msg: String,
}

#[derive(Deserialize)]
pub(crate) struct SignMessageResponse {
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_from_gateway_json() {
        let json = r#"{
            "memo": "",
            "r_preimage": "AQID",
            "r_hash": "BAUG",
            "value_msat": "1000",
            "creation_date": "100",
            "settle_date": "110",
            "payment_request": "",
            "add_index": "5",
            "settle_index": "7",
            "amt_paid_msat": "1000",
            "state": "SETTLED",
            "is_keysend": true,
            "htlcs": [{
                "chan_id": "123",
                "amt_msat": "1000",
                "custom_records": {"34349334": "aGk="}
            }]
        }"#;
        let invoice: LnInvoice = serde_json::from_str::<InvoiceWire>(json).unwrap().into();
        assert_eq!(invoice.r_preimage, "010203");
        assert_eq!(invoice.r_hash, "040506");
        assert_eq!(invoice.settle_index, 7);
        assert!(invoice.is_settled());
        assert_eq!(invoice.custom_record(34_349_334), Some(&b"hi"[..]));
    }

    #[test]
    fn test_payment_from_gateway_json() {
        let json = r#"{
            "payment_hash": "ab",
            "value_msat": "1000",
            "fee_msat": 15,
            "payment_preimage": "0000",
            "status": "FAILED",
            "payment_index": "3",
            "failure_reason": "FAILURE_REASON_NO_ROUTE",
            "htlcs": [{
                "status": "FAILED",
                "route": {"total_fees_msat": "15", "total_amt_msat": "1015", "hops": []}
            }]
        }"#;
        let payment: LnPayment = serde_json::from_str::<PaymentWire>(json).unwrap().into();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.failure_reason, FailureReason::NoRoute);
        assert_eq!(payment.fee_msat, 15);
        assert!(payment.payment_preimage.is_empty());
        assert_eq!(payment.htlcs[0].route.amt_msat(), 1000);
    }

    #[test]
    fn test_custom_records_encode() {
        let mut records = CustomRecords::new();
        records.insert(34_349_334, b"hi".to_vec());
        let encoded = encode_records(&records);
        assert_eq!(encoded.get("34349334").map(String::as_str), Some("aGk="));
    }

    #[test]
    fn test_txid_is_reversed() {
        let point = ChannelPointResponse {
            funding_txid_bytes: Some(b64(&[1, 2, 3])),
            funding_txid_str: None,
            output_index: 1,
        };
        assert_eq!(point.txid().unwrap(), "030201");
    }
}
