//! In-process payment network.
//!
//! A [`SimNetwork`] holds any number of [`SimNode`]s. Keysend and invoice
//! payments between nodes of the same network settle on the destination
//! with their custom records attached, and every state change is published
//! on the node's invoice and payment streams, so the chat service runs
//! against it exactly as it would against a real node. Routing is a single
//! virtual router hop that charges `BASE_FEE_MSAT + amt * FEE_RATE_PPM`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use lnchat_shared::constants::KEYSEND_PREIMAGE_RECORD;
use lnchat_shared::ln::{
    Chain, ChannelPoint, CustomRecords, FailureReason, Hop, HtlcAttempt, HtlcStatus,
    InvoiceHtlc, InvoiceState, LnInvoice, LnPayment, OpenChannelRequest, PayReq, PaymentStatus,
    Route, SelfBalance, SelfInfo, SendPaymentRequest,
};
use lnchat_shared::signature::{recover_address, NodeKey};
use lnchat_shared::{Address, ChatError, Node, PaymentOptions, Result};

use crate::node::{InvoiceStream, LnNode, PaymentStream, RouteEstimate};

const SIM_VERSION: &str = "0.1.0-sim";
const PAY_REQ_PREFIX: &str = "lnsim";
const BASE_FEE_MSAT: i64 = 1_000;
const FEE_RATE_PPM: i64 = 1_000;
const EVENT_CAPACITY: usize = 256;
const DEFAULT_WALLET_SAT: i64 = 100_000_000;
const DEFAULT_CHANNEL_LOCAL_MSAT: i64 = 1_000_000_000;

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

fn now_secs() -> i64 {
    now_ns() / 1_000_000_000
}

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn hash_hex(preimage: &[u8]) -> String {
    hex::encode(Sha256::digest(preimage))
}

/// Routing fee the virtual router charges for `amt_msat`.
pub fn route_fee_msat(amt_msat: i64) -> i64 {
    BASE_FEE_MSAT + amt_msat * FEE_RATE_PPM / 1_000_000
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// A set of simulated nodes that can pay each other.
#[derive(Clone)]
pub struct SimNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    router: Address,
    nodes: Mutex<HashMap<Address, Weak<SimInner>>>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                router: NodeKey::generate().address(),
                nodes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a funded node with a fresh key and join it to the network.
    pub fn add_node(&self, alias: &str) -> SimNode {
        self.add_node_with_key(alias, NodeKey::generate())
    }

    pub fn add_node_with_key(&self, alias: &str, key: NodeKey) -> SimNode {
        let node = SimNode {
            inner: Arc::new(SimInner {
                key,
                alias: alias.to_string(),
                network: self.clone(),
                state: Mutex::new(SimState::default()),
                events: Mutex::new(Events::new()),
            }),
        };
        tracing::debug!(alias, address = %node.address(), "sim node joined");
        self.nodes()
            .insert(node.address(), Arc::downgrade(&node.inner));
        node
    }

    /// Look a live node up by address.
    pub fn node(&self, address: &Address) -> Option<SimNode> {
        self.nodes()
            .get(address)
            .and_then(Weak::upgrade)
            .map(|inner| SimNode { inner })
    }

    fn live_nodes(&self) -> Vec<SimNode> {
        self.nodes()
            .values()
            .filter_map(Weak::upgrade)
            .map(|inner| SimNode { inner })
            .collect()
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<Address, Weak<SimInner>>> {
        self.inner
            .nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Node state
// ---------------------------------------------------------------------------

struct Events {
    invoices: broadcast::Sender<LnInvoice>,
    payments: broadcast::Sender<LnPayment>,
}

impl Events {
    fn new() -> Self {
        let (invoices, _) = broadcast::channel(EVENT_CAPACITY);
        let (payments, _) = broadcast::channel(EVENT_CAPACITY);
        Self { invoices, payments }
    }
}

struct SimState {
    /// Position `i` holds the invoice with add index `i + 1`.
    invoices: Vec<LnInvoice>,
    /// Position `i` holds the payment with payment index `i + 1`.
    payments: Vec<LnPayment>,
    last_settle_index: u64,
    wallet_sat: i64,
    channel_local_msat: i64,
    channel_remote_msat: i64,
    num_channels: u32,
    peers: HashSet<Address>,
    failures: HashMap<Address, FailureReason>,
    success_probs: HashMap<Address, f64>,
    settle_delay: Duration,
    delays: HashMap<Address, Duration>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            invoices: Vec::new(),
            payments: Vec::new(),
            last_settle_index: 0,
            wallet_sat: DEFAULT_WALLET_SAT,
            channel_local_msat: DEFAULT_CHANNEL_LOCAL_MSAT,
            channel_remote_msat: 0,
            num_channels: 1,
            peers: HashSet::new(),
            failures: HashMap::new(),
            success_probs: HashMap::new(),
            settle_delay: Duration::ZERO,
            delays: HashMap::new(),
        }
    }
}

struct SimInner {
    key: NodeKey,
    alias: String,
    network: SimNetwork,
    state: Mutex<SimState>,
    events: Mutex<Events>,
}

/// One simulated node. Cheap to clone.
#[derive(Clone)]
pub struct SimNode {
    inner: Arc<SimInner>,
}

struct PendingPayment {
    payment_index: u64,
    dest: Address,
    amt_msat: i64,
    invoice_hash: Option<String>,
    custom_records: CustomRecords,
    options: PaymentOptions,
}

impl SimNode {
    pub fn address(&self) -> Address {
        self.inner.key.address()
    }

    pub fn alias(&self) -> &str {
        &self.inner.alias
    }

    /// Make every payment and probe to `dest` fail with `reason`.
    pub fn fail_payments_to(&self, dest: &Address, reason: FailureReason) {
        self.state().failures.insert(dest.clone(), reason);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Success probability reported by probes to `dest` (default 1.0).
    pub fn set_success_prob(&self, dest: &Address, prob: f64) {
        self.state().success_probs.insert(dest.clone(), prob);
    }

    /// Delay between starting a payment and resolving it.
    pub fn set_settle_delay(&self, delay: Duration) {
        self.state().settle_delay = delay;
    }

    /// Delay for payments to `dest`, overriding the settle delay.
    pub fn delay_payments_to(&self, dest: &Address, delay: Duration) {
        self.state().delays.insert(dest.clone(), delay);
    }

    pub fn set_channel_balance(&self, local_msat: i64) {
        self.state().channel_local_msat = local_msat;
    }

    /// End every open invoice and payment stream of this node.
    pub fn close_streams(&self) {
        *self.events() = Events::new();
    }

    pub fn invoices(&self) -> Vec<LnInvoice> {
        self.state().invoices.clone()
    }

    pub fn payments(&self) -> Vec<LnPayment> {
        self.state().payments.clone()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn events(&self) -> MutexGuard<'_, Events> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_invoice(&self, invoice: LnInvoice) {
        // No receivers is fine.
        let _ = self.events().invoices.send(invoice);
    }

    fn publish_payment(&self, payment: LnPayment) {
        let _ = self.events().payments.send(payment);
    }

    fn encode_pay_req(pay_req: &PayReq) -> Result<String> {
        let json = serde_json::to_vec(pay_req)
            .map_err(|e| ChatError::internal("cannot encode payment request").with_source(e))?;
        Ok(format!("{PAY_REQ_PREFIX}{}", hex::encode(json)))
    }

    fn parse_pay_req(pay_req: &str) -> Result<PayReq> {
        let invalid = || ChatError::invalid_argument(format!("invalid payment request {pay_req:?}"));
        let body = pay_req.strip_prefix(PAY_REQ_PREFIX).ok_or_else(invalid)?;
        let json = hex::decode(body).map_err(|e| invalid().with_source(e))?;
        serde_json::from_slice(&json).map_err(|e| invalid().with_source(e))
    }

    fn build_route(&self, dest: &Address, amt_msat: i64) -> Route {
        let fee = route_fee_msat(amt_msat);
        let chan_id = OsRng.next_u64() >> 1;
        Route {
            total_time_lock: 40,
            total_fees_msat: fee,
            total_amt_msat: amt_msat + fee,
            hops: vec![
                Hop {
                    chan_id,
                    chan_capacity_sat: DEFAULT_CHANNEL_LOCAL_MSAT / 1_000,
                    amt_to_forward_msat: amt_msat,
                    fee_msat: fee,
                    expiry: 40,
                    pub_key: self.inner.network.inner.router.to_string(),
                },
                Hop {
                    chan_id: chan_id + 1,
                    chan_capacity_sat: DEFAULT_CHANNEL_LOCAL_MSAT / 1_000,
                    amt_to_forward_msat: amt_msat,
                    fee_msat: 0,
                    expiry: 20,
                    pub_key: dest.to_string(),
                },
            ],
        }
    }

    /// Route `pending` to its destination, moving balances on success.
    /// Returns the successful route and the preimage (hex).
    fn route_payment(
        &self,
        pending: &PendingPayment,
    ) -> std::result::Result<(Route, String), FailureReason> {
        if let Some(reason) = self.state().failures.get(&pending.dest) {
            return Err(*reason);
        }
        let dest = self
            .inner
            .network
            .node(&pending.dest)
            .ok_or(FailureReason::NoRoute)?;

        let route = self.build_route(&pending.dest, pending.amt_msat);
        if route.total_fees_msat > pending.options.fee_limit_msat {
            return Err(FailureReason::NoRoute);
        }

        {
            let mut state = self.state();
            if state.channel_local_msat < route.total_amt_msat {
                return Err(FailureReason::InsufficientBalance);
            }
            state.channel_local_msat -= route.total_amt_msat;
            state.channel_remote_msat += route.total_amt_msat;
        }

        match dest.settle_incoming(
            pending.invoice_hash.as_deref(),
            pending.amt_msat,
            &pending.custom_records,
        ) {
            Ok(preimage) => Ok((route, preimage)),
            Err(reason) => {
                let mut state = self.state();
                state.channel_local_msat += route.total_amt_msat;
                state.channel_remote_msat -= route.total_amt_msat;
                Err(reason)
            }
        }
    }

    fn complete_payment(&self, pending: PendingPayment) {
        let attempt_time_ns = now_ns();
        let outcome = self.route_payment(&pending);

        let snapshot = {
            let mut state = self.state();
            let Some(payment) = state
                .payments
                .get_mut(pending.payment_index as usize - 1)
            else {
                return;
            };
            match outcome {
                Ok((route, preimage)) => {
                    payment.status = PaymentStatus::Succeeded;
                    payment.fee_msat = route.total_fees_msat;
                    payment.payment_preimage = preimage;
                    payment.htlcs = vec![HtlcAttempt {
                        attempt_id: pending.payment_index,
                        status: HtlcStatus::Succeeded,
                        route,
                        attempt_time_ns,
                        resolve_time_ns: now_ns(),
                    }];
                }
                Err(reason) => {
                    payment.status = PaymentStatus::Failed;
                    payment.failure_reason = reason;
                    payment.htlcs = vec![HtlcAttempt {
                        attempt_id: pending.payment_index,
                        status: HtlcStatus::Failed,
                        route: Route::default(),
                        attempt_time_ns,
                        resolve_time_ns: now_ns(),
                    }];
                }
            }
            payment.clone()
        };

        tracing::debug!(
            payment_index = snapshot.payment_index,
            status = ?snapshot.status,
            "sim payment resolved"
        );
        self.publish_payment(snapshot);
    }

    /// Accept an incoming HTLC: settle the invoice with `hash`, or create
    /// and settle a keysend invoice when there is none.
    fn settle_incoming(
        &self,
        hash: Option<&str>,
        amt_msat: i64,
        custom_records: &CustomRecords,
    ) -> std::result::Result<String, FailureReason> {
        let now = now_secs();
        let snapshot = {
            let mut state = self.state();
            let position = match hash {
                Some(hash) => {
                    let position = state
                        .invoices
                        .iter()
                        .position(|i| i.r_hash == hash)
                        .ok_or(FailureReason::IncorrectPaymentDetails)?;
                    let invoice = &state.invoices[position];
                    if invoice.state != InvoiceState::Open || amt_msat < invoice.value_msat {
                        return Err(FailureReason::IncorrectPaymentDetails);
                    }
                    position
                }
                None => {
                    let preimage = custom_records
                        .get(&KEYSEND_PREIMAGE_RECORD)
                        .filter(|p| p.len() == 32)
                        .ok_or(FailureReason::IncorrectPaymentDetails)?;
                    let add_index = state.invoices.len() as u64 + 1;
                    state.invoices.push(LnInvoice {
                        r_preimage: hex::encode(preimage),
                        r_hash: hash_hex(preimage),
                        value_msat: amt_msat,
                        creation_date: now,
                        add_index,
                        state: InvoiceState::Open,
                        is_keysend: true,
                        ..Default::default()
                    });
                    state.invoices.len() - 1
                }
            };

            state.last_settle_index += 1;
            state.channel_local_msat += amt_msat;
            let settle_index = state.last_settle_index;

            let invoice = &mut state.invoices[position];
            invoice.state = InvoiceState::Settled;
            invoice.settle_index = settle_index;
            invoice.settle_date = now;
            invoice.amt_paid_msat = amt_msat;
            invoice.htlcs = vec![InvoiceHtlc {
                chan_id: OsRng.next_u64() >> 1,
                amt_msat,
                accept_time: now,
                resolve_time: now,
                custom_records: custom_records.clone(),
            }];
            invoice.clone()
        };

        tracing::debug!(
            alias = %self.inner.alias,
            settle_index = snapshot.settle_index,
            keysend = snapshot.is_keysend,
            "sim invoice settled"
        );
        let preimage = snapshot.r_preimage.clone();
        self.publish_invoice(snapshot);
        Ok(preimage)
    }
}

fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, Result<T>>
where
    T: Clone + Send + 'static,
{
    stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(item) => Some((Ok(item), rx)),
            Err(broadcast::error::RecvError::Lagged(missed)) => Some((
                Err(ChatError::network(format!(
                    "event stream fell behind by {missed} updates"
                ))),
                rx,
            )),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    })
    .boxed()
}

// ---------------------------------------------------------------------------
// LnNode
// ---------------------------------------------------------------------------

#[async_trait]
impl LnNode for SimNode {
    async fn get_self_info(&self) -> Result<SelfInfo> {
        let state = self.state();
        Ok(SelfInfo {
            address: self.address(),
            alias: self.inner.alias.clone(),
            version: SIM_VERSION.to_string(),
            chains: vec![Chain {
                chain: "bitcoin".into(),
                network: "regtest".into(),
            }],
            block_height: 0,
            num_active_channels: state.num_channels,
            num_peers: state.peers.len() as u32,
        })
    }

    async fn get_self_balance(&self) -> Result<SelfBalance> {
        let state = self.state();
        Ok(SelfBalance {
            wallet_confirmed_sat: state.wallet_sat,
            channel_local_msat: state.channel_local_msat,
            channel_remote_msat: state.channel_remote_msat,
            ..Default::default()
        })
    }

    async fn get_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .inner
            .network
            .live_nodes()
            .into_iter()
            .map(|n| Node {
                alias: n.inner.alias.clone(),
                address: n.address(),
            })
            .collect();
        nodes.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(nodes)
    }

    async fn connect_node(&self, address: &Address, host_port: &str) -> Result<()> {
        let peer = self.inner.network.node(address).ok_or_else(|| {
            ChatError::network(format!("cannot reach {address} at {host_port}"))
        })?;
        self.state().peers.insert(address.clone());
        peer.state().peers.insert(self.address());
        Ok(())
    }

    async fn open_channel(&self, request: &OpenChannelRequest) -> Result<ChannelPoint> {
        let mut state = self.state();
        if !state.peers.contains(&request.address) {
            return Err(ChatError::network(format!(
                "not connected to {}",
                request.address
            )));
        }
        let amt_sat = request.amt_msat / 1_000;
        if amt_sat <= 0 || request.push_msat > request.amt_msat {
            return Err(ChatError::invalid_argument("invalid channel amounts"));
        }
        if amt_sat > state.wallet_sat {
            return Err(ChatError::insufficient_balance(format!(
                "wallet holds {} sat, channel needs {amt_sat} sat",
                state.wallet_sat
            )));
        }
        state.wallet_sat -= amt_sat;
        state.channel_local_msat += request.amt_msat - request.push_msat;
        state.channel_remote_msat += request.push_msat;
        state.num_channels += 1;

        Ok(ChannelPoint {
            funding_txid: hex::encode(random_bytes()),
            output_index: 0,
        })
    }

    async fn create_invoice(
        &self,
        memo: &str,
        amt_msat: i64,
        expiry: i64,
        private: bool,
    ) -> Result<LnInvoice> {
        let preimage = random_bytes();
        let r_hash = hash_hex(&preimage);
        let now = now_secs();
        let payment_request = Self::encode_pay_req(&PayReq {
            destination: self.address(),
            payment_hash: r_hash.clone(),
            num_msat: amt_msat,
            timestamp: now,
            expiry,
            description: memo.to_string(),
        })?;

        let invoice = {
            let mut state = self.state();
            let invoice = LnInvoice {
                memo: memo.to_string(),
                r_preimage: hex::encode(preimage),
                r_hash,
                value_msat: amt_msat,
                creation_date: now,
                payment_request,
                expiry,
                private,
                add_index: state.invoices.len() as u64 + 1,
                state: InvoiceState::Open,
                ..Default::default()
            };
            state.invoices.push(invoice.clone());
            invoice
        };
        self.publish_invoice(invoice.clone());
        Ok(invoice)
    }

    async fn lookup_invoice(&self, pay_req: &str) -> Result<LnInvoice> {
        let decoded = Self::parse_pay_req(pay_req)?;
        self.state()
            .invoices
            .iter()
            .find(|i| i.r_hash == decoded.payment_hash)
            .cloned()
            .ok_or_else(|| ChatError::not_found(format!("invoice {}", decoded.payment_hash)))
    }

    async fn decode_pay_req(&self, pay_req: &str) -> Result<PayReq> {
        Self::parse_pay_req(pay_req)
    }

    async fn send_payment(&self, request: SendPaymentRequest) -> Result<LnPayment> {
        let (dest, invoice_hash, amt_msat) = match &request.payment_request {
            Some(pay_req) => {
                let decoded = Self::parse_pay_req(pay_req)?;
                let amt = if decoded.num_msat > 0 {
                    decoded.num_msat
                } else {
                    request.amt_msat
                };
                (decoded.destination, Some(decoded.payment_hash), amt)
            }
            None => {
                let dest = request.dest.clone().ok_or_else(|| {
                    ChatError::invalid_argument("payment needs a destination or a payment request")
                })?;
                (dest, None, request.amt_msat)
            }
        };
        if amt_msat <= 0 {
            return Err(ChatError::invalid_argument("payment amount must be positive"));
        }

        let mut custom_records = request.custom_records.clone();
        let payment_hash = match &invoice_hash {
            Some(hash) => hash.clone(),
            None => {
                let preimage = custom_records
                    .entry(KEYSEND_PREIMAGE_RECORD)
                    .or_insert_with(|| random_bytes().to_vec());
                hash_hex(preimage)
            }
        };

        let (payment, delay) = {
            let mut state = self.state();
            let payment = LnPayment {
                payment_hash,
                value_msat: amt_msat,
                payment_request: request.payment_request.clone().unwrap_or_default(),
                status: PaymentStatus::InFlight,
                creation_time_ns: now_ns(),
                payment_index: state.payments.len() as u64 + 1,
                ..Default::default()
            };
            state.payments.push(payment.clone());
            let delay = state.delays.get(&dest).copied().unwrap_or(state.settle_delay);
            (payment, delay)
        };
        self.publish_payment(payment.clone());

        let pending = PendingPayment {
            payment_index: payment.payment_index,
            dest,
            amt_msat,
            invoice_hash,
            custom_records,
            options: request.options,
        };
        let node = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            node.complete_payment(pending);
        });

        Ok(payment)
    }

    async fn probe_route(
        &self,
        dest: &Address,
        amt_msat: i64,
        options: &PaymentOptions,
    ) -> Result<RouteEstimate> {
        let (failure, success_prob, local_msat) = {
            let state = self.state();
            (
                state.failures.get(dest).copied(),
                state.success_probs.get(dest).copied().unwrap_or(1.0),
                state.channel_local_msat,
            )
        };
        if failure.is_some() || self.inner.network.node(dest).is_none() {
            return Err(ChatError::no_route_found(dest));
        }

        let route = self.build_route(dest, amt_msat);
        if route.total_fees_msat > options.fee_limit_msat {
            return Err(ChatError::no_route_found(dest));
        }
        if route.total_amt_msat > local_msat {
            return Err(ChatError::insufficient_balance(format!(
                "{local_msat} msat available, route needs {}",
                route.total_amt_msat
            )));
        }
        Ok(RouteEstimate {
            route,
            success_prob,
        })
    }

    async fn list_invoices(&self, from_settle_index: u64) -> Result<Vec<LnInvoice>> {
        let mut settled: Vec<LnInvoice> = self
            .state()
            .invoices
            .iter()
            .filter(|i| i.is_settled() && i.settle_index >= from_settle_index)
            .cloned()
            .collect();
        settled.sort_by_key(|i| i.settle_index);
        Ok(settled)
    }

    async fn list_payments(&self, from_payment_index: u64) -> Result<Vec<LnPayment>> {
        Ok(self
            .state()
            .payments
            .iter()
            .filter(|p| p.payment_index >= from_payment_index)
            .cloned()
            .collect())
    }

    async fn subscribe_invoices(&self, from_settle_index: u64) -> Result<InvoiceStream> {
        // Subscribe before taking the backlog so nothing falls in between.
        let rx = self.events().invoices.subscribe();
        let backlog = self.list_invoices(from_settle_index).await?;
        Ok(stream::iter(backlog.into_iter().map(Ok))
            .chain(broadcast_stream(rx))
            .boxed())
    }

    async fn subscribe_payments(&self, from_payment_index: u64) -> Result<PaymentStream> {
        let rx = self.events().payments.subscribe();
        let backlog = self.list_payments(from_payment_index).await?;
        Ok(stream::iter(backlog.into_iter().map(Ok))
            .chain(broadcast_stream(rx))
            .boxed())
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.inner.key.sign(message))
    }

    async fn verify_message(&self, message: &[u8], signature: &[u8]) -> Result<Address> {
        Ok(recover_address(message, signature)?)
    }
}
