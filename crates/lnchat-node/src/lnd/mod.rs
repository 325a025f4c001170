//! LND backend over the REST gateway.
//!
//! Unary calls are plain JSON requests. Streaming calls (invoice and payment
//! subscriptions, `router/send`) answer with newline-delimited JSON objects
//! of the form `{"result": ...}` or `{"error": ...}`.

mod wire;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;

use lnchat_shared::constants::KEYSEND_PREIMAGE_RECORD;
use lnchat_shared::ln::{
    ChannelPoint, LnInvoice, LnPayment, OpenChannelRequest, PayReq, SelfBalance, SelfInfo,
    SendPaymentRequest,
};
use lnchat_shared::signature::recover_address;
use lnchat_shared::{Address, ChatError, Node, PaymentOptions, Result};

use crate::node::{InvoiceStream, LnNode, PaymentStream, RouteEstimate};

const UNARY_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_PAGE_SIZE: u64 = 500;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum LndError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LND returned {status}: {message}")]
    Rpc { status: u16, message: String },

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LndError> for ChatError {
    fn from(err: LndError) -> Self {
        match &err {
            LndError::Rpc { status, message } => {
                let lower = message.to_lowercase();
                let description = message.clone();
                let chat = if lower.contains("insufficient") {
                    ChatError::insufficient_balance(description)
                } else if lower.contains("unable to find a path") || lower.contains("no route") {
                    ChatError::not_found(description)
                } else if *status == 404 || lower.contains("not found") || lower.contains("unable to locate") {
                    ChatError::not_found(description)
                } else if *status == 401 || *status == 403 || lower.contains("permission denied") {
                    ChatError::permission(description)
                } else if lower.contains("deadline") || lower.contains("timeout") {
                    ChatError::deadline_exceeded(description)
                } else if *status == 400 || lower.contains("invalid") {
                    ChatError::invalid_argument(description)
                } else {
                    ChatError::network(description)
                };
                chat.with_source(err)
            }
            LndError::Http(e) if e.is_timeout() => {
                ChatError::deadline_exceeded("LND request").with_source(err)
            }
            LndError::Http(_) | LndError::Io(_) => {
                ChatError::network("cannot reach LND").with_source(err)
            }
            LndError::Decode(_) | LndError::Json(_) => {
                ChatError::internal("unexpected LND response").with_source(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Where and how to reach LND.
#[derive(Debug, Clone)]
pub struct LndConfig {
    /// e.g. `https://127.0.0.1:8080`
    pub rest_url: String,
    pub macaroon_path: Option<PathBuf>,
    /// CA for LND's self-signed certificate.
    pub tls_cert_path: Option<PathBuf>,
}

pub struct LndNode {
    client: reqwest::Client,
    base_url: String,
    macaroon: Option<String>,
}

impl LndNode {
    pub fn connect(config: &LndConfig) -> std::result::Result<Self, LndError> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(path) = &config.tls_cert_path {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        let macaroon = match &config.macaroon_path {
            Some(path) => Some(hex::encode(std::fs::read(path)?)),
            None => None,
        };

        tracing::info!(url = %config.rest_url, macaroon = macaroon.is_some(), "LND REST client ready");

        Ok(Self {
            client: builder.build()?,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            macaroon,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.macaroon {
            Some(macaroon) => builder.header("Grpc-Metadata-macaroon", macaroon),
            None => builder,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> std::result::Result<T, LndError> {
        let response = checked(builder.timeout(UNARY_TIMEOUT).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> std::result::Result<T, LndError> {
        self.call(self.request(Method::GET, path)).await
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> std::result::Result<T, LndError>
    where
        B: serde::Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.call(self.request(Method::POST, path).json(body)).await
    }

    async fn stream<T>(&self, builder: RequestBuilder) -> Result<BoxStream<'static, Result<T>>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let response = checked(builder.send().await.map_err(LndError::from)?).await?;
        Ok(ndjson_stream(response))
    }

    async fn invoice_by_hash(&self, r_hash_hex: &str) -> Result<LnInvoice> {
        let invoice: wire::InvoiceWire = self.get(&format!("/v1/invoice/{r_hash_hex}")).await?;
        Ok(invoice.into())
    }
}

/// Turn a non-success response into [`LndError::Rpc`].
async fn checked(response: reqwest::Response) -> std::result::Result<reqwest::Response, LndError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<wire::RpcStatus>(&body)
        .map(|s| s.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or(body);
    Err(LndError::Rpc {
        status: status.as_u16(),
        message,
    })
}

fn parse_stream_line<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    let item: wire::StreamItem<T> = serde_json::from_slice(line).map_err(LndError::from)?;
    match (item.result, item.error) {
        (Some(result), _) => Ok(result),
        (None, Some(status)) => Err(LndError::Rpc {
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            message: status.message,
        }
        .into()),
        (None, None) => Err(LndError::Decode("empty stream item".into()).into()),
    }
}

/// Split a chunked body into JSON lines.
fn ndjson_stream<T>(response: reqwest::Response) -> BoxStream<'static, Result<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    let body: BoxStream<'static, reqwest::Result<Bytes>> = response.bytes_stream().fuse().boxed();
    stream::unfold((body, BytesMut::new()), |(mut body, mut buf)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line = buf.split_to(pos + 1);
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((parse_stream_line(&line), (body, buf)));
            }
            match body.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Some((Err(LndError::from(e).into()), (body, buf))),
                None if buf.iter().all(u8::is_ascii_whitespace) => return None,
                None => {
                    let rest = buf.split();
                    return Some((parse_stream_line(&rest), (body, buf)));
                }
            }
        }
    })
    .boxed()
}

// ---------------------------------------------------------------------------
// zbase32 (signmessage encodes signatures with it)
// ---------------------------------------------------------------------------

const ZBASE32_ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

/// Decode the zbase32 text `signmessage` returns: a 65-byte recoverable
/// signature (recovery flag, then r and s), in LND's zbase32 alphabet with
/// no padding. Trailing bits that do not fill a byte are dropped.
fn zbase32_decode(input: &str) -> std::result::Result<Vec<u8>, LndError> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for c in input.bytes() {
        let value = ZBASE32_ALPHABET
            .iter()
            .position(|a| *a == c)
            .ok_or_else(|| LndError::Decode(format!("invalid zbase32 character {:?}", c as char)))?;
        acc = (acc << 5) | value as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// LnNode
// ---------------------------------------------------------------------------

#[async_trait]
impl LnNode for LndNode {
    async fn get_self_info(&self) -> Result<SelfInfo> {
        let info: wire::GetInfoResponse = self.get("/v1/getinfo").await?;
        Ok(SelfInfo {
            address: Address::parse(&info.identity_pubkey)?,
            alias: info.alias,
            version: info.version,
            chains: info.chains,
            block_height: info.block_height,
            num_active_channels: info.num_active_channels,
            num_peers: info.num_peers,
        })
    }

    async fn get_self_balance(&self) -> Result<SelfBalance> {
        let (wallet, channels) = futures::try_join!(
            self.get::<wire::WalletBalanceResponse>("/v1/balance/blockchain"),
            self.get::<wire::ChannelBalanceResponse>("/v1/balance/channels"),
        )?;
        Ok(SelfBalance {
            wallet_confirmed_sat: wallet.confirmed_balance,
            wallet_unconfirmed_sat: wallet.unconfirmed_balance,
            channel_local_msat: channels.local_balance.msat,
            channel_remote_msat: channels.remote_balance.msat,
            pending_open_local_msat: channels.pending_open_local_balance.msat,
            pending_open_remote_msat: channels.pending_open_remote_balance.msat,
            unsettled_local_msat: channels.unsettled_local_balance.msat,
            unsettled_remote_msat: channels.unsettled_remote_balance.msat,
        })
    }

    async fn get_nodes(&self) -> Result<Vec<Node>> {
        let graph: wire::GraphResponse = self.get("/v1/graph").await?;
        Ok(graph.into_nodes())
    }

    async fn connect_node(&self, address: &Address, host_port: &str) -> Result<()> {
        let body = wire::ConnectPeerRequest {
            addr: wire::LightningAddress {
                pubkey: address.as_str(),
                host: host_port,
            },
            perm: false,
            timeout: CONNECT_TIMEOUT.as_secs(),
        };
        match self.post::<_, serde_json::Value>("/v1/peers", &body).await {
            Ok(_) => Ok(()),
            Err(LndError::Rpc { message, .. }) if message.contains("already connected") => {
                tracing::debug!(peer = %address.short(), "peer already connected");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_channel(&self, request: &OpenChannelRequest) -> Result<ChannelPoint> {
        let body = wire::OpenChannelBody {
            node_pubkey: wire::b64(&request.address.to_pubkey_bytes()?),
            local_funding_amount: (request.amt_msat / 1_000).to_string(),
            push_sat: (request.push_msat / 1_000).to_string(),
            min_confs: request.min_input_confs,
            spend_unconfirmed: request.min_input_confs == 0,
            target_conf: request.target_conf,
            sat_per_vbyte: request.sat_per_vbyte.to_string(),
            private: request.private,
        };
        let point: wire::ChannelPointResponse = self.post("/v1/channels", &body).await?;
        Ok(ChannelPoint {
            funding_txid: point.txid()?,
            output_index: point.output_index,
        })
    }

    async fn create_invoice(
        &self,
        memo: &str,
        amt_msat: i64,
        expiry: i64,
        private: bool,
    ) -> Result<LnInvoice> {
        let body = wire::AddInvoiceBody {
            memo,
            value_msat: amt_msat.to_string(),
            expiry: expiry.to_string(),
            private,
        };
        let added: wire::AddInvoiceResponse = self.post("/v1/invoices", &body).await?;
        self.invoice_by_hash(&added.r_hash).await
    }

    async fn lookup_invoice(&self, pay_req: &str) -> Result<LnInvoice> {
        let decoded = self.decode_pay_req(pay_req).await?;
        self.invoice_by_hash(&decoded.payment_hash).await
    }

    async fn decode_pay_req(&self, pay_req: &str) -> Result<PayReq> {
        let decoded: wire::PayReqWire = self.get(&format!("/v1/payreq/{pay_req}")).await?;
        Ok(PayReq::try_from(decoded)?)
    }

    async fn send_payment(&self, request: SendPaymentRequest) -> Result<LnPayment> {
        let mut records = request.custom_records;
        let mut payment_hash = None;
        if request.payment_request.is_none() {
            // Keysend: we pick the preimage.
            let preimage = records.entry(KEYSEND_PREIMAGE_RECORD).or_insert_with(|| {
                let mut bytes = vec![0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                bytes
            });
            payment_hash = Some(wire::b64(&Sha256::digest(&preimage[..])));
        }
        let dest = match &request.dest {
            Some(dest) => Some(wire::b64(&dest.to_pubkey_bytes()?)),
            None => None,
        };

        let body = wire::SendPaymentBody {
            dest,
            amt_msat: request.amt_msat.to_string(),
            payment_hash,
            payment_request: request.payment_request,
            dest_custom_records: wire::encode_records(&records),
            fee_limit_msat: request.options.fee_limit_msat.to_string(),
            final_cltv_delta: request.options.final_cltv_delta,
            timeout_seconds: request.options.timeout_secs,
            no_inflight_updates: false,
        };

        let mut updates = self
            .stream::<wire::PaymentWire>(self.request(Method::POST, "/v2/router/send").json(&body))
            .await?;
        // The first update carries the payment index; LND keeps going after
        // we hang up and the rest arrives on the payment subscription.
        match updates.next().await {
            Some(update) => Ok(update?.into()),
            None => Err(LndError::Decode("payment stream closed before the first update".into()).into()),
        }
    }

    async fn probe_route(
        &self,
        dest: &Address,
        amt_msat: i64,
        options: &PaymentOptions,
    ) -> Result<RouteEstimate> {
        let path = format!(
            "/v1/graph/routes/{dest}/0?amt_msat={amt_msat}&fee_limit.fixed_msat={}&final_cltv_delta={}&use_mission_control=true",
            options.fee_limit_msat, options.final_cltv_delta
        );
        let found: wire::QueryRoutesResponse = match self.get(&path).await {
            Ok(found) => found,
            Err(LndError::Rpc { message, .. }) if message.contains("unable to find a path") => {
                return Err(ChatError::no_route_found(dest));
            }
            Err(e) => return Err(e.into()),
        };
        let route = found
            .routes
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::no_route_found(dest))?;
        Ok(RouteEstimate {
            route: route.into(),
            success_prob: found.success_prob,
        })
    }

    async fn list_invoices(&self, from_settle_index: u64) -> Result<Vec<LnInvoice>> {
        // LND pages by add index only, so walk everything and filter.
        let mut settled = Vec::new();
        let mut offset = 0u64;
        loop {
            let page: wire::ListInvoicesResponse = self
                .get(&format!(
                    "/v1/invoices?index_offset={offset}&num_max_invoices={LIST_PAGE_SIZE}"
                ))
                .await?;
            if page.invoices.is_empty() {
                break;
            }
            settled.extend(
                page.invoices
                    .into_iter()
                    .map(LnInvoice::from)
                    .filter(|i| i.is_settled() && i.settle_index >= from_settle_index),
            );
            if page.last_index_offset <= offset {
                break;
            }
            offset = page.last_index_offset;
        }
        settled.sort_by_key(|i| i.settle_index);
        Ok(settled)
    }

    async fn list_payments(&self, from_payment_index: u64) -> Result<Vec<LnPayment>> {
        let mut payments = Vec::new();
        let mut offset = from_payment_index.saturating_sub(1);
        loop {
            let page: wire::ListPaymentsResponse = self
                .get(&format!(
                    "/v1/payments?index_offset={offset}&max_payments={LIST_PAGE_SIZE}&include_incomplete=true"
                ))
                .await?;
            if page.payments.is_empty() {
                break;
            }
            payments.extend(page.payments.into_iter().map(LnPayment::from));
            if page.last_index_offset <= offset {
                break;
            }
            offset = page.last_index_offset;
        }
        Ok(payments)
    }

    async fn subscribe_invoices(&self, from_settle_index: u64) -> Result<InvoiceStream> {
        let path = format!(
            "/v1/invoices/subscribe?settle_index={}",
            from_settle_index.saturating_sub(1)
        );
        let updates = self
            .stream::<wire::InvoiceWire>(self.request(Method::GET, &path))
            .await?;
        Ok(updates.map(|item| item.map(LnInvoice::from)).boxed())
    }

    async fn subscribe_payments(&self, _from_payment_index: u64) -> Result<PaymentStream> {
        // TrackPayments has no resume point; history comes from list_payments.
        let updates = self
            .stream::<wire::PaymentWire>(
                self.request(Method::GET, "/v2/router/payments?no_inflight_updates=false"),
            )
            .await?;
        Ok(updates.map(|item| item.map(LnPayment::from)).boxed())
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>> {
        let body = wire::SignMessageBody {
            msg: wire::b64(message),
        };
        let signed: wire::SignMessageResponse = self.post("/v1/signmessage", &body).await?;
        Ok(zbase32_decode(&signed.signature)?)
    }

    async fn verify_message(&self, message: &[u8], signature: &[u8]) -> Result<Address> {
        Ok(recover_address(message, signature)?)
    }
}
