//! Outgoing messages: one payment per recipient, awaited in parallel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use lnchat_node::RouteEstimate;
use lnchat_shared::constants::{PAYLOAD_RECORD, SENDER_RECORD, SIGNATURE_RECORD, TIMESTAMP_RECORD};
use lnchat_shared::ln::{CustomRecords, FailureReason, PaymentStatus, SendPaymentRequest};
use lnchat_shared::{payload, Address, ChatError, MessageOptions, Result};
use lnchat_store::{Message, Payment, RawMessage, StoreError};

use crate::assembler::assemble_outgoing;
use crate::resolver::resolve;
use crate::service::Core;

/// A message to send, addressed either to a discussion or to the node
/// behind a payment request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    pub payload: String,
    #[serde(default)]
    pub amt_msat: i64,
    /// 0 when sending through `pay_req`.
    #[serde(default)]
    pub discussion_id: u64,
    /// Empty when sending to a discussion.
    #[serde(default)]
    pub pay_req: String,
    /// Defaults to the discussion's options.
    #[serde(default)]
    pub options: Option<MessageOptions>,
}

/// Result of a send that reached at least one recipient.
#[derive(Debug)]
pub struct SendOutcome {
    pub message: Message,
    /// Set when some recipients could not be paid.
    pub partial_error: Option<ChatError>,
}

/// Who a request goes to.
struct Recipients {
    discussion_id: u64,
    participants: Vec<Address>,
    recipients: Vec<Address>,
    options: MessageOptions,
    pay_req: Option<String>,
    /// Amount to ask the node for; 0 lets a payment request set it.
    amt_msat: i64,
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Work out the discussion and recipients of `request`. With `create`,
/// the 1-on-1 discussion behind a payment request is created on demand.
async fn recipients(core: &Core, request: &SendRequest, create: bool) -> Result<Recipients> {
    match (request.discussion_id, request.pay_req.is_empty()) {
        (0, true) => Err(ChatError::invalid_argument(
            "either a discussion or a payment request is required",
        )),
        (id, false) if id != 0 => Err(ChatError::invalid_argument(
            "a discussion and a payment request are mutually exclusive",
        )),
        (_, false) => {
            let decoded = core.node.decode_pay_req(&request.pay_req).await?;
            let dest = decoded.destination;
            let participants = vec![dest.clone()];
            let discussion = if create {
                Some(core.store.with(|db| resolve(db, &participants))?)
            } else {
                core.store
                    .with(|db| db.find_discussion_by_participants(&participants))?
            };
            let options = request
                .options
                .or(discussion.as_ref().map(|d| d.options))
                .unwrap_or_default();
            let amt_msat = match (decoded.num_msat, request.amt_msat) {
                (invoice_amt, _) if invoice_amt > 0 => 0,
                (_, amt) if amt > 0 => amt,
                _ => {
                    return Err(ChatError::invalid_argument(
                        "amount must be positive for an open-amount payment request",
                    ))
                }
            };
            Ok(Recipients {
                discussion_id: discussion.map(|d| d.id).unwrap_or_default(),
                participants,
                recipients: vec![dest],
                options,
                pay_req: Some(request.pay_req.clone()),
                amt_msat,
            })
        }
        (id, true) => {
            if request.amt_msat <= 0 {
                return Err(ChatError::invalid_argument("amount must be positive"));
            }
            let discussion = core
                .store
                .with(|db| db.get_discussion(id))
                .map_err(|e| match e {
                    StoreError::NotFound(_) => ChatError::discussion_not_found(id),
                    other => other.into(),
                })?;
            let recipients: Vec<Address> = discussion
                .participants
                .iter()
                .filter(|p| **p != core.self_address)
                .cloned()
                .collect();
            if recipients.is_empty() {
                return Err(ChatError::invalid_argument(format!(
                    "discussion {id} has no other participant"
                )));
            }
            Ok(Recipients {
                discussion_id: discussion.id,
                options: request.options.unwrap_or(discussion.options),
                participants: discussion.participants,
                recipients,
                pay_req: None,
                amt_msat: request.amt_msat,
            })
        }
    }
}

/// The raw message of one send. It is stored as soon as the first payment
/// has an index and gains the index of every later one.
struct OutgoingRaw {
    template: RawMessage,
    stored: Mutex<Option<RawMessage>>,
}

impl OutgoingRaw {
    fn new(template: RawMessage) -> Self {
        Self {
            template,
            stored: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RawMessage>> {
        self.stored.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_payment(&self, core: &Core, payment_index: u64) -> Result<()> {
        let mut stored = self.lock();
        let raw = match stored.as_ref() {
            Some(raw) => core
                .store
                .with(|db| db.add_raw_message_payment_index(raw.id, payment_index))?,
            None => {
                let raw = RawMessage {
                    payment_indexes: vec![payment_index],
                    ..self.template.clone()
                };
                let id = core.store.with(|db| db.insert_raw_message(&raw))?;
                debug!(raw_message_id = id, payment_index, "raw message stored");
                RawMessage { id, ..raw }
            }
        };
        *stored = Some(raw);
        Ok(())
    }

    fn stored(&self) -> Option<RawMessage> {
        self.lock().clone()
    }
}

fn failure_error(recipient: &Address, payment: &Payment) -> ChatError {
    match payment.payment.failure_reason {
        FailureReason::NoRoute => ChatError::no_route_found(recipient),
        FailureReason::InsufficientBalance => {
            ChatError::insufficient_balance(format!("cannot pay {recipient}"))
        }
        FailureReason::Timeout => ChatError::deadline_exceeded(format!("payment to {recipient}")),
        reason => ChatError::network(format!("payment to {recipient} failed: {reason:?}")),
    }
}

/// Pay one recipient and wait until the payment is final.
async fn pay_one(
    core: Arc<Core>,
    recipient: Address,
    request: SendPaymentRequest,
    outgoing: Arc<OutgoingRaw>,
) -> Result<Payment> {
    let initial = core.node.send_payment(request).await?;
    let index = initial.payment_index;
    outgoing.record_payment(&core, index)?;
    debug!(payment_index = index, recipient = %recipient.short(), "payment started");

    let stored = core
        .store
        .with(|db| db.upsert_payment(&core.self_address, Some(&recipient), &initial))?;
    let mut finished = if stored.payment.status.is_terminal() {
        stored
    } else {
        // Register before looking again so the payment loop cannot slip
        // the final update in between.
        let waiter = core.waiters.register(index);
        match core.store.with(|db| db.find_payment_by_index(index))? {
            Some(p) if p.payment.status.is_terminal() => p,
            _ => waiter.await.map_err(|_| ChatError::cancelled())?,
        }
    };
    if finished.payee_address.is_none() {
        finished.payee_address = Some(recipient);
    }
    Ok(finished)
}

/// Send `request`, persisting the raw message and, when any payment
/// succeeded, the assembled message.
///
/// Fails when no recipient could be paid. A partial success returns the
/// message together with an error naming the failed recipients.
pub(crate) async fn send(core: &Arc<Core>, request: &SendRequest) -> Result<SendOutcome> {
    let target = recipients(core, request, true).await?;
    let options = target.options;

    let raw_payload = payload::encode(&target.participants, &request.payload)?;
    let timestamp = Utc::now();
    let mut records = CustomRecords::new();
    records.insert(PAYLOAD_RECORD, raw_payload.clone());
    records.insert(
        TIMESTAMP_RECORD,
        timestamp
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_be_bytes()
            .to_vec(),
    );
    let (sender, signature) = if options.anonymous {
        (None, Vec::new())
    } else {
        let signature = core.node.sign_message(&raw_payload).await?;
        records.insert(SIGNATURE_RECORD, signature.clone());
        records.insert(
            SENDER_RECORD,
            core.self_address.to_pubkey_bytes()?.to_vec(),
        );
        (Some(core.self_address.clone()), signature)
    };

    let payment_options = options.payment_options();
    let deadline = Duration::from_secs(payment_options.timeout_secs.max(1) as u64);
    let outgoing = Arc::new(OutgoingRaw::new(RawMessage {
        id: 0,
        discussion_id: target.discussion_id,
        raw_payload,
        sender,
        signature,
        signature_verified: !options.anonymous,
        invoice_settle_index: 0,
        payment_indexes: Vec::new(),
        timestamp,
    }));
    let mut tasks = JoinSet::new();
    for recipient in &target.recipients {
        let request = SendPaymentRequest {
            dest: target.pay_req.is_none().then(|| recipient.clone()),
            amt_msat: target.amt_msat,
            payment_request: target.pay_req.clone(),
            custom_records: records.clone(),
            options: payment_options,
        };
        let task = pay_one(core.clone(), recipient.clone(), request, outgoing.clone());
        let recipient = recipient.clone();
        tasks.spawn(async move { (recipient, task.await) });
    }

    let mut payments = Vec::new();
    let mut failures: Vec<(Address, ChatError)> = Vec::new();
    let mut reported = HashSet::new();
    let collect = async {
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((recipient, Ok(payment))) => {
                    reported.insert(recipient.clone());
                    if payment.payment.status == PaymentStatus::Succeeded {
                        payments.push(payment);
                    } else {
                        failures.push((recipient.clone(), failure_error(&recipient, &payment)));
                        payments.push(payment);
                    }
                }
                Ok((recipient, Err(e))) => {
                    reported.insert(recipient.clone());
                    failures.push((recipient, e));
                }
                Err(e) => warn!(error = %e, "payment task failed"),
            }
        }
    };
    if tokio::time::timeout(deadline, collect).await.is_err() {
        tasks.abort_all();
        warn!(timeout_secs = payment_options.timeout_secs, "send timed out");
    }
    for recipient in &target.recipients {
        if !reported.contains(recipient) {
            failures.push((
                recipient.clone(),
                ChatError::deadline_exceeded(format!("payment to {recipient}")),
            ));
        }
    }

    let any_succeeded = payments
        .iter()
        .any(|p| p.payment.status == PaymentStatus::Succeeded);

    let message = match outgoing.stored() {
        Some(raw) if any_succeeded => core.store.tx(|db| -> Result<Option<Message>> {
            let mut message = assemble_outgoing(&raw, &payments, true)?;
            message.id = db.insert_message(&message)?;
            if message.discussion_id != 0 {
                db.bump_last_message(message.discussion_id, message.id)?;
            }
            Ok(Some(message))
        })?,
        _ => None,
    };

    let Some(message) = message else {
        let (recipient, error) = failures
            .into_iter()
            .next()
            .unwrap_or_else(|| (core.self_address.clone(), ChatError::unknown("send failed")));
        warn!(recipient = %recipient.short(), error = %error, "send failed");
        return Err(error);
    };

    info!(
        discussion_id = message.discussion_id,
        message_id = message.id,
        amt_msat = message.amt_msat,
        fees_msat = message.total_fees_msat,
        failed = failures.len(),
        "message sent"
    );

    let partial_error = failures.first().map(|(_, first)| {
        let names: Vec<String> = failures.iter().map(|(r, _)| r.to_string()).collect();
        ChatError::new(
            first.kind(),
            format!("could not reach {}", names.join(", ")),
        )
    });
    Ok(SendOutcome {
        message,
        partial_error,
    })
}

/// Probe a route to every recipient; nothing is paid or stored.
pub(crate) async fn estimate(core: &Arc<Core>, request: &SendRequest) -> Result<Message> {
    let target = recipients(core, request, false).await?;
    let payment_options = target.options.payment_options();
    let deadline = Duration::from_secs(payment_options.timeout_secs.max(1) as u64);
    let amt_msat = match &target.pay_req {
        Some(pay_req) if target.amt_msat == 0 => core.node.decode_pay_req(pay_req).await?.num_msat,
        _ => target.amt_msat,
    };

    let mut tasks = JoinSet::new();
    for recipient in &target.recipients {
        let core = core.clone();
        let recipient = recipient.clone();
        tasks.spawn(async move {
            core.node
                .probe_route(&recipient, amt_msat, &payment_options)
                .await
        });
    }

    let collect = async {
        let mut estimates: Vec<RouteEstimate> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let estimate = joined.map_err(|e| ChatError::internal("probe task failed").with_source(e))??;
            estimates.push(estimate);
        }
        Ok::<_, ChatError>(estimates)
    };
    let estimates = match tokio::time::timeout(deadline, collect).await {
        Ok(result) => result?,
        Err(_) => return Err(ChatError::deadline_exceeded("route estimation")),
    };

    let mut message = Message {
        discussion_id: target.discussion_id,
        payload: request.payload.clone(),
        sender: (!target.options.anonymous).then(|| core.self_address.clone()),
        sent_time_ns: now_ns(),
        pay_req: target.pay_req.unwrap_or_default(),
        ..Message::default()
    };
    if let [only] = target.recipients.as_slice() {
        message.receiver = Some(only.clone());
    }
    for estimate in estimates {
        message.amt_msat += estimate.route.amt_msat();
        message.total_fees_msat += estimate.route.total_fees_msat;
        message.success_prob *= estimate.success_prob;
        message.routes.push(estimate.route);
    }
    Ok(message)
}
