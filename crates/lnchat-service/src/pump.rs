//! Background loops that follow the node's invoice and payment streams.
//!
//! Both loops resume from the highest index already in the store and rely
//! on upserts to absorb replays. Payments still in flight are listed
//! again on every subscription. A failed or finished stream is
//! resubscribed with exponential backoff until shutdown is signalled.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures::StreamExt;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use lnchat_node::{InvoiceStream, PaymentStream};
use lnchat_shared::constants::{PAYLOAD_RECORD, SENDER_RECORD, SIGNATURE_RECORD, TIMESTAMP_RECORD};
use lnchat_shared::ln::{LnInvoice, LnPayment};
use lnchat_shared::{signature, Address, ChatError, ErrorKind, Result};
use lnchat_store::{Message, Payment, RawMessage};

use crate::assembler::assemble_incoming;
use crate::service::Core;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Doubling delay between resubscription attempts.
#[derive(Debug)]
pub(crate) struct Backoff {
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { next: BACKOFF_BASE }
    }
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(BACKOFF_CAP);
        delay
    }

    pub fn reset(&mut self) {
        self.next = BACKOFF_BASE;
    }
}

// ---------------------------------------------------------------------------
// Payment waiters
// ---------------------------------------------------------------------------

/// Send flows waiting for a payment to finish, keyed by payment index.
#[derive(Default)]
pub(crate) struct PaymentWaiters {
    waiting: Mutex<HashMap<u64, Vec<oneshot::Sender<Payment>>>>,
}

impl PaymentWaiters {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Vec<oneshot::Sender<Payment>>>> {
        self.waiting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, payment_index: u64) -> oneshot::Receiver<Payment> {
        let (tx, rx) = oneshot::channel();
        let mut waiting = self.lock();
        let entry = waiting.entry(payment_index).or_default();
        entry.retain(|w| !w.is_closed());
        entry.push(tx);
        rx
    }

    /// Wake everyone waiting on this payment.
    pub fn notify(&self, payment: &Payment) {
        let waiters = self.lock().remove(&payment.payment.payment_index);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(payment.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Event handling
// ---------------------------------------------------------------------------

/// The raw message a settled invoice carries, if it carries one.
fn raw_from_invoice(invoice: &LnInvoice) -> Option<RawMessage> {
    let payload = invoice.custom_record(PAYLOAD_RECORD)?.to_vec();

    let sender = invoice.custom_record(SENDER_RECORD).and_then(|bytes| {
        match <[u8; 33]>::try_from(bytes) {
            Ok(pubkey) => Some(Address::from_pubkey_bytes(&pubkey)),
            Err(_) => {
                warn!(settle_index = invoice.settle_index, len = bytes.len(), "malformed sender record");
                None
            }
        }
    });
    let signature = invoice
        .custom_record(SIGNATURE_RECORD)
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    let signature_verified = signature::verify(sender.as_ref(), &signature, &payload);

    let timestamp = invoice
        .custom_record(TIMESTAMP_RECORD)
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map(|nanos| Utc.timestamp_nanos(i64::from_be_bytes(nanos)))
        .unwrap_or_else(Utc::now);

    Some(RawMessage {
        id: 0,
        discussion_id: 0,
        raw_payload: payload,
        sender,
        signature,
        signature_verified,
        invoice_settle_index: invoice.settle_index,
        payment_indexes: Vec::new(),
        timestamp,
    })
}

/// Persist an invoice update and, for a settled chat invoice, materialise
/// and publish its message. Replays return `None`.
pub(crate) fn handle_invoice(core: &Core, invoice: &LnInvoice) -> Result<Option<Message>> {
    let message = core.store.tx(|db| -> Result<Option<Message>> {
        let stored = db.upsert_invoice(&core.self_address, invoice)?;
        if !stored.invoice.is_settled() {
            return Ok(None);
        }
        let Some(incoming) = raw_from_invoice(&stored.invoice) else {
            debug!(settle_index = invoice.settle_index, "settled invoice without chat payload");
            return Ok(None);
        };

        let raw = match db.find_raw_message_by_settle_index(incoming.invoice_settle_index)? {
            Some(raw) => raw,
            None => RawMessage {
                id: db.insert_raw_message(&incoming)?,
                ..incoming
            },
        };
        if db.find_message_by_raw(raw.id)?.is_some() {
            return Ok(None);
        }

        // An undecodable payload is kept as a raw message with no message.
        let mut message = match assemble_incoming(db, &raw, &stored) {
            Ok(message) => message,
            Err(e) if e.is(ErrorKind::DecodeError) => {
                warn!(settle_index = raw.invoice_settle_index, error = %e, "cannot decode payload");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        message.id = db.insert_message(&message)?;
        db.set_raw_message_discussion(raw.id, message.discussion_id)?;
        db.bump_last_message(message.discussion_id, message.id)?;
        Ok(Some(message))
    })?;

    if let Some(message) = &message {
        let delivered = core.subscribers.publish(message);
        info!(
            settle_index = message.index,
            discussion_id = message.discussion_id,
            message_id = message.id,
            delivered,
            "incoming message"
        );
    }
    Ok(message)
}

/// Persist a payment update and wake the send flow waiting on it.
pub(crate) fn handle_payment(core: &Core, payment: &LnPayment) -> Result<Payment> {
    let stored = core
        .store
        .with(|db| db.upsert_payment(&core.self_address, None, payment))?;
    if stored.payment.status.is_terminal() {
        debug!(
            payment_index = stored.payment.payment_index,
            status = ?stored.payment.status,
            "payment finished"
        );
        core.waiters.notify(&stored);
    }
    Ok(stored)
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Subscribe from the invoice high-water mark, then apply what the node
/// already has past it.
pub(crate) async fn subscribe_invoices(core: &Core) -> Result<InvoiceStream> {
    let from = core.store.with(|db| db.max_invoice_settle_index())? + 1;
    let stream = core.node.subscribe_invoices(from).await?;

    let backlog = core.node.list_invoices(from).await?;
    debug!(from, backlog = backlog.len(), "invoice catch-up");
    for invoice in &backlog {
        if let Err(e) = handle_invoice(core, invoice) {
            warn!(settle_index = invoice.settle_index, error = %e, "skipping invoice");
        }
    }
    Ok(stream)
}

/// Subscribe past the payment high-water mark. Catch-up starts at the
/// oldest payment still in flight in the store, so updates missed while
/// the stream was down still reach their waiters.
pub(crate) async fn subscribe_payments(core: &Core) -> Result<PaymentStream> {
    let (max, pending) = core
        .store
        .with(|db| Ok::<_, ChatError>((db.max_payment_index()?, db.min_pending_payment_index()?)))?;
    let from = max + 1;
    let stream = core.node.subscribe_payments(from).await?;

    let catch_up = pending.map_or(from, |p| p.min(from));
    let backlog = core.node.list_payments(catch_up).await?;
    debug!(from, catch_up, backlog = backlog.len(), "payment catch-up");
    for payment in &backlog {
        if let Err(e) = handle_payment(core, payment) {
            warn!(payment_index = payment.payment_index, error = %e, "skipping payment");
        }
    }
    Ok(stream)
}

/// Retry `subscribe` with backoff. `None` once shutdown is signalled.
async fn resubscribe<S, F, Fut>(
    what: &'static str,
    backoff: &mut Backoff,
    shutdown: &mut watch::Receiver<bool>,
    mut subscribe: F,
) -> Option<S>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<S>>,
{
    loop {
        let delay = backoff.next_delay();
        debug!(stream = what, delay_ms = delay.as_millis() as u64, "resubscribing");
        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        match subscribe().await {
            Ok(stream) => {
                info!(stream = what, "resubscribed");
                return Some(stream);
            }
            Err(e) => warn!(stream = what, error = %e, "resubscribe failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

pub(crate) async fn run_invoice_loop(
    core: Arc<Core>,
    mut stream: InvoiceStream,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("invoice loop started");
    let mut backoff = Backoff::default();

    loop {
        let item = tokio::select! {
            _ = shutdown.changed() => break,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(invoice)) => {
                backoff.reset();
                if let Err(e) = handle_invoice(&core, &invoice) {
                    warn!(
                        add_index = invoice.add_index,
                        settle_index = invoice.settle_index,
                        error = %e,
                        "skipping invoice event"
                    );
                }
                continue;
            }
            Some(Err(e)) => warn!(error = %e, "invoice stream failed"),
            None => warn!("invoice stream ended"),
        }

        match resubscribe("invoices", &mut backoff, &mut shutdown, || subscribe_invoices(&core)).await
        {
            Some(next) => stream = next,
            None => break,
        }
    }

    info!("invoice loop stopped");
}

pub(crate) async fn run_payment_loop(
    core: Arc<Core>,
    mut stream: PaymentStream,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("payment loop started");
    let mut backoff = Backoff::default();

    loop {
        let item = tokio::select! {
            _ = shutdown.changed() => break,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(payment)) => {
                backoff.reset();
                if let Err(e) = handle_payment(&core, &payment) {
                    warn!(payment_index = payment.payment_index, error = %e, "skipping payment event");
                }
                continue;
            }
            Some(Err(e)) => warn!(error = %e, "payment stream failed"),
            None => warn!("payment stream ended"),
        }

        match resubscribe("payments", &mut backoff, &mut shutdown, || subscribe_payments(&core)).await
        {
            Some(next) => stream = next,
            None => break,
        }
    }

    info!("payment loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lnchat_node::SimNetwork;
    use lnchat_shared::constants::KEYSEND_PREIMAGE_RECORD;
    use lnchat_shared::ln::{InvoiceHtlc, InvoiceState};
    use lnchat_shared::signature::NodeKey;
    use lnchat_store::{Store, StoreError};

    use crate::subscribers::Subscribers;

    fn core_on_memory_store() -> Core {
        Core {
            node: Arc::new(SimNetwork::new().add_node("self")),
            store: Store::open_in_memory().unwrap(),
            self_address: NodeKey::generate().address(),
            subscribers: Subscribers::new(),
            waiters: PaymentWaiters::default(),
        }
    }

    fn settled_chat_invoice(settle_index: u64, payload: &[u8]) -> LnInvoice {
        let key = NodeKey::generate();
        let mut records = lnchat_shared::ln::CustomRecords::new();
        records.insert(PAYLOAD_RECORD, payload.to_vec());
        records.insert(SIGNATURE_RECORD, key.sign(payload));
        records.insert(SENDER_RECORD, key.public_key().serialize().to_vec());
        LnInvoice {
            r_preimage: "11".repeat(32),
            r_hash: "22".repeat(32),
            amt_paid_msat: 1_000,
            value_msat: 1_000,
            add_index: settle_index,
            settle_index,
            state: InvoiceState::Settled,
            htlcs: vec![InvoiceHtlc {
                custom_records: records,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), BACKOFF_BASE);
    }

    #[tokio::test]
    async fn test_waiters_are_woken_once() {
        let waiters = PaymentWaiters::default();
        let a = waiters.register(4);
        let b = waiters.register(4);
        let other = waiters.register(5);

        let payment = Payment {
            id: 1,
            payer_address: NodeKey::generate().address(),
            payee_address: None,
            payment: LnPayment {
                payment_index: 4,
                ..Default::default()
            },
        };
        waiters.notify(&payment);
        assert_eq!(a.await.unwrap().payment.payment_index, 4);
        assert_eq!(b.await.unwrap().payment.payment_index, 4);

        drop(other);
        assert!(waiters.lock().get(&4).is_none());
        assert!(waiters.lock().contains_key(&5));
    }

    #[test]
    fn test_raw_from_invoice_verifies_signature() {
        let key = NodeKey::generate();
        let payload = br#"{"participants":[],"message":"hey"}"#.to_vec();
        let mut records = lnchat_shared::ln::CustomRecords::new();
        records.insert(KEYSEND_PREIMAGE_RECORD, vec![1; 32]);
        records.insert(PAYLOAD_RECORD, payload.clone());
        records.insert(SIGNATURE_RECORD, key.sign(&payload));
        records.insert(SENDER_RECORD, key.public_key().serialize().to_vec());
        records.insert(TIMESTAMP_RECORD, 5_000_000_000i64.to_be_bytes().to_vec());

        let invoice = LnInvoice {
            state: InvoiceState::Settled,
            settle_index: 2,
            htlcs: vec![InvoiceHtlc {
                custom_records: records,
                ..Default::default()
            }],
            ..Default::default()
        };

        let raw = raw_from_invoice(&invoice).unwrap();
        assert_eq!(raw.sender, Some(key.address()));
        assert!(raw.signature_verified);
        assert_eq!(raw.invoice_settle_index, 2);
        assert_eq!(raw.raw_payload, payload);
        assert_eq!(raw.timestamp.timestamp(), 5);

        let plain = LnInvoice {
            state: InvoiceState::Settled,
            settle_index: 3,
            ..Default::default()
        };
        assert!(raw_from_invoice(&plain).is_none());
    }

    #[test]
    fn test_settled_invoice_and_message_commit_together() {
        let core = core_on_memory_store();
        let invoice = settled_chat_invoice(1, br#"{"participants":[],"message":"hey"}"#);

        core.store
            .with(|db| -> std::result::Result<(), StoreError> {
                db.conn().execute_batch("DROP TABLE messages")?;
                Ok(())
            })
            .unwrap();
        assert!(handle_invoice(&core, &invoice).is_err());

        // Nothing of the failed attempt is left, so catch-up retries it.
        let (settle_max, raw) = core
            .store
            .with(|db| {
                Ok::<_, StoreError>((
                    db.max_invoice_settle_index()?,
                    db.find_raw_message_by_settle_index(1)?,
                ))
            })
            .unwrap();
        assert_eq!(settle_max, 0);
        assert!(raw.is_none());
    }

    #[test]
    fn test_undecodable_payload_keeps_invoice_and_raw_message() {
        let core = core_on_memory_store();
        let invoice = settled_chat_invoice(3, b"{not json");

        assert!(handle_invoice(&core, &invoice).unwrap().is_none());
        let (settle_max, raw) = core
            .store
            .with(|db| {
                Ok::<_, StoreError>((
                    db.max_invoice_settle_index()?,
                    db.find_raw_message_by_settle_index(3)?,
                ))
            })
            .unwrap();
        assert_eq!(settle_max, 3);
        let raw = raw.unwrap();
        assert_eq!(raw.discussion_id, 0);

        // A replay finds the stored raw message and stops there.
        assert!(handle_invoice(&core, &invoice).unwrap().is_none());
    }
}
