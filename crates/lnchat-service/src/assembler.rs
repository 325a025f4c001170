//! Builds user-visible messages from what the node reported.
//!
//! An incoming message joins a raw message with the settled invoice that
//! carried it. An outgoing message joins a raw message with the payments
//! made for it, one per recipient, summing amounts and fees over the HTLCs
//! that actually succeeded.

use lnchat_shared::ln::PaymentStatus;
use lnchat_shared::{payload, Address, ChatError, Result};
use lnchat_store::{Database, Invoice, Message, Payment, RawMessage};

use crate::resolver::resolve;

const NANOS_PER_SEC: i64 = 1_000_000_000;

fn decode_hex(value: &str, what: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| ChatError::decode(format!("invalid {what}")).with_source(e))
}

/// Assemble the message carried by a settled invoice.
///
/// The discussion is resolved from the payload participants plus the
/// sender, so it may be created here. When the receiver is among them and
/// already has a discussion with everyone else, that one is used.
pub fn assemble_incoming(db: &Database, raw: &RawMessage, invoice: &Invoice) -> Result<Message> {
    let ln = &invoice.invoice;
    if !raw.is_incoming() || raw.invoice_settle_index != ln.settle_index {
        return Err(ChatError::invalid_argument(format!(
            "raw message settle index {} does not match invoice settle index {}",
            raw.invoice_settle_index, ln.settle_index
        )));
    }

    let preimage = decode_hex(&ln.r_preimage, "invoice preimage")?;
    let preimage_hash = decode_hex(&ln.r_hash, "invoice hash")?;
    let (text, mut participants) = payload::decode(&raw.raw_payload)?;
    if let Some(sender) = &raw.sender {
        if !participants.contains(sender) {
            participants.push(sender.clone());
        }
    }
    // A reply lists the receiver among its participants; the receiver's own
    // discussion for that conversation does not.
    let others: Vec<Address> = participants
        .iter()
        .filter(|p| **p != invoice.creator_address)
        .cloned()
        .collect();
    let existing = if others.is_empty() || others.len() == participants.len() {
        None
    } else {
        db.find_discussion_by_participants(&others)?
    };
    let discussion = match existing {
        Some(discussion) => discussion,
        None => resolve(db, &participants)?,
    };

    Ok(Message {
        id: 0,
        discussion_id: discussion.id,
        raw_message_id: raw.id,
        payload: text,
        amt_msat: ln.amt_paid_msat,
        sender: raw.sender.clone(),
        receiver: Some(invoice.creator_address.clone()),
        sender_verified: raw.signature_verified,
        sent_time_ns: ln.creation_date * NANOS_PER_SEC,
        received_time_ns: ln.settle_date * NANOS_PER_SEC,
        index: ln.settle_index,
        total_fees_msat: 0,
        routes: Vec::new(),
        preimage_hash,
        preimage,
        pay_req: ln.payment_request.clone(),
        success_prob: 1.0,
    })
}

/// Assemble the message sent through `payments`.
///
/// With `only_successful_payments`, payments that did not succeed are left
/// out before any check. `receiver`, `pay_req`, `index` and the preimage are
/// only filled in when exactly one payment is used.
pub fn assemble_outgoing(
    raw: &RawMessage,
    payments: &[Payment],
    only_successful_payments: bool,
) -> Result<Message> {
    let used: Vec<&Payment> = payments
        .iter()
        .filter(|p| !only_successful_payments || p.payment.status == PaymentStatus::Succeeded)
        .collect();

    let Some(first) = used.first() else {
        return Err(ChatError::invalid_argument("no payment to build the message from"));
    };
    let payer: &Address = &first.payer_address;
    for p in &used {
        if !raw.payment_indexes.contains(&p.payment.payment_index) {
            return Err(ChatError::invalid_argument(format!(
                "payment {} is not part of raw message {}",
                p.payment.payment_index, raw.id
            )));
        }
        if &p.payer_address != payer {
            return Err(ChatError::invalid_argument(
                "payments of one message must share a payer",
            ));
        }
    }

    let (text, _) = payload::decode(&raw.raw_payload)?;

    let mut message = Message {
        discussion_id: raw.discussion_id,
        raw_message_id: raw.id,
        payload: text,
        sender: Some(payer.clone()),
        sender_verified: raw.signature_verified,
        sent_time_ns: i64::MAX,
        ..Message::default()
    };

    for p in &used {
        message.sent_time_ns = message.sent_time_ns.min(p.payment.creation_time_ns);
        for htlc in p.payment.successful_htlcs() {
            message.amt_msat += htlc.route.amt_msat();
            message.total_fees_msat += htlc.route.total_fees_msat;
            message.received_time_ns = message.received_time_ns.max(htlc.resolve_time_ns);
            message.routes.push(htlc.route.clone());
        }
    }

    if let [only] = used.as_slice() {
        message.receiver = only.payee_address.clone();
        message.pay_req = only.payment.payment_request.clone();
        message.index = only.payment.payment_index;
        message.preimage_hash = decode_hex(&only.payment.payment_hash, "payment hash")?;
        message.preimage = decode_hex(&only.payment.payment_preimage, "payment preimage")?;
    }

    Ok(message)
}
