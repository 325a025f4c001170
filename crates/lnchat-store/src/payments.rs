//! Outgoing payments made by the local node, keyed by `payment_index`.

use rusqlite::{params, OptionalExtension};

use lnchat_shared::ln::{LnPayment, PaymentStatus};
use lnchat_shared::Address;

use crate::columns;
use crate::database::{sql_id, Database};
use crate::error::{not_found, Result};
use crate::models::Payment;

const PAYMENT_COLUMNS: &str = "id, payer_address, payee_address, record";

impl Database {
    /// Insert or refresh a payment. A payment that already reached a
    /// terminal status keeps it.
    pub fn upsert_payment(
        &self,
        payer_address: &Address,
        payee_address: Option<&Address>,
        payment: &LnPayment,
    ) -> Result<Payment> {
        self.transaction(|tx| {
            let existing = tx.find_payment_by_index(payment.payment_index)?;

            if let Some(existing) = &existing {
                if existing.payment.status.is_terminal() && !payment.status.is_terminal() {
                    tracing::debug!(
                        payment_index = payment.payment_index,
                        "ignoring stale update of finished payment"
                    );
                    let mut kept = existing.clone();
                    if let (None, Some(payee)) = (&kept.payee_address, payee_address) {
                        tx.conn().execute(
                            "UPDATE payments SET payee_address = ?2 WHERE id = ?1",
                            params![sql_id(kept.id), payee.as_str()],
                        )?;
                        kept.payee_address = Some(payee.clone());
                    }
                    return Ok(kept);
                }
            }

            // Updates from the stream do not know the payee; keep the one we
            // recorded when sending.
            let payee = payee_address
                .cloned()
                .or_else(|| existing.as_ref().and_then(|p| p.payee_address.clone()));
            let record = serde_json::to_string(payment)?;
            let status = columns::enum_tag(&payment.status)?;

            let id = match &existing {
                Some(existing) => {
                    tx.conn().execute(
                        "UPDATE payments SET payment_hash = ?2, status = ?3, payer_address = ?4,
                             payee_address = ?5, record = ?6
                         WHERE id = ?1",
                        params![
                            sql_id(existing.id),
                            payment.payment_hash,
                            status,
                            payer_address.as_str(),
                            payee.as_ref().map(|a| a.as_str()),
                            record,
                        ],
                    )?;
                    existing.id
                }
                None => {
                    tx.conn().execute(
                        "INSERT INTO payments (payment_index, payment_hash, status, payer_address,
                             payee_address, record)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            sql_id(payment.payment_index),
                            payment.payment_hash,
                            status,
                            payer_address.as_str(),
                            payee.as_ref().map(|a| a.as_str()),
                            record,
                        ],
                    )?;
                    tx.conn().last_insert_rowid() as u64
                }
            };

            Ok(Payment {
                id,
                payer_address: payer_address.clone(),
                payee_address: payee,
                payment: payment.clone(),
            })
        })
    }

    pub fn get_payment(&self, id: u64) -> Result<Payment> {
        self.conn()
            .query_row(
                &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?1"),
                params![sql_id(id)],
                row_to_payment,
            )
            .map_err(|e| not_found(e, &format!("payment {id}")))
    }

    pub fn find_payment_by_index(&self, payment_index: u64) -> Result<Option<Payment>> {
        let found = self
            .conn()
            .query_row(
                &format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_index = ?1"),
                params![sql_id(payment_index)],
                row_to_payment,
            )
            .optional()?;
        Ok(found)
    }

    /// Payments for the given indexes, in the order of `indexes`. Unknown
    /// indexes are skipped.
    pub fn find_payments_by_indexes(&self, indexes: &[u64]) -> Result<Vec<Payment>> {
        let mut payments = Vec::with_capacity(indexes.len());
        for index in indexes {
            if let Some(payment) = self.find_payment_by_index(*index)? {
                payments.push(payment);
            }
        }
        Ok(payments)
    }

    /// Highest payment index persisted so far (0 when none).
    pub fn max_payment_index(&self) -> Result<u64> {
        let max: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(payment_index), 0) FROM payments",
            [],
            |row| row.get(0),
        )?;
        Ok(max as u64)
    }

    /// Lowest payment index still waiting for a final status.
    pub fn min_pending_payment_index(&self) -> Result<Option<u64>> {
        let min: Option<i64> = self.conn().query_row(
            "SELECT MIN(payment_index) FROM payments WHERE status NOT IN (?1, ?2)",
            params![
                columns::enum_tag(&PaymentStatus::Succeeded)?,
                columns::enum_tag(&PaymentStatus::Failed)?,
            ],
            |row| row.get(0),
        )?;
        Ok(min.map(|m| m as u64))
    }
}

fn row_to_payment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: columns::id(row, 0)?,
        payer_address: columns::address(row, 1)?,
        payee_address: columns::opt_address(row, 2)?,
        payment: columns::json(row, 3)?,
    })
}
