//! CRUD operations for [`RawMessage`] records.

use rusqlite::{params, OptionalExtension};

use crate::columns;
use crate::database::{sql_id, Database};
use crate::error::{not_found, unique_violation, Result, StoreError};
use crate::models::RawMessage;

const RAW_MESSAGE_COLUMNS: &str = "id, discussion_id, raw_payload, sender, signature, \
     signature_verified, invoice_settle_index, payment_indexes, timestamp";

impl Database {
    /// Insert a raw message and return its id.
    ///
    /// A raw message is linked either to one settled invoice or to a
    /// non-empty list of payments, never both.
    pub fn insert_raw_message(&self, raw: &RawMessage) -> Result<u64> {
        if !raw.is_well_formed() {
            return Err(StoreError::Invariant(format!(
                "raw message must reference either an invoice or payments \
                 (settle index {}, {} payment indexes)",
                raw.invoice_settle_index,
                raw.payment_indexes.len()
            )));
        }

        let discussion_id = (raw.discussion_id > 0).then(|| sql_id(raw.discussion_id));
        self.conn()
            .execute(
                "INSERT INTO raw_messages (discussion_id, raw_payload, sender, signature,
                     signature_verified, invoice_settle_index, payment_indexes, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    discussion_id,
                    raw.raw_payload,
                    raw.sender.as_ref().map(|a| a.as_str()),
                    raw.signature,
                    raw.signature_verified,
                    sql_id(raw.invoice_settle_index),
                    serde_json::to_string(&raw.payment_indexes)?,
                    raw.timestamp.to_rfc3339(),
                ],
            )
            .map_err(|e| {
                unique_violation(
                    e,
                    &format!("raw message for settle index {}", raw.invoice_settle_index),
                )
            })?;
        Ok(self.conn().last_insert_rowid() as u64)
    }

    pub fn get_raw_message(&self, id: u64) -> Result<RawMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {RAW_MESSAGE_COLUMNS} FROM raw_messages WHERE id = ?1"),
                params![sql_id(id)],
                row_to_raw_message,
            )
            .map_err(|e| not_found(e, &format!("raw message {id}")))
    }

    pub fn find_raw_message_by_settle_index(
        &self,
        settle_index: u64,
    ) -> Result<Option<RawMessage>> {
        if settle_index == 0 {
            return Ok(None);
        }
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {RAW_MESSAGE_COLUMNS} FROM raw_messages WHERE invoice_settle_index = ?1"
                ),
                params![sql_id(settle_index)],
                row_to_raw_message,
            )
            .optional()?;
        Ok(found)
    }

    /// Attach a raw message to the discussion it was resolved to.
    pub fn set_raw_message_discussion(&self, id: u64, discussion_id: u64) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE raw_messages SET discussion_id = ?2 WHERE id = ?1",
            params![sql_id(id), sql_id(discussion_id)],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("raw message {id}")));
        }
        Ok(())
    }

    /// Record one more payment carrying an outgoing raw message.
    pub fn add_raw_message_payment_index(&self, id: u64, payment_index: u64) -> Result<RawMessage> {
        let mut raw = self.get_raw_message(id)?;
        if raw.invoice_settle_index > 0 {
            return Err(StoreError::Invariant(format!(
                "raw message {id} belongs to invoice {}",
                raw.invoice_settle_index
            )));
        }
        if raw.payment_indexes.contains(&payment_index) {
            return Ok(raw);
        }
        raw.payment_indexes.push(payment_index);
        self.conn().execute(
            "UPDATE raw_messages SET payment_indexes = ?2 WHERE id = ?1",
            params![sql_id(id), serde_json::to_string(&raw.payment_indexes)?],
        )?;
        Ok(raw)
    }
}

fn row_to_raw_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    let discussion_id: Option<i64> = row.get(1)?;
    Ok(RawMessage {
        id: columns::id(row, 0)?,
        discussion_id: discussion_id.unwrap_or(0) as u64,
        raw_payload: row.get(2)?,
        sender: columns::opt_address(row, 3)?,
        signature: row.get(4)?,
        signature_verified: row.get(5)?,
        invoice_settle_index: columns::id(row, 6)?,
        payment_indexes: columns::json(row, 7)?,
        timestamp: columns::timestamp(row, 8)?,
    })
}
