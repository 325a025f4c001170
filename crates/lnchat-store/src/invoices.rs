//! Invoices observed on the local node.
//!
//! Invoices are re-observed every time their state changes, so writes are
//! upserts keyed by the node's `add_index`. A settled invoice is never
//! overwritten by a stale unsettled copy.

use rusqlite::{params, OptionalExtension};

use lnchat_shared::ln::LnInvoice;
use lnchat_shared::Address;

use crate::columns;
use crate::database::{sql_id, Database};
use crate::error::{not_found, unique_violation, Result};
use crate::models::Invoice;

const INVOICE_COLUMNS: &str = "id, creator_address, record";

impl Database {
    /// Insert or refresh an invoice, returning the stored record.
    pub fn upsert_invoice(&self, creator_address: &Address, invoice: &LnInvoice) -> Result<Invoice> {
        self.transaction(|tx| {
            let existing = tx.find_invoice_by_add_index(invoice.add_index)?;

            if let Some(existing) = &existing {
                if existing.invoice.is_settled() && !invoice.is_settled() {
                    tracing::debug!(
                        add_index = invoice.add_index,
                        "ignoring stale update of settled invoice"
                    );
                    return Ok(existing.clone());
                }
            }

            let preimage = (!invoice.r_preimage.is_empty()).then_some(invoice.r_preimage.as_str());
            let record = serde_json::to_string(invoice)?;
            let what = format!("invoice {}", invoice.add_index);

            let id = match existing {
                Some(existing) => {
                    tx.conn()
                        .execute(
                            "UPDATE invoices SET settle_index = ?2, preimage = ?3, r_hash = ?4,
                                 state = ?5, creator_address = ?6, record = ?7
                             WHERE id = ?1",
                            params![
                                sql_id(existing.id),
                                sql_id(invoice.settle_index),
                                preimage,
                                invoice.r_hash,
                                columns::enum_tag(&invoice.state)?,
                                creator_address.as_str(),
                                record,
                            ],
                        )
                        .map_err(|e| unique_violation(e, &what))?;
                    existing.id
                }
                None => {
                    tx.conn()
                        .execute(
                            "INSERT INTO invoices (add_index, settle_index, preimage, r_hash,
                                 state, creator_address, record)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            params![
                                sql_id(invoice.add_index),
                                sql_id(invoice.settle_index),
                                preimage,
                                invoice.r_hash,
                                columns::enum_tag(&invoice.state)?,
                                creator_address.as_str(),
                                record,
                            ],
                        )
                        .map_err(|e| unique_violation(e, &what))?;
                    tx.conn().last_insert_rowid() as u64
                }
            };

            Ok(Invoice {
                id,
                creator_address: creator_address.clone(),
                invoice: invoice.clone(),
            })
        })
    }

    pub fn get_invoice(&self, id: u64) -> Result<Invoice> {
        self.conn()
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?1"),
                params![sql_id(id)],
                row_to_invoice,
            )
            .map_err(|e| not_found(e, &format!("invoice {id}")))
    }

    pub fn find_invoice_by_add_index(&self, add_index: u64) -> Result<Option<Invoice>> {
        let found = self
            .conn()
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE add_index = ?1"),
                params![sql_id(add_index)],
                row_to_invoice,
            )
            .optional()?;
        Ok(found)
    }

    pub fn find_invoice_by_settle_index(&self, settle_index: u64) -> Result<Option<Invoice>> {
        if settle_index == 0 {
            return Ok(None);
        }
        let found = self
            .conn()
            .query_row(
                &format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE settle_index = ?1"),
                params![sql_id(settle_index)],
                row_to_invoice,
            )
            .optional()?;
        Ok(found)
    }

    pub fn find_invoice_by_payment_request(&self, payment_request: &str) -> Result<Option<Invoice>> {
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {INVOICE_COLUMNS} FROM invoices
                     WHERE json_extract(record, '$.payment_request') = ?1"
                ),
                params![payment_request],
                row_to_invoice,
            )
            .optional()?;
        Ok(found)
    }

    /// Highest settle index persisted so far (0 when none).
    pub fn max_invoice_settle_index(&self) -> Result<u64> {
        let max: i64 = self.conn().query_row(
            "SELECT COALESCE(MAX(settle_index), 0) FROM invoices",
            [],
            |row| row.get(0),
        )?;
        Ok(max as u64)
    }
}

fn row_to_invoice(row: &rusqlite::Row<'_>) -> rusqlite::Result<Invoice> {
    Ok(Invoice {
        id: columns::id(row, 0)?,
        creator_address: columns::address(row, 1)?,
        invoice: columns::json(row, 2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::test_util::addr;
    use lnchat_shared::ln::InvoiceState;

    fn open_invoice(add_index: u64) -> LnInvoice {
        LnInvoice {
            add_index,
            r_hash: format!("{add_index:064x}"),
            payment_request: format!("lnbcrt{add_index}"),
            value_msat: 1000,
            state: InvoiceState::Open,
            ..Default::default()
        }
    }

    fn settled(mut invoice: LnInvoice, settle_index: u64) -> LnInvoice {
        invoice.state = InvoiceState::Settled;
        invoice.settle_index = settle_index;
        invoice.r_preimage = format!("{settle_index:064x}");
        invoice.amt_paid_msat = invoice.value_msat;
        invoice
    }

    #[test]
    fn test_upsert_keeps_one_row_per_invoice() {
        let db = Database::open_in_memory().unwrap();
        let creator = addr('a');

        let first = db.upsert_invoice(&creator, &open_invoice(1)).unwrap();
        let again = db
            .upsert_invoice(&creator, &settled(open_invoice(1), 4))
            .unwrap();
        assert_eq!(first.id, again.id);

        let stored = db.find_invoice_by_settle_index(4).unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert!(stored.invoice.is_settled());
        assert_eq!(db.max_invoice_settle_index().unwrap(), 4);
    }

    #[test]
    fn test_settled_invoice_is_not_downgraded() {
        let db = Database::open_in_memory().unwrap();
        let creator = addr('a');
        db.upsert_invoice(&creator, &settled(open_invoice(1), 2))
            .unwrap();

        let stale = db.upsert_invoice(&creator, &open_invoice(1)).unwrap();
        assert!(stale.invoice.is_settled());
        assert!(db.get_invoice(stale.id).unwrap().invoice.is_settled());
    }

    #[test]
    fn test_settle_index_is_unique_across_invoices() {
        let db = Database::open_in_memory().unwrap();
        let creator = addr('a');
        db.upsert_invoice(&creator, &settled(open_invoice(1), 2))
            .unwrap();
        let mut clash = settled(open_invoice(2), 2);
        clash.r_preimage = "ff".repeat(32);
        assert!(matches!(
            db.upsert_invoice(&creator, &clash),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_lookup_by_payment_request() {
        let db = Database::open_in_memory().unwrap();
        let stored = db.upsert_invoice(&addr('a'), &open_invoice(3)).unwrap();
        let found = db.find_invoice_by_payment_request("lnbcrt3").unwrap().unwrap();
        assert_eq!(found.id, stored.id);
        assert!(db.find_invoice_by_payment_request("nope").unwrap().is_none());
        assert_eq!(db.max_invoice_settle_index().unwrap(), 0);
    }
}
