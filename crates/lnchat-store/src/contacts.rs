//! CRUD operations for [`Contact`] records.

use rusqlite::params;

use lnchat_shared::{Address, Node, PageOptions};

use crate::columns;
use crate::database::{sql_id, Database};
use crate::error::{not_found, unique_violation, Result, StoreError};
use crate::models::Contact;

const CONTACT_COLUMNS: &str = "id, display_name, alias, address";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new contact and return its id.
    ///
    /// Fails with [`StoreError::AlreadyExists`] when a contact with the same
    /// node address exists.
    pub fn insert_contact(&self, display_name: &str, node: &Node) -> Result<u64> {
        self.conn()
            .execute(
                "INSERT INTO contacts (display_name, alias, address) VALUES (?1, ?2, ?3)",
                params![display_name, node.alias, node.address.as_str()],
            )
            .map_err(|e| unique_violation(e, &format!("contact {}", node.address)))?;
        Ok(self.conn().last_insert_rowid() as u64)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_contact(&self, id: u64) -> Result<Contact> {
        self.conn()
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
                params![sql_id(id)],
                row_to_contact,
            )
            .map_err(|e| not_found(e, &format!("contact {id}")))
    }

    pub fn get_contact_by_address(&self, address: &Address) -> Result<Contact> {
        self.conn()
            .query_row(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE address = ?1"),
                params![address.as_str()],
                row_to_contact,
            )
            .map_err(|e| not_found(e, &format!("contact {address}")))
    }

    /// List contacts ordered by id.
    pub fn list_contacts(&self, page: &PageOptions) -> Result<Vec<Contact>> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE {}",
            columns::page_clause("id", page)
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![sql_id(page.last_id), page.effective_size()],
            row_to_contact,
        )?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    pub fn delete_contact(&self, id: u64) -> Result<()> {
        let affected = self
            .conn()
            .execute("DELETE FROM contacts WHERE id = ?1", params![sql_id(id)])?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("contact {id}")));
        }
        Ok(())
    }

    pub fn delete_contact_by_address(&self, address: &Address) -> Result<()> {
        let affected = self.conn().execute(
            "DELETE FROM contacts WHERE address = ?1",
            params![address.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("contact {address}")));
        }
        Ok(())
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: columns::id(row, 0)?,
        display_name: row.get(1)?,
        node: Node {
            alias: row.get(2)?,
            address: columns::address(row, 3)?,
        },
    })
}
