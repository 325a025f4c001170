//! CRUD operations for [`Discussion`] records.
//!
//! A discussion is identified by the set of its participants. The sorted,
//! comma-joined form of that set is kept in `participants_key` under a unique
//! index so two discussions can never share the same participants.

use rusqlite::{params, OptionalExtension};

use lnchat_shared::{Address, MessageOptions, PageOptions};

use crate::columns;
use crate::database::{sql_id, Database};
use crate::error::{not_found, unique_violation, Result, StoreError};
use crate::models::{participants_key, Discussion, DiscussionStatistics};

const DISCUSSION_COLUMNS: &str =
    "id, participants, last_read_id, last_message_id, fee_limit_msat, anonymous";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a discussion for `participants`, keeping their order but
    /// dropping repeats.
    pub fn insert_discussion(
        &self,
        participants: &[Address],
        options: &MessageOptions,
    ) -> Result<Discussion> {
        if participants.is_empty() {
            return Err(StoreError::Invariant(
                "a discussion needs at least one participant".into(),
            ));
        }

        let mut ordered: Vec<Address> = Vec::with_capacity(participants.len());
        for p in participants {
            if !ordered.contains(p) {
                ordered.push(p.clone());
            }
        }
        let key = participants_key(&ordered);

        self.conn()
            .execute(
                "INSERT INTO discussions (participants, participants_key, fee_limit_msat, anonymous)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    serde_json::to_string(&ordered)?,
                    key,
                    options.fee_limit_msat,
                    options.anonymous,
                ],
            )
            .map_err(|e| unique_violation(e, &format!("discussion with participants {key}")))?;

        let id = self.conn().last_insert_rowid() as u64;
        tracing::debug!(discussion_id = id, participants = ordered.len(), "discussion created");

        Ok(Discussion {
            id,
            participants: ordered,
            last_read_id: 0,
            last_message_id: 0,
            options: *options,
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_discussion(&self, id: u64) -> Result<Discussion> {
        self.conn()
            .query_row(
                &format!("SELECT {DISCUSSION_COLUMNS} FROM discussions WHERE id = ?1"),
                params![sql_id(id)],
                row_to_discussion,
            )
            .map_err(|e| not_found(e, &format!("discussion {id}")))
    }

    /// Look a discussion up by its participant set (order-independent).
    pub fn find_discussion_by_participants(
        &self,
        participants: &[Address],
    ) -> Result<Option<Discussion>> {
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {DISCUSSION_COLUMNS} FROM discussions WHERE participants_key = ?1"
                ),
                params![participants_key(participants)],
                row_to_discussion,
            )
            .optional()?;
        Ok(found)
    }

    pub fn list_discussions(&self, page: &PageOptions) -> Result<Vec<Discussion>> {
        let sql = format!(
            "SELECT {DISCUSSION_COLUMNS} FROM discussions WHERE {}",
            columns::page_clause("id", page)
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![sql_id(page.last_id), page.effective_size()],
            row_to_discussion,
        )?;

        let mut discussions = Vec::new();
        for row in rows {
            discussions.push(row?);
        }
        Ok(discussions)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Mark messages up to `message_id` as read.
    ///
    /// `message_id` must be 0 or a message of this discussion no newer than
    /// its last message.
    pub fn update_last_read(&self, id: u64, message_id: u64) -> Result<()> {
        self.transaction(|tx| {
            let discussion = tx.get_discussion(id)?;
            if message_id > discussion.last_message_id {
                return Err(StoreError::Invariant(format!(
                    "message {message_id} is newer than the last message of discussion {id}"
                )));
            }
            if message_id > 0 {
                let owner = tx.get_message(message_id)?.discussion_id;
                if owner != id {
                    return Err(StoreError::Invariant(format!(
                        "message {message_id} does not belong to discussion {id}"
                    )));
                }
            }
            tx.conn().execute(
                "UPDATE discussions SET last_read_id = ?2 WHERE id = ?1",
                params![sql_id(id), sql_id(message_id)],
            )?;
            Ok(())
        })
    }

    /// Advance `last_message_id`; never moves it backwards.
    pub fn bump_last_message(&self, id: u64, message_id: u64) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE discussions SET last_message_id = MAX(last_message_id, ?2) WHERE id = ?1",
            params![sql_id(id), sql_id(message_id)],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("discussion {id}")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a discussion together with its messages and raw messages.
    pub fn delete_discussion(&self, id: u64) -> Result<()> {
        self.transaction(|tx| {
            let conn = tx.conn();
            conn.execute(
                "DELETE FROM messages WHERE discussion_id = ?1",
                params![sql_id(id)],
            )?;
            conn.execute(
                "DELETE FROM raw_messages WHERE discussion_id = ?1",
                params![sql_id(id)],
            )?;
            let affected =
                conn.execute("DELETE FROM discussions WHERE id = ?1", params![sql_id(id)])?;
            if affected == 0 {
                return Err(StoreError::NotFound(format!("discussion {id}")));
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Sums over the messages of a discussion. Messages sent by
    /// `self_address` count as sent, everything else as received.
    pub fn discussion_statistics(
        &self,
        id: u64,
        self_address: &Address,
    ) -> Result<DiscussionStatistics> {
        // Existence check so an unknown id is NotFound, not all zeros.
        self.get_discussion(id)?;

        let stats = self.conn().query_row(
            "SELECT
                 COALESCE(SUM(CASE WHEN sender = ?2 THEN amt_msat END), 0),
                 COALESCE(SUM(CASE WHEN sender = ?2 THEN total_fees_msat END), 0),
                 COALESCE(SUM(CASE WHEN sender IS NOT ?2 THEN amt_msat END), 0),
                 COUNT(CASE WHEN sender = ?2 THEN 1 END),
                 COUNT(CASE WHEN sender IS NOT ?2 THEN 1 END)
             FROM messages WHERE discussion_id = ?1",
            params![sql_id(id), self_address.as_str()],
            |row| {
                Ok(DiscussionStatistics {
                    amt_msat_sent: row.get(0)?,
                    amt_msat_fees: row.get(1)?,
                    amt_msat_received: row.get(2)?,
                    messages_sent: columns::id(row, 3)?,
                    messages_received: columns::id(row, 4)?,
                })
            },
        )?;
        Ok(stats)
    }
}

fn row_to_discussion(row: &rusqlite::Row<'_>) -> rusqlite::Result<Discussion> {
    Ok(Discussion {
        id: columns::id(row, 0)?,
        participants: columns::json(row, 1)?,
        last_read_id: columns::id(row, 2)?,
        last_message_id: columns::id(row, 3)?,
        options: MessageOptions {
            fee_limit_msat: row.get(4)?,
            anonymous: row.get(5)?,
        },
    })
}
