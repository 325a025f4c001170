use rusqlite::{params, OptionalExtension};

use lnchat_shared::PageOptions;

use crate::columns;
use crate::database::{sql_id, Database};
use crate::error::{not_found, unique_violation, Result};
use crate::models::Message;

const MESSAGE_COLUMNS: &str = "id, discussion_id, raw_message_id, payload, amt_msat, sender, \
     receiver, sender_verified, sent_time_ns, received_time_ns, idx, total_fees_msat, routes, \
     preimage_hash, preimage, pay_req, success_prob";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<u64> {
        self.conn()
            .execute(
                "INSERT INTO messages (discussion_id, raw_message_id, payload, amt_msat, sender,
                     receiver, sender_verified, sent_time_ns, received_time_ns, idx,
                     total_fees_msat, routes, preimage_hash, preimage, pay_req, success_prob)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    sql_id(message.discussion_id),
                    sql_id(message.raw_message_id),
                    message.payload,
                    message.amt_msat,
                    message.sender.as_ref().map(|a| a.as_str()),
                    message.receiver.as_ref().map(|a| a.as_str()),
                    message.sender_verified,
                    message.sent_time_ns,
                    message.received_time_ns,
                    sql_id(message.index),
                    message.total_fees_msat,
                    serde_json::to_string(&message.routes)?,
                    message.preimage_hash,
                    message.preimage,
                    message.pay_req,
                    message.success_prob,
                ],
            )
            .map_err(|e| {
                unique_violation(
                    e,
                    &format!("message for raw message {}", message.raw_message_id),
                )
            })?;
        Ok(self.conn().last_insert_rowid() as u64)
    }

    pub fn get_message(&self, id: u64) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![sql_id(id)],
                row_to_message,
            )
            .map_err(|e| not_found(e, &format!("message {id}")))
    }

    pub fn find_message_by_raw(&self, raw_message_id: u64) -> Result<Option<Message>> {
        let found = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE raw_message_id = ?1"),
                params![sql_id(raw_message_id)],
                row_to_message,
            )
            .optional()?;
        Ok(found)
    }

    /// Page through the history of one discussion by message id.
    pub fn list_messages_for_discussion(
        &self,
        discussion_id: u64,
        page: &PageOptions,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE discussion_id = ?3 AND {}",
            columns::page_clause("id", page)
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                sql_id(page.last_id),
                page.effective_size(),
                sql_id(discussion_id)
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: columns::id(row, 0)?,
        discussion_id: columns::id(row, 1)?,
        raw_message_id: columns::id(row, 2)?,
        payload: row.get(3)?,
        amt_msat: row.get(4)?,
        sender: columns::opt_address(row, 5)?,
        receiver: columns::opt_address(row, 6)?,
        sender_verified: row.get(7)?,
        sent_time_ns: row.get(8)?,
        received_time_ns: row.get(9)?,
        index: columns::id(row, 10)?,
        total_fees_msat: row.get(11)?,
        routes: columns::json(row, 12)?,
        preimage_hash: row.get(13)?,
        preimage: row.get(14)?,
        pay_req: row.get(15)?,
        success_prob: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::test_util::{addr, outgoing_raw};
    use lnchat_shared::ln::Route;
    use lnchat_shared::MessageOptions;

    #[test]
    fn test_message_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let d = db
            .insert_discussion(&[addr('b')], &MessageOptions::default())
            .unwrap();
        let raw_id = db.insert_raw_message(&outgoing_raw(d.id, vec![5])).unwrap();

        let message = Message {
            discussion_id: d.id,
            raw_message_id: raw_id,
            payload: "hello".into(),
            amt_msat: 1000,
            sender: Some(addr('a')),
            receiver: Some(addr('b')),
            sender_verified: true,
            sent_time_ns: 10,
            received_time_ns: 20,
            index: 5,
            total_fees_msat: 15,
            routes: vec![Route {
                total_amt_msat: 1015,
                total_fees_msat: 15,
                ..Default::default()
            }],
            preimage_hash: vec![0xaa; 32],
            preimage: vec![0xbb; 32],
            pay_req: "lnbc1".into(),
            success_prob: 0.5,
            ..Default::default()
        };
        let id = db.insert_message(&message).unwrap();

        let stored = db.get_message(id).unwrap();
        assert_eq!(stored, Message { id, ..message });
        assert_eq!(db.find_message_by_raw(raw_id).unwrap().map(|m| m.id), Some(id));
    }

    #[test]
    fn test_one_message_per_raw_message() {
        let db = Database::open_in_memory().unwrap();
        let d = db
            .insert_discussion(&[addr('b')], &MessageOptions::default())
            .unwrap();
        let raw_id = db.insert_raw_message(&outgoing_raw(d.id, vec![1])).unwrap();
        let message = Message {
            discussion_id: d.id,
            raw_message_id: raw_id,
            ..Default::default()
        };
        db.insert_message(&message).unwrap();
        assert!(matches!(
            db.insert_message(&message),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_message_requires_discussion() {
        let db = Database::open_in_memory().unwrap();
        let raw_id = db.insert_raw_message(&outgoing_raw(0, vec![1])).unwrap();
        let orphan = Message {
            discussion_id: 42,
            raw_message_id: raw_id,
            ..Default::default()
        };
        assert!(db.insert_message(&orphan).is_err());
    }

    #[test]
    fn test_history_paging() {
        let db = Database::open_in_memory().unwrap();
        let d = db
            .insert_discussion(&[addr('b')], &MessageOptions::default())
            .unwrap();
        let other = db
            .insert_discussion(&[addr('c')], &MessageOptions::default())
            .unwrap();

        let mut ids = Vec::new();
        for i in 1..=3u64 {
            let raw_id = db.insert_raw_message(&outgoing_raw(d.id, vec![i])).unwrap();
            ids.push(
                db.insert_message(&Message {
                    discussion_id: d.id,
                    raw_message_id: raw_id,
                    payload: format!("m{i}"),
                    ..Default::default()
                })
                .unwrap(),
            );
        }
        let raw_id = db
            .insert_raw_message(&outgoing_raw(other.id, vec![9]))
            .unwrap();
        db.insert_message(&Message {
            discussion_id: other.id,
            raw_message_id: raw_id,
            ..Default::default()
        })
        .unwrap();

        let all = db
            .list_messages_for_discussion(d.id, &PageOptions::default())
            .unwrap();
        assert_eq!(all.iter().map(|m| m.id).collect::<Vec<_>>(), ids);

        let newest_first = db
            .list_messages_for_discussion(
                d.id,
                &PageOptions {
                    last_id: ids[2],
                    page_size: 1,
                    reverse: true,
                },
            )
            .unwrap();
        assert_eq!(newest_first.len(), 1);
        assert_eq!(newest_first[0].payload, "m2");
    }
}
