//! Participant set → discussion.

use lnchat_shared::{Address, ChatError, MessageOptions, Result};
use lnchat_store::{Database, Discussion};

/// Find the discussion for `participants`, creating it with default options
/// when there is none.
///
/// Lookup and creation share one transaction (a savepoint when the caller
/// already holds one), so two resolvers never create the same discussion.
pub fn resolve(db: &Database, participants: &[Address]) -> Result<Discussion> {
    if participants.is_empty() {
        return Err(ChatError::invalid_argument(
            "a discussion needs at least one participant",
        ));
    }

    db.transaction(|tx| -> Result<Discussion> {
        if let Some(existing) = tx.find_discussion_by_participants(participants)? {
            return Ok(existing);
        }
        let created = tx.insert_discussion(participants, &MessageOptions::default())?;
        tracing::info!(discussion_id = created.id, "new discussion");
        Ok(created)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lnchat_shared::ErrorKind;

    fn addr(c: char) -> Address {
        Address::parse(&format!("02{}", c.to_string().repeat(64))).unwrap()
    }

    #[test]
    fn test_resolve_creates_then_reuses() {
        let db = Database::open_in_memory().unwrap();

        let first = resolve(&db, &[addr('a'), addr('b')]).unwrap();
        assert_eq!(first.participants, vec![addr('a'), addr('b')]);
        assert_eq!(first.last_read_id, 0);
        assert_eq!(first.last_message_id, 0);
        assert_eq!(first.options, MessageOptions::default());

        let again = resolve(&db, &[addr('b'), addr('a')]).unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.participants, first.participants);
    }

    #[test]
    fn test_resolve_drops_duplicates_keeps_order() {
        let db = Database::open_in_memory().unwrap();
        let d = resolve(&db, &[addr('c'), addr('a'), addr('c')]).unwrap();
        assert_eq!(d.participants, vec![addr('c'), addr('a')]);
        assert_eq!(resolve(&db, &[addr('a'), addr('c')]).unwrap().id, d.id);
    }

    #[test]
    fn test_resolve_empty_set() {
        let db = Database::open_in_memory().unwrap();
        let err = resolve(&db, &[]).unwrap_err();
        assert!(err.is(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_resolve_inside_failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result = db.transaction(|tx| -> Result<()> {
            resolve(tx, &[addr('d')])?;
            Err(ChatError::internal("abort"))
        });
        assert!(result.is_err());
        assert!(db
            .find_discussion_by_participants(&[addr('d')])
            .unwrap()
            .is_none());
    }
}
