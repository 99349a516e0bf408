use anyhow::Result;
use rusqlite::params;

use crate::Database;
use crate::models::{MESSAGE_COLUMNS, MessageRow, NewMessage};

impl Database {
    // -- Messages --

    /// Appends a message, refreshes the conversation preview and bumps the
    /// recipient's unread counter, all in one transaction. Returns the
    /// store-assigned sequence number and that of the conversation's previous
    /// message (0 for the first).
    pub fn insert_message(&self, msg: &NewMessage, recipient_id: Option<&str>) -> Result<(i64, i64)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let prev_seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE conversation_id = ?1",
                [&msg.conversation_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, text, is_system, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![msg.id, msg.conversation_id, msg.sender_id, msg.text, msg.is_system, msg.created_at],
            )?;
            let seq = tx.last_insert_rowid();

            tx.execute(
                "UPDATE conversations SET last_message = ?2, last_message_at = ?3 WHERE id = ?1",
                params![msg.conversation_id, msg.text, msg.created_at],
            )?;

            if let Some(recipient) = recipient_id {
                tx.execute(
                    "INSERT INTO conversation_unread (conversation_id, user_id, count) VALUES (?1, ?2, 1)
                     ON CONFLICT(conversation_id, user_id) DO UPDATE SET count = count + 1",
                    params![msg.conversation_id, recipient],
                )?;
            }

            tx.commit()?;
            Ok((seq, prev_seq))
        })
    }

    /// Messages with `seq > after_seq`, ascending.
    pub fn messages_after(&self, conversation_id: &str, after_seq: i64) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1 AND seq > ?2 ORDER BY seq ASC",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![conversation_id, after_seq], MessageRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// One page of history ending before `before_seq` (newest page when `None`),
    /// returned in ascending order.
    pub fn message_page(&self, conversation_id: &str, limit: u32, before_seq: Option<i64>) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1 AND seq < ?2
                 ORDER BY seq DESC
                 LIMIT ?3",
                MESSAGE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(
                    params![conversation_id, before_seq.unwrap_or(i64::MAX), limit],
                    MessageRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            Ok(rows)
        })
    }

    /// Marks the other side's messages read and zeroes the reader's counter.
    /// Returns how many messages flipped.
    pub fn mark_conversation_read(&self, conversation_id: &str, reader_id: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let flipped = tx.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0",
                params![conversation_id, reader_id],
            )?;
            tx.execute(
                "INSERT INTO conversation_unread (conversation_id, user_id, count) VALUES (?1, ?2, 0)
                 ON CONFLICT(conversation_id, user_id) DO UPDATE SET count = 0",
                params![conversation_id, reader_id],
            )?;
            tx.commit()?;
            Ok(flipped)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listings::tests::sample_listing;
    use crate::now;

    fn setup() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let listing = sample_listing("seller");
        db.insert_listing(&listing).unwrap();
        db.insert_conversation_if_absent("conv", "buyer", "seller", &listing.id.to_string(), &now())
            .unwrap();
        (db, "conv".to_string())
    }

    fn message(conversation_id: &str, sender: &str, text: &str) -> NewMessage {
        NewMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender.into(),
            text: text.into(),
            is_system: false,
            created_at: now(),
        }
    }

    #[test]
    fn insert_updates_preview_and_counter() {
        let (db, conv) = setup();
        let (first, prev) = db.insert_message(&message(&conv, "buyer", "hello"), Some("seller")).unwrap();
        assert_eq!(prev, 0);
        let (second, prev) = db.insert_message(&message(&conv, "buyer", "still there?"), Some("seller")).unwrap();
        assert!(second > first);
        assert_eq!(prev, first);

        let record = db.get_conversation(&conv).unwrap().unwrap();
        assert_eq!(record.row.last_message.as_deref(), Some("still there?"));
        assert_eq!(record.unread.get("seller"), Some(&2));
        assert_eq!(db.unread_total("seller").unwrap(), 2);
        assert_eq!(db.unread_total("buyer").unwrap(), 0);
    }

    #[test]
    fn previous_seq_stays_within_the_conversation() {
        let (db, conv) = setup();
        let listing = sample_listing("seller");
        db.insert_listing(&listing).unwrap();
        db.insert_conversation_if_absent("other", "buyer-2", "seller", &listing.id.to_string(), &now())
            .unwrap();

        let (a, _) = db.insert_message(&message(&conv, "buyer", "a"), Some("seller")).unwrap();
        let (b, prev_b) = db.insert_message(&message("other", "buyer-2", "b"), Some("seller")).unwrap();
        let (c, prev_c) = db.insert_message(&message(&conv, "seller", "c"), Some("buyer")).unwrap();
        assert_eq!(prev_b, 0);
        assert_eq!(prev_c, a);
        assert!(a < b && b < c);
    }

    #[test]
    fn mark_read_only_touches_the_other_side() {
        let (db, conv) = setup();
        db.insert_message(&message(&conv, "buyer", "hi"), Some("seller")).unwrap();
        db.insert_message(&message(&conv, "seller", "hey"), Some("buyer")).unwrap();

        assert_eq!(db.mark_conversation_read(&conv, "seller").unwrap(), 1);
        assert_eq!(db.unread_total("seller").unwrap(), 0);
        assert_eq!(db.unread_total("buyer").unwrap(), 1);

        let rows = db.messages_after(&conv, 0).unwrap();
        assert!(rows[0].is_read);
        assert!(!rows[1].is_read);
    }

    #[test]
    fn pages_come_back_ascending() {
        let (db, conv) = setup();
        for i in 0..5 {
            db.insert_message(&message(&conv, "buyer", &format!("m{}", i)), Some("seller")).unwrap();
        }

        let newest = db.message_page(&conv, 2, None).unwrap();
        let texts: Vec<_> = newest.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["m3", "m4"]);

        let older = db.message_page(&conv, 2, Some(newest[0].seq)).unwrap();
        let texts: Vec<_> = older.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["m1", "m2"]);

        let after = db.messages_after(&conv, newest[0].seq).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].text, "m4");
    }
}
