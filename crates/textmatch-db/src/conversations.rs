use std::collections::HashMap;

use anyhow::Result;
use rusqlite::{Connection, params};

use crate::models::{CONVERSATION_COLUMNS, ConversationRecord, ConversationRow};
use crate::{Database, OptionalExt};

impl Database {
    // -- Conversations --

    /// Inserts unless the id or the (buyer, seller, listing) triple already exists.
    /// Returns true when a row was created.
    pub fn insert_conversation_if_absent(
        &self,
        id: &str,
        buyer_id: &str,
        seller_id: &str,
        listing_id: &str,
        created_at: &str,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO conversations (id, buyer_id, seller_id, listing_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, buyer_id, seller_id, listing_id, created_at],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
            let row = conn.query_row(&sql, [id], ConversationRow::from_row).optional()?;
            match row {
                Some(row) => {
                    let unread = query_unread(conn, &row.id)?;
                    Ok(Some(ConversationRecord { row, unread }))
                }
                None => Ok(None),
            }
        })
    }

    pub fn find_conversation_id(&self, buyer_id: &str, seller_id: &str, listing_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT id FROM conversations WHERE buyer_id = ?1 AND seller_id = ?2 AND listing_id = ?3",
                    params![buyer_id, seller_id, listing_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
    }

    pub fn conversations_as_buyer(&self, user_id: &str) -> Result<Vec<ConversationRecord>> {
        self.with_conn(|conn| query_conversations(conn, "buyer_id", user_id))
    }

    pub fn conversations_as_seller(&self, user_id: &str) -> Result<Vec<ConversationRecord>> {
        self.with_conn(|conn| query_conversations(conn, "seller_id", user_id))
    }

    pub fn conversations_for_listing(&self, listing_id: &str) -> Result<Vec<ConversationRecord>> {
        self.with_conn(|conn| query_conversations(conn, "listing_id", listing_id))
    }

    /// Sum of the user's unread counters across every conversation.
    pub fn unread_total(&self, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let total = conn.query_row(
                "SELECT COALESCE(SUM(count), 0) FROM conversation_unread WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(total)
        })
    }
}

fn query_conversations(conn: &Connection, column: &str, value: &str) -> Result<Vec<ConversationRecord>> {
    let sql = format!(
        "SELECT {} FROM conversations WHERE {} = ?1 ORDER BY created_at DESC",
        CONVERSATION_COLUMNS, column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([value], ConversationRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            let unread = query_unread(conn, &row.id)?;
            Ok(ConversationRecord { row, unread })
        })
        .collect()
}

fn query_unread(conn: &Connection, conversation_id: &str) -> Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT user_id, count FROM conversation_unread WHERE conversation_id = ?1")?;
    let counts = stmt
        .query_map([conversation_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(counts)
}
