use anyhow::Result;
use rusqlite::params;

use crate::models::{NOTIFICATION_COLUMNS, NotificationRow};
use crate::{Database, OptionalExt};

impl Database {
    // -- Notifications --

    pub fn insert_notification(&self, n: &NotificationRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO notifications (id, user_id, kind, title, message, is_read, related_id, action_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    n.id,
                    n.user_id,
                    n.kind,
                    n.title,
                    n.message,
                    n.is_read,
                    n.related_id,
                    n.action_url,
                    n.created_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_notification(&self, id: &str) -> Result<Option<NotificationRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLUMNS);
            let row = conn.query_row(&sql, [id], NotificationRow::from_row).optional()?;
            Ok(row)
        })
    }

    /// Newest first.
    pub fn notifications_for_user(&self, user_id: &str) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM notifications WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC",
                NOTIFICATION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], NotificationRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_unread_notifications(&self, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND is_read = 0",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Marks the given ids read in one transaction; returns how many existed.
    pub fn mark_notifications_read(&self, ids: &[String]) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut touched = 0;
            {
                let mut stmt = tx.prepare("UPDATE notifications SET is_read = 1 WHERE id = ?1")?;
                for id in ids {
                    touched += stmt.execute([id])?;
                }
            }
            tx.commit()?;
            Ok(touched)
        })
    }

    pub fn mark_all_notifications_read(&self, user_id: &str) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let flipped = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
                [user_id],
            )?;
            Ok(flipped)
        })
    }

    pub fn delete_notification(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let removed = conn.execute("DELETE FROM notifications WHERE id = ?1", [id])?;
            Ok(removed > 0)
        })
    }
}
