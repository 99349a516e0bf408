use anyhow::Result;
use rusqlite::{Connection, params};

use textmatch_types::models::Listing;

use crate::models::{DeleteLogRow, LISTING_COLUMNS, ListingRow, TradeLogRow};
use crate::{Database, OptionalExt, timestamp};

/// Field-merge payload for a status transition. `None` leaves the column untouched.
pub struct StatusChange<'a> {
    pub status: &'a str,
    pub buyer_id: Option<&'a str>,
    pub purchased_at: Option<&'a str>,
    pub updated_at: &'a str,
}

impl Database {
    // -- Listings --

    pub fn insert_listing(&self, listing: &Listing) -> Result<()> {
        let image_urls = serde_json::to_string(&listing.image_urls)?;
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO listings (id, title, description, condition, price, image_urls, seller_id,
                                       status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    listing.id.to_string(),
                    listing.title,
                    listing.description,
                    listing.condition,
                    listing.price,
                    image_urls,
                    listing.seller_id,
                    listing.status.as_str(),
                    timestamp(listing.created_at),
                    timestamp(listing.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Includes soft-deleted listings; callers decide whether those count.
    pub fn get_listing(&self, id: &str) -> Result<Option<ListingRow>> {
        self.with_conn(|conn| query_listing(conn, id))
    }

    /// Compare-and-set on the current status. Returns false when the listing
    /// is gone, soft-deleted, or no longer in `expected`.
    pub fn set_listing_status(&self, id: &str, expected: &str, change: &StatusChange<'_>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE listings
                 SET status = ?2,
                     buyer_id = COALESCE(?3, buyer_id),
                     purchased_at = COALESCE(?4, purchased_at),
                     updated_at = ?5
                 WHERE id = ?1 AND status = ?6 AND deleted_at IS NULL",
                params![id, change.status, change.buyer_id, change.purchased_at, change.updated_at, expected],
            )?;
            Ok(changed > 0)
        })
    }

    /// Compare-and-set on the transaction status (`expected = None` means unset).
    pub fn set_transaction_status(
        &self,
        id: &str,
        expected: Option<&str>,
        next: &str,
        completed_at: Option<&str>,
        updated_at: &str,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE listings
                 SET transaction_status = ?2,
                     completed_at = COALESCE(?3, completed_at),
                     updated_at = ?4
                 WHERE id = ?1 AND transaction_status IS ?5 AND deleted_at IS NULL",
                params![id, next, completed_at, updated_at, expected],
            )?;
            Ok(changed > 0)
        })
    }

    /// Administrative write that skips the transition table.
    ///
    /// A transaction status that would rank below the stored one is not
    /// written; returns false in that case and when the listing is gone.
    pub fn override_listing_status(
        &self,
        id: &str,
        change: &StatusChange<'_>,
        transaction_status: Option<&str>,
        completed_at: Option<&str>,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let sql = format!(
                "UPDATE listings
                 SET status = ?2,
                     purchased_at = COALESCE(?3, purchased_at),
                     transaction_status = COALESCE(?4, transaction_status),
                     completed_at = COALESCE(?5, completed_at),
                     updated_at = ?6
                 WHERE id = ?1 AND deleted_at IS NULL
                   AND (?4 IS NULL OR {} <= {})",
                transaction_rank("transaction_status"),
                transaction_rank("?4"),
            );
            let changed = conn.execute(
                &sql,
                params![id, change.status, change.purchased_at, transaction_status, completed_at, change.updated_at],
            )?;
            Ok(changed > 0)
        })
    }

    /// Starts a new trade at `pending` after archiving the previous one.
    /// Compare-and-set on the archived transaction status.
    pub fn restart_transaction(&self, log: &TradeLogRow, updated_at: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE listings
                 SET transaction_status = 'pending',
                     completed_at = NULL,
                     updated_at = ?2
                 WHERE id = ?1 AND transaction_status = ?3 AND deleted_at IS NULL",
                params![log.listing_id, updated_at, log.transaction_status],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO listing_trade_log (id, listing_id, buyer_id, transaction_status,
                                                purchased_at, completed_at, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    log.id,
                    log.listing_id,
                    log.buyer_id,
                    log.transaction_status,
                    log.purchased_at,
                    log.completed_at,
                    log.archived_at,
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    pub fn trade_log(&self, listing_id: &str) -> Result<Vec<TradeLogRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, listing_id, buyer_id, transaction_status, purchased_at, completed_at, archived_at
                 FROM listing_trade_log WHERE listing_id = ?1 ORDER BY archived_at",
            )?;
            let rows = stmt
                .query_map([listing_id], |row| {
                    Ok(TradeLogRow {
                        id: row.get(0)?,
                        listing_id: row.get(1)?,
                        buyer_id: row.get(2)?,
                        transaction_status: row.get(3)?,
                        purchased_at: row.get(4)?,
                        completed_at: row.get(5)?,
                        archived_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn moderate_listing(&self, id: &str, approved: bool, notes: Option<&str>, updated_at: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE listings SET is_approved = ?2, admin_notes = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, approved, notes, updated_at],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn soft_delete_listing(&self, id: &str, deleted_at: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE listings SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, deleted_at],
            )?;
            Ok(changed > 0)
        })
    }

    /// Writes the audit row and removes the listing in one transaction.
    /// Conversations, their messages and favorites go with it (ON DELETE CASCADE).
    pub fn hard_delete_listing(&self, log: &DeleteLogRow) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO listing_delete_log (id, listing_id, snapshot, reason, deleted_by, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![log.id, log.listing_id, log.snapshot, log.reason, log.deleted_by, log.deleted_at],
            )?;
            let removed = tx.execute("DELETE FROM listings WHERE id = ?1", [&log.listing_id])?;
            if removed == 0 {
                // Nothing to audit; the transaction rolls back on drop.
                return Ok(false);
            }
            tx.commit()?;
            Ok(true)
        })
    }

    pub fn increment_listing_views(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE listings SET views = views + 1 WHERE id = ?1 AND deleted_at IS NULL",
                [id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn recent_listings(&self, limit: u32) -> Result<Vec<ListingRow>> {
        self.with_conn(|conn| {
            query_listings(
                conn,
                "WHERE deleted_at IS NULL ORDER BY created_at DESC LIMIT ?1",
                params![limit],
            )
        })
    }

    /// Listings of a seller still on the market, newest first.
    pub fn selling_listings(&self, seller_id: &str) -> Result<Vec<ListingRow>> {
        self.with_conn(|conn| {
            query_listings(
                conn,
                "WHERE seller_id = ?1 AND status = 'available' AND deleted_at IS NULL
                 ORDER BY created_at DESC",
                params![seller_id],
            )
        })
    }

    pub fn purchased_listings(&self, buyer_id: &str) -> Result<Vec<ListingRow>> {
        self.with_conn(|conn| {
            query_listings(
                conn,
                "WHERE buyer_id = ?1 AND status = 'sold' AND deleted_at IS NULL
                 ORDER BY purchased_at DESC",
                params![buyer_id],
            )
        })
    }

    /// Sold listings of a seller whose trade is not completed yet.
    pub fn trading_listings(&self, seller_id: &str) -> Result<Vec<ListingRow>> {
        self.with_conn(|conn| {
            query_listings(
                conn,
                "WHERE seller_id = ?1 AND status = 'sold' AND deleted_at IS NULL
                   AND (transaction_status IS NULL OR transaction_status != 'completed')
                 ORDER BY created_at DESC",
                params![seller_id],
            )
        })
    }

    // -- Favorites --

    /// Returns true when the favorite was newly added.
    pub fn add_favorite(&self, user_id: &str, listing_id: &str, created_at: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO favorites (user_id, listing_id, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, listing_id, created_at],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn remove_favorite(&self, user_id: &str, listing_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "DELETE FROM favorites WHERE user_id = ?1 AND listing_id = ?2",
                params![user_id, listing_id],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn is_favorite(&self, user_id: &str, listing_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM favorites WHERE user_id = ?1 AND listing_id = ?2",
                    params![user_id, listing_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Favorited listings, most recently favorited first.
    pub fn favorite_listings(&self, user_id: &str) -> Result<Vec<ListingRow>> {
        self.with_conn(|conn| {
            let columns = LISTING_COLUMNS
                .split(", ")
                .map(|c| format!("l.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {} FROM favorites f
                 JOIN listings l ON l.id = f.listing_id
                 WHERE f.user_id = ?1 AND l.deleted_at IS NULL
                 ORDER BY f.created_at DESC",
                columns
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], ListingRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn favoriter_ids(&self, listing_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT user_id FROM favorites WHERE listing_id = ?1")?;
            let ids = stmt
                .query_map([listing_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }
}

/// Orders transaction statuses in SQL; unset ranks lowest.
fn transaction_rank(expr: &str) -> String {
    format!(
        "(CASE {} WHEN 'pending' THEN 1 WHEN 'paid' THEN 2 WHEN 'completed' THEN 3 ELSE 0 END)",
        expr
    )
}

fn query_listing(conn: &Connection, id: &str) -> Result<Option<ListingRow>> {
    let sql = format!("SELECT {} FROM listings WHERE id = ?1", LISTING_COLUMNS);
    let row = conn.query_row(&sql, [id], ListingRow::from_row).optional()?;
    Ok(row)
}

fn query_listings(conn: &Connection, clause: &str, params: impl rusqlite::Params) -> Result<Vec<ListingRow>> {
    let sql = format!("SELECT {} FROM listings {}", LISTING_COLUMNS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, ListingRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
