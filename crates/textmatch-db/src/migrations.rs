use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE listings (
                id                  TEXT PRIMARY KEY,
                title               TEXT NOT NULL,
                description         TEXT,
                condition           TEXT,
                price               INTEGER NOT NULL,
                image_urls          TEXT NOT NULL,
                seller_id           TEXT NOT NULL,
                buyer_id            TEXT,
                status              TEXT NOT NULL DEFAULT 'available',
                transaction_status  TEXT,
                views               INTEGER NOT NULL DEFAULT 0,
                is_approved         INTEGER,
                admin_notes         TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                purchased_at        TEXT,
                completed_at        TEXT,
                deleted_at          TEXT
            );

            CREATE INDEX idx_listings_seller ON listings(seller_id, created_at);
            CREATE INDEX idx_listings_buyer ON listings(buyer_id, status);

            CREATE TABLE listing_delete_log (
                id          TEXT PRIMARY KEY,
                listing_id  TEXT NOT NULL,
                snapshot    TEXT NOT NULL,
                reason      TEXT NOT NULL,
                deleted_by  TEXT NOT NULL,
                deleted_at  TEXT NOT NULL
            );

            CREATE TABLE listing_trade_log (
                id                  TEXT PRIMARY KEY,
                listing_id          TEXT NOT NULL,
                buyer_id            TEXT,
                transaction_status  TEXT NOT NULL,
                purchased_at        TEXT,
                completed_at        TEXT,
                archived_at         TEXT NOT NULL
            );

            CREATE INDEX idx_trade_log_listing ON listing_trade_log(listing_id, archived_at);

            CREATE TABLE favorites (
                user_id     TEXT NOT NULL,
                listing_id  TEXT NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (user_id, listing_id)
            );

            CREATE INDEX idx_favorites_listing ON favorites(listing_id);

            CREATE TABLE conversations (
                id               TEXT PRIMARY KEY,
                buyer_id         TEXT NOT NULL,
                seller_id        TEXT NOT NULL,
                listing_id       TEXT NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
                created_at       TEXT NOT NULL,
                last_message     TEXT,
                last_message_at  TEXT,
                UNIQUE(buyer_id, seller_id, listing_id)
            );

            CREATE INDEX idx_conversations_buyer ON conversations(buyer_id);
            CREATE INDEX idx_conversations_seller ON conversations(seller_id);
            CREATE INDEX idx_conversations_listing ON conversations(listing_id);

            CREATE TABLE conversation_unread (
                conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                user_id          TEXT NOT NULL,
                count            INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE TABLE messages (
                seq              INTEGER PRIMARY KEY AUTOINCREMENT,
                id               TEXT NOT NULL UNIQUE,
                conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id        TEXT NOT NULL,
                text             TEXT NOT NULL,
                is_read          INTEGER NOT NULL DEFAULT 0,
                is_system        INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation ON messages(conversation_id, seq);

            CREATE TABLE notifications (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL,
                kind        TEXT NOT NULL,
                title       TEXT NOT NULL,
                message     TEXT NOT NULL,
                is_read     INTEGER NOT NULL DEFAULT 0,
                related_id  TEXT,
                action_url  TEXT,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_notifications_user ON notifications(user_id, is_read, created_at);

            CREATE TABLE push_tokens (
                user_id     TEXT PRIMARY KEY,
                token       TEXT NOT NULL,
                enabled     INTEGER NOT NULL DEFAULT 1,
                platform    TEXT NOT NULL DEFAULT 'web',
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE profiles (
                user_id       TEXT PRIMARY KEY,
                display_name  TEXT NOT NULL,
                email         TEXT,
                updated_at    TEXT NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
