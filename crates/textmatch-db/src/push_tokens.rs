use anyhow::Result;
use rusqlite::params;

use crate::models::{ProfileRow, PushTokenRow};
use crate::{Database, OptionalExt};

impl Database {
    // -- Push tokens --

    /// Creates or merges the user's push-token record.
    pub fn upsert_push_token(&self, row: &PushTokenRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO push_tokens (user_id, token, enabled, platform, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    token = excluded.token,
                    enabled = excluded.enabled,
                    platform = excluded.platform,
                    updated_at = excluded.updated_at",
                params![row.user_id, row.token, row.enabled, row.platform, row.updated_at],
            )?;
            Ok(())
        })
    }

    pub fn get_push_token(&self, user_id: &str) -> Result<Option<PushTokenRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, token, enabled, platform, updated_at FROM push_tokens WHERE user_id = ?1",
                    [user_id],
                    |row| {
                        Ok(PushTokenRow {
                            user_id: row.get(0)?,
                            token: row.get(1)?,
                            enabled: row.get(2)?,
                            platform: row.get(3)?,
                            updated_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    // -- Profiles --

    pub fn upsert_profile(&self, row: &ProfileRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO profiles (user_id, display_name, email, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    display_name = excluded.display_name,
                    email = COALESCE(excluded.email, profiles.email),
                    updated_at = excluded.updated_at",
                params![row.user_id, row.display_name, row.email, row.updated_at],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, user_id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, display_name, email, updated_at FROM profiles WHERE user_id = ?1",
                    [user_id],
                    |row| {
                        Ok(ProfileRow {
                            user_id: row.get(0)?,
                            display_name: row.get(1)?,
                            email: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }
}
