use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

/// Catalog schema version understood by this build.
pub const SCHEMA_VERSION: u32 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS assets (
            id              TEXT PRIMARY KEY,
            captured_at     INTEGER NOT NULL,
            file_name       TEXT NOT NULL,
            byte_size       INTEGER NOT NULL,
            pixel_width     INTEGER NOT NULL,
            pixel_height    INTEGER NOT NULL,
            media_type      TEXT NOT NULL,
            album_name      TEXT,
            tags            INTEGER NOT NULL DEFAULT 0,
            decision        TEXT NOT NULL DEFAULT 'clean',
            phash           INTEGER,
            blur_score      REAL NOT NULL DEFAULT 0,
            document_score  REAL NOT NULL DEFAULT 0,
            similarity_score REAL NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_assets_captured ON assets(captured_at DESC, id);
        CREATE INDEX IF NOT EXISTS idx_assets_decision ON assets(decision, captured_at);
        CREATE INDEX IF NOT EXISTS idx_assets_size ON assets(byte_size);

        CREATE TABLE IF NOT EXISTS similarity_groups (
            id          TEXT PRIMARY KEY,
            confidence  REAL NOT NULL,
            cover_id    TEXT NOT NULL REFERENCES assets(id)
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id    TEXT NOT NULL REFERENCES similarity_groups(id),
            asset_id    TEXT NOT NULL REFERENCES assets(id),
            position    INTEGER NOT NULL,
            PRIMARY KEY (group_id, asset_id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_group_members_asset ON group_members(asset_id);

        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Stamp or verify the schema version. Refuses catalogs written by a newer build.
pub fn migrate(conn: &Connection) -> Result<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM config WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match stored.and_then(|v| v.parse::<u32>().ok()) {
        None => {
            conn.execute(
                "INSERT OR REPLACE INTO config (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(db) if db > SCHEMA_VERSION => {
            return Err(Error::SchemaTooNew {
                db,
                code: SCHEMA_VERSION,
            });
        }
        Some(_) => {}
    }
    Ok(())
}
