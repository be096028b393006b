//! SQLite-backed item store and event outbox.
//!
//! One `ferry.db` file in WAL mode. Every record lives in `items`, keyed by
//! `(pk, sk)`; derived events wait in `outbox` until a dispatcher acks them.

use std::path::Path;

use ferry_core::clock::{now_sortable, unix_now};
use ferry_core::error::{FerryError, FerryResult};
use ferry_core::event::{EventBus, OutboundEvent, OutboxReader, PendingEvent};
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{Guard, Item, ItemStore, Order, Page, SkRange};

const SCHEMA_SQL: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS items (
    pk TEXT NOT NULL,
    sk TEXT NOT NULL,
    body TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    seq INTEGER NOT NULL,
    expires_at INTEGER,
    PRIMARY KEY (pk, sk)
);

CREATE INDEX IF NOT EXISTS idx_items_expires ON items(expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS outbox (
    rowid INTEGER PRIMARY KEY,
    event_id TEXT UNIQUE NOT NULL,
    ts TEXT NOT NULL,
    topic TEXT NOT NULL,
    dedup_key TEXT UNIQUE,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    delivered_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(rowid) WHERE delivered_at IS NULL;

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

type ItemRow = (String, String, String, i64, i64, Option<i64>);

const NEXT_SEQ: &str = "(SELECT COALESCE(MAX(seq), 0) + 1 FROM items)";

fn db_err(e: rusqlite::Error) -> FerryError {
    FerryError::storage(e)
}

/// SQLite-backed storage engine.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open an existing ferry.db.
    pub fn open(db_path: &Path) -> FerryResult<Self> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        let store = Self { conn };
        store.apply_pragmas()?;
        Ok(store)
    }

    /// Open or create ferry.db with full schema.
    pub fn open_or_create(db_path: &Path) -> FerryResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(FerryError::storage)?;
        }
        let conn = Connection::open(db_path).map_err(db_err)?;
        let store = Self { conn };
        store.apply_pragmas()?;
        store.apply_schema()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> FerryResult<()> {
        self.conn
            .execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )
            .map_err(db_err)
    }

    fn apply_schema(&self) -> FerryResult<()> {
        self.conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('version', '1')",
                [],
            )
            .map_err(db_err)?;
        Ok(())
    }

    // ── Maintenance ─────────────────────────────────────────────────

    /// Physically remove items whose expiry has passed. Returns the count.
    pub fn purge_expired(&self, now: i64) -> FerryResult<usize> {
        self.conn
            .execute(
                "DELETE FROM items WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
            .map_err(db_err)
    }

    /// Item counts per key family (the part of `pk` before the first `#`).
    pub fn item_counts(&self) -> FerryResult<Vec<(String, u64)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT CASE WHEN instr(pk, '#') > 0 THEN substr(pk, 1, instr(pk, '#') - 1)
                             ELSE pk END AS family,
                        COUNT(*)
                 FROM items GROUP BY family ORDER BY family",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows.into_iter().map(|(f, n)| (f, n.max(0) as u64)).collect())
    }

    fn map_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn row_to_item((pk, sk, body, version, seq, expires_at): ItemRow) -> FerryResult<Item> {
        let body = serde_json::from_str(&body).map_err(|e| FerryError::CorruptItem {
            pk: pk.clone(),
            sk: sk.clone(),
            message: e.to_string(),
        })?;
        Ok(Item {
            pk,
            sk,
            body,
            version: version.max(0) as u64,
            seq,
            expires_at,
        })
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        // Merge WAL back into main DB so users see a single file when idle.
        let _ = self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
    }
}

// ── Items ───────────────────────────────────────────────────────────

impl ItemStore for SqliteStore {
    fn get(&self, pk: &str, sk: &str) -> FerryResult<Option<Item>> {
        let row = self
            .conn
            .query_row(
                "SELECT pk, sk, body, version, seq, expires_at FROM items
                 WHERE pk = ?1 AND sk = ?2
                   AND (expires_at IS NULL OR expires_at > ?3)",
                params![pk, sk, unix_now()],
                Self::map_item,
            )
            .optional()
            .map_err(db_err)?;
        row.map(Self::row_to_item).transpose()
    }

    fn put(
        &self,
        pk: &str,
        sk: &str,
        body: &serde_json::Value,
        expires_at: Option<i64>,
        guard: Guard,
    ) -> FerryResult<bool> {
        let body = body.to_string();
        let changed = match guard {
            Guard::None => self
                .conn
                .execute(
                    &format!(
                        "INSERT INTO items (pk, sk, body, version, seq, expires_at)
                         VALUES (?1, ?2, ?3, 1, {NEXT_SEQ}, ?4)
                         ON CONFLICT(pk, sk) DO UPDATE SET
                             body = excluded.body,
                             version = items.version + 1,
                             expires_at = excluded.expires_at"
                    ),
                    params![pk, sk, body, expires_at],
                )
                .map_err(db_err)?,
            // An expired leftover counts as absent.
            Guard::Absent => self
                .conn
                .execute(
                    &format!(
                        "INSERT INTO items (pk, sk, body, version, seq, expires_at)
                         VALUES (?1, ?2, ?3, 1, {NEXT_SEQ}, ?4)
                         ON CONFLICT(pk, sk) DO UPDATE SET
                             body = excluded.body,
                             version = items.version + 1,
                             expires_at = excluded.expires_at
                         WHERE items.expires_at IS NOT NULL AND items.expires_at <= ?5"
                    ),
                    params![pk, sk, body, expires_at, unix_now()],
                )
                .map_err(db_err)?,
            Guard::Version(expected) => self
                .conn
                .execute(
                    "UPDATE items SET body = ?3, version = version + 1, expires_at = ?4
                     WHERE pk = ?1 AND sk = ?2 AND version = ?5",
                    params![pk, sk, body, expires_at, expected as i64],
                )
                .map_err(db_err)?,
        };
        Ok(changed == 1)
    }

    fn set_field(
        &self,
        pk: &str,
        sk: &str,
        path: &str,
        value: &serde_json::Value,
        seed: &serde_json::Value,
    ) -> FerryResult<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO items (pk, sk, body, version, seq, expires_at)
                     VALUES (?1, ?2, json_set(?3, ?4, json(?5)), 1, {NEXT_SEQ}, NULL)
                     ON CONFLICT(pk, sk) DO UPDATE SET
                         body = json_set(items.body, ?4, json(?5)),
                         version = items.version + 1"
                ),
                params![pk, sk, seed.to_string(), path, value.to_string()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn query(
        &self,
        pk: &str,
        range: &SkRange,
        order: Order,
        cursor: Option<&str>,
        limit: usize,
    ) -> FerryResult<Page> {
        let limit = limit.max(1);
        let (cursor_cmp, direction) = match order {
            Order::Ascending => (">", "ASC"),
            Order::Descending => ("<", "DESC"),
        };
        let sql = format!(
            "SELECT pk, sk, body, version, seq, expires_at FROM items
             WHERE pk = ?1
               AND (?2 IS NULL OR sk >= ?2)
               AND (?3 IS NULL OR sk <= ?3)
               AND (?4 IS NULL OR sk {cursor_cmp} ?4)
               AND (expires_at IS NULL OR expires_at > ?5)
             ORDER BY sk {direction}
             LIMIT ?6"
        );
        let mut stmt = self.conn.prepare(&sql).map_err(db_err)?;
        // One extra row tells us whether another page exists.
        let rows = stmt
            .query_map(
                params![
                    pk,
                    range.start,
                    range.end,
                    cursor,
                    unix_now(),
                    (limit + 1) as i64
                ],
                Self::map_item,
            )
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let has_more = rows.len() > limit;
        let items = rows
            .into_iter()
            .take(limit)
            .map(Self::row_to_item)
            .collect::<FerryResult<Vec<_>>>()?;
        let next = if has_more {
            items.last().map(|i| i.sk.clone())
        } else {
            None
        };
        Ok(Page { items, next })
    }
}

// ── Outbox ──────────────────────────────────────────────────────────

impl EventBus for SqliteStore {
    fn publish(&self, event: &OutboundEvent) -> FerryResult<bool> {
        let payload = event.payload.to_string();
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO outbox (event_id, ts, topic, dedup_key, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event.event_id, event.ts, event.topic, event.dedup_key, payload],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            tracing::debug!(
                topic = %event.topic,
                dedup_key = ?event.dedup_key,
                "duplicate event not enqueued"
            );
        }
        Ok(inserted == 1)
    }
}

impl OutboxReader for SqliteStore {
    fn pending(&self, limit: usize) -> FerryResult<Vec<PendingEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT event_id, ts, topic, dedup_key, payload, attempts, last_error
                 FROM outbox WHERE delivered_at IS NULL
                 ORDER BY rowid LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        rows.into_iter()
            .map(|(event_id, ts, topic, dedup_key, payload, attempts, last_error)| {
                let payload = serde_json::from_str(&payload).map_err(|e| {
                    FerryError::CorruptItem {
                        pk: "outbox".into(),
                        sk: event_id.clone(),
                        message: e.to_string(),
                    }
                })?;
                Ok(PendingEvent {
                    event: OutboundEvent {
                        event_id,
                        ts,
                        topic,
                        dedup_key,
                        payload,
                    },
                    attempts: attempts.max(0) as u32,
                    last_error,
                })
            })
            .collect()
    }

    fn ack(&self, event_id: &str) -> FerryResult<()> {
        self.conn
            .execute(
                "UPDATE outbox SET delivered_at = ?2, attempts = attempts + 1
                 WHERE event_id = ?1",
                params![event_id, now_sortable()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn nack(&self, event_id: &str, error: &str) -> FerryResult<()> {
        self.conn
            .execute(
                "UPDATE outbox SET attempts = attempts + 1, last_error = ?2
                 WHERE event_id = ?1",
                params![event_id, error],
            )
            .map_err(db_err)?;
        Ok(())
    }
}
