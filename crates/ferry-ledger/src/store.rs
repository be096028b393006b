//! Key-value item store contract: single-item atomic writes, optional
//! compare-and-set guards, sort-key range queries with continuation cursors,
//! and a per-item expiry attribute.

use ferry_core::error::{FerryError, FerryResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One stored item.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub pk: String,
    pub sk: String,
    pub body: serde_json::Value,
    /// Incremented on every write; starts at 1.
    pub version: u64,
    /// Arrival order, assigned on first insert and kept by later upserts.
    pub seq: i64,
    /// Unix seconds after which the item is invisible.
    pub expires_at: Option<i64>,
}

impl Item {
    pub fn decode<T: DeserializeOwned>(&self) -> FerryResult<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| FerryError::CorruptItem {
            pk: self.pk.clone(),
            sk: self.sk.clone(),
            message: e.to_string(),
        })
    }
}

/// Write precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// Unconditional upsert.
    None,
    /// Only if no live item exists under the key.
    Absent,
    /// Only if the stored version still equals this one.
    Version(u64),
}

/// Inclusive sort-key bounds; `None` is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl SkRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }

    pub fn from(start: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: None,
        }
    }

    /// Every sort key starting with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        Self::between(prefix, format!("{prefix}\u{10FFFF}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// One page of a range query.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Item>,
    /// Resume point for the next page; `None` once the range is exhausted.
    pub next: Option<String>,
}

pub trait ItemStore {
    fn get(&self, pk: &str, sk: &str) -> FerryResult<Option<Item>>;

    /// Write `body` under `(pk, sk)`. Returns `false` when the guard did not hold.
    fn put(
        &self,
        pk: &str,
        sk: &str,
        body: &serde_json::Value,
        expires_at: Option<i64>,
        guard: Guard,
    ) -> FerryResult<bool>;

    /// Set one attribute at a JSON `path`, creating the item from `seed` first
    /// if it does not exist. Atomic at the item level.
    fn set_field(
        &self,
        pk: &str,
        sk: &str,
        path: &str,
        value: &serde_json::Value,
        seed: &serde_json::Value,
    ) -> FerryResult<()>;

    /// Live items under `pk` within `range`, strictly after `cursor` in scan order.
    fn query(
        &self,
        pk: &str,
        range: &SkRange,
        order: Order,
        cursor: Option<&str>,
        limit: usize,
    ) -> FerryResult<Page>;
}

// ── Typed helpers ──

/// A decoded body with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

pub fn load<T: DeserializeOwned>(
    store: &dyn ItemStore,
    pk: &str,
    sk: &str,
) -> FerryResult<Option<Versioned<T>>> {
    match store.get(pk, sk)? {
        Some(item) => Ok(Some(Versioned {
            value: item.decode()?,
            version: item.version,
        })),
        None => Ok(None),
    }
}

pub fn save<T: Serialize>(
    store: &dyn ItemStore,
    pk: &str,
    sk: &str,
    value: &T,
    expires_at: Option<i64>,
    guard: Guard,
) -> FerryResult<bool> {
    let body = encode(pk, sk, value)?;
    store.put(pk, sk, &body, expires_at, guard)
}

/// Serialize a body destined for `pk`/`sk`. Failures are not retryable.
pub fn encode<T: Serialize>(pk: &str, sk: &str, value: &T) -> FerryResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| FerryError::CorruptItem {
        pk: pk.to_string(),
        sk: sk.to_string(),
        message: e.to_string(),
    })
}

/// Drain every page of a range query.
pub fn query_all(
    store: &dyn ItemStore,
    pk: &str,
    range: &SkRange,
    order: Order,
    page_size: usize,
) -> FerryResult<Vec<Item>> {
    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = store.query(pk, range, order, cursor.as_deref(), page_size)?;
        out.extend(page.items);
        match page.next {
            Some(next) => cursor = Some(next),
            None => return Ok(out),
        }
    }
}
