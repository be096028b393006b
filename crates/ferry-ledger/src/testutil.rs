use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use ferry_core::error::{FerryError, FerryResult};

use crate::sqlite_store::SqliteStore;
use crate::store::{Guard, Item, ItemStore, Order, Page, SkRange};

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn tmp_store() -> (PathBuf, SqliteStore) {
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("ferry_ledger_test_{}_{n}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let store = SqliteStore::open_or_create(&dir.join("ferry.db")).unwrap();
    (dir, store)
}

/// Delegates to a real store but fails reads and writes on poisoned partitions,
/// and can reject a number of upcoming guarded writes to simulate contention.
pub struct FlakyStore<'a> {
    pub inner: &'a SqliteStore,
    pub poisoned: Vec<String>,
    pub lose_races: RefCell<usize>,
}

impl<'a> FlakyStore<'a> {
    pub fn new(inner: &'a SqliteStore) -> Self {
        Self {
            inner,
            poisoned: Vec::new(),
            lose_races: RefCell::new(0),
        }
    }

    fn check(&self, pk: &str) -> FerryResult<()> {
        if self.poisoned.iter().any(|p| p == pk) {
            return Err(FerryError::storage(format!("partition {pk} unavailable")));
        }
        Ok(())
    }
}

impl ItemStore for FlakyStore<'_> {
    fn get(&self, pk: &str, sk: &str) -> FerryResult<Option<Item>> {
        self.check(pk)?;
        self.inner.get(pk, sk)
    }

    fn put(
        &self,
        pk: &str,
        sk: &str,
        body: &serde_json::Value,
        expires_at: Option<i64>,
        guard: Guard,
    ) -> FerryResult<bool> {
        self.check(pk)?;
        if matches!(guard, Guard::Version(_)) {
            let mut lose = self.lose_races.borrow_mut();
            if *lose > 0 {
                *lose -= 1;
                return Ok(false);
            }
        }
        self.inner.put(pk, sk, body, expires_at, guard)
    }

    fn set_field(
        &self,
        pk: &str,
        sk: &str,
        path: &str,
        value: &serde_json::Value,
        seed: &serde_json::Value,
    ) -> FerryResult<()> {
        self.check(pk)?;
        self.inner.set_field(pk, sk, path, value, seed)
    }

    fn query(
        &self,
        pk: &str,
        range: &SkRange,
        order: Order,
        cursor: Option<&str>,
        limit: usize,
    ) -> FerryResult<Page> {
        self.check(pk)?;
        self.inner.query(pk, range, order, cursor, limit)
    }
}
