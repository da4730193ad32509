//! Counters shared between processes through one locked JSON file.

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use {
    chrono::Utc,
    fd_lock::RwLock,
    serde::{Deserialize, Serialize},
    tracing::error,
};

use crate::store::AccountingStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct StoredCounter {
    value: i64,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

impl StoredCounter {
    fn fresh(value: i64, ttl: Option<Duration>, now: i64) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| now.saturating_add(millis(ttl))),
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Counters = BTreeMap<String, StoredCounter>;

/// [`AccountingStore`] kept in a JSON file and guarded by an exclusive
/// advisory lock.
///
/// Each mutation is a locked read-modify-write of the whole file, so a
/// running server and one-shot CLI commands see the same counters. Expiry
/// uses wall-clock time and survives restarts.
///
/// The trait is infallible: on I/O errors reads fall back to `0` and
/// [`try_incr_below`](AccountingStore::try_incr_below) refuses admission.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the counter file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        open_file(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> io::Result<Counters> {
        let lock = RwLock::new(open_file(&self.path)?);
        let guard = lock.read()?;
        decode(&*guard)
    }

    /// Run `apply` on the live counters under the write lock and persist
    /// the result. Also returns how many expired entries were dropped.
    fn update<R>(&self, apply: impl FnOnce(&mut Counters, i64) -> R) -> io::Result<(R, usize)> {
        let mut lock = RwLock::new(open_file(&self.path)?);
        let mut guard = lock.write()?;
        let file: &mut File = &mut guard;

        let mut counters = decode(&mut *file)?;
        let now = now_millis();
        let before = counters.len();
        counters.retain(|_, c| !c.is_expired(now));
        let purged = before - counters.len();
        let result = apply(&mut counters, now);

        let body = serde_json::to_vec(&counters).map_err(io::Error::other)?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(&body)?;
        file.flush()?;
        Ok((result, purged))
    }

    fn mutate<R>(
        &self,
        op: &'static str,
        key: &str,
        fallback: R,
        apply: impl FnOnce(&mut Counters, i64) -> R,
    ) -> R {
        match self.update(apply) {
            Ok((result, _)) => result,
            Err(e) => {
                error!(path = %self.path.display(), op, key, error = %e, "counter update failed");
                fallback
            },
        }
    }
}

impl AccountingStore for FileStore {
    fn get(&self, key: &str) -> i64 {
        match self.load() {
            Ok(counters) => {
                let now = now_millis();
                counters
                    .get(key)
                    .filter(|c| !c.is_expired(now))
                    .map_or(0, |c| c.value)
            },
            Err(e) => {
                error!(path = %self.path.display(), key, error = %e, "counter read failed");
                0
            },
        }
    }

    fn set(&self, key: &str, value: i64, ttl: Option<Duration>) {
        self.mutate("set", key, (), |counters, now| {
            counters.insert(key.to_string(), StoredCounter::fresh(value, ttl, now));
        });
    }

    fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> i64 {
        self.mutate("incr", key, 0, |counters, now| {
            let counter = counters
                .entry(key.to_string())
                .or_insert_with(|| StoredCounter::fresh(0, ttl, now));
            counter.value = counter.value.saturating_add(delta);
            counter.value
        })
    }

    fn decr(&self, key: &str, delta: i64) -> i64 {
        self.mutate("decr", key, 0, |counters, _| {
            let Some(counter) = counters.get_mut(key) else {
                return 0;
            };
            counter.value = counter.value.saturating_sub(delta).max(0);
            let value = counter.value;
            if value == 0 {
                counters.remove(key);
            }
            value
        })
    }

    fn try_incr_below(&self, key: &str, limit: i64, ttl: Option<Duration>) -> Option<i64> {
        self.mutate("try_incr_below", key, None, |counters, now| {
            let counter = counters
                .get(key)
                .copied()
                .unwrap_or_else(|| StoredCounter::fresh(0, ttl, now));
            if counter.value >= limit {
                return None;
            }
            let next = StoredCounter {
                value: counter.value + 1,
                ..counter
            };
            counters.insert(key.to_string(), next);
            Some(next.value)
        })
    }

    fn purge_expired(&self) -> usize {
        match self.update(|_, _| ()) {
            Ok(((), purged)) => purged,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "counter purge failed");
                0
            },
        }
    }
}

fn open_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn decode(mut reader: impl Read) -> io::Result<Counters> {
    let mut raw = String::new();
    reader.read_to_string(&mut raw)?;
    if raw.trim().is_empty() {
        return Ok(Counters::new());
    }
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> FileStore {
        FileStore::open(dir.path().join("accounting/counters.json")).unwrap()
    }

    #[test]
    fn separate_handles_share_counters() {
        let dir = tempfile::tempdir().unwrap();
        let a = store_in(&dir);
        let b = store_in(&dir);

        assert_eq!(a.incr("builds:7:2026-01-01", 1, Some(Duration::from_secs(60))), 1);
        assert_eq!(b.incr("builds:7:2026-01-01", 1, None), 2);
        assert_eq!(a.get("builds:7:2026-01-01"), 2);
        assert_eq!(b.get("missing"), 0);
    }

    #[test]
    fn admission_limit_holds_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let a = store_in(&dir);
        let b = store_in(&dir);

        assert_eq!(a.try_incr_below("active_jobs", 2, None), Some(1));
        assert_eq!(b.try_incr_below("active_jobs", 2, None), Some(2));
        assert_eq!(a.try_incr_below("active_jobs", 2, None), None);
        assert_eq!(b.decr("active_jobs", 1), 1);
        assert_eq!(a.try_incr_below("active_jobs", 2, None), Some(2));
    }

    #[test]
    fn expired_entries_read_zero_and_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.set("short", 5, Some(Duration::ZERO));
        store.set("forever", 1, None);
        assert_eq!(store.get("short"), 0);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.get("forever"), 1);
        assert_eq!(store.incr("short", 1, None), 1);
    }

    #[test]
    fn decr_to_zero_removes_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.decr("k", 1), 0);
        store.incr("k", 2, None);
        assert_eq!(store.decr("k", 5), 0);
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("\"k\""), "{raw}");
    }

    #[test]
    fn concurrent_handles_are_lossless() {
        let dir = tempfile::tempdir().unwrap();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let store = store_in(&dir);
                    for _ in 0..25 {
                        store.incr("n", 1, None);
                    }
                });
            }
        });
        assert_eq!(store_in(&dir).get("n"), 200);
    }

    #[test]
    fn corrupt_file_refuses_admission() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{not json").unwrap();
        assert_eq!(store.get("active_jobs"), 0);
        assert_eq!(store.try_incr_below("active_jobs", 4, None), None);
    }
}
