//! Shard-file storage engine
//!
//! Layout: `<data_dir>/<prefix>.db`, where `prefix` is the leading hex of the
//! key's ring position. Each file holds newline-delimited records:
//!
//! ```text
//! escaped-key,escaped-value\n
//! ```
//!
//! `\`, `,`, CR and LF are backslash-escaped (`\\`, `\,`, `\r`, `\n`) so a raw
//! comma or line break always belongs to the format. A delete removes the line.
//!
//! Each shard is guarded by one of `LOCK_STRIPES` mutexes; the lock is held for
//! the whole file access, so two puts to the same key never interleave.

use crate::common::{Error, KeyHasher, Result, RingPosition};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Number of lock stripes shared by all shards
pub const LOCK_STRIPES: usize = 64;

const SHARD_EXT: &str = "db";

/// Result of a `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
    Deleted,
    /// Delete of a key that was not stored
    DeleteMissing,
}

/// Escape one record field.
pub fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Format one record line (with its terminator).
pub fn format_record(key: &str, value: &str) -> String {
    format!("{},{}\n", escape(key), escape(value))
}

/// Split a record line at its first unescaped comma and unescape both fields.
pub fn parse_record(line: &str) -> Result<(String, String)> {
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        let out = if in_value { &mut value } else { &mut key };
        match c {
            '\\' => match chars.next() {
                Some('\\') => out.push('\\'),
                Some(',') => out.push(','),
                Some('r') => out.push('\r'),
                Some('n') => out.push('\n'),
                Some(other) => {
                    return Err(Error::Corrupted(format!("unknown escape \\{}", other)))
                }
                None => return Err(Error::Corrupted("dangling escape".into())),
            },
            ',' if !in_value => in_value = true,
            c => out.push(c),
        }
    }

    if !in_value {
        return Err(Error::Corrupted(format!("record without delimiter: {}", line)));
    }
    Ok((key, value))
}

/// File-backed key-value store partitioned into shards
pub struct ShardStore {
    root: PathBuf,
    hasher: Arc<dyn KeyHasher>,
    prefix_len: usize,
    stripes: Vec<Mutex<()>>,
}

impl ShardStore {
    pub fn open(root: impl AsRef<Path>, hasher: Arc<dyn KeyHasher>, prefix_len: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        // Leftovers from an interrupted rewrite
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("tmp") {
                fs::remove_file(&path)?;
            }
        }

        tracing::info!("Shard store opened at {:?}", root);

        Ok(Self {
            root,
            hasher,
            prefix_len: prefix_len.max(1),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn position_of(&self, key: &str) -> RingPosition {
        self.hasher.position_of(key)
    }

    fn shard_of(&self, key: &str) -> String {
        self.position_of(key).prefix(self.prefix_len).to_string()
    }

    fn shard_path(&self, shard: &str) -> PathBuf {
        self.root.join(format!("{}.{}", shard, SHARD_EXT))
    }

    fn lock(&self, shard: &str) -> MutexGuard<'_, ()> {
        let stripe = u64::from_str_radix(shard, 16).unwrap_or(0) as usize % self.stripes.len();
        self.stripes[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Read all records of a shard (caller holds the shard lock).
    fn read_records(&self, shard: &str) -> Result<Vec<(String, String)>> {
        let content = match fs::read_to_string(self.shard_path(shard)) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(parse_record)
            .collect()
    }

    /// Replace a shard's content (caller holds the shard lock).
    fn write_records(&self, shard: &str, records: &[(String, String)]) -> Result<()> {
        let path = self.shard_path(shard);
        if records.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        let tmp = self.root.join(format!("{}.{}.tmp", shard, SHARD_EXT));
        let mut content = String::new();
        for (key, value) in records {
            content.push_str(&format_record(key, value));
        }
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn append_record(&self, shard: &str, key: &str, value: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.shard_path(shard))?;
        file.write_all(format_record(key, value).as_bytes())?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.get_then(key, |value| value.map(str::to_string))
    }

    /// Read `key` and hand the value to `then` before the shard lock is released.
    pub fn get_then<T>(&self, key: &str, then: impl FnOnce(Option<&str>) -> T) -> Result<T> {
        let shard = self.shard_of(key);
        let _guard = self.lock(&shard);
        let value = self
            .read_records(&shard)?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v);
        Ok(then(value.as_deref()))
    }

    /// Insert, update or (with `None`) delete a key.
    pub fn put(&self, key: &str, value: Option<&str>) -> Result<PutOutcome> {
        self.put_then(key, value, |outcome| outcome)
    }

    /// Write like `put`, then hand the result to `then` while the shard lock
    /// is still held. Writes to one key reach `then` in storage order.
    pub fn put_then<T>(
        &self,
        key: &str,
        value: Option<&str>,
        then: impl FnOnce(Result<PutOutcome>) -> T,
    ) -> T {
        let shard = self.shard_of(key);
        let _guard = self.lock(&shard);
        then(self.write_locked(&shard, key, value))
    }

    fn write_locked(&self, shard: &str, key: &str, value: Option<&str>) -> Result<PutOutcome> {
        let mut records = self.read_records(shard)?;
        let existing = records.iter().position(|(k, _)| k == key);

        match (existing, value) {
            (Some(idx), Some(value)) => {
                if records[idx].1 != value {
                    records[idx].1 = value.to_string();
                    self.write_records(shard, &records)?;
                }
                Ok(PutOutcome::Updated)
            }
            (Some(idx), None) => {
                records.remove(idx);
                self.write_records(shard, &records)?;
                Ok(PutOutcome::Deleted)
            }
            (None, Some(value)) => {
                self.append_record(shard, key, value)?;
                Ok(PutOutcome::Inserted)
            }
            (None, None) => Ok(PutOutcome::DeleteMissing),
        }
    }

    fn shards(&self) -> Result<Vec<String>> {
        let mut shards = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(SHARD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                shards.push(stem.to_string());
            }
        }
        shards.sort();
        Ok(shards)
    }

    /// Records whose key position lies in `(start, end]`.
    pub fn entries_in_range(
        &self,
        start: &RingPosition,
        end: &RingPosition,
    ) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::new();
        for shard in self.shards()? {
            let _guard = self.lock(&shard);
            entries.extend(
                self.read_records(&shard)?
                    .into_iter()
                    .filter(|(k, _)| self.position_of(k).in_range(start, end)),
            );
        }
        Ok(entries)
    }

    /// Keys whose position lies in `(start, end]`.
    pub fn list_keys(&self, start: &RingPosition, end: &RingPosition) -> Result<Vec<String>> {
        Ok(self
            .entries_in_range(start, end)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }

    /// Delete every record in `(start, end]`; returns how many were removed.
    pub fn remove_range(&self, start: &RingPosition, end: &RingPosition) -> Result<usize> {
        self.remove_range_then(start, end, |_| {})
    }

    /// Like `remove_range`; `on_removed` sees each removed key under its shard lock.
    pub fn remove_range_then(
        &self,
        start: &RingPosition,
        end: &RingPosition,
        mut on_removed: impl FnMut(&str),
    ) -> Result<usize> {
        let mut removed = 0;
        for shard in self.shards()? {
            let _guard = self.lock(&shard);
            let (gone, kept): (Vec<_>, Vec<_>) = self
                .read_records(&shard)?
                .into_iter()
                .partition(|(k, _)| self.position_of(k).in_range(start, end));
            if !gone.is_empty() {
                self.write_records(&shard, &kept)?;
                for (key, _) in &gone {
                    on_removed(key);
                }
                removed += gone.len();
            }
        }
        Ok(removed)
    }

    /// Total number of stored records.
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for shard in self.shards()? {
            let _guard = self.lock(&shard);
            total += self.read_records(&shard)?.len();
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DigestHasher;
    use tempfile::tempdir;

    fn open(dir: &Path) -> ShardStore {
        ShardStore::open(dir, Arc::new(DigestHasher::default()), 2).unwrap()
    }

    #[test]
    fn test_escape_roundtrip() {
        for raw in ["plain", "a,b", "back\\slash", "line\nbreak", "cr\r\n", ",\\,\\\\", ""] {
            let line = format_record(raw, raw);
            assert_eq!(line.matches('\n').count(), 1);
            let (k, v) = parse_record(line.trim_end_matches('\n')).unwrap();
            assert_eq!(k, raw);
            assert_eq!(v, raw);
        }
    }

    #[test]
    fn test_parse_rejects_bad_records() {
        assert!(parse_record("no-delimiter").is_err());
        assert!(parse_record("key,bad\\q").is_err());
        assert!(parse_record("key,dangling\\").is_err());
    }

    #[test]
    fn test_put_get() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        assert_eq!(store.put("key1", Some("value1")).unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put("key2", Some("value2")).unwrap(), PutOutcome::Inserted);

        assert_eq!(store.get("key1").unwrap().as_deref(), Some("value1"));
        assert_eq!(store.get("key2").unwrap().as_deref(), Some("value2"));
        assert!(store.get("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_special_characters_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let key = "k,\\\n";
        let value = "v1,v2\\n\r\nend,";
        store.put(key, Some(value)).unwrap();
        store.put("other", Some("x")).unwrap();
        assert_eq!(store.get(key).unwrap().as_deref(), Some(value));
    }

    #[test]
    fn test_update_semantics() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        assert_eq!(store.put("k", Some("v1")).unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put("k", Some("v2")).unwrap(), PutOutcome::Updated);
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));

        let shard = store.shard_path(&store.shard_of("k"));
        let before = fs::read_to_string(&shard).unwrap();
        assert_eq!(store.put("k", Some("v2")).unwrap(), PutOutcome::Updated);
        assert_eq!(fs::read_to_string(&shard).unwrap(), before);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_delete_semantics() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store.put("k", Some("v")).unwrap();
        assert_eq!(store.put("k", None).unwrap(), PutOutcome::Deleted);
        assert!(store.get("k").unwrap().is_none());
        assert_eq!(store.put("k", None).unwrap(), PutOutcome::DeleteMissing);
        assert_eq!(store.put("never", None).unwrap(), PutOutcome::DeleteMissing);
    }

    #[test]
    fn test_delete_keeps_neighbours() {
        let dir = tempdir().unwrap();
        let store = ShardStore::open(dir.path(), Arc::new(DigestHasher::default()), 1).unwrap();

        for i in 0..50 {
            store.put(&format!("key_{}", i), Some(&format!("value_{}", i))).unwrap();
        }
        store.put("key_10", None).unwrap();
        store.put("key_11", Some("changed")).unwrap();

        assert_eq!(store.len().unwrap(), 49);
        assert!(store.get("key_10").unwrap().is_none());
        assert_eq!(store.get("key_11").unwrap().as_deref(), Some("changed"));
        assert_eq!(store.get("key_49").unwrap().as_deref(), Some("value_49"));
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        {
            let store = open(dir.path());
            store.put("key1", Some("value1")).unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.get("key1").unwrap().as_deref(), Some("value1"));
    }

    #[test]
    fn test_ranges() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for i in 0..40 {
            store.put(&format!("key_{}", i), Some("v")).unwrap();
        }

        let whole = RingPosition::from_hex("0");
        assert_eq!(store.list_keys(&whole, &whole).unwrap().len(), 40);

        let mid = RingPosition::from_hex("8");
        let low = store.list_keys(&whole, &mid).unwrap();
        let high = store.list_keys(&mid, &whole).unwrap();
        assert_eq!(low.len() + high.len(), 40);
        for key in &low {
            assert!(store.position_of(key).in_range(&whole, &mid));
        }

        let removed = store.remove_range(&whole, &mid).unwrap();
        assert_eq!(removed, low.len());
        assert_eq!(store.len().unwrap(), high.len());
        assert!(store.list_keys(&whole, &mid).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_puts() {
        let dir = tempdir().unwrap();
        let store = Arc::new(open(dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store
                            .put(&format!("t{}_{}", t, i), Some(&format!("{}", i)))
                            .unwrap();
                        store.put("shared", Some(&format!("t{}", t))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len().unwrap(), 8 * 25 + 1);
        assert!(store.get("shared").unwrap().unwrap().starts_with('t'));
    }
}
