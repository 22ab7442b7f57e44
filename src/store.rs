use crate::models::LinkRow;
use sled::{Db, Tree};
use std::ops::Bound;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("row encoding error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt owner index key")]
    CorruptIndex,
}

// Owner index keys are `owner \0 identifier`; identifiers and owner handles
// never contain NUL.
const OWNER_SEP: u8 = 0;

fn owner_key(owner_id: &str, identifier: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner_id.len() + 1 + identifier.len());
    key.extend_from_slice(owner_id.as_bytes());
    key.push(OWNER_SEP);
    key.extend_from_slice(identifier.as_bytes());
    key
}

/// The checker's persistent row table, keyed by identifier.
///
/// sled's ordered keyspace provides the ascending paged scan the reconciler
/// merge-join needs; a secondary `owner \0 identifier` tree serves the
/// per-owner workset queries.
pub struct LinkStore {
    db: Db,
    rows: Tree,
    owner_index: Tree,
}

impl LinkStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let rows = db.open_tree("rows")?;
        let owner_index = db.open_tree("owner_index")?;
        Ok(Self { db, rows, owner_index })
    }

    fn decode(bytes: &[u8]) -> Result<LinkRow, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Insert or update a row, keeping the owner index in step.
    pub fn put(&self, row: &LinkRow) -> Result<(), StoreError> {
        if let Some(old) = self.get(&row.identifier)? {
            if old.owner_id != row.owner_id {
                self.owner_index
                    .remove(owner_key(&old.owner_id, &old.identifier))?;
            }
        }
        let encoded = serde_json::to_vec(row)?;
        self.rows.insert(row.identifier.as_bytes(), encoded)?;
        self.owner_index
            .insert(owner_key(&row.owner_id, &row.identifier), vec![])?;
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Result<Option<LinkRow>, StoreError> {
        match self.rows.get(identifier.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, identifier: &str) -> Result<Option<LinkRow>, StoreError> {
        match self.rows.remove(identifier.as_bytes())? {
            Some(bytes) => {
                let row = Self::decode(&bytes)?;
                self.owner_index.remove(owner_key(&row.owner_id, &row.identifier))?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    /// One page of rows with identifier strictly greater than `after`,
    /// ascending by identifier.
    pub fn scan_page(&self, after: Option<&str>, limit: usize) -> Result<Vec<LinkRow>, StoreError> {
        let iter = match after {
            Some(cursor) => self.rows.range((
                Bound::Excluded(cursor.as_bytes().to_vec()),
                Bound::Unbounded,
            )),
            None => self.rows.iter(),
        };
        let mut page = Vec::with_capacity(limit.min(1024));
        for item in iter.take(limit) {
            let (_, bytes) = item?;
            page.push(Self::decode(&bytes)?);
        }
        Ok(page)
    }

    /// Distinct owners with at least one row, ascending.
    pub fn owners(&self) -> Result<Vec<String>, StoreError> {
        let mut owners: Vec<String> = Vec::new();
        for item in self.owner_index.iter() {
            let (key, _) = item?;
            let sep = key
                .iter()
                .position(|&b| b == OWNER_SEP)
                .ok_or(StoreError::CorruptIndex)?;
            let owner = String::from_utf8(key[..sep].to_vec())
                .map_err(|_| StoreError::CorruptIndex)?;
            if owners.last().map(String::as_str) != Some(owner.as_str()) {
                owners.push(owner);
            }
        }
        Ok(owners)
    }

    /// Up to `limit` of an owner's rows matching the verdict class, last
    /// checked before `checked_before`, ascending by `last_check_time` so the
    /// longest-unvisited links come first. `want_bad == false` selects
    /// good-or-unvisited rows (unvisited rows carry time 0 and sort first).
    pub fn candidates(
        &self,
        owner_id: &str,
        want_bad: bool,
        checked_before: u64,
        limit: usize,
    ) -> Result<Vec<LinkRow>, StoreError> {
        let mut prefix = owner_id.as_bytes().to_vec();
        prefix.push(OWNER_SEP);

        let mut matches = Vec::new();
        for item in self.owner_index.scan_prefix(&prefix) {
            let (key, _) = item?;
            let identifier = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|_| StoreError::CorruptIndex)?;
            let Some(row) = self.get(identifier)? else {
                continue;
            };
            if row.is_bad == want_bad && row.last_check_time < checked_before {
                matches.push(row);
            }
        }
        matches.sort_by(|a, b| {
            a.last_check_time
                .cmp(&b.last_check_time)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    /// Rows an external notifier should act on.
    pub fn notification_worthy(
        &self,
        threshold: usize,
        min_span_secs: u64,
        now: u64,
    ) -> Result<Vec<LinkRow>, StoreError> {
        let mut worthy = Vec::new();
        for item in self.rows.iter() {
            let (_, bytes) = item?;
            let row = Self::decode(&bytes)?;
            if row.is_notification_worthy(threshold, min_span_secs, now) {
                worthy.push(row);
            }
        }
        Ok(worthy)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Lazy ascending reader over the whole row table, one page at a time.
/// Feeds the reconciler merge-join without holding the table in memory.
pub struct StorePager<'a> {
    store: &'a LinkStore,
    page_size: usize,
    cursor: Option<String>,
    page: std::vec::IntoIter<LinkRow>,
    exhausted: bool,
}

impl<'a> StorePager<'a> {
    pub fn new(store: &'a LinkStore, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            cursor: None,
            page: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    pub fn next_row(&mut self) -> Result<Option<LinkRow>, StoreError> {
        if let Some(row) = self.page.next() {
            return Ok(Some(row));
        }
        if self.exhausted {
            return Ok(None);
        }
        let page = self.store.scan_page(self.cursor.as_deref(), self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.cursor = page.last().map(|r| r.identifier.clone());
        self.page = page.into_iter();
        Ok(self.page.next())
    }
}
