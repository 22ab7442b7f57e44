use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source record parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("source backend error: {0}")]
    Backend(String),
}

/// One identifier as projected by the authoritative store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub identifier: String,
    pub owner_id: String,
    pub owner_username: String,
    pub target: String,
    pub is_public: bool,
    pub is_test: bool,
    /// True when the target is the service-generated placeholder URL.
    pub is_default_target: bool,
}

impl SourceRecord {
    /// Whether the reconciler should track this identifier at all.
    pub fn is_checkable(&self) -> bool {
        self.is_public && !self.is_test && !self.is_default_target
    }
}

/// Read access to the authoritative identifier store.
#[async_trait]
pub trait IdentifierSource: Send + Sync {
    /// One page of records with identifier strictly greater than `after`,
    /// ascending by identifier.
    async fn fetch_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, SourceError>;

    /// Username-to-owner-handle map, for resolving exclusion-file entries.
    async fn owner_directory(&self) -> Result<HashMap<String, String>, SourceError>;
}

/// Identifier store read from a JSONL export, one record per line.
pub struct JsonlSource {
    records: Vec<SourceRecord>,
}

impl JsonlSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let raw = std::fs::read_to_string(path)?;
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str::<SourceRecord>(line)?);
        }
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(Self { records })
    }
}

fn page_of(records: &[SourceRecord], after: Option<&str>, limit: usize) -> Vec<SourceRecord> {
    let start = match after {
        Some(cursor) => records.partition_point(|r| r.identifier.as_str() <= cursor),
        None => 0,
    };
    records[start..].iter().take(limit).cloned().collect()
}

fn directory_of(records: &[SourceRecord]) -> HashMap<String, String> {
    records
        .iter()
        .map(|r| (r.owner_username.clone(), r.owner_id.clone()))
        .collect()
}

#[async_trait]
impl IdentifierSource for JsonlSource {
    async fn fetch_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        Ok(page_of(&self.records, after, limit))
    }

    async fn owner_directory(&self) -> Result<HashMap<String, String>, SourceError> {
        Ok(directory_of(&self.records))
    }
}

/// In-memory identifier store. Backs the test scenarios and local dry runs;
/// contents can be swapped between reconcile cycles.
#[derive(Default)]
pub struct MemorySource {
    records: parking_lot::RwLock<Vec<SourceRecord>>,
    fail_paging: AtomicBool,
}

impl MemorySource {
    pub fn new(mut records: Vec<SourceRecord>) -> Self {
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Self {
            records: parking_lot::RwLock::new(records),
            fail_paging: AtomicBool::new(false),
        }
    }

    pub fn replace(&self, mut records: Vec<SourceRecord>) {
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        *self.records.write() = records;
    }

    /// Make subsequent `fetch_page` calls fail, to exercise abort paths.
    pub fn set_fail_paging(&self, fail: bool) {
        self.fail_paging.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentifierSource for MemorySource {
    async fn fetch_page(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        if self.fail_paging.load(Ordering::SeqCst) {
            return Err(SourceError::Backend("paging failure injected".to_string()));
        }
        Ok(page_of(&self.records.read(), after, limit))
    }

    async fn owner_directory(&self) -> Result<HashMap<String, String>, SourceError> {
        Ok(directory_of(&self.records.read()))
    }
}

/// Lazy ascending reader over an identifier source, one page at a time.
/// The source side of the reconciler merge-join.
pub struct SourcePager<'a> {
    source: &'a dyn IdentifierSource,
    page_size: usize,
    cursor: Option<String>,
    buffer: VecDeque<SourceRecord>,
    exhausted: bool,
}

impl<'a> SourcePager<'a> {
    pub fn new(source: &'a dyn IdentifierSource, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub async fn next_record(&mut self) -> Result<Option<SourceRecord>, SourceError> {
        if let Some(record) = self.buffer.pop_front() {
            return Ok(Some(record));
        }
        if self.exhausted {
            return Ok(None);
        }
        let page = self
            .source
            .fetch_page(self.cursor.as_deref(), self.page_size)
            .await?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.cursor = page.last().map(|r| r.identifier.clone());
        self.buffer = page.into();
        Ok(self.buffer.pop_front())
    }
}
