use crate::exclusions::ExclusionRegistry;
use crate::models::LinkRow;
use crate::source::{IdentifierSource, SourceError, SourcePager, SourceRecord};
use crate::store::{LinkStore, StoreError, StorePager};
use thiserror::Error;

/// Rows fetched per page on both sides of the merge-join.
pub const RECONCILE_PAGE_SIZE: usize = 1000;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("identifier store paging failed: {0}")]
    Source(#[from] SourceError),
    #[error("row table scan failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub inserted: u64,
    pub deleted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl std::fmt::Display for ReconcileStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} inserted, {} deleted, {} updated, {} unchanged",
            self.inserted, self.deleted, self.updated, self.unchanged
        )
    }
}

/// Next source record worth tracking: public, non-test, non-default-target,
/// and not owned by a permanently excluded owner.
async fn next_checkable(
    pager: &mut SourcePager<'_>,
    exclusions: &ExclusionRegistry,
) -> Result<Option<SourceRecord>, SourceError> {
    loop {
        match pager.next_record().await? {
            Some(r) if !r.is_checkable() || exclusions.is_permanent(&r.owner_id) => continue,
            other => return Ok(other),
        }
    }
}

/// Merge-join the checker's row table against the authoritative identifier
/// store, both streamed ascending by identifier in bounded pages.
///
/// Rows missing from the filtered source are deleted; source records missing
/// from the table are inserted unvisited; rows whose (owner, target) pair
/// changed are rewritten with their history cleared. Per-row persistence
/// failures are logged and skipped; a paging failure on either side aborts
/// the cycle, which the next cycle retries from scratch.
pub async fn reconcile(
    store: &LinkStore,
    source: &dyn IdentifierSource,
    exclusions: &ExclusionRegistry,
    page_size: usize,
) -> Result<ReconcileStats, ReconcileError> {
    exclusions.refresh();

    let mut stats = ReconcileStats::default();
    let mut left_pager = StorePager::new(store, page_size);
    let mut right_pager = SourcePager::new(source, page_size);

    let mut left = left_pager.next_row()?;
    let mut right = next_checkable(&mut right_pager, exclusions).await?;

    loop {
        match (left, right) {
            (None, None) => break,
            (Some(l), None) => {
                apply_delete(store, l, &mut stats);
                left = left_pager.next_row()?;
                right = None;
            }
            (None, Some(r)) => {
                apply_insert(store, r, &mut stats);
                left = None;
                right = next_checkable(&mut right_pager, exclusions).await?;
            }
            (Some(l), Some(r)) => match l.identifier.cmp(&r.identifier) {
                std::cmp::Ordering::Less => {
                    apply_delete(store, l, &mut stats);
                    left = left_pager.next_row()?;
                    right = Some(r);
                }
                std::cmp::Ordering::Greater => {
                    apply_insert(store, r, &mut stats);
                    left = Some(l);
                    right = next_checkable(&mut right_pager, exclusions).await?;
                }
                std::cmp::Ordering::Equal => {
                    apply_update(store, l, r, &mut stats);
                    left = left_pager.next_row()?;
                    right = next_checkable(&mut right_pager, exclusions).await?;
                }
            },
        }
    }

    Ok(stats)
}

fn apply_delete(store: &LinkStore, row: LinkRow, stats: &mut ReconcileStats) {
    match store.remove(&row.identifier) {
        Ok(_) => stats.deleted += 1,
        Err(e) => tracing::warn!(
            identifier = %row.identifier,
            error = %e,
            "failed to delete row; skipping"
        ),
    }
}

fn apply_insert(store: &LinkStore, record: SourceRecord, stats: &mut ReconcileStats) {
    let row = LinkRow::new(record.identifier, record.owner_id, record.target);
    match store.put(&row) {
        Ok(()) => stats.inserted += 1,
        Err(e) => tracing::warn!(
            identifier = %row.identifier,
            error = %e,
            "failed to insert row; skipping"
        ),
    }
}

fn apply_update(
    store: &LinkStore,
    mut row: LinkRow,
    record: SourceRecord,
    stats: &mut ReconcileStats,
) {
    if row.owner_id == record.owner_id && row.target == record.target {
        stats.unchanged += 1;
        return;
    }
    row.retarget(record.owner_id, record.target);
    match store.put(&row) {
        Ok(()) => stats.updated += 1,
        Err(e) => tracing::warn!(
            identifier = %row.identifier,
            error = %e,
            "failed to rewrite row; skipping"
        ),
    }
}
