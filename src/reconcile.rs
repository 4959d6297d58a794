//! Merge of the local row set with the freshly fetched remote one.
//!
//! Remote wins for every key it reports. Keys only present locally are kept
//! untouched: the listing is what the server currently knows, not a record
//! of deletions.

use crate::row::{RowSet, Upserted};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Remote keys that were not in the local set.
    pub added: usize,
    /// Keys in both sets whose row changed.
    pub updated: usize,
    /// Keys in both sets with identical rows.
    pub unchanged: usize,
    /// Local keys the remote did not report.
    pub kept_local: usize,
}

#[derive(Debug)]
pub struct Reconciled {
    pub rows: RowSet,
    pub stats: MergeStats,
}

/// Combine `local` and `remote`.
///
/// The result keeps the local order and appends new remote keys in remote
/// order, so an unchanged remote reproduces the local set exactly.
pub fn reconcile(local: RowSet, remote: RowSet) -> Reconciled {
    let local_len = local.len();
    let mut rows = local;
    let mut stats = MergeStats::default();

    for row in remote {
        let incoming = row.clone();
        match rows.upsert(row) {
            Upserted::Added => stats.added += 1,
            Upserted::Replaced(previous) if previous == incoming => stats.unchanged += 1,
            Upserted::Replaced(_) => stats.updated += 1,
            Upserted::Refused => {}
        }
    }
    stats.kept_local = local_len - stats.updated - stats.unchanged;

    Reconciled { rows, stats }
}
