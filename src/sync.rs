//! Sync run orchestration.
//!
//! A run claims the local file, reads it, fetches the remote address book,
//! merges the two and replaces the file. The local file is read before any
//! network traffic so a broken file fails fast.

use std::future::Future;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::fetch::{fetch_rows, FetchOptions, RecordFailure};
use crate::progress::Progress;
use crate::reconcile::{reconcile, MergeStats};
use crate::remote::{Directory, DirectoryError};
use crate::row::RowSet;
use crate::store::{read_rows, write_rows, FileLock, LocalFileError};

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Ignore the existing file; the result is exactly the remote set.
    pub fresh: bool,
    /// Merge and write what was fetched before an interrupt.
    pub allow_partial: bool,
    pub fetch: FetchOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Local(#[from] LocalFileError),
    #[error(transparent)]
    Remote(#[from] DirectoryError),
    #[error(
        "interrupted with {handled} of {total} card(s) handled; nothing was written \
         (use --allow-partial to keep partial results)"
    )]
    Interrupted { handled: usize, total: usize },
}

/// Result of a completed run
#[derive(Debug)]
pub struct SyncReport {
    pub path: PathBuf,
    /// Records in the remote listing
    pub total: usize,
    /// Remote rows that made it into the merge
    pub fetched: usize,
    pub empty: usize,
    pub duplicates: usize,
    pub stats: MergeStats,
    pub failures: Vec<RecordFailure>,
    pub interrupted: bool,
    /// Rows in the file after the run
    pub written: usize,
}

impl SyncReport {
    /// Some records were skipped or the run was cut short.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty() || self.interrupted
    }

    pub fn print_summary(&self) {
        println!("Sync completed: {}", self.path.display());
        println!("  Fetched:   {} of {} card(s)", self.fetched, self.total);
        println!("  Added:     {} contact(s)", self.stats.added);
        println!("  Updated:   {} contact(s)", self.stats.updated);
        println!("  Unchanged: {} contact(s)", self.stats.unchanged);
        println!("  Kept:      {} local-only contact(s)", self.stats.kept_local);
        if self.empty > 0 {
            println!("  Empty:     {} card(s) without data", self.empty);
        }
        if self.duplicates > 0 {
            println!("  Merged:    {} card(s) with a repeated identity", self.duplicates);
        }
        if !self.failures.is_empty() {
            println!("  Failures:  {} card(s)", self.failures.len());
            for failure in &self.failures {
                println!("    - {failure}");
            }
        }
        if self.interrupted {
            println!("  Interrupted: partial results were merged");
        }
        println!("  Written:   {} row(s)", self.written);
    }
}

/// A claimed local file with its current rows, ready to sync.
#[derive(Debug)]
pub struct Session {
    path: PathBuf,
    local: RowSet,
    options: SyncOptions,
    _lock: FileLock,
}

impl Session {
    /// Lock `path` and load its rows (unless `fresh`).
    pub fn prepare(path: &Path, options: SyncOptions) -> Result<Self, SyncError> {
        let lock = FileLock::acquire(path)?;
        let local = if options.fresh {
            info!("starting fresh; ignoring {}", path.display());
            RowSet::new()
        } else {
            read_rows(path)?
        };
        debug!(rows = local.len(), "loaded local file");

        Ok(Self {
            path: path.to_path_buf(),
            local,
            options,
            _lock: lock,
        })
    }

    /// Fetch from `directory`, merge and write the file.
    ///
    /// Nothing is written when the fetch fails, or when `interrupt` fires
    /// and partial results were not allowed.
    pub async fn run<D, I>(
        self,
        directory: &D,
        progress: &dyn Progress,
        interrupt: I,
    ) -> Result<SyncReport, SyncError>
    where
        D: Directory,
        I: Future<Output = ()>,
    {
        let fetched = fetch_rows(directory, &self.options.fetch, progress, interrupt).await?;

        if fetched.interrupted && !self.options.allow_partial {
            return Err(SyncError::Interrupted {
                handled: fetched.rows.len()
                    + fetched.duplicates
                    + fetched.empty
                    + fetched.failures.len(),
                total: fetched.total,
            });
        }

        let remote_rows = fetched.rows.len();
        let merged = reconcile(self.local, fetched.rows);
        write_rows(&self.path, &merged.rows)?;
        info!(
            rows = merged.rows.len(),
            "wrote {}",
            self.path.display()
        );

        Ok(SyncReport {
            path: self.path,
            total: fetched.total,
            fetched: remote_rows,
            empty: fetched.empty,
            duplicates: fetched.duplicates,
            stats: merged.stats,
            failures: fetched.failures,
            interrupted: fetched.interrupted,
            written: merged.rows.len(),
        })
    }
}
