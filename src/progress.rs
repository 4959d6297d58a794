//! Progress reporting, kept apart from the sync logic.

use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The directory listing came back with `total` records.
    Listed { total: usize },
    /// `done` of `total` records have been handled.
    Fetched { done: usize, total: usize },
    /// The fetch phase ended, normally or not.
    Finished,
}

/// Consumer of progress events. Implementations must not affect results.
pub trait Progress: Sync {
    fn report(&self, event: ProgressEvent);
}

/// Discards every event.
pub struct Silent;

impl Progress for Silent {
    fn report(&self, _event: ProgressEvent) {}
}

/// Logs progress through `tracing`; used when stderr is not a terminal.
pub struct LogProgress;

impl Progress for LogProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Listed { total } => info!("found {total} card(s)"),
            ProgressEvent::Fetched { done, total } => debug!("fetched {done} of {total}"),
            ProgressEvent::Finished => debug!("fetch phase finished"),
        }
    }
}

/// Terminal progress bar.
pub struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgress {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for BarProgress {
    fn report(&self, event: ProgressEvent) {
        let Ok(mut slot) = self.bar.lock() else {
            return;
        };
        match event {
            ProgressEvent::Listed { total } => {
                *slot = Some(create_progress_bar(total as u64, "Fetching"));
            }
            ProgressEvent::Fetched { done, .. } => {
                if let Some(bar) = slot.as_ref() {
                    bar.set_position(done as u64);
                }
            }
            ProgressEvent::Finished => {
                if let Some(bar) = slot.take() {
                    bar.finish_and_clear();
                }
            }
        }
    }
}

fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_message(message.to_string());
    pb
}
