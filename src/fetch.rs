//! Fetch phase: list the address book, download cards in bounded parallel
//! batches and convert each one to a row.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::convert::card_to_row;
use crate::progress::{Progress, ProgressEvent};
use crate::remote::{Directory, DirectoryError, FetchedCard, RecordError};
use crate::row::{Row, RowSet, Upserted};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    /// Batches in flight at once.
    pub concurrency: usize,
    /// Hrefs per multiget request.
    pub batch_size: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            batch_size: 25,
        }
    }
}

/// Where a single record went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Listed but gone by the time it was fetched.
    Missing,
    Fetch,
    Convert,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Missing => "missing",
            Stage::Fetch => "fetch",
            Stage::Convert => "convert",
        })
    }
}

/// A record that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    /// The href involved
    pub href: String,
    pub stage: Stage,
    pub message: String,
}

impl fmt::Display for RecordFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.href, self.stage, self.message)
    }
}

/// Everything the fetch phase produced.
#[derive(Debug, Default)]
pub struct Fetched {
    /// Converted rows, ordered by href.
    pub rows: RowSet,
    pub failures: Vec<RecordFailure>,
    /// Records in the listing.
    pub total: usize,
    /// Cards that converted to nothing.
    pub empty: usize,
    /// Cards whose identity collided with an earlier card.
    pub duplicates: usize,
    /// The interrupt fired before every record was handled.
    pub interrupted: bool,
}

enum Outcome {
    Row(Row),
    Empty,
    Failed(RecordFailure),
}

/// List `directory`, fetch every card and convert it.
///
/// Listing and batch transport errors abort with `Err`. Per-record problems
/// end up in [`Fetched::failures`]. When `interrupt` resolves, during the
/// listing or between batches, no new batches are started, in-flight ones
/// are dropped and the partial result is returned with `interrupted` set.
pub async fn fetch_rows<D, I>(
    directory: &D,
    options: &FetchOptions,
    progress: &dyn Progress,
    interrupt: I,
) -> Result<Fetched, DirectoryError>
where
    D: Directory,
    I: Future<Output = ()>,
{
    tokio::pin!(interrupt);
    let listed = tokio::select! {
        biased;
        _ = &mut interrupt => None,
        listed = directory.list_handles() => Some(listed?),
    };
    let Some(mut handles) = listed else {
        progress.report(ProgressEvent::Finished);
        return Ok(Fetched {
            interrupted: true,
            ..Fetched::default()
        });
    };
    handles.sort_by(|a, b| a.href.cmp(&b.href));
    handles.dedup_by(|a, b| a.href == b.href);
    let total = handles.len();
    progress.report(ProgressEvent::Listed { total });
    let tagged = handles.iter().filter(|handle| handle.etag.is_some()).count();
    debug!(total, tagged, "listed address book");

    let batch_size = options.batch_size.max(1);
    let hrefs: Vec<&str> = handles.iter().map(|handle| handle.href.as_str()).collect();
    let done = AtomicUsize::new(0);

    let batches = hrefs.chunks(batch_size).enumerate().map(|(idx, batch)| {
        let done = &done;
        async move {
            let cards = directory.fetch_cards(batch).await?;
            let outcomes: Vec<Outcome> = cards
                .into_iter()
                .map(|card| {
                    let outcome = convert_fetched(card);
                    let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                    progress.report(ProgressEvent::Fetched {
                        done: current,
                        total,
                    });
                    outcome
                })
                .collect();
            Ok::<_, DirectoryError>((idx * batch_size, outcomes))
        }
    });
    let mut in_flight = stream::iter(batches).buffer_unordered(options.concurrency.max(1));

    // Slots keep the href order regardless of completion order.
    let mut slots: Vec<Option<Outcome>> = (0..total).map(|_| None).collect();
    let mut interrupted = false;
    loop {
        tokio::select! {
            biased;
            _ = &mut interrupt => {
                interrupted = true;
                break;
            }
            next = in_flight.next() => match next {
                Some(Ok((offset, outcomes))) => {
                    for (pos, outcome) in outcomes.into_iter().enumerate() {
                        if let Some(slot) = slots.get_mut(offset + pos) {
                            *slot = Some(outcome);
                        }
                    }
                }
                Some(Err(err)) => {
                    progress.report(ProgressEvent::Finished);
                    return Err(err);
                }
                None => break,
            }
        }
    }
    drop(in_flight);
    progress.report(ProgressEvent::Finished);

    let mut fetched = Fetched {
        total,
        interrupted,
        ..Fetched::default()
    };
    for outcome in slots.into_iter().flatten() {
        match outcome {
            Outcome::Row(row) => {
                if let Upserted::Replaced(previous) = fetched.rows.upsert(row) {
                    warn!(
                        "two remote cards share the identity '{}'; keeping the later one",
                        previous.key()
                    );
                    fetched.duplicates += 1;
                }
            }
            Outcome::Empty => fetched.empty += 1,
            Outcome::Failed(failure) => {
                warn!("skipped {failure}");
                fetched.failures.push(failure);
            }
        }
    }
    Ok(fetched)
}

fn convert_fetched(card: FetchedCard) -> Outcome {
    let failed = |stage: Stage, message: String| {
        Outcome::Failed(RecordFailure {
            href: card.href.clone(),
            stage,
            message,
        })
    };

    match &card.body {
        Ok(body) => match card_to_row(body, &card.href) {
            Ok(Some(row)) => Outcome::Row(row),
            Ok(None) => Outcome::Empty,
            Err(err) => failed(Stage::Convert, err.to_string()),
        },
        Err(err @ RecordError::NotFound) => failed(Stage::Missing, err.to_string()),
        Err(err) => failed(Stage::Fetch, err.to_string()),
    }
}
