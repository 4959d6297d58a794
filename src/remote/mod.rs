//! Remote address book access.
//!
//! This module provides:
//! - `Directory` trait, the seam between the fetcher and the server
//! - `CardDavDirectory`, the libdav-backed implementation
//! - the HTTP client stack (auth schemes, TLS policy) it runs on

pub mod carddav;
pub mod http;

use std::fmt;
use std::time::Duration;

/// One addressable contact resource on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    /// The href (path) on the remote server
    pub href: String,
    /// The ETag for change detection
    pub etag: Option<String>,
}

/// Result of fetching one requested href.
#[derive(Debug, Clone)]
pub struct FetchedCard {
    pub href: String,
    pub body: Result<String, RecordError>,
}

/// Failure scoped to a single record. Never aborts a run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("not found on server")]
    NotFound,
    #[error("server answered HTTP {0}")]
    Status(u16),
}

impl RecordError {
    pub fn from_status(status: u16) -> Self {
        match status {
            404 | 410 => RecordError::NotFound,
            other => RecordError::Status(other),
        }
    }
}

/// Failure reaching or talking to the server. Aborts a run.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to set up TLS: {0}")]
    Tls(String),
    #[error("authentication rejected by {url} (HTTP {status}); check user and password")]
    Auth { url: String, status: u16 },
    #[error("address book not found at {0}")]
    NotFound(String),
    #[error("{stage} failed: {message}")]
    Transport { stage: String, message: String },
    #[error("{stage} timed out after {}s", .after.as_secs())]
    Timeout { stage: String, after: Duration },
}

impl DirectoryError {
    pub fn transport(stage: impl Into<String>, err: impl fmt::Display) -> Self {
        DirectoryError::Transport {
            stage: stage.into(),
            message: err.to_string(),
        }
    }
}

/// Trait for address book backends
#[allow(async_fn_in_trait)]
pub trait Directory {
    /// List every contact resource in the address book.
    async fn list_handles(&self) -> Result<Vec<RecordHandle>, DirectoryError>;

    /// Fetch several cards in one request; one outcome per requested href,
    /// in request order.
    async fn fetch_cards(&self, hrefs: &[&str]) -> Result<Vec<FetchedCard>, DirectoryError>;
}
