//! Durable storage and network fetch for the watcher: page fetcher, report
//! persister, marker store, and the raw page archive.

mod archive;
mod fetch;
mod markers;
mod reports;

pub use archive::{ArchivedPage, PageArchive};
pub use fetch::{FetchConfig, FetchError, FetchedPage, HttpFetcher, PageFetcher};
pub use markers::{MarkerError, MarkerStore, MemoryMarkerStore, RedisMarkerStore};
pub use reports::{MemoryReportStore, PersistError, PgReportStore, ReportStore};

pub const CRATE_NAME: &str = "hwatch-storage";
