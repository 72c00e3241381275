//! The package-loader engine: fetch registry artifacts, unpack them,
//! content-address the trees and commit synthetic releases plus a snapshot
//! per visit, incrementally and idempotently.

pub mod adapters;
mod decompression;
mod errors;
mod fetch;
mod ingest;
mod loader;
mod unpack;

pub use errors::{AdapterError, ArchiveError, FetchError};
pub use fetch::{Expected, FetchConfig, Fetcher};
pub use ingest::{ingest_tree, IngestError};
pub use loader::{BranchError, BranchFailure, LoadResult, LoadStats, Loader, LoaderConfig};
pub use unpack::{unpack, ArchiveKind};
