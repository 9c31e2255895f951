//! Plenum - Datastore
//!
//! The cached view of the remote key/value datastore that the whole
//! autoupdate pipeline reads through.
//!
//! # Architecture
//!
//! ```text
//! [Connections]          [Datastore]                [Remote]
//!    Fetcher ──┐                                  ┌──→ reader service
//!    Fetcher ──┼──→ single-flight cache ──────────┤      (HTTP)
//!    Fetcher ──┘         │        ▲               └──← change stream
//!                 computed fields │                     (via ChangeFeed)
//!                        └── update loop ──→ listeners / subscribers
//! ```
//!
//! # Key Design
//!
//! - **Single-flight**: concurrent reads of a cold key share one
//!   source request; the entry mutex is never held across I/O.
//! - **Change-driven invalidation**: the update loop overwrites
//!   cached values and drops stale computed entries before anyone is
//!   notified.
//! - **Computed fields**: derived keys produced by registered
//!   functions inside a nested [`Fetcher`]; the fetched keys become
//!   the dependency set.
//! - **Fetcher**: short-lived per-request batching with typed slots
//!   and a touched-key record used as the change wake-up filter.

mod cache;
mod datastore;
mod error;
mod fetcher;
mod http_source;
mod source;
pub mod stub;

pub use datastore::{BoxError, ComputedField, Datastore, UpdateBatch};
pub use error::{DatastoreError, FetchError, SourceError};
pub use fetcher::{Fetcher, Lazy};
pub use http_source::{ChangeFeed, HttpSource, RetryPolicy};
pub use source::{Source, SourceAnswer, Value};
