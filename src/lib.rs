//! A relay for handing a file from one HTTP client to another.
//!
//! The uploader's request stays open while its file waits on the shelf.
//! The first downloader to ask for it pulls the bytes straight off the
//! uploader's connection, and only then does the uploader get its answer.

pub mod config;
pub mod egress;
pub mod entry;
pub mod errors;
pub mod framing;
pub mod ingress;
pub mod listing;
pub mod server;
pub mod shelf;

pub use config::Config;
pub use entry::{EntryId, TransportEntry};
pub use errors::{HubError, Result};
pub use server::{bind, router, serve, Hub};
pub use shelf::{EntrySummary, Shelf};
