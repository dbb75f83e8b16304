//! Streaming download, request coalescing, and the dynamic timeout policy
//! used when fetching a distribution file from upstream for the first
//! time (spec components F, G, H).

pub mod coordinator;
pub mod downloader;
pub mod latch;
pub mod timeout;

pub use coordinator::{CoordinateOutcome, CoordinatorError, DownloadContext, DownloadCoordinator};
pub use downloader::{download_and_stream, DownloadError, DownloadOutcome};
pub use timeout::timeout_for_size;
