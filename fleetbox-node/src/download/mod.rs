//! Media delivery: bandwidth budget, chunked fetching, the download queue
//! and the local cache it fills.

pub mod cache;
pub mod fetcher;
pub mod governor;
pub mod job;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod source;

pub use cache::MediaCache;
pub use fetcher::ChunkFetcher;
pub use governor::BandwidthGovernor;
pub use job::{DownloadJob, Owner, Priority};
pub use progress::ProgressTracker;
pub use retry::RetryPolicy;
pub use scheduler::{DownloadEvent, DownloadScheduler, SubmitOutcome};
pub use source::{ChunkData, HttpMediaSource, MediaSource};

