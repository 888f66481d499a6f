pub mod ingest;
pub mod source;

pub use ingest::{CaptureOpener, FeedOpener, FeedStatus, Frame, FrameFeed, VideoIngestor};
pub use source::{SourceKind, SourceSpec};
