pub mod download;
pub mod error;
pub mod hls;
pub mod remux;
pub mod segment;
pub mod util;

pub use error::{KasumiError, KasumiResult};
pub use segment::{DownloadResult, SegmentTask, SkippedSegment};
pub use util::http::HttpClient;

/// ┌───────────────────────┐                ┌────────────────────┐
/// │                       │    Segment 1   │                    │  worker 1..N
/// │                       ├────────────────►                    ├───┐
/// │                       │                │                    │   │fetch_segment
/// │                       │    Segment 2   │    Shared queue    ◄───┘
/// │   Manifest refresh #1 ├────────────────►                    │
/// │                       │                │   [MPSC + permit]  ├───┐
/// │                       │    Segment 3   │                    │   │fetch_segment
/// │                       ├────────────────►                    ◄───┘
/// └───────────────────────┘                └─────────┬──────────┘
///                                                    │ DownloadResult (any order)
/// ┌───────────────────────┐                ┌─────────▼──────────┐
/// │                       │       ...      │                    │
/// │   Manifest refresh #N ├────────────────►   Reorder writer   ├──► sink
/// │                       │                │                    │
/// └───────────────────────┘                └────────────────────┘
pub trait StreamingSource {
    type Segment: StreamingSegment + Send + Sync + 'static;

    /// Starts watching the stream. Every item is a batch of segments that were not sent before.
    ///
    /// The channel closes when the stream ends. Dropping the receiver stops the watcher.
    fn fetch_info(
        &self,
    ) -> impl std::future::Future<
        Output = KasumiResult<
            tokio::sync::mpsc::UnboundedReceiver<KasumiResult<Vec<Self::Segment>>>,
        >,
    > + Send;

    fn fetch_segment(
        &self,
        segment: &Self::Segment,
    ) -> impl std::future::Future<Output = KasumiResult<bytes::Bytes>> + Send;
}

pub trait StreamingSegment {
    fn sequence(&self) -> u64;

    fn file_name(&self) -> &str;
}
