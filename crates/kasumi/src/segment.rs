use bytes::Bytes;

use crate::{error::KasumiResult, StreamingSegment};

/// One unit of work for the download pool.
///
/// `index` is the dispatch position assigned when the segment was first seen.
/// The writer appends strictly in `index` order, which follows the manifest order.
#[derive(Debug, Clone)]
pub struct SegmentTask<S> {
    pub index: u64,
    pub segment: S,
    pub retries: u32,
}

impl<S> SegmentTask<S> {
    pub fn new(index: u64, segment: S) -> Self {
        Self {
            index,
            segment,
            retries: 0,
        }
    }
}

/// Completion of a [`SegmentTask`], consumed by the reorder stage.
pub struct DownloadResult<S> {
    pub index: u64,
    pub segment: S,
    pub payload: KasumiResult<Bytes>,
}

/// A segment that was given up on. The recording has a gap here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSegment {
    pub sequence: u64,
    pub file_name: String,
    pub reason: String,
}

impl SkippedSegment {
    pub(crate) fn new<S>(segment: &S, reason: impl ToString) -> Self
    where
        S: StreamingSegment,
    {
        Self {
            sequence: segment.sequence(),
            file_name: segment.file_name().to_string(),
            reason: reason.to_string(),
        }
    }
}
