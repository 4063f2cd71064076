use std::sync::Arc;

use url::Url;

use crate::hls::segment::HlsSegment;

/// One fetched version of a media playlist. Never mutated after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamManifest {
    pub url: Url,
    /// `EXT-X-MEDIA-SEQUENCE` of the first entry.
    pub media_sequence: u64,
    pub target_duration: f32,
    pub segments: Vec<HlsSegment>,
    /// `EXT-X-ENDLIST` was present.
    pub ended: bool,
}

impl StreamManifest {
    pub fn empty(url: Url) -> Self {
        Self {
            url,
            media_sequence: 0,
            target_duration: 0.,
            segments: Vec::new(),
            ended: false,
        }
    }

    /// Version marker of this snapshot: the sequence number right after its last entry.
    ///
    /// Sliding the window and appending entries both raise it. A refresh carrying the same
    /// or a lower marker is a stale copy.
    pub fn rotation_marker(&self) -> u64 {
        self.media_sequence + self.segments.len() as u64
    }

    pub fn average_duration(&self) -> f32 {
        if self.segments.is_empty() {
            return 0.;
        }
        self.segments.iter().map(|s| s.duration).sum::<f32>() / self.segments.len() as f32
    }
}

/// Keeps the active manifest and decides which entries still need to be scheduled.
#[derive(Debug, Default)]
pub struct ManifestTracker {
    active: Option<Arc<StreamManifest>>,
    last_scheduled: Option<u64>,
}

impl ManifestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats everything up to and including `sequence` as already scheduled.
    pub fn resume_after(sequence: Option<u64>) -> Self {
        Self {
            active: None,
            last_scheduled: sequence,
        }
    }

    pub fn active(&self) -> Option<Arc<StreamManifest>> {
        self.active.clone()
    }

    pub fn last_scheduled(&self) -> Option<u64> {
        self.last_scheduled
    }

    /// Swaps in `manifest` if it is newer than the active one and returns the entries that
    /// were never returned before, in manifest order.
    ///
    /// Tasks already created from the previous manifest are unaffected.
    pub fn apply(&mut self, manifest: Arc<StreamManifest>) -> Vec<HlsSegment> {
        if let Some(active) = &self.active {
            if manifest.rotation_marker() <= active.rotation_marker() {
                return Vec::new();
            }
        }

        let new_segments: Vec<_> = manifest
            .segments
            .iter()
            .filter(|s| self.last_scheduled.map_or(true, |last| s.sequence > last))
            .cloned()
            .collect();
        if let Some(last) = new_segments.last() {
            self.last_scheduled = Some(last.sequence);
        }

        self.active = Some(manifest);
        new_segments
    }
}
