mod live;
mod manifest;
mod segment;
mod utils;

pub use live::{HlsLiveSource, MAX_STALL};
pub use manifest::{ManifestTracker, StreamManifest};
pub use segment::HlsSegment;
pub use utils::load_manifest;
