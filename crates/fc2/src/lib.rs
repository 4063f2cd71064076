pub mod chat;
pub mod config;
pub mod control;
pub mod cookies;
pub mod error;
pub mod live;
pub mod model;
pub mod output;
pub mod platform;
pub mod quality;
pub mod recorder;
pub mod resolver;
pub mod session;

pub use config::RecorderConfig;
pub use error::{ErrorClass, FailureReason, Fc2Error, Fc2Result};
pub use platform::{Fc2Platform, LivePlatform};
pub use quality::{Latency, Mode, Quality};
pub use recorder::{Recorder, RecordingOutcome, RecordingReport};
