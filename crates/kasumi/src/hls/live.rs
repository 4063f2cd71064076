use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use url::Url;

use crate::{
    error::{KasumiError, KasumiResult},
    hls::{
        manifest::{ManifestTracker, StreamManifest},
        segment::HlsSegment,
        utils::load_manifest,
    },
    util::http::HttpClient,
    StreamingSource,
};

/// Hard limit on how long a playlist may stay unchanged before the stream is considered over.
pub const MAX_STALL: Duration = Duration::from_secs(30);

pub struct HlsLiveSource {
    client: HttpClient,
    playlist_url: Url,
    initial: Option<StreamManifest>,
    last_sequence: Option<u64>,

    manifest_retries: u32,
    manifest_timeout: Duration,
    segment_timeout: Duration,
    poll_interval: Duration,

    ended: Option<watch::Receiver<bool>>,
    ended_grace: Duration,
    max_stall: Duration,
}

impl HlsLiveSource {
    pub fn new(client: HttpClient, playlist_url: Url) -> Self {
        Self {
            client,
            playlist_url,
            initial: None,
            last_sequence: None,
            manifest_retries: 3,
            manifest_timeout: Duration::from_secs(10),
            segment_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            ended: None,
            ended_grace: Duration::from_secs(5),
            max_stall: MAX_STALL,
        }
    }

    /// Uses an already fetched manifest instead of loading the playlist again on start.
    pub fn with_initial_manifest(mut self, manifest: StreamManifest) -> Self {
        self.initial = Some(manifest);
        self
    }

    /// Skips segments up to and including `sequence`, written by an earlier source.
    pub fn with_last_sequence(mut self, sequence: Option<u64>) -> Self {
        self.last_sequence = sequence;
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.manifest_retries = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_manifest_timeout(mut self, timeout: Duration) -> Self {
        self.manifest_timeout = timeout;
        self
    }

    pub fn with_segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout = timeout;
        self
    }

    /// Once `ended` turns `true`, a playlist that did not grow for `grace` ends the stream.
    pub fn with_end_signal(mut self, ended: watch::Receiver<bool>, grace: Duration) -> Self {
        self.ended = Some(ended);
        self.ended_grace = grace;
        self
    }

    pub fn with_max_stall(mut self, max_stall: Duration) -> Self {
        self.max_stall = max_stall;
        self
    }
}

impl StreamingSource for HlsLiveSource {
    type Segment = HlsSegment;

    async fn fetch_info(
        &self,
    ) -> KasumiResult<mpsc::UnboundedReceiver<KasumiResult<Vec<Self::Segment>>>> {
        let initial = match &self.initial {
            Some(manifest) => manifest.clone(),
            None => {
                load_manifest(
                    &self.client,
                    self.playlist_url.clone(),
                    self.manifest_retries,
                    self.manifest_timeout,
                )
                .await?
            }
        };

        let (sender, receiver) = mpsc::unbounded_channel();

        let client = self.client.clone();
        let playlist_url = initial.url.clone();
        let retry = self.manifest_retries;
        let manifest_timeout = self.manifest_timeout;
        let poll_interval = self.poll_interval;
        let ended = self.ended.clone();
        let ended_grace = self.ended_grace;
        let max_stall = self.max_stall;
        let last_sequence = self.last_sequence;

        tokio::spawn(async move {
            let mut tracker = ManifestTracker::resume_after(last_sequence);
            let mut last_growth = Instant::now();

            let mut manifest = initial;
            loop {
                let is_end = manifest.ended;
                let segments = tracker.apply(Arc::new(manifest));
                if !segments.is_empty() {
                    last_growth = Instant::now();
                    if sender.send(Ok(segments)).is_err() {
                        break;
                    }
                }
                if is_end {
                    tracing::info!("Playlist ended.");
                    break;
                }

                let stalled = last_growth.elapsed();
                let platform_ended = ended.as_ref().is_some_and(|rx| *rx.borrow());
                if platform_ended && stalled >= ended_grace {
                    tracing::info!("Broadcast ended and playlist stopped growing.");
                    break;
                }
                if stalled >= max_stall {
                    tracing::warn!(
                        "Playlist did not change for {}s, treating stream as ended.",
                        stalled.as_secs()
                    );
                    break;
                }

                tokio::select! {
                    _ = sender.closed() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }

                manifest = match load_manifest(&client, playlist_url.clone(), retry, manifest_timeout)
                    .await
                {
                    Ok(manifest) => manifest,
                    Err(KasumiError::PlaylistGone(status)) => {
                        tracing::info!("Playlist responded {status}, broadcast is over.");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Exceeded retry limit for fetching segments: {e}");
                        let _ = sender.send(Err(e));
                        break;
                    }
                };
            }
        });

        Ok(receiver)
    }

    async fn fetch_segment(&self, segment: &Self::Segment) -> KasumiResult<Bytes> {
        segment.fetch(&self.client, self.segment_timeout).await
    }
}
