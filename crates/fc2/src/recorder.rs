use std::{path::Path, sync::Arc, time::Duration};

use chrono::Local;
use kasumi::{
    download::{DownloadEnd, ParallelDownloaderBuilder, RetryPolicy},
    SkippedSegment,
};
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::{broadcast::error::RecvError, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    chat::ChatSink,
    config::RecorderConfig,
    control::{CloseReason, ControlEvent},
    error::{ErrorClass, FailureReason, Fc2Error},
    model::ChannelMeta,
    output::{OutputPlanner, RecordingOutput},
    platform::{ControlSession, LivePlatform},
    quality::Mode,
    resolver::{self, PlaylistRef},
    session::{AcquisitionState, BroadcastSession, StateTracker},
};

/// Upper bound of the status poll interval after repeated errors.
pub const MAX_LIVE_CHECK_INTERVAL: Duration = Duration::from_secs(300);
/// How often an unavailable quality is asked for again.
const QUALITY_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingOutcome {
    /// The broadcast ended and the recording was flushed.
    Stopped,
    /// Cancelled from outside. The recording holds everything written so far.
    Cancelled,
    Failed(FailureReason),
}

impl RecordingOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug)]
pub struct RecordingReport {
    pub outcome: RecordingOutcome,
    /// `None` when the recorder failed before the broadcast was found online.
    pub output: Option<RecordingOutput>,
    /// Every state the recorder went through.
    pub states: Vec<AcquisitionState>,
    /// The mode actually recorded, after any fallback.
    pub mode: Option<Mode>,
    pub segments: u64,
    pub bytes: u64,
    pub skipped: Vec<SkippedSegment>,
    /// Highest media sequence written or skipped, carried across reconnects.
    pub last_sequence: Option<u64>,
    pub reconnects: u32,
    pub comments: u64,
}

impl RecordingReport {
    fn new() -> Self {
        Self {
            outcome: RecordingOutcome::Stopped,
            output: None,
            states: Vec::new(),
            mode: None,
            segments: 0,
            bytes: 0,
            skipped: Vec::new(),
            last_sequence: None,
            reconnects: 0,
            comments: 0,
        }
    }
}

/// How one control session ended.
#[derive(Debug)]
enum Round {
    /// The broadcast is over.
    Ended,
    Cancelled,
    /// Worth reconnecting. `progressed` is set when the session wrote any segment.
    Lost { progressed: bool, error: String },
    Fatal(FailureReason),
}

impl Round {
    fn from_error(error: &Fc2Error, progressed: bool) -> Self {
        match error {
            Fc2Error::BroadcastEnded | Fc2Error::NotOnline => Self::Ended,
            Fc2Error::QualityUnavailable { .. } => Self::Fatal(FailureReason::NoQualityAvailable),
            e => match e.class() {
                ErrorClass::Auth | ErrorClass::Channel | ErrorClass::Output => {
                    Self::Fatal(FailureReason::from(e))
                }
                _ => Self::Lost {
                    progressed,
                    error: e.to_string(),
                },
            },
        }
    }

    fn from_close(reason: CloseReason, progressed: bool) -> Self {
        match reason {
            CloseReason::PublishStop => Self::Ended,
            CloseReason::PaidProgram => Self::Fatal(FailureReason::PaidProgram),
            CloseReason::LoginRequired => Self::Fatal(FailureReason::LoginRequired),
            CloseReason::MultipleConnections => Self::Fatal(FailureReason::MultipleConnections),
            reason => Self::Lost {
                progressed,
                error: reason.to_error().to_string(),
            },
        }
    }
}

/// Records one broadcast of one channel.
///
/// The recorder waits for the channel to go live (when configured), negotiates a control
/// session, resolves the playlist and downloads it until the broadcast ends. Lost connections
/// are renegotiated a bounded number of times while the output file stays open.
/// An instance runs at most once.
pub struct Recorder<P>
where
    P: LivePlatform,
{
    platform: P,
    config: Arc<RecorderConfig>,
    cancel: CancellationToken,
    tracker: StateTracker,
    chat_writer: Option<Box<dyn AsyncWrite + Send + Sync + Unpin>>,
}

impl<P> Recorder<P>
where
    P: LivePlatform,
{
    pub fn new(platform: P, config: Arc<RecorderConfig>) -> Self {
        Self {
            platform,
            config,
            cancel: CancellationToken::new(),
            tracker: StateTracker::new(),
            chat_writer: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Writes chat to `writer` instead of the chat file.
    pub fn with_chat_writer<W>(mut self, writer: W) -> Self
    where
        W: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        self.chat_writer = Some(Box::new(writer));
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AcquisitionState> {
        self.tracker.subscribe()
    }

    pub async fn run(mut self) -> RecordingReport {
        let mut report = RecordingReport::new();
        report.outcome = self.record(&mut report).await;
        report.states = self.tracker.history().to_vec();

        match report.outcome {
            RecordingOutcome::Failed(reason) => log::error!("Recording failed: {reason}"),
            outcome => log::info!(
                "Recording finished ({outcome:?}): {} segments, {} skipped",
                report.segments,
                report.skipped.len()
            ),
        }
        report
    }

    async fn record(&mut self, report: &mut RecordingReport) -> RecordingOutcome {
        let meta = match self.wait_for_live().await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                self.tracker.transition(AcquisitionState::Stopping);
                self.tracker.transition(AcquisitionState::Stopped);
                return RecordingOutcome::Cancelled;
            }
            Err(reason) => return self.fail(reason),
        };
        log::info!("Stream is online: {}", meta.channel_data.title);

        let output = match self.prepare_output(&meta).await {
            Ok(output) => output,
            Err(e) => {
                log::error!("Failed to prepare output files: {e}");
                return self.fail(FailureReason::Output);
            }
        };
        report.output = Some(output.clone());

        let mut sink = match File::create(&output.stream).await {
            Ok(file) => BufWriter::new(file),
            Err(e) => {
                log::error!("Failed to open {}: {e}", output.stream.display());
                return self.fail(FailureReason::Output);
            }
        };
        log::info!("Writing stream to {}", output.stream.display());

        let mut chat = match self.chat_writer.take() {
            Some(writer) => Some(ChatSink::from_writer(writer)),
            None if self.config.write_chat => {
                log::info!("Writing chat to {}", output.chat.display());
                Some(ChatSink::create(&output.chat).await)
            }
            None => None,
        };

        let requested = self.config.mode();
        self.tracker
            .begin(BroadcastSession::new(self.platform.channel_id(), requested));

        let mut meta = meta;
        let mut losses = 0;
        let backoff = RetryPolicy::new(self.config.reconnect_retries, self.config.reconnect_backoff)
            .with_max_delay(self.config.reconnect_max_backoff);

        let end = loop {
            let round = self
                .round(&meta, &output, &mut sink, &mut chat, report)
                .await;
            log::debug!("Control session ended: {round:?}");

            let (progressed, error) = match round {
                Round::Lost { progressed, error } => (progressed, error),
                round => break round,
            };
            if progressed {
                losses = 0;
            }
            losses += 1;
            if losses > self.config.reconnect_retries {
                log::error!("Giving up after {} reconnect attempts: {error}", losses - 1);
                break Round::Lost { progressed, error };
            }

            if self.tracker.state() != AcquisitionState::Negotiating {
                self.tracker.transition(AcquisitionState::Negotiating);
            }
            let delay = backoff.delay_for_attempt(losses - 1);
            log::warn!(
                "Connection lost ({error}), reconnecting in {}s ({losses}/{})",
                delay.as_secs_f32(),
                self.config.reconnect_retries
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break Round::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            report.reconnects += 1;

            let refreshed = tokio::select! {
                _ = self.cancel.cancelled() => break Round::Cancelled,
                meta = self.platform.channel_meta() => meta,
            };
            match refreshed {
                Ok(refreshed) if !refreshed.is_online() => {
                    log::info!("Channel went offline");
                    break Round::Ended;
                }
                Ok(refreshed) => meta = refreshed,
                Err(e) => log::warn!("Failed to refresh channel status: {e}"),
            }
        };

        if !matches!(end, Round::Fatal(_)) {
            self.tracker.transition(AcquisitionState::Stopping);
        }
        if let Err(e) = sink.shutdown().await {
            log::error!("Failed to flush {}: {e}", output.stream.display());
        }
        if let Some(chat) = chat {
            report.comments = chat.recorded();
            chat.close().await;
        }

        match end {
            Round::Ended => {
                self.tracker.transition(AcquisitionState::Stopped);
                RecordingOutcome::Stopped
            }
            Round::Cancelled => {
                self.tracker.transition(AcquisitionState::Stopped);
                RecordingOutcome::Cancelled
            }
            Round::Lost { .. } => self.fail(FailureReason::ConnectionLost),
            Round::Fatal(reason) => self.fail(reason),
        }
    }

    fn fail(&mut self, reason: FailureReason) -> RecordingOutcome {
        self.tracker.transition(AcquisitionState::Failed(reason));
        RecordingOutcome::Failed(reason)
    }

    /// Returns the channel meta once the channel is online, `None` when cancelled.
    async fn wait_for_live(&mut self) -> Result<Option<ChannelMeta>, FailureReason> {
        let poll_interval = self.config.wait_poll_interval;
        let mut interval = poll_interval;

        loop {
            let meta = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                meta = self.platform.channel_meta() => meta,
            };
            match meta {
                Ok(meta) if meta.is_online() => return Ok(Some(meta)),
                Ok(_) if !self.config.wait_for_live => return Err(FailureReason::NotOnline),
                Ok(_) => {
                    if interval != poll_interval {
                        log::debug!(
                            "Successfully fetched live status, restoring check interval of {}s",
                            poll_interval.as_secs_f32()
                        );
                        interval = poll_interval;
                    }
                }
                Err(e @ Fc2Error::InvalidChannel(_)) => {
                    log::error!("{e}");
                    return Err(FailureReason::InvalidChannel);
                }
                Err(e) if !self.config.wait_for_live => {
                    log::error!("Failed to fetch channel status: {e}");
                    return Err(FailureReason::Network);
                }
                Err(e) => {
                    log::warn!("Error when checking if stream is live: {e}");
                    interval = (interval * 2).min(MAX_LIVE_CHECK_INTERVAL);
                    log::debug!("Next check in {}s", interval.as_secs_f32());
                }
            }

            if self.tracker.state() == AcquisitionState::Idle {
                log::info!("Waiting for stream");
                self.tracker.transition(AcquisitionState::WaitingForLive);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn prepare_output(&self, meta: &ChannelMeta) -> Result<RecordingOutput, Fc2Error> {
        let planner = OutputPlanner::new(&self.config, Some(meta), Local::now());
        let output = planner.plan(&self.config).await?;

        if self.config.write_info_json {
            log::info!("Writing info json to {}", output.info_json.display());
            if let Err(e) = write_info_json(meta, &output.info_json).await {
                log::warn!("Failed to write info json: {e}");
            }
        }
        if self.config.write_thumbnail {
            log::info!("Writing thumbnail to {}", output.thumbnail.display());
            if let Err(e) = self
                .platform
                .download_thumbnail(meta, &output.thumbnail)
                .await
            {
                log::warn!("Failed to download thumbnail: {e}");
            }
        }
        Ok(output)
    }

    /// One control session: connect, pick a playlist and download until something ends it.
    async fn round<W>(
        &mut self,
        meta: &ChannelMeta,
        output: &RecordingOutput,
        sink: &mut W,
        chat: &mut Option<ChatSink>,
        report: &mut RecordingReport,
    ) -> Round
    where
        W: AsyncWrite + Unpin + Send,
    {
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return Round::Cancelled,
            connected = self.platform.connect(meta, output.websocket.as_deref()) => connected,
        };
        let connected = match connected {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Failed to connect to control server: {e}");
                return Round::from_error(&e, false);
            }
        };
        if let Some(session) = self.tracker.session_mut() {
            session.control_token = Some(connected.control_token);
            session.user_id = connected.user_id;
        }

        let channel = connected.channel;
        let token = self.cancel.child_token();
        let chat_task = chat
            .take()
            .map(|sink| tokio::spawn(sink.drain(channel.subscribe(), token.clone())));

        let round = self.negotiate(&channel, sink, report, &token).await;

        channel.close().await;
        token.cancel();
        if let Some(task) = chat_task {
            match task.await {
                Ok(sink) => *chat = Some(sink),
                Err(e) => log::error!("Chat sink stopped unexpectedly: {e}"),
            }
        }
        round
    }

    async fn negotiate<C, W>(
        &mut self,
        channel: &C,
        sink: &mut W,
        report: &mut RecordingReport,
        token: &CancellationToken,
    ) -> Round
    where
        C: ControlSession,
        W: AsyncWrite + Unpin + Send,
    {
        let mut events = channel.subscribe();

        let playlist = match self.select_playlist(channel, token).await {
            Ok(playlist) => playlist,
            Err(round) => return round,
        };
        log::info!("Received HLS info, recording {}", playlist.mode);
        if let Some(session) = self.tracker.session_mut() {
            session.mode = playlist.mode;
        }
        report.mode = Some(playlist.mode);

        let (ended, ended_rx) = watch::channel(false);
        let source = tokio::select! {
            _ = token.cancelled() => return Round::Cancelled,
            source = self.platform.playlist_source(&playlist, report.last_sequence, ended_rx) => {
                source
            }
        };
        let source = match source {
            Ok(source) => source,
            Err(e) => {
                log::warn!("Failed to load playlist: {e}");
                return Round::from_error(&e, false);
            }
        };

        self.tracker.transition(AcquisitionState::Downloading);
        let download_token = token.child_token();
        let download = ParallelDownloaderBuilder::new()
            .concurrency(self.config.threads)
            .retries(self.config.segment_retries)
            .cancellation(download_token.clone())
            .download(source, sink);
        tokio::pin!(download);

        let mut listening = true;
        let mut closed: Option<CloseReason> = None;
        let result = loop {
            tokio::select! {
                result = &mut download => break result,
                event = events.recv(), if listening => match event {
                    Ok(ControlEvent::Closed(CloseReason::PublishStop)) => {
                        log::info!("Broadcaster stopped publishing, waiting for the playlist to end");
                        ended.send_replace(true);
                        listening = false;
                    }
                    Ok(ControlEvent::Closed(reason)) => {
                        closed = Some(reason);
                        download_token.cancel();
                        listening = false;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => log::warn!("Missed {n} control events"),
                    Err(RecvError::Closed) => {
                        closed = Some(CloseReason::ConnectionLost("control channel closed".to_string()));
                        download_token.cancel();
                        listening = false;
                    }
                },
            }
        };

        let download = match result {
            Ok(download) => download,
            Err(e) => {
                let e = Fc2Error::from(e);
                log::error!("Download failed: {e}");
                return Round::from_error(&e, false);
            }
        };
        report.segments += download.segments;
        report.bytes += download.bytes;
        report.skipped.extend(download.skipped);
        if let Some(last) = download.last_sequence {
            let seen = report.last_sequence.unwrap_or(last);
            report.last_sequence = Some(seen.max(last));
        }
        let progressed = download.segments > 0;

        if self.cancel.is_cancelled() {
            return Round::Cancelled;
        }
        if let Some(reason) = closed {
            return Round::from_close(reason, progressed);
        }
        match download.end {
            DownloadEnd::Exhausted => Round::Ended,
            DownloadEnd::Cancelled => Round::Cancelled,
            DownloadEnd::SourceFailed(e) => Round::Lost {
                progressed,
                error: e.to_string(),
            },
        }
    }

    /// Waits for the requested mode, then falls back to the best available one.
    async fn select_playlist<C>(
        &mut self,
        channel: &C,
        token: &CancellationToken,
    ) -> Result<PlaylistRef, Round>
    where
        C: ControlSession,
    {
        let requested = self.config.mode();
        let deadline = Instant::now() + self.config.wait_for_quality_timeout;

        loop {
            let info = tokio::select! {
                _ = token.cancelled() => return Err(Round::Cancelled),
                info = channel.hls_information() => info,
            };
            let info = info.map_err(|e| {
                log::warn!("Failed to get HLS information: {e}");
                Round::from_error(&e, false)
            })?;

            match resolver::resolve(&info, requested) {
                Ok(playlist) => return Ok(playlist),
                Err(e @ Fc2Error::QualityUnavailable { .. }) => {
                    if Instant::now() >= deadline {
                        self.tracker.transition(AcquisitionState::QualityFallback);
                        return match resolver::fallback(&info, requested) {
                            Some(playlist) => {
                                log::warn!(
                                    "Requested quality {requested} is not available, falling back to {}",
                                    playlist.mode
                                );
                                Ok(playlist)
                            }
                            None => Err(Round::Fatal(FailureReason::NoQualityAvailable)),
                        };
                    }
                    log::info!("{e}, waiting");
                }
                Err(e) => return Err(Round::from_error(&e, false)),
            }

            tokio::select! {
                _ = token.cancelled() => return Err(Round::Cancelled),
                _ = tokio::time::sleep(QUALITY_RECHECK_INTERVAL) => {}
            }
        }
    }
}

async fn write_info_json(meta: &ChannelMeta, path: &Path) -> Result<(), Fc2Error> {
    let json = serde_json::to_vec(meta.raw())?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
