use std::{num::NonZeroU32, sync::Arc};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;

use crate::{
    download::retry::{retry_with_backoff, RetryPolicy},
    error::{KasumiError, KasumiResult},
    segment::{DownloadResult, SegmentTask, SkippedSegment},
    util::{format_size, ordered_stream::OrderedStream},
    StreamingSegment, StreamingSource,
};

type TaskQueue<T> = Arc<Mutex<mpsc::Receiver<SegmentTask<T>>>>;
type Completed<T> = (u64, (DownloadResult<T>, OwnedSemaphorePermit));

/// Why a download run returned.
#[derive(Debug, Default)]
pub enum DownloadEnd {
    /// The source closed its segment channel: the stream is over.
    #[default]
    Exhausted,
    /// The cancellation token fired. The sink holds a flushed prefix of whole segments.
    Cancelled,
    /// The source gave up refreshing its segment list.
    SourceFailed(KasumiError),
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Segments appended to the sink.
    pub segments: u64,
    /// Bytes appended to the sink.
    pub bytes: u64,
    /// Segments given up on, in sequence order.
    pub skipped: Vec<SkippedSegment>,
    /// Highest sequence that was written or skipped. Later segments were never handled.
    pub last_sequence: Option<u64>,
    pub end: DownloadEnd,
}

impl DownloadReport {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.end, DownloadEnd::Cancelled)
    }
}

/// Downloads segments with a fixed pool of workers and appends them to one sink in order.
///
/// Each worker takes a permit before picking a task and hands it to the writer together
/// with the result. The permit is only released after the result has been written or
/// skipped, so at most `concurrency` results can ever wait in the reorder buffer.
pub struct ParallelDownloader<S>
where
    S: StreamingSource,
{
    source: Arc<S>,
    concurrency: NonZeroU32,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<S> ParallelDownloader<S>
where
    S: StreamingSource + Send + Sync + 'static,
{
    pub fn new(source: S, concurrency: NonZeroU32, retry: RetryPolicy) -> Self {
        Self {
            source: Arc::new(source),
            concurrency,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn download<W>(self, sink: &mut W) -> KasumiResult<DownloadReport>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let concurrency = self.concurrency.get() as usize;
        tracing::info!("Start downloading with {concurrency} thread(s).");
        if concurrency > 8 {
            tracing::warn!("Using more than 8 threads is not recommended.");
        }

        let receiver = self.source.fetch_info().await?;

        // fired by external cancellation, or by the writer when the sink breaks
        let stop = self.cancel.child_token();
        let permits = Arc::new(Semaphore::new(concurrency));
        let (task_tx, task_rx) = mpsc::channel(concurrency);
        let task_rx: TaskQueue<S::Segment> = Arc::new(Mutex::new(task_rx));
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let workers: Vec<_> = (0..concurrency)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    self.source.clone(),
                    task_rx.clone(),
                    permits.clone(),
                    result_tx.clone(),
                    self.retry.clone(),
                    stop.clone(),
                ))
            })
            .collect();
        // the writer finishes once every worker dropped its sender
        drop(result_tx);

        let feed = async {
            let task_tx = task_tx;
            let mut receiver = receiver;
            let mut index = 0;

            loop {
                let batch = tokio::select! {
                    _ = stop.cancelled() => break None,
                    batch = receiver.recv() => batch,
                };
                let segments = match batch {
                    Some(Ok(segments)) => segments,
                    Some(Err(e)) => {
                        tracing::error!("Failed to fetch segment list: {e}");
                        break Some(e);
                    }
                    None => break None,
                };

                tracing::debug!("{} new segments were added to queue.", segments.len());
                for segment in segments {
                    let task = SegmentTask::new(index, segment);
                    index += 1;
                    tokio::select! {
                        _ = stop.cancelled() => return None,
                        sent = task_tx.send(task) => {
                            if sent.is_err() {
                                return None;
                            }
                        }
                    }
                }
            }
        };

        let write = async {
            let mut ordered: OrderedStream<(DownloadResult<S::Segment>, OwnedSemaphorePermit)> =
                OrderedStream::new(result_rx);
            let mut segments = 0;
            let mut bytes = 0;
            let mut skipped = Vec::new();
            let mut last_sequence: Option<u64> = None;

            while let Some((_, (result, permit))) = ordered.next().await {
                let sequence = result.segment.sequence();
                match result.payload {
                    Ok(data) => {
                        if let Err(e) = sink.write_all(&data).await {
                            tracing::error!("Failed to write fragment: {e}");
                            stop.cancel();
                            return Err(KasumiError::IOError(e));
                        }
                        segments += 1;
                        bytes += data.len() as u64;
                        tracing::info!("Downloaded {segments} fragments, {}", format_size(bytes));
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Skipped fragment {sequence} ({}), the recording has a gap. {e}",
                            result.segment.file_name()
                        );
                        skipped.push(SkippedSegment::new(&result.segment, e));
                    }
                }
                last_sequence = Some(last_sequence.map_or(sequence, |last| last.max(sequence)));
                drop(permit);
            }

            if ordered.buffered() > 0 {
                tracing::debug!(
                    "Discarding {} fragments queued behind an unfinished one.",
                    ordered.buffered()
                );
            }
            if let Err(e) = sink.flush().await {
                return Err(KasumiError::IOError(e));
            }
            Ok::<_, KasumiError>((segments, bytes, skipped, last_sequence))
        };

        let (source_error, written) = tokio::join!(feed, write);
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("Download worker panicked: {e}");
            }
        }
        let (segments, bytes, skipped, last_sequence) = written?;

        if !skipped.is_empty() {
            tracing::error!("Failed to download {} segments:", skipped.len());
            for segment in skipped.iter() {
                tracing::error!("  - #{} {}", segment.sequence, segment.file_name);
            }
        }

        let end = if self.cancel.is_cancelled() {
            DownloadEnd::Cancelled
        } else if let Some(e) = source_error {
            DownloadEnd::SourceFailed(e)
        } else {
            DownloadEnd::Exhausted
        };

        Ok(DownloadReport {
            segments,
            bytes,
            skipped,
            last_sequence,
            end,
        })
    }
}

async fn worker<S>(
    id: usize,
    source: Arc<S>,
    queue: TaskQueue<S::Segment>,
    permits: Arc<Semaphore>,
    results: mpsc::UnboundedSender<Completed<S::Segment>>,
    retry: RetryPolicy,
    stop: CancellationToken,
) where
    S: StreamingSource + Send + Sync + 'static,
{
    loop {
        // back-pressure: blocks while the reorder buffer is full
        let permit = tokio::select! {
            _ = stop.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task = {
            let mut queue = queue.lock().await;
            tokio::select! {
                _ = stop.cancelled() => None,
                task = queue.recv() => task,
            }
        };
        let Some(mut task) = task else {
            break;
        };

        tracing::debug!(
            "[worker {id}] Downloading fragment #{} ({})",
            task.index,
            task.segment.file_name()
        );
        let payload = retry_with_backoff(&retry, &stop, |attempt| {
            task.retries = attempt;
            source.fetch_segment(&task.segment)
        })
        .await;

        let payload = match payload {
            Err(KasumiError::Cancelled) => {
                tracing::debug!("[worker {id}] Fragment #{} cancelled.", task.index);
                break;
            }
            Err(e) => {
                tracing::error!(
                    "Processing {} failed after {} retries, drop. {e}",
                    task.segment.file_name(),
                    task.retries
                );
                Err(e)
            }
            Ok(bytes) => Ok(bytes),
        };

        let index = task.index;
        let result = DownloadResult {
            index,
            segment: task.segment,
            payload,
        };
        if results.send((index, (result, permit))).is_err() {
            break;
        }
    }
}

pub struct ParallelDownloaderBuilder {
    concurrency: NonZeroU32,
    retry: RetryPolicy,
    cancel: Option<CancellationToken>,
}

impl ParallelDownloaderBuilder {
    pub fn new() -> Self {
        Self {
            concurrency: NonZeroU32::MIN,
            retry: RetryPolicy::default(),
            cancel: None,
        }
    }

    pub fn concurrency(mut self, concurrency: NonZeroU32) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retry.max_retries = retries;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build<S>(self, source: S) -> ParallelDownloader<S>
    where
        S: StreamingSource + Send + Sync + 'static,
    {
        let downloader = ParallelDownloader::new(source, self.concurrency, self.retry);
        match self.cancel {
            Some(token) => downloader.with_cancellation(token),
            None => downloader,
        }
    }

    pub async fn download<S, W>(self, source: S, sink: &mut W) -> KasumiResult<DownloadReport>
    where
        S: StreamingSource + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        self.build(source).download(sink).await
    }
}

impl Default for ParallelDownloaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
