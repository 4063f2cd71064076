use std::{path::Path, sync::Arc, time::Duration};

use chrono::Utc;
use kasumi_fc2::{
    chat::CommentEvent,
    control::{CloseReason, ControlEvent},
    session::AcquisitionState::{self, *},
    FailureReason, Latency, Mode, Quality, Recorder, RecorderConfig, RecordingOutcome,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::fake::{
    expected_output, FakePlatform, FakeSession, MetaReply, Refusal, SourceEnd, CHANNEL_ID,
};

const MBPS3_MID: u32 = 52;
const MBPS2_MID: u32 = 42;
const MBPS1_2_MID: u32 = 32;

fn config(dir: &Path) -> RecorderConfig {
    RecorderConfig {
        outtmpl: format!("{}/%(channel_id)s.%(ext)s", dir.display()),
        ..Default::default()
    }
}

fn stream_path(dir: &Path) -> std::path::PathBuf {
    dir.join(format!("{CHANNEL_ID}.ts"))
}

fn comment(body: &str) -> ControlEvent {
    ControlEvent::Comment(CommentEvent::from_raw(
        json!({ "user_name": "viewer", "comment": body }),
        Utc::now(),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_records_until_playlist_ends() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = RecorderConfig {
        write_info_json: true,
        write_thumbnail: true,
        ..config(dir.path())
    };
    let platform = FakePlatform::new(vec![
        FakeSession::new(&[MBPS3_MID, MBPS2_MID]).segments(0..5)
    ]);

    let report = Recorder::new(platform, Arc::new(config)).run().await;

    assert_eq!(report.outcome, RecordingOutcome::Stopped);
    assert_eq!(
        report.states,
        vec![Idle, Negotiating, Downloading, Stopping, Stopped]
    );
    assert_eq!(report.mode, Some(Mode::new(Quality::Mbps3, Latency::Mid)));
    assert_eq!(report.segments, 5);
    assert!(report.skipped.is_empty());

    let output = report.output.expect("output should be planned");
    assert_eq!(output.stream, stream_path(dir.path()));
    assert_eq!(
        tokio::fs::read_to_string(&output.stream).await?,
        expected_output(0..5)
    );

    let info: serde_json::Value = serde_json::from_slice(&tokio::fs::read(&output.info_json).await?)?;
    assert_eq!(info["channel_data"]["title"], "Test & stream");
    assert!(output.thumbnail.exists());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_after_quality_timeout() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = RecorderConfig {
        wait_for_quality_timeout: Duration::from_secs(3),
        ..config(dir.path())
    };
    let platform = FakePlatform::new(vec![
        FakeSession::new(&[MBPS1_2_MID, MBPS2_MID]).segments(0..2)
    ]);
    let stats = platform.stats.clone();

    let report = Recorder::new(platform, Arc::new(config)).run().await;

    assert_eq!(report.outcome, RecordingOutcome::Stopped);
    assert_eq!(
        report.states,
        vec![Idle, Negotiating, QualityFallback, Downloading, Stopping, Stopped]
    );
    // next best tier at the same latency
    assert_eq!(report.mode, Some(Mode::new(Quality::Mbps2, Latency::Mid)));
    // asked once per second until the timeout
    assert!(stats.info_calls.load(std::sync::atomic::Ordering::SeqCst) >= 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fails_without_any_known_quality() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = RecorderConfig {
        wait_for_quality_timeout: Duration::from_secs(2),
        ..config(dir.path())
    };
    let platform = FakePlatform::new(vec![FakeSession::new(&[77])]);

    let report = Recorder::new(platform, Arc::new(config)).run().await;

    let failed = Failed(FailureReason::NoQualityAvailable);
    assert_eq!(report.outcome, RecordingOutcome::Failed(FailureReason::NoQualityAvailable));
    assert_eq!(
        report.states,
        vec![Idle, Negotiating, QualityFallback, failed]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_are_bounded_and_backed_off() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = RecorderConfig {
        reconnect_retries: 2,
        reconnect_backoff: Duration::from_secs(2),
        ..config(dir.path())
    };
    let lost = || {
        FakeSession::new(&[MBPS3_MID])
            .end(SourceEnd::HoldOpen)
            .close_after(Duration::from_secs(1), CloseReason::ConnectionLost("reset".into()))
    };
    let platform = FakePlatform::new(vec![lost(), lost(), lost(), lost()]);
    let stats = platform.stats.clone();

    let report = Recorder::new(platform, Arc::new(config)).run().await;

    assert_eq!(report.outcome, RecordingOutcome::Failed(FailureReason::ConnectionLost));
    assert_eq!(report.reconnects, 2);
    assert_eq!(
        report.states,
        vec![
            Idle,
            Negotiating,
            Downloading,
            Negotiating,
            Downloading,
            Negotiating,
            Downloading,
            Stopping,
            Failed(FailureReason::ConnectionLost),
        ]
    );

    let connects = stats.connects.lock().clone();
    assert_eq!(connects.len(), 3);
    // one second of downloading, then 2s and 4s of backoff
    assert!(connects[1] - connects[0] >= Duration::from_secs(3));
    assert!(connects[2] - connects[1] >= Duration::from_secs(5));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_output_is_appended_across_reconnects() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = FakePlatform::new(vec![
        FakeSession::new(&[MBPS3_MID])
            .segments(0..3)
            .end(SourceEnd::HoldOpen)
            .close_after(Duration::from_secs(2), CloseReason::Server(4000)),
        FakeSession::refused(Refusal::Network),
        FakeSession::new(&[MBPS3_MID]).segments(3..6),
    ]);

    let report = Recorder::new(platform, Arc::new(config(dir.path()))).run().await;

    assert_eq!(report.outcome, RecordingOutcome::Stopped);
    assert_eq!(report.reconnects, 2);
    assert_eq!(report.segments, 6);
    assert_eq!(
        tokio::fs::read_to_string(stream_path(dir.path())).await?,
        expected_output(0..6)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_window_after_reconnect_is_written_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = FakePlatform::new(vec![
        FakeSession::new(&[MBPS3_MID])
            .segments(0..4)
            .end(SourceEnd::HoldOpen)
            .close_after(Duration::from_secs(2), CloseReason::ConnectionLost("reset".into())),
        // the live window still holds 2 and 3
        FakeSession::new(&[MBPS3_MID]).segments(2..6),
    ]);
    let stats = platform.stats.clone();

    let report = Recorder::new(platform, Arc::new(config(dir.path()))).run().await;

    assert_eq!(report.outcome, RecordingOutcome::Stopped);
    assert_eq!(report.reconnects, 1);
    assert_eq!(report.segments, 6);
    assert_eq!(report.last_sequence, Some(5));
    assert_eq!(*stats.resumed_after.lock(), vec![None, Some(3)]);
    assert_eq!(
        tokio::fs::read_to_string(stream_path(dir.path())).await?,
        expected_output(0..6)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_progress_resets_reconnect_budget() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = RecorderConfig {
        reconnect_retries: 1,
        ..config(dir.path())
    };
    let flaky = |segments| {
        FakeSession::new(&[MBPS3_MID])
            .segments(segments)
            .end(SourceEnd::HoldOpen)
            .close_after(Duration::from_secs(1), CloseReason::ConnectionLost("reset".into()))
    };
    let platform = FakePlatform::new(vec![
        flaky(0..2),
        flaky(2..4),
        flaky(4..6),
        FakeSession::new(&[MBPS3_MID]).segments(6..8),
    ]);

    let report = Recorder::new(platform, Arc::new(config)).run().await;

    assert_eq!(report.outcome, RecordingOutcome::Stopped);
    assert_eq!(report.reconnects, 3);
    assert_eq!(
        tokio::fs::read_to_string(stream_path(dir.path())).await?,
        expected_output(0..8)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_auth_failures_are_not_retried() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = FakePlatform::new(vec![
        FakeSession::new(&[MBPS3_MID])
            .segments(0..2)
            .end(SourceEnd::HoldOpen)
            .close_after(Duration::from_secs(1), CloseReason::LoginRequired),
        FakeSession::new(&[MBPS3_MID]),
    ]);
    let stats = platform.stats.clone();

    let report = Recorder::new(platform, Arc::new(config(dir.path()))).run().await;

    assert_eq!(report.outcome, RecordingOutcome::Failed(FailureReason::LoginRequired));
    assert_eq!(
        report.states,
        vec![Idle, Negotiating, Downloading, Failed(FailureReason::LoginRequired)]
    );
    assert_eq!(stats.connects.lock().len(), 1);
    // what was downloaded is kept
    assert_eq!(
        tokio::fs::read_to_string(stream_path(dir.path())).await?,
        expected_output(0..2)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refused_login_fails_while_negotiating() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = FakePlatform::new(vec![FakeSession::refused(Refusal::LoginRequired)]);

    let report = Recorder::new(platform, Arc::new(config(dir.path()))).run().await;

    assert_eq!(
        report.states,
        vec![Idle, Negotiating, Failed(FailureReason::LoginRequired)]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_keeps_written_prefix() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = FakePlatform::new(vec![FakeSession::new(&[MBPS3_MID])
        .segments(0..4)
        .end(SourceEnd::HoldOpen)]);
    let token = CancellationToken::new();

    let recorder =
        Recorder::new(platform, Arc::new(config(dir.path()))).with_cancellation(token.clone());
    let mut state = recorder.subscribe_state();
    let recording = tokio::spawn(recorder.run());

    state.wait_for(|s| *s == Downloading).await?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    token.cancel();
    let report = recording.await?;

    assert_eq!(report.outcome, RecordingOutcome::Cancelled);
    assert_eq!(report.states.last(), Some(&Stopped));
    assert_eq!(report.states[report.states.len() - 2], Stopping);
    assert_eq!(
        tokio::fs::read_to_string(stream_path(dir.path())).await?,
        expected_output(0..4)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_publish_stop_ends_recording() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = RecorderConfig {
        write_chat: true,
        ..config(dir.path())
    };
    let platform = FakePlatform::new(vec![FakeSession::new(&[MBPS3_MID])
        .segments(0..3)
        .end(SourceEnd::OnEndSignal)
        .event(Duration::from_secs(1), comment("hello"))
        .event(Duration::from_secs(1), comment("bye"))
        .close_after(Duration::from_secs(1), CloseReason::PublishStop)]);

    let report = Recorder::new(platform, Arc::new(config)).run().await;

    assert_eq!(report.outcome, RecordingOutcome::Stopped);
    assert_eq!(report.comments, 2);

    let chat = tokio::fs::read_to_string(report.output.unwrap().chat).await?;
    let lines: Vec<serde_json::Value> = chat
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["body"], "hello");
    assert_eq!(lines[1]["body"], "bye");
    assert_eq!(lines[1]["author"], "viewer");
    Ok(())
}

mod broken {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };

    use tokio::io::AsyncWrite;

    pub struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::other("no space left on device")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("no space left on device")))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_chat_failures_do_not_change_states() -> anyhow::Result<()> {
    async fn record(broken_chat: bool) -> anyhow::Result<(RecordingOutcome, Vec<AcquisitionState>, u64)> {
        let dir = tempfile::tempdir()?;
        let platform = FakePlatform::new(vec![FakeSession::new(&[MBPS3_MID])
            .segments(0..3)
            .end(SourceEnd::OnEndSignal)
            .event(Duration::from_secs(1), comment("one"))
            .event(Duration::from_secs(1), comment("two"))
            .close_after(Duration::from_secs(1), CloseReason::PublishStop)]);

        let recorder = Recorder::new(platform, Arc::new(config(dir.path())));
        let recorder = if broken_chat {
            recorder.with_chat_writer(broken::BrokenWriter)
        } else {
            recorder.with_chat_writer(tokio::fs::File::create(dir.path().join("chat.json")).await?)
        };
        let report = recorder.run().await;
        assert_eq!(
            tokio::fs::read_to_string(stream_path(dir.path())).await?,
            expected_output(0..3)
        );
        Ok((report.outcome, report.states, report.comments))
    }

    let (healthy_outcome, healthy_states, healthy_comments) = record(false).await?;
    let (broken_outcome, broken_states, broken_comments) = record(true).await?;

    assert_eq!(healthy_comments, 2);
    assert_eq!(broken_comments, 0);
    assert_eq!(healthy_outcome, RecordingOutcome::Stopped);
    assert_eq!(broken_outcome, healthy_outcome);
    assert_eq!(broken_states, healthy_states);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_offline_channel_fails_without_waiting() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let platform = FakePlatform::new(vec![]).with_status(vec![MetaReply::Offline]);

    let report = Recorder::new(platform, Arc::new(config(dir.path()))).run().await;

    assert_eq!(report.outcome, RecordingOutcome::Failed(FailureReason::NotOnline));
    assert_eq!(report.states, vec![Idle, Failed(FailureReason::NotOnline)]);
    assert!(report.output.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_live_with_backoff_on_errors() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = RecorderConfig {
        wait_for_live: true,
        wait_poll_interval: Duration::from_secs(5),
        ..config(dir.path())
    };
    let platform = FakePlatform::new(vec![FakeSession::new(&[MBPS3_MID]).segments(0..1)])
        .with_status(vec![
            MetaReply::Offline,
            MetaReply::Error,
            MetaReply::Error,
            MetaReply::Offline,
            MetaReply::Online,
        ]);
    let stats = platform.stats.clone();

    let report = Recorder::new(platform, Arc::new(config)).run().await;

    assert_eq!(report.outcome, RecordingOutcome::Stopped);
    assert_eq!(
        report.states,
        vec![Idle, WaitingForLive, Negotiating, Downloading, Stopping, Stopped]
    );

    let checks = stats.meta_checks.lock().clone();
    let gaps: Vec<Duration> = checks.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(20),
            // restored after a successful check
            Duration::from_secs(5),
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_for_live() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = RecorderConfig {
        wait_for_live: true,
        ..config(dir.path())
    };
    let platform = FakePlatform::new(vec![]).with_status(vec![MetaReply::Offline; 100]);
    let token = CancellationToken::new();

    let recorder = Recorder::new(platform, Arc::new(config)).with_cancellation(token.clone());
    let recording = tokio::spawn(recorder.run());
    tokio::time::sleep(Duration::from_secs(12)).await;
    token.cancel();
    let report = recording.await?;

    assert_eq!(report.outcome, RecordingOutcome::Cancelled);
    assert_eq!(report.states, vec![Idle, WaitingForLive, Stopping, Stopped]);
    Ok(())
}
