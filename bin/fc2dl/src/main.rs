use std::{num::NonZeroU32, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use kasumi_fc2::{
    config::DEFAULT_OUTTMPL, output::post_process, Fc2Platform, Latency, Quality, Recorder,
    RecorderConfig, RecordingOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug, Clone)]
#[clap(name = "fc2dl", version, about = "Download fc2 livestreams")]
pub struct Fc2Args {
    /// A live.fc2.com URL, or the channel id
    url: String,

    /// Quality of the stream to download
    ///
    /// One of 150Kbps, 400Kbps, 1.2Mbps, 2Mbps, 3Mbps or sound.
    #[clap(long, default_value = "3Mbps")]
    quality: Quality,

    /// Stream latency: low, high or mid
    #[clap(long, default_value = "mid")]
    latency: Latency,

    /// Threads limit
    #[clap(long, default_value = "1")]
    threads: NonZeroU32,

    /// Output template
    ///
    /// Available keys: channel_id, channel_name, date, time, title, ext.
    #[clap(short, long, default_value = DEFAULT_OUTTMPL)]
    output: String,

    /// Do not remux recordings into mp4/m4a after it is finished
    #[clap(long)]
    no_remux: bool,

    /// Keep the raw .ts recordings after it has been remuxed
    #[clap(short, long)]
    keep_intermediates: bool,

    /// Generate an audio-only copy of the stream
    #[clap(short = 'x', long)]
    extract_audio: bool,

    /// Path to a cookies file
    #[clap(long)]
    cookies: Option<PathBuf>,

    /// Save live chat into a json file
    #[clap(long)]
    write_chat: bool,

    /// Dump output stream information into a json file
    #[clap(long)]
    write_info_json: bool,

    /// Download thumbnail into a file
    #[clap(long)]
    write_thumbnail: bool,

    /// Wait until the broadcast goes live, then start recording
    #[clap(long)]
    wait: bool,

    /// Seconds to wait for the requested quality before falling back
    #[clap(long, default_value = "15")]
    wait_for_quality_timeout: f64,

    /// Seconds between checks while waiting for the stream to go live
    #[clap(long, default_value = "5")]
    poll_interval: f64,

    /// Reconnect attempts after the control channel was lost
    #[clap(long, default_value = "3")]
    reconnect_retries: u32,

    /// Retry limit of a single segment
    #[clap(long, default_value = "5")]
    retries: u32,

    /// Log level: silent, error, warn, info, debug or trace. Defaults to RUST_LOG, then info
    #[clap(long)]
    log_level: Option<String>,

    /// Trust environment variables for proxy settings
    #[clap(long)]
    trust_env_proxy: bool,

    /// Dump all websocket communication to a file for debugging
    #[clap(long)]
    dump_websocket: bool,
}

impl Fc2Args {
    fn config(&self) -> anyhow::Result<RecorderConfig> {
        Ok(RecorderConfig {
            quality: self.quality,
            latency: self.latency,
            threads: self.threads,
            outtmpl: self.output.clone(),
            write_chat: self.write_chat,
            write_info_json: self.write_info_json,
            write_thumbnail: self.write_thumbnail,
            dump_websocket: self.dump_websocket,
            wait_for_live: self.wait,
            wait_for_quality_timeout: Duration::try_from_secs_f64(self.wait_for_quality_timeout)
                .context("invalid --wait-for-quality-timeout")?,
            wait_poll_interval: Duration::try_from_secs_f64(self.poll_interval)
                .context("invalid --poll-interval")?,
            cookies_file: self.cookies.clone(),
            trust_env_proxy: self.trust_env_proxy,
            remux: !self.no_remux,
            keep_intermediates: self.keep_intermediates,
            extract_audio: self.extract_audio,
            reconnect_retries: self.reconnect_retries,
            segment_retries: self.retries,
            ..Default::default()
        })
    }
}

/// `https://live.fc2.com/<id>/` or a bare id.
fn parse_channel_id(input: &str) -> anyhow::Result<String> {
    if !input.is_empty() && input.chars().all(|c| c.is_ascii_digit()) {
        return Ok(input.to_string());
    }

    let url = Url::parse(input).context("please provide a https://live.fc2.com/ URL")?;
    if url.host_str() != Some("live.fc2.com") {
        bail!("please provide a https://live.fc2.com/ URL");
    }
    match url.path_segments().and_then(|mut s| s.next()) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => bail!("no channel id in {input}"),
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some("silent") => EnvFilter::new("off"),
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Fc2Args::parse();
    init_logging(args.log_level.as_deref());

    let channel_id = parse_channel_id(&args.url)?;
    let config = Arc::new(args.config()?.validate());
    log::info!("fc2dl v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Using options: {config:?}");

    let platform = Fc2Platform::new(channel_id, &config).await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, stopping the recording");
                cancel.cancel();
            }
        }
    });

    let report = Recorder::new(platform, config.clone())
        .with_cancellation(cancel)
        .run()
        .await;
    log::info!(
        "Recorded {} segments, {} skipped, {} reconnects",
        report.segments,
        report.skipped.len(),
        report.reconnects
    );

    if let Some(output) = &report.output {
        if let Err(e) = post_process(output, &config).await {
            log::error!("Failed to remux the recording: {e}");
        }
    }

    match report.outcome {
        RecordingOutcome::Failed(reason) => {
            log::error!("Recording failed: {reason:?}");
            std::process::exit(1);
        }
        RecordingOutcome::Stopped | RecordingOutcome::Cancelled => Ok(()),
    }
}
