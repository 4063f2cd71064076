use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use kasumi_fc2::{output::post_process, Fc2Platform, Recorder, RecorderConfig, RecordingOutcome};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{prelude::*, reload, EnvFilter, Registry};

use crate::config::AutoFc2Config;

mod config;

const TICK: Duration = Duration::from_secs(1);

#[derive(Parser, Debug, Clone)]
#[clap(name = "autofc2", version, about = "Automatically download FC2 live streams")]
struct AutoFc2Args {
    /// Config file to use, TOML or JSON
    #[clap(short, long, default_value = "autofc2.toml")]
    config: PathBuf,
}

type LogHandle = reload::Handle<EnvFilter, Registry>;

fn init_logging() -> LogHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    handle
}

struct ChannelTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

struct Supervisor {
    path: PathBuf,
    /// Last config that could be read.
    config: AutoFc2Config,
    log: LogHandle,
    log_level: Option<String>,
    tasks: HashMap<String, ChannelTask>,
    /// Channels removed from the config that are still shutting down.
    stopping: Vec<JoinHandle<()>>,
    last_start: HashMap<String, Instant>,
    shutdown: CancellationToken,
}

impl Supervisor {
    fn new(path: PathBuf, log: LogHandle) -> anyhow::Result<Self> {
        let config = AutoFc2Config::load(&path)?;
        Ok(Self {
            path,
            config,
            log,
            log_level: None,
            tasks: HashMap::new(),
            stopping: Vec::new(),
            last_start: HashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    fn reload_config(&mut self) {
        match AutoFc2Config::load(&self.path) {
            Ok(config) => self.config = config,
            Err(e) => log::warn!("Unable to load config, using last valid one: {e:#}"),
        }
    }

    fn apply_log_level(&mut self) {
        let level = self.config.autofc2.log_level.clone();
        if level == self.log_level {
            return;
        }
        self.log_level = level;

        let Some(level) = &self.log_level else {
            return;
        };
        let filter = match level.as_str() {
            "silent" => EnvFilter::new("off"),
            level => match EnvFilter::try_new(level) {
                Ok(filter) => filter,
                Err(e) => {
                    log::error!("Invalid log level {level}: {e}");
                    return;
                }
            },
        };
        match self.log.reload(filter) {
            Ok(()) => log::info!("Setting log level to {level}"),
            Err(e) => log::error!("Failed to set log level: {e}"),
        }
    }

    fn tick(&mut self) {
        self.reload_config();
        self.apply_log_level();

        let removed: Vec<_> = self
            .tasks
            .keys()
            .filter(|id| !self.config.channels.contains_key(*id))
            .cloned()
            .collect();
        for channel_id in removed {
            if let Some(task) = self.tasks.remove(&channel_id) {
                log::info!("[{channel_id}] Removed from config, stopping");
                task.cancel.cancel();
                self.stopping.push(task.handle);
            }
        }
        self.stopping.retain(|handle| !handle.is_finished());

        let channels: Vec<_> = self.config.channels.keys().cloned().collect();
        for channel_id in channels {
            let running = self
                .tasks
                .get(&channel_id)
                .is_some_and(|task| !task.handle.is_finished());
            if !running {
                self.spawn(channel_id);
            }
        }
    }

    fn spawn(&mut self, channel_id: String) {
        let config = match self.config.channel_config(&channel_id) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                log::error!("[{channel_id}] {e:#}");
                return;
            }
        };

        let now = Instant::now();
        let start_at = self
            .last_start
            .get(&channel_id)
            .map(|last| *last + self.config.autofc2.debounce_time)
            .filter(|at| *at > now)
            .unwrap_or(now);
        self.last_start.insert(channel_id.clone(), start_at);

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(record_channel(
            channel_id.clone(),
            config,
            start_at,
            cancel.clone(),
        ));
        self.tasks.insert(channel_id, ChannelTask { handle, cancel });
    }

    async fn run(mut self) {
        log::info!("autofc2 v{}", env!("CARGO_PKG_VERSION"));
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::warn!("Interrupted");
                    break;
                }
                _ = ticker.tick() => self.tick(),
            }
        }

        self.shutdown.cancel();
        let handles = self
            .tasks
            .into_values()
            .map(|task| task.handle)
            .chain(self.stopping);
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Channel task panicked: {e}");
            }
        }
    }
}

async fn record_channel(
    channel_id: String,
    config: Arc<RecorderConfig>,
    start_at: Instant,
    cancel: CancellationToken,
) {
    if start_at > Instant::now() {
        log::debug!("[{channel_id}] Debouncing");
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep_until(start_at) => {}
        }
    }

    let platform = match Fc2Platform::new(channel_id.clone(), &config).await {
        Ok(platform) => platform,
        Err(e) => {
            log::error!("[{channel_id}] {e}");
            return;
        }
    };
    let report = Recorder::new(platform, config.clone())
        .with_cancellation(cancel)
        .run()
        .await;

    if let Some(output) = &report.output {
        if let Err(e) = post_process(output, &config).await {
            log::error!("[{channel_id}] Failed to remux the recording: {e}");
        }
    }
    match report.outcome {
        RecordingOutcome::Failed(reason) => {
            log::error!("[{channel_id}] Recording failed: {reason:?}")
        }
        outcome => log::info!(
            "[{channel_id}] Recording finished ({outcome:?}), {} segments",
            report.segments
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = AutoFc2Args::parse();
    let log = init_logging();

    let supervisor = Supervisor::new(args.config, log)?;
    supervisor.run().await;
    Ok(())
}
