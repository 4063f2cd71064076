use std::{future::Future, path::Path, time::Duration};

use fake_user_agent::get_chrome_rua;
use kasumi::{
    hls::{load_manifest, HlsLiveSource},
    HttpClient, KasumiError, StreamingSource,
};
use reqwest::Client;
use tokio::sync::{broadcast, watch};

use crate::{
    config::RecorderConfig,
    control::{ControlChannel, ControlEvent, ControlOptions},
    cookies::load_cookies_file,
    error::{Fc2Error, Fc2Result},
    live::Fc2LiveStream,
    model::{ChannelMeta, HlsInformation},
    resolver::PlaylistRef,
};

/// An open control session.
pub trait ControlSession: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ControlEvent>;

    fn hls_information(&self) -> impl Future<Output = Fc2Result<HlsInformation>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

impl ControlSession for ControlChannel {
    fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        ControlChannel::subscribe(self)
    }

    async fn hls_information(&self) -> Fc2Result<HlsInformation> {
        ControlChannel::hls_information(self).await
    }

    async fn close(&self) {
        ControlChannel::close(self).await
    }
}

pub struct Connected<C> {
    pub channel: C,
    pub control_token: String,
    pub user_id: Option<String>,
}

/// Everything the recorder needs from the outside world.
pub trait LivePlatform: Send + Sync {
    type Channel: ControlSession + 'static;
    type Source: StreamingSource + Send + Sync + 'static;

    fn channel_id(&self) -> &str;

    fn channel_meta(&self) -> impl Future<Output = Fc2Result<ChannelMeta>> + Send;

    /// Opens a control channel, writing its frames to `dump` when given.
    fn connect(
        &self,
        meta: &ChannelMeta,
        dump: Option<&Path>,
    ) -> impl Future<Output = Fc2Result<Connected<Self::Channel>>> + Send;

    /// Segment source of `playlist`. `ended` turns `true` once the broadcaster stopped.
    ///
    /// Segments up to and including `after` were handled by an earlier session and must not
    /// be handed out again.
    fn playlist_source(
        &self,
        playlist: &PlaylistRef,
        after: Option<u64>,
        ended: watch::Receiver<bool>,
    ) -> impl Future<Output = Fc2Result<Self::Source>> + Send;

    fn download_thumbnail(
        &self,
        meta: &ChannelMeta,
        path: &Path,
    ) -> impl Future<Output = Fc2Result<()>> + Send;
}

/// live.fc2.com
pub struct Fc2Platform {
    live: Fc2LiveStream,
    control: ControlOptions,
    manifest_retries: u32,
    segment_timeout: Duration,
    /// How long a stopped broadcast may keep an unchanged playlist.
    ended_grace: Duration,
}

impl Fc2Platform {
    pub fn http_client(config: &RecorderConfig) -> Fc2Result<HttpClient> {
        let mut builder = Client::builder()
            .user_agent(get_chrome_rua())
            // https://github.com/jgraef/reqwest-websocket/issues/2
            .http1_only();
        if !config.trust_env_proxy {
            builder = builder.no_proxy();
        }
        Ok(HttpClient::new(builder)?)
    }

    pub async fn new(channel_id: impl Into<String>, config: &RecorderConfig) -> Fc2Result<Self> {
        let client = Self::http_client(config)?;
        if let Some(cookies_file) = &config.cookies_file {
            load_cookies_file(&client, cookies_file).await?;
        }
        Ok(Self::with_live(Fc2LiveStream::new(client, channel_id), config))
    }

    pub fn with_live(live: Fc2LiveStream, config: &RecorderConfig) -> Self {
        Self {
            live,
            control: ControlOptions::default(),
            manifest_retries: config.segment_retries,
            segment_timeout: config.segment_timeout,
            ended_grace: Duration::from_secs(5),
        }
    }

    pub fn with_control_options(mut self, options: ControlOptions) -> Self {
        self.control = options;
        self
    }

    pub fn live(&self) -> &Fc2LiveStream {
        &self.live
    }
}

impl LivePlatform for Fc2Platform {
    type Channel = ControlChannel;
    type Source = HlsLiveSource;

    fn channel_id(&self) -> &str {
        self.live.channel_id()
    }

    async fn channel_meta(&self) -> Fc2Result<ChannelMeta> {
        self.live.meta().await
    }

    async fn connect(
        &self,
        meta: &ChannelMeta,
        dump: Option<&Path>,
    ) -> Fc2Result<Connected<ControlChannel>> {
        let (server, claims) = self.live.control_server(meta).await?;
        log::info!("Found websocket url");

        let options = ControlOptions {
            dump: dump.map(Path::to_path_buf),
            ..self.control.clone()
        };
        let channel =
            ControlChannel::connect(self.live.client(), &server.websocket_url(), options).await?;
        Ok(Connected {
            channel,
            user_id: claims.user_id().map(str::to_string),
            control_token: server.control_token,
        })
    }

    async fn playlist_source(
        &self,
        playlist: &PlaylistRef,
        after: Option<u64>,
        ended: watch::Receiver<bool>,
    ) -> Fc2Result<HlsLiveSource> {
        let client = self.live.client().clone();
        let manifest = load_manifest(
            &client,
            playlist.url.clone(),
            self.manifest_retries,
            self.segment_timeout,
        )
        .await
        .map_err(|e| match e {
            KasumiError::PlaylistGone(_) => Fc2Error::BroadcastEnded,
            e => e.into(),
        })?;

        Ok(HlsLiveSource::new(client, playlist.url.clone())
            .with_initial_manifest(manifest)
            .with_last_sequence(after)
            .with_retry(self.manifest_retries)
            .with_manifest_timeout(self.segment_timeout)
            .with_segment_timeout(self.segment_timeout)
            .with_end_signal(ended, self.ended_grace))
    }

    async fn download_thumbnail(&self, meta: &ChannelMeta, path: &Path) -> Fc2Result<()> {
        self.live.download_thumbnail(meta, path).await
    }
}
