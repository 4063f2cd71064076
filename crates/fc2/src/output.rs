use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use chrono::{DateTime, Local};
use kasumi::remux::remux_stream;
use regex::Regex;

use crate::{
    config::RecorderConfig,
    error::{Fc2Error, Fc2Result},
    model::ChannelMeta,
};

// %(key)s or %%
static TEMPLATE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%(?:\(([^)]*)\)s|%)").unwrap());
static FORBIDDEN_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|]+"#).unwrap());
static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x1f\x7f]").unwrap());

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Makes `name` usable as a file name on Windows and Linux.
pub fn sanitize_filename(name: &str) -> String {
    let name = FORBIDDEN_CHARS.replace_all(name, "_");
    let name = CONTROL_CHARS.replace_all(&name, "");
    let name = name.trim().trim_matches('.');

    let upper = name.to_uppercase();
    let reserved = RESERVED_NAMES.iter().any(|reserved| {
        upper == *reserved
            || upper
                .strip_prefix(reserved)
                .is_some_and(|rest| rest.starts_with('.'))
    });
    if reserved {
        format!("_{name}")
    } else {
        name.to_string()
    }
}

/// `%(key)s` output template.
pub struct Template {
    args: HashMap<String, String>,
}

impl Template {
    pub fn new() -> Self {
        Self {
            args: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.args.insert(key.into(), value.into());
    }

    pub fn resolve(&self, template: &str) -> Fc2Result<String> {
        let mut result = String::with_capacity(template.len());
        let mut last = 0;
        for caps in TEMPLATE_REGEX.captures_iter(template) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            result.push_str(&template[last..whole.start()]);
            last = whole.end();

            match caps.get(1) {
                Some(key) => {
                    let value = self.args.get(key.as_str()).ok_or_else(|| {
                        Fc2Error::Template(format!("unknown key {}", key.as_str()))
                    })?;
                    result.push_str(value);
                }
                None => result.push('%'),
            }
        }
        result.push_str(&template[last..]);
        Ok(result)
    }
}

impl Default for Template {
    fn default() -> Self {
        Self::new()
    }
}

/// Where every file of one recording goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingOutput {
    /// Raw transport stream.
    pub stream: PathBuf,
    pub chat: PathBuf,
    pub info_json: PathBuf,
    pub thumbnail: PathBuf,
    pub websocket: Option<PathBuf>,
    /// Remux target: `.mp4`, or `.m4a` for audio-only recordings.
    pub muxed: PathBuf,
    /// Audio-only extraction target.
    pub audio: PathBuf,
}

/// Names output files from the output template and channel metadata.
pub struct OutputPlanner {
    outtmpl: String,
    template: Template,
}

impl OutputPlanner {
    pub fn new(config: &RecorderConfig, meta: Option<&ChannelMeta>, now: DateTime<Local>) -> Self {
        let mut template = Template::new();
        template.insert("date", now.format("%F").to_string());
        template.insert("time", now.format("%H%M%S").to_string());
        template.insert("ext", "");

        let (channel_id, channel_name, title) = match meta {
            Some(meta) => (
                meta.channel_data.channelid.as_str(),
                meta.profile_data.name.as_str(),
                meta.channel_data.title.as_str(),
            ),
            None => ("", "", ""),
        };
        template.insert("channel_id", sanitize_filename(channel_id));
        template.insert("channel_name", sanitize_filename(channel_name));
        template.insert("title", sanitize_filename(title));

        for (key, value) in config.string_params() {
            template.insert(key, value);
        }

        Self {
            outtmpl: config.outtmpl.clone(),
            template,
        }
    }

    /// Formats the template for `ext`.
    pub fn format(&self, ext: &str) -> Fc2Result<PathBuf> {
        let mut template = Template {
            args: self.template.args.clone(),
        };
        template.insert("ext", ext);

        let mut formatted = template.resolve(&self.outtmpl)?;
        if formatted.starts_with('-') {
            formatted.insert(0, '_');
        }
        Ok(PathBuf::from(formatted))
    }

    /// First path for `ext` that does not exist yet (`name.ext`, `name.1.ext`, ...),
    /// with its parent directories created.
    pub async fn prepare(&self, ext: &str) -> Fc2Result<PathBuf> {
        let mut n = 0;
        let path = loop {
            let ext = if n == 0 {
                ext.to_string()
            } else {
                format!("{n}.{ext}")
            };
            let path = self.format(&ext)?;
            if !tokio::fs::try_exists(&path).await? {
                break path;
            }
            n += 1;
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }

    pub async fn plan(&self, config: &RecorderConfig) -> Fc2Result<RecordingOutput> {
        let muxed_ext = if config.quality.is_audio_only() {
            "m4a"
        } else {
            "mp4"
        };
        Ok(RecordingOutput {
            info_json: self.prepare("info.json").await?,
            thumbnail: self.prepare("png").await?,
            stream: self.prepare("ts").await?,
            chat: self.prepare("fc2chat.json").await?,
            muxed: self.prepare(muxed_ext).await?,
            audio: self.prepare("m4a").await?,
            websocket: match config.dump_websocket {
                true => Some(self.prepare("ws").await?),
                false => None,
            },
        })
    }
}

/// Whether `path` exists and is not empty.
pub async fn has_content(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false)
}

/// Remuxes a finished recording, extracts its audio and removes the raw stream, as configured.
///
/// Returns `false` when nothing was remuxed.
pub async fn post_process(output: &RecordingOutput, config: &RecorderConfig) -> Fc2Result<bool> {
    if !config.remux {
        log::debug!("Not remuxing stream");
        return Ok(false);
    }
    if !has_content(&output.stream).await {
        log::info!("Nothing was recorded, skipping remux");
        return Ok(false);
    }

    log::info!("Remuxing stream to {}", output.muxed.display());
    remux_stream(&output.stream, &output.muxed, &[]).await?;
    log::debug!("Finished remuxing stream {}", output.muxed.display());

    if config.extract_audio {
        if output.audio == output.muxed {
            log::info!("Recording is audio only, skipping audio extraction");
        } else {
            log::info!("Extracting audio to {}", output.audio.display());
            remux_stream(&output.stream, &output.audio, &["-vn"]).await?;
        }
    }

    if !config.keep_intermediates && has_content(&output.muxed).await {
        log::info!("Removing intermediate files");
        tokio::fs::remove_file(&output.stream).await?;
    }
    Ok(true)
}
