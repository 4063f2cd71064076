//! Container remux through the ffmpeg CLI.
//!
//! Recordings are written as a plain MPEG-TS concatenation. Remuxing copies the streams into
//! an mp4/m4a container without re-encoding.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use tokio::process::Command;

use crate::error::{KasumiError, KasumiResult};

/// Location of the `ffmpeg` executable in `PATH`.
pub fn ffmpeg_path() -> KasumiResult<PathBuf> {
    Ok(which::which("ffmpeg")?)
}

fn remux_args<I, O>(input: I, output: O, extra_flags: &[&str]) -> Vec<OsString>
where
    I: AsRef<Path>,
    O: AsRef<Path>,
{
    let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "fatal", "-stats", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(input.as_ref().into());
    args.extend(extra_flags.iter().map(OsString::from));
    args.extend(
        ["-c", "copy", "-movflags", "faststart"]
            .iter()
            .map(OsString::from),
    );
    args.push(output.as_ref().into());
    args
}

/// Copies the streams of `input` into `output`. `extra_flags` go right after the input,
/// e.g. `["-vn"]` to drop the video track.
pub async fn remux_stream<I, O>(input: I, output: O, extra_flags: &[&str]) -> KasumiResult<()>
where
    I: AsRef<Path>,
    O: AsRef<Path>,
{
    let ffmpeg = ffmpeg_path()?;
    tracing::debug!(
        "Remuxing {} to {}",
        input.as_ref().display(),
        output.as_ref().display()
    );

    let status = Command::new(ffmpeg)
        .args(remux_args(&input, &output, extra_flags))
        .kill_on_drop(true)
        .spawn()?
        .wait()
        .await?;

    if !status.success() {
        return Err(KasumiError::ProcessFailed {
            program: "ffmpeg".to_string(),
            status,
        });
    }

    Ok(())
}
