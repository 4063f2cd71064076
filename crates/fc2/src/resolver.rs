//! Picks a playlist out of a `get_hls_information` reply.
//!
//! [`resolve`] only ever returns the requested mode. Substitution is left to [`fallback`] so
//! that the caller can wait for the requested quality first.

use url::Url;

use crate::{
    error::{Fc2Error, Fc2Result},
    model::HlsInformation,
    quality::{Latency, Mode, Quality},
};

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistRef {
    pub url: Url,
    pub mode: Mode,
}

/// Modes present in `info`, unknown codes ignored.
pub fn available_modes(info: &HlsInformation) -> Vec<Mode> {
    let mut modes: Vec<Mode> = Vec::new();
    for mode in info.merged().filter_map(|p| Mode::from_code(p.mode)) {
        if !modes.contains(&mode) {
            modes.push(mode);
        }
    }
    modes
}

fn find(info: &HlsInformation, mode: Mode) -> Option<Fc2Result<PlaylistRef>> {
    info.merged()
        .find(|p| p.mode == mode.code())
        .map(|p| -> Fc2Result<PlaylistRef> {
            Ok(PlaylistRef {
                url: Url::parse(&p.url)?,
                mode,
            })
        })
}

pub fn resolve(info: &HlsInformation, requested: Mode) -> Fc2Result<PlaylistRef> {
    if info.merged().next().is_none() {
        return Err(Fc2Error::EmptyPlaylist);
    }

    match find(info, requested) {
        Some(playlist) => playlist,
        None => Err(Fc2Error::QualityUnavailable {
            requested,
            available: available_modes(info),
        }),
    }
}

/// Order in which modes are tried when `requested` is not offered.
///
/// The requested latency is kept as long as possible: tiers below the requested one come
/// first, best first, followed by the tiers above it. Only then are the other latencies
/// walked the same way, starting from the requested tier.
pub fn fallback_order(requested: Mode) -> Vec<Mode> {
    let position = Quality::PREFERENCE
        .iter()
        .position(|q| *q == requested.quality)
        .unwrap_or_default();
    let below = &Quality::PREFERENCE[position + 1..];
    let above = &Quality::PREFERENCE[..position];

    let mut order = Vec::new();
    for quality in below.iter().chain(above.iter().rev()) {
        order.push(Mode::new(*quality, requested.latency));
    }
    for latency in Latency::ALL.into_iter().filter(|l| *l != requested.latency) {
        order.push(Mode::new(requested.quality, latency));
        for quality in below.iter().chain(above.iter().rev()) {
            order.push(Mode::new(*quality, latency));
        }
    }
    order
}

/// Next best playlist after `requested`, or `None` when nothing usable is offered.
pub fn fallback(info: &HlsInformation, requested: Mode) -> Option<PlaylistRef> {
    fallback_order(requested)
        .into_iter()
        .filter_map(|mode| find(info, mode))
        .find_map(|playlist| match playlist {
            Ok(playlist) => Some(playlist),
            Err(e) => {
                log::warn!("Ignoring playlist with invalid url: {e}");
                None
            }
        })
}
