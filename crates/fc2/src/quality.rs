use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Quality tiers offered by FC2, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Quality {
    Kbps150,
    Kbps400,
    Mbps1_2,
    Mbps2,
    Mbps3,
    Sound,
}

impl Quality {
    /// Fallback preference, best first.
    pub const PREFERENCE: [Quality; 6] = [
        Quality::Mbps3,
        Quality::Mbps2,
        Quality::Mbps1_2,
        Quality::Kbps400,
        Quality::Kbps150,
        Quality::Sound,
    ];

    pub fn code(&self) -> u32 {
        match self {
            Quality::Kbps150 => 10,
            Quality::Kbps400 => 20,
            Quality::Mbps1_2 => 30,
            Quality::Mbps2 => 40,
            Quality::Mbps3 => 50,
            Quality::Sound => 90,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::PREFERENCE.into_iter().find(|q| q.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Kbps150 => "150Kbps",
            Quality::Kbps400 => "400Kbps",
            Quality::Mbps1_2 => "1.2Mbps",
            Quality::Mbps2 => "2Mbps",
            Quality::Mbps3 => "3Mbps",
            Quality::Sound => "sound",
        }
    }

    pub fn is_audio_only(&self) -> bool {
        matches!(self, Quality::Sound)
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PREFERENCE
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| format!("unknown quality {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Latency {
    Low,
    High,
    Mid,
}

impl Latency {
    pub const ALL: [Latency; 3] = [Latency::Low, Latency::High, Latency::Mid];

    pub fn code(&self) -> u32 {
        match self {
            Latency::Low => 0,
            Latency::High => 1,
            Latency::Mid => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Latency::Low => "low",
            Latency::High => "high",
            Latency::Mid => "mid",
        }
    }
}

impl FromStr for Latency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unknown latency {s}"))
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(Quality);
string_serde!(Latency);

/// Playlist mode as used on the wire: quality code plus latency code, e.g. `52` is 3Mbps/mid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode {
    pub quality: Quality,
    pub latency: Latency,
}

impl Mode {
    pub fn new(quality: Quality, latency: Latency) -> Self {
        Self { quality, latency }
    }

    pub fn code(&self) -> u32 {
        self.quality.code() + self.latency.code()
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(Self {
            quality: Quality::from_code(code / 10 * 10)?,
            latency: Latency::from_code(code % 10)?,
        })
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.quality, self.latency)
    }
}
