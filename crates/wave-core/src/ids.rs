//! Identifiers for waves, wavelets, participants and segments.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a wave (a tree of wavelets).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaveId(pub String);

impl WaveId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a wavelet: the unit of concurrency control.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaveletId {
    pub wave: WaveId,
    pub name: String,
}

impl WaveletId {
    pub fn new(wave: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            wave: WaveId::new(wave),
            name: name.into(),
        }
    }

    /// Canonical URI of the wavelet, used to seed the version chain.
    pub fn uri(&self) -> String {
        format!("wave://{}/{}", self.wave, self.name)
    }
}

impl fmt::Display for WaveletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.wave, self.name)
    }
}

impl FromStr for WaveletId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((wave, name)) if !wave.is_empty() && !name.is_empty() => {
                Ok(WaveletId::new(wave, name))
            }
            _ => Err(CoreError::InvalidWaveletId(s.to_string())),
        }
    }
}

/// Address of a participant (author of deltas, member of a wavelet).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A sub-document unit of a wavelet that can be fetched on its own.
///
/// Serialized as a plain string (`index`, `participants`, `blip:<id>`) so it
/// can be used as a JSON map key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SegmentId {
    /// Wavelet metadata: which blips exist and when they last changed.
    Index,
    /// The participant list.
    Participants,
    /// One blip's content.
    Blip(String),
}

impl SegmentId {
    pub fn blip(id: impl Into<String>) -> Self {
        SegmentId::Blip(id.into())
    }

    pub fn is_blip(&self) -> bool {
        matches!(self, SegmentId::Blip(_))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentId::Index => write!(f, "index"),
            SegmentId::Participants => write!(f, "participants"),
            SegmentId::Blip(id) => write!(f, "blip:{}", id),
        }
    }
}

impl FromStr for SegmentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index" => Ok(SegmentId::Index),
            "participants" => Ok(SegmentId::Participants),
            _ => match s.strip_prefix("blip:") {
                Some(id) if !id.is_empty() => Ok(SegmentId::Blip(id.to_string())),
                _ => Err(CoreError::InvalidSegmentId(s.to_string())),
            },
        }
    }
}

impl From<SegmentId> for String {
    fn from(id: SegmentId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for SegmentId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
