//! Coordinator <-> agent message types
//!
//! Requests always expect a reply. Commands are one-way and are never
//! acknowledged by the agent, so the sender only learns whether the
//! command was handed to the source's link.

use serde::{Deserialize, Serialize};

/// Stable identifier of an audio source (e.g. a browser tab)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Playback volume in `[0, 1]`; 0 is silent, 1 is full scale
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(from = "f64", into = "f64")]
pub struct Volume(f64);

impl Volume {
    pub const SILENT: Volume = Volume(0.0);
    pub const FULL: Volume = Volume(1.0);

    /// Build a volume, clamping into range. NaN is treated as silent.
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self::SILENT;
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// Scale by a factor, staying in range
    pub fn scaled(self, factor: f64) -> Self {
        Self::new(self.0 * factor)
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::FULL
    }
}

impl From<f64> for Volume {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl From<Volume> for f64 {
    fn from(volume: Volume) -> Self {
        volume.0
    }
}

impl std::fmt::Display for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

/// Requests sent to an agent; each expects an [`AgentReply`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Representative volume of the source's media
    GetCurrentVolume,
    /// Whether the source is producing audible output right now
    QueryAudible,
}

/// Agent answers to an [`AgentRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentReply {
    Volume { volume: Volume },
    Audible { audible: bool },
}

/// One-way commands sent to an agent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Apply a volume to every tracked media element
    SetVolume { volume: Volume },
}

/// One-way media activity reports sent by an agent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaReport {
    MediaPlayed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<Volume>,
    },
    MediaVolumeChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<Volume>,
    },
}

impl MediaReport {
    pub fn volume(&self) -> Option<Volume> {
        match self {
            MediaReport::MediaPlayed { volume } | MediaReport::MediaVolumeChanged { volume } => {
                *volume
            }
        }
    }
}

/// Answer to an agent's local duck check
///
/// `volume` is the absolute ducked target when `duck` is true, so agents
/// never scale their current volume and repeated checks cannot compound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DuckAdvice {
    pub duck: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Volume>,
}

impl DuckAdvice {
    pub fn hold() -> Self {
        Self {
            duck: false,
            volume: None,
        }
    }

    pub fn duck_to(volume: Volume) -> Self {
        Self {
            duck: true,
            volume: Some(volume),
        }
    }
}


/// Frames the coordinator side sends over an agent link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    /// Request to answer with an [`AgentUpstream::Reply`] carrying the same id
    Request { id: u64, request: AgentRequest },

    /// One-way command
    Command { command: AgentCommand },

    /// Answer to an [`AgentUpstream::ShouldDuck`]
    DuckAdvice { id: u64, advice: DuckAdvice },
}

/// Frames an agent sends to the coordinator side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentUpstream {
    /// Reply to [`AgentFrame::Request`]
    Reply { id: u64, reply: AgentReply },

    /// Ask whether this source should be ducked right now
    ShouldDuck { id: u64 },

    /// Fire-and-forget activity report
    Report { report: MediaReport },
}
