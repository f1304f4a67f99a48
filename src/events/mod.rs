//! Events module for coordinator transitions
//!
//! Provides structured event types for protection toggles, duck/restore
//! decisions and media reports. Events are broadcast to subscribed IPC
//! clients.

use serde::{Deserialize, Serialize};

use crate::channel::{SourceId, Volume};

/// Events emitted by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    /// A source became protected
    ProtectionEnabled {
        source_id: SourceId,
        /// Volume captured at activation
        original_volume: Volume,
    },

    /// Protection was toggled off and the source restored
    ProtectionDisabled { source_id: SourceId },

    /// The protected source was lowered
    Ducked {
        source_id: SourceId,
        volume: Volume,
        /// Sources that were audible when the duck was issued
        audible: Vec<SourceId>,
    },

    /// The protected source was brought back to its original volume
    Restored { source_id: SourceId, volume: Volume },

    /// The protected source disappeared while active
    ProtectedSourceLost { source_id: SourceId },

    /// An agent reported media activity
    MediaReported {
        source_id: SourceId,
        kind: MediaActivity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<Volume>,
    },
}

/// Kind of reported media activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaActivity {
    Played,
    VolumeChanged,
}

impl std::fmt::Display for CoordinatorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorEvent::ProtectionEnabled {
                source_id,
                original_volume,
            } => write!(f, "PROTECTION_ENABLED {} ({})", source_id, original_volume),
            CoordinatorEvent::ProtectionDisabled { source_id } => {
                write!(f, "PROTECTION_DISABLED {}", source_id)
            }
            CoordinatorEvent::Ducked { source_id, volume, .. } => {
                write!(f, "DUCKED {} -> {}", source_id, volume)
            }
            CoordinatorEvent::Restored { source_id, volume } => {
                write!(f, "RESTORED {} -> {}", source_id, volume)
            }
            CoordinatorEvent::ProtectedSourceLost { source_id } => {
                write!(f, "PROTECTED_SOURCE_LOST {}", source_id)
            }
            CoordinatorEvent::MediaReported { source_id, kind, .. } => {
                write!(f, "MEDIA_{:?} {}", kind, source_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = CoordinatorEvent::Ducked {
            source_id: "tabA".into(),
            volume: Volume::new(0.08),
            audible: vec!["tabB".into()],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("ducked"));
        assert!(json.contains("tabB"));
        assert!(json.contains("0.08"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"protected_source_lost","source_id":"tab-3"}"#;
        let event: CoordinatorEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            CoordinatorEvent::ProtectedSourceLost {
                source_id: "tab-3".into()
            }
        );
    }

    #[test]
    fn test_event_display() {
        let event = CoordinatorEvent::Restored {
            source_id: "tabA".into(),
            volume: Volume::new(0.8),
        };
        assert_eq!(event.to_string(), "RESTORED tabA -> 0.800");
    }
}
