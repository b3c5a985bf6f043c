//! Conversation lifecycle events and the audio archive.
//!
//! Events are a passive side-channel: sinks observe the turn, they never
//! influence it. The default sink forwards to `tracing`; hosts can install
//! their own to drive UI state or analytics.

use crate::error::VoiceResult;
use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// What happened during a conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConversationEvent {
    RecordingStarted {
        conversation_id: String,
    },
    RecordingFinished {
        conversation_id: String,
        speech_detected: bool,
        #[serde(with = "duration_millis")]
        elapsed: Duration,
    },
    TtsStarted {
        conversation_id: String,
        endpoint: String,
    },
    TtsFirstAudio {
        conversation_id: String,
        #[serde(with = "duration_millis")]
        ttfa: Duration,
    },
    PlaybackStarted {
        conversation_id: String,
    },
    PlaybackFinished {
        conversation_id: String,
        chunks_played: u64,
        buffer_underruns: u64,
    },
    SttStarted {
        conversation_id: String,
        endpoint: String,
    },
    SttCompleted {
        conversation_id: String,
        transcript_chars: usize,
    },
    SttNoSpeech {
        conversation_id: String,
    },
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Observer of conversation events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ConversationEvent);
}

/// Default sink: structured log lines via `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ConversationEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "murmur_voice::events", "{}", json),
            Err(_) => debug!(target: "murmur_voice::events", "{:?}", event),
        }
    }
}

/// Sink that drops every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &ConversationEvent) {}
}

/// Which half of the turn an archived file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tts,
    Stt,
}

impl ArchiveKind {
    fn label(self) -> &'static str {
        match self {
            ArchiveKind::Tts => "tts",
            ArchiveKind::Stt => "stt",
        }
    }
}

/// Writes turn audio under `<root>/<year>/<month>/` with timestamped names,
/// so a conversation can be replayed or audited after the fact.
#[derive(Debug, Clone)]
pub struct AudioArchive {
    root: PathBuf,
}

impl AudioArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Persist one blob. Returns the path written, shaped
    /// `<root>/<year>/<month>/<timestamp>_<conversation-id>_<tts|stt>.<ext>`.
    pub fn save(
        &self,
        conversation_id: &str,
        kind: ArchiveKind,
        extension: &str,
        data: &[u8],
    ) -> VoiceResult<PathBuf> {
        let now = Local::now();
        let dir = self
            .root
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()));
        std::fs::create_dir_all(&dir)?;

        let name = format!(
            "{}_{}_{}.{}",
            now.format("%Y%m%d-%H%M%S"),
            sanitize(conversation_id),
            kind.label(),
            extension
        );
        let path = dir.join(name);
        std::fs::write(&path, data)?;
        debug!("archived {} bytes to {}", data.len(), path.display());
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Conversation ids come from the host; keep filenames portable.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let event = ConversationEvent::SttNoSpeech {
            conversation_id: "abc".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"stt_no_speech\""));
    }

    #[test]
    fn recording_finished_round_trips_duration_as_millis() {
        let event = ConversationEvent::RecordingFinished {
            conversation_id: "t1".to_string(),
            speech_detected: true,
            elapsed: Duration::from_millis(5430),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"elapsed\":5430"));
        let back: ConversationEvent = serde_json::from_str(&json).unwrap();
        match back {
            ConversationEvent::RecordingFinished { elapsed, .. } => {
                assert_eq!(elapsed, Duration::from_millis(5430));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn archive_writes_under_year_month() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = AudioArchive::new(tmp.path());
        let path = archive
            .save("conv/01", ArchiveKind::Tts, "wav", &[1, 2, 3])
            .unwrap();
        assert!(path.exists());
        assert!(path.to_string_lossy().contains("_conv-01_tts.wav"));
        let rel = path.strip_prefix(tmp.path()).unwrap();
        // year/month/file
        assert_eq!(rel.components().count(), 3);
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
    }
}
