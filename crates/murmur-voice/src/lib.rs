//! # murmur-voice
//!
//! Hands-free voice conversation core: silence-gated recording, streaming
//! text-to-speech playback, and multi-endpoint failover over any
//! OpenAI-compatible speech API (local Kokoro/Whisper servers or cloud).
//!
//! ```text
//!                    ┌───────────────────────────┐
//!                    │       SessionContext      │
//!                    │   (one turn at a time)    │
//!                    └──────┬─────────────┬──────┘
//!                     speak │             │ listen
//!                           ▼             ▼
//!            ┌──────────────────┐   ┌──────────────────┐
//!            │ FailoverOrch.    │   │     Recorder     │
//!            │ TTS ▸ endpoints  │   │  SilenceGate +   │
//!            │ in strict order  │   │  FrameClassifier │
//!            └────────┬─────────┘   └────────┬─────────┘
//!                     ▼                      │
//!            ┌──────────────────┐            ▼
//!            │  play_streaming  │   ┌──────────────────┐
//!            │ pcm/opus/bufferd │   │ FailoverOrch.    │
//!            │ → PlaybackQueue  │   │ STT ▸ endpoints  │
//!            └──────────────────┘   └──────────────────┘
//! ```
//!
//! The pieces compose but stand alone: the recorder works without any
//! network, the orchestrator works without any audio device, and playback
//! writes to a [`audio::SampleSink`] that tests satisfy in memory.

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod failover;
pub mod playback;
pub mod recorder;
pub mod session;
pub mod vad;

pub use audio::{BufferSink, PlaybackQueue, PlaybackStream, SampleSink};
pub use config::{
    Endpoint, PlaybackSettings, ProviderKind, RecorderSettings, ResponseFormat, VoiceConfig,
};
pub use error::{ErrorKind, ProviderFailure, VoiceError, VoiceResult};
pub use events::{ArchiveKind, AudioArchive, ConversationEvent, EventSink, TracingSink};
pub use failover::{
    AttemptRecord, FailoverOrchestrator, FailureReport, HttpTransport, SpeechTransport,
    SttOutcome, TtsStream,
};
pub use playback::{play_streaming, StreamMetrics};
pub use recorder::{RecordOptions, Recorder, RecordingResult, RecordingState, SilenceGate};
pub use session::{SessionContext, TurnError, TurnOutcome};
