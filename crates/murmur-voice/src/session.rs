//! One conversation session: speak a reply, then listen for the user's turn.
//!
//! `SessionContext` owns the pieces a turn needs (config, failover
//! orchestrator, event sink, optional archive) and serializes turns with an
//! async lock, since there is exactly one microphone and one speaker.
//!
//! The futures here are not `Send`: CPAL streams live across await points.
//! Drive them from a current-thread runtime or a `LocalSet`.

use crate::audio::{listening_pip, PlaybackStream, SampleSink};
use crate::config::VoiceConfig;
use crate::error::VoiceError;
use crate::events::{ArchiveKind, AudioArchive, ConversationEvent, EventSink, TracingSink};
use crate::failover::{
    pcm_i16_to_wav, FailoverOrchestrator, FailureReport, HttpTransport, SpeechTransport,
    SttOutcome, TtsStream,
};
use crate::playback::{play_streaming, StreamMetrics};
use crate::recorder::{RecordOptions, Recorder, RecordingResult};
use std::time::Duration;
use tracing::{info, warn};

/// Why a conversation turn could not complete.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("speech synthesis failed on every endpoint:\n{0}")]
    Tts(FailureReport),
    #[error("transcription failed on every endpoint:\n{0}")]
    Stt(FailureReport),
    #[error(transparent)]
    Device(#[from] VoiceError),
}

/// A completed turn: what was played, what was heard.
#[derive(Debug)]
pub struct TurnOutcome {
    /// What the user said; `None` when no speech was detected, either by the
    /// recorder gate or by the transcription service.
    pub transcript: Option<String>,
    /// Endpoint that won the TTS failover.
    pub tts_endpoint: String,
    /// Endpoint that answered STT, when one was consulted.
    pub stt_endpoint: Option<String>,
    pub playback: StreamMetrics,
    pub recording_elapsed: Duration,
}

/// Everything one conversation needs, wired once and reused per turn.
pub struct SessionContext<T: SpeechTransport = HttpTransport> {
    config: VoiceConfig,
    orchestrator: FailoverOrchestrator<T>,
    events: Box<dyn EventSink>,
    archive: Option<AudioArchive>,
    turn_lock: tokio::sync::Mutex<()>,
}

impl SessionContext<HttpTransport> {
    /// Build a session over the production HTTP transport.
    pub fn new(config: VoiceConfig) -> Result<Self, VoiceError> {
        config.validate()?;
        let transport = HttpTransport::new(config.request_timeout)?;
        Ok(Self::with_transport(config, transport))
    }
}

impl<T: SpeechTransport> SessionContext<T> {
    pub fn with_transport(config: VoiceConfig, transport: T) -> Self {
        Self {
            config,
            orchestrator: FailoverOrchestrator::new(transport),
            events: Box::new(TracingSink),
            archive: None,
            turn_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_events(mut self, events: Box<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_archive(mut self, archive: AudioArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &FailoverOrchestrator<T> {
        &self.orchestrator
    }

    fn preferred(list: &[String], fallback: &str) -> String {
        list.first().cloned().unwrap_or_else(|| fallback.to_string())
    }

    /// Speak `text`, then record and transcribe the user's reply.
    ///
    /// Order inside the turn: synthesize and stream playback, queue the
    /// listening pip, record until the silence gate stops, transcribe only
    /// when the gate saw speech. A gate-confirmed silent recording never
    /// reaches the network.
    pub async fn converse(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<TurnOutcome, TurnError> {
        let _turn = self.turn_lock.lock().await;
        info!("turn start ({} chars to speak)", text.len());

        let voice = Self::preferred(&self.config.voices, "af_sky");
        let tts_model = Self::preferred(&self.config.tts_models, "tts-1");
        let stt_model = Self::preferred(&self.config.stt_models, "whisper-1");

        // Speak.
        let tts = self
            .orchestrator
            .synthesize(
                text,
                &voice,
                &tts_model,
                self.config.response_format,
                &self.config.tts_endpoints,
            )
            .await
            .map_err(TurnError::Tts)?;
        let tts_endpoint = tts.endpoint.clone();
        self.events.emit(&ConversationEvent::TtsStarted {
            conversation_id: conversation_id.to_string(),
            endpoint: tts_endpoint.clone(),
        });

        let playback = PlaybackStream::open(
            self.config.playback.sample_rate,
            self.config.playback.max_buffer,
        )
        .map_err(TurnError::Device)?;
        let queue = playback.queue();
        let metrics = self
            .stream_to_sink(conversation_id, tts, queue.as_ref())
            .await
            .map_err(TurnError::Device)?;

        // Non-verbal "your turn" cue, played through the same stream.
        queue.set_active(true);
        queue.enqueue(&listening_pip(self.config.playback.sample_rate));
        while queue.queued() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        queue.set_active(false);
        drop(playback);

        // Listen.
        self.events.emit(&ConversationEvent::RecordingStarted {
            conversation_id: conversation_id.to_string(),
        });
        let recording = self.record_blocking().await.map_err(TurnError::Device)?;
        self.events.emit(&ConversationEvent::RecordingFinished {
            conversation_id: conversation_id.to_string(),
            speech_detected: recording.speech_detected,
            elapsed: recording.elapsed,
        });

        if !recording.speech_detected {
            info!("no speech detected, skipping transcription");
            self.events.emit(&ConversationEvent::SttNoSpeech {
                conversation_id: conversation_id.to_string(),
            });
            return Ok(TurnOutcome {
                transcript: None,
                tts_endpoint,
                stt_endpoint: None,
                playback: metrics,
                recording_elapsed: recording.elapsed,
            });
        }

        // Transcribe.
        let wav = pcm_i16_to_wav(&recording.samples, recording.sample_rate);
        if let Some(ref archive) = self.archive {
            if let Err(e) = archive.save(conversation_id, ArchiveKind::Stt, "wav", &wav) {
                warn!("failed to archive recording: {}", e);
            }
        }
        if let Some(first) = self.config.stt_endpoints.first() {
            self.events.emit(&ConversationEvent::SttStarted {
                conversation_id: conversation_id.to_string(),
                endpoint: first.base_url.clone(),
            });
        }
        match self
            .orchestrator
            .transcribe(wav, &stt_model, &self.config.stt_endpoints)
            .await
        {
            SttOutcome::Transcript { text, endpoint, .. } => {
                self.events.emit(&ConversationEvent::SttCompleted {
                    conversation_id: conversation_id.to_string(),
                    transcript_chars: text.chars().count(),
                });
                Ok(TurnOutcome {
                    transcript: Some(text),
                    tts_endpoint,
                    stt_endpoint: Some(endpoint),
                    playback: metrics,
                    recording_elapsed: recording.elapsed,
                })
            }
            SttOutcome::NoSpeech { endpoint, .. } => {
                self.events.emit(&ConversationEvent::SttNoSpeech {
                    conversation_id: conversation_id.to_string(),
                });
                Ok(TurnOutcome {
                    transcript: None,
                    tts_endpoint,
                    stt_endpoint: Some(endpoint),
                    playback: metrics,
                    recording_elapsed: recording.elapsed,
                })
            }
            SttOutcome::Failed(report) => Err(TurnError::Stt(report)),
        }
    }

    /// Record the user's reply without speaking first.
    pub async fn listen(&self, conversation_id: &str) -> Result<RecordingResult, TurnError> {
        let _turn = self.turn_lock.lock().await;
        self.events.emit(&ConversationEvent::RecordingStarted {
            conversation_id: conversation_id.to_string(),
        });
        let recording = self.record_blocking().await.map_err(TurnError::Device)?;
        self.events.emit(&ConversationEvent::RecordingFinished {
            conversation_id: conversation_id.to_string(),
            speech_detected: recording.speech_detected,
            elapsed: recording.elapsed,
        });
        Ok(recording)
    }

    /// Speak `text` without listening afterwards.
    pub async fn speak(&self, conversation_id: &str, text: &str) -> Result<StreamMetrics, TurnError> {
        let _turn = self.turn_lock.lock().await;
        let voice = Self::preferred(&self.config.voices, "af_sky");
        let tts_model = Self::preferred(&self.config.tts_models, "tts-1");
        let tts = self
            .orchestrator
            .synthesize(
                text,
                &voice,
                &tts_model,
                self.config.response_format,
                &self.config.tts_endpoints,
            )
            .await
            .map_err(TurnError::Tts)?;
        self.events.emit(&ConversationEvent::TtsStarted {
            conversation_id: conversation_id.to_string(),
            endpoint: tts.endpoint.clone(),
        });
        let playback = PlaybackStream::open(
            self.config.playback.sample_rate,
            self.config.playback.max_buffer,
        )
        .map_err(TurnError::Device)?;
        let queue = playback.queue();
        let metrics = self
            .stream_to_sink(conversation_id, tts, queue.as_ref())
            .await
            .map_err(TurnError::Device)?;
        Ok(metrics)
    }

    /// Stream one synthesis response into `sink`, emitting the playback
    /// events every speech path shares: started, first-audio, finished.
    async fn stream_to_sink(
        &self,
        conversation_id: &str,
        tts: TtsStream,
        sink: &dyn SampleSink,
    ) -> Result<StreamMetrics, VoiceError> {
        self.events.emit(&ConversationEvent::PlaybackStarted {
            conversation_id: conversation_id.to_string(),
        });
        let metrics = play_streaming(
            tts.stream,
            tts.format,
            sink,
            self.config.playback.container_threshold,
        )
        .await?;
        if let Some(ttfa) = metrics.ttfa {
            self.events.emit(&ConversationEvent::TtsFirstAudio {
                conversation_id: conversation_id.to_string(),
                ttfa,
            });
        }
        self.events.emit(&ConversationEvent::PlaybackFinished {
            conversation_id: conversation_id.to_string(),
            chunks_played: metrics.chunks_played,
            buffer_underruns: metrics.buffer_underruns,
        });
        Ok(metrics)
    }

    /// The recorder blocks on device I/O; run it off the async executor.
    async fn record_blocking(&self) -> Result<RecordingResult, VoiceError> {
        let recorder = Recorder::new(self.config.recorder.clone());
        let opts = RecordOptions::default();
        tokio::task::spawn_blocking(move || recorder.record(&opts))
            .await
            .map_err(|e| VoiceError::AudioDevice(format!("recording task panicked: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::BufferSink;
    use crate::config::{Endpoint, ProviderKind, ResponseFormat};
    use crate::error::ProviderFailure;
    use crate::failover::{ByteStream, SttRequest, TtsRequest};
    use bytes::Bytes;
    use futures::stream;
    use std::sync::{Arc, Mutex};

    struct NoopTransport;

    impl SpeechTransport for NoopTransport {
        async fn speech(
            &self,
            _endpoint: &Endpoint,
            _req: &TtsRequest,
        ) -> Result<ByteStream, ProviderFailure> {
            Ok(Box::pin(stream::empty()))
        }

        async fn transcription(
            &self,
            _endpoint: &Endpoint,
            _req: &SttRequest,
        ) -> Result<String, ProviderFailure> {
            Ok(String::new())
        }
    }

    struct RecordingSink(Arc<Mutex<Vec<&'static str>>>);

    impl EventSink for RecordingSink {
        fn emit(&self, event: &ConversationEvent) {
            let tag = match event {
                ConversationEvent::TtsStarted { .. } => "tts_started",
                ConversationEvent::TtsFirstAudio { .. } => "tts_first_audio",
                ConversationEvent::PlaybackStarted { .. } => "playback_started",
                ConversationEvent::PlaybackFinished { .. } => "playback_finished",
                ConversationEvent::RecordingStarted { .. } => "recording_started",
                ConversationEvent::RecordingFinished { .. } => "recording_finished",
                ConversationEvent::SttStarted { .. } => "stt_started",
                ConversationEvent::SttCompleted { .. } => "stt_completed",
                ConversationEvent::SttNoSpeech { .. } => "stt_no_speech",
            };
            if let Ok(mut seen) = self.0.lock() {
                seen.push(tag);
            }
        }
    }

    #[test]
    fn preferred_falls_back_when_list_is_empty() {
        assert_eq!(
            SessionContext::<HttpTransport>::preferred(&[], "tts-1"),
            "tts-1"
        );
        assert_eq!(
            SessionContext::<HttpTransport>::preferred(&["kokoro".to_string()], "tts-1"),
            "kokoro"
        );
    }

    #[test]
    fn session_builds_over_http_transport() {
        let mut config = VoiceConfig::default();
        config.tts_endpoints = vec![Endpoint::new(
            "http://localhost:8880/v1",
            ProviderKind::Local,
        )];
        let session = SessionContext::new(config).unwrap();
        assert_eq!(session.config().tts_endpoints.len(), 1);
    }

    // Both converse() and speak() play through stream_to_sink, so this
    // covers the event sequence for every speech path.
    #[tokio::test]
    async fn playback_emits_started_first_audio_and_finished_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let session = SessionContext::with_transport(VoiceConfig::default(), NoopTransport)
            .with_events(Box::new(RecordingSink(seen.clone())));

        let pcm: Vec<i16> = (0..480).collect();
        let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        let tts = TtsStream {
            stream: Box::pin(stream::iter(vec![Ok(Bytes::from(bytes))])),
            endpoint: "http://localhost:8880/v1".to_string(),
            provider: ProviderKind::Local,
            voice: "af_sky".to_string(),
            model: "tts-1".to_string(),
            format: ResponseFormat::Pcm,
            attempts: Vec::new(),
        };

        let sink = BufferSink::new();
        let metrics = session.stream_to_sink("conv-1", tts, &sink).await.unwrap();
        assert_eq!(sink.take(), pcm);
        assert!(metrics.ttfa.is_some());
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["playback_started", "tts_first_audio", "playback_finished"]
        );
    }
}
