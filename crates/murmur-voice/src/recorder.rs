//! Silence-gated recording.
//!
//! `SilenceGate` is the pure 4-state machine deciding, frame by frame, when
//! a human has finished speaking. `Recorder` drives a live capture stream
//! through it: capture-rate samples go into the output buffer untouched
//! while a resampled copy feeds the classifier, so classification quality
//! never degrades captured fidelity.

use crate::audio::{AudioCapture, AudioFrame, CaptureConfig};
use crate::config::RecorderSettings;
use crate::error::{VoiceError, VoiceResult};
use crate::vad::{resample_i16, ClassifierConfig, FrameClassifier};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// State of one in-flight recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    /// No speech observed yet; grace period applies.
    WaitingForSpeech,
    /// Speech in progress.
    SpeechActive,
    /// Speech was observed, now counting contiguous silence.
    SilenceAfterSpeech,
    /// Recording finished.
    Stopped,
}

/// What the gate decided after consuming one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Continue,
    Stop { speech_detected: bool },
}

/// The frame-driven stop decision. Time advances one frame period per push,
/// which keeps the machine deterministic and testable without a device.
#[derive(Debug)]
pub struct SilenceGate {
    state: RecordingState,
    frame_ms: u64,
    elapsed_ms: u64,
    silence_ms: u64,
    max_ms: u64,
    min_ms: u64,
    silence_threshold_ms: u64,
    grace_ms: u64,
    speech_seen: bool,
}

impl SilenceGate {
    pub fn new(
        frame_ms: u32,
        max_duration: Duration,
        min_duration: Duration,
        silence_threshold: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            state: RecordingState::WaitingForSpeech,
            frame_ms: frame_ms as u64,
            elapsed_ms: 0,
            silence_ms: 0,
            max_ms: max_duration.as_millis() as u64,
            min_ms: min_duration.as_millis() as u64,
            silence_threshold_ms: silence_threshold.as_millis() as u64,
            grace_ms: grace_period.as_millis() as u64,
            speech_seen: false,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Consume one classified frame and decide whether to keep recording.
    pub fn push(&mut self, is_speech: bool) -> GateDecision {
        if self.state == RecordingState::Stopped {
            return GateDecision::Stop {
                speech_detected: self.speech_seen,
            };
        }
        self.elapsed_ms += self.frame_ms;

        // Hard ceiling regardless of state; flag reflects what was last known.
        if self.elapsed_ms >= self.max_ms {
            debug!("max duration reached at {}ms", self.elapsed_ms);
            return self.stop(self.speech_seen);
        }

        match (self.state, is_speech) {
            (RecordingState::WaitingForSpeech, true) => {
                info!("speech started at {}ms", self.elapsed_ms);
                self.state = RecordingState::SpeechActive;
                self.speech_seen = true;
                self.silence_ms = 0;
                GateDecision::Continue
            }
            (RecordingState::WaitingForSpeech, false) => {
                // No silence-duration check here: "no speech yet" is expected.
                if self.elapsed_ms >= self.grace_ms {
                    debug!("grace period expired with no speech");
                    return self.stop(false);
                }
                GateDecision::Continue
            }
            (RecordingState::SpeechActive, true) => {
                self.silence_ms = 0;
                GateDecision::Continue
            }
            (RecordingState::SpeechActive, false) => {
                self.state = RecordingState::SilenceAfterSpeech;
                self.silence_ms = self.frame_ms;
                self.check_silence_stop()
            }
            (RecordingState::SilenceAfterSpeech, true) => {
                // Natural mid-sentence pause; resume.
                self.state = RecordingState::SpeechActive;
                self.silence_ms = 0;
                GateDecision::Continue
            }
            (RecordingState::SilenceAfterSpeech, false) => {
                self.silence_ms += self.frame_ms;
                self.check_silence_stop()
            }
            (RecordingState::Stopped, _) => GateDecision::Stop {
                speech_detected: self.speech_seen,
            },
        }
    }

    fn check_silence_stop(&mut self) -> GateDecision {
        if self.elapsed_ms >= self.min_ms && self.silence_ms >= self.silence_threshold_ms {
            info!(
                "silence threshold reached ({}ms silence after {}ms)",
                self.silence_ms, self.elapsed_ms
            );
            return self.stop(true);
        }
        GateDecision::Continue
    }

    fn stop(&mut self, speech_detected: bool) -> GateDecision {
        self.state = RecordingState::Stopped;
        GateDecision::Stop { speech_detected }
    }
}

/// A finished recording. Ownership transfers to the caller (e.g. STT).
#[derive(Debug, Clone)]
pub struct RecordingResult {
    /// Capture-rate samples, untouched by classification.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// False means dead air: no STT call should be issued for this buffer.
    pub speech_detected: bool,
    pub elapsed: Duration,
}

/// Per-call overrides; unset fields fall back to [`RecorderSettings`].
#[derive(Debug, Clone, Default)]
pub struct RecordOptions {
    pub max_duration: Option<Duration>,
    pub min_duration: Option<Duration>,
    pub silence_threshold: Option<Duration>,
    pub grace_period: Option<Duration>,
    pub aggressiveness: Option<u8>,
}

#[derive(Debug, Clone)]
struct ResolvedRecording {
    max_duration: Duration,
    min_duration: Duration,
    silence_threshold: Duration,
    grace_period: Duration,
    aggressiveness: u8,
}

/// Drives a capture stream through the silence gate.
pub struct Recorder {
    settings: RecorderSettings,
}

impl Recorder {
    pub fn new(settings: RecorderSettings) -> Self {
        Self { settings }
    }

    fn resolve(&self, opts: &RecordOptions) -> ResolvedRecording {
        ResolvedRecording {
            max_duration: opts.max_duration.unwrap_or(self.settings.max_duration),
            // The floor wins over a shorter per-call override so one short
            // utterance cannot end a recording before the user plausibly
            // finished.
            min_duration: opts
                .min_duration
                .unwrap_or(self.settings.min_duration)
                .max(self.settings.min_duration),
            silence_threshold: opts
                .silence_threshold
                .unwrap_or(self.settings.silence_threshold),
            grace_period: opts.grace_period.unwrap_or(self.settings.grace_period),
            aggressiveness: opts.aggressiveness.unwrap_or(self.settings.aggressiveness),
        }
    }

    /// Record until the gate stops, the grace period expires, or the hard
    /// ceiling hits. A device failure reinitializes the audio subsystem and
    /// retries once; a second failure falls back to fixed-duration capture
    /// with no gating and `speech_detected = true`.
    pub fn record(&self, opts: &RecordOptions) -> VoiceResult<RecordingResult> {
        let resolved = self.resolve(opts);
        // Bounded retry, never recursion: the policy lives in this one loop.
        for attempt in 1..=2 {
            match self.capture_gated(&resolved) {
                Ok(result) => return Ok(result),
                Err(e @ (VoiceError::AudioDevice(_) | VoiceError::AudioStream(_))) => {
                    warn!(
                        "gated capture attempt {} failed ({}), reinitializing audio",
                        attempt, e
                    );
                }
                Err(e) => return Err(e),
            }
        }
        warn!("gated capture failed twice, falling back to fixed-duration capture");
        self.capture_fixed(&resolved)
    }

    fn open_capture(&self) -> VoiceResult<(cpal::Stream, mpsc::Receiver<AudioFrame>)> {
        let frame_size =
            (self.settings.capture_rate / 1000 * self.settings.frame_ms) as usize;
        let capture = AudioCapture::new(CaptureConfig {
            sample_rate: self.settings.capture_rate,
            channels: 1,
            frame_size,
        })?;
        let (tx, rx) = mpsc::sync_channel(64);
        let stream = capture.start(tx)?;
        Ok((stream, rx))
    }

    fn capture_gated(&self, resolved: &ResolvedRecording) -> VoiceResult<RecordingResult> {
        let mut classifier = FrameClassifier::new(ClassifierConfig {
            sample_rate: self.settings.classifier_rate,
            aggressiveness: resolved.aggressiveness,
            frame_ms: self.settings.frame_ms,
        })?;
        let (stream, rx) = self.open_capture()?;

        let mut gate = SilenceGate::new(
            self.settings.frame_ms,
            resolved.max_duration,
            resolved.min_duration,
            resolved.silence_threshold,
            resolved.grace_period,
        );
        let frame_period = Duration::from_millis(self.settings.frame_ms as u64);
        let started = Instant::now();
        let mut buffer: Vec<i16> = Vec::new();
        let mut speech_detected = false;
        info!(
            "recording: max {:?}, min {:?}, silence {:?}, grace {:?}",
            resolved.max_duration,
            resolved.min_duration,
            resolved.silence_threshold,
            resolved.grace_period
        );

        loop {
            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(frame) => {
                    let classifier_frame = resample_i16(
                        &frame.samples,
                        frame.sample_rate,
                        self.settings.classifier_rate,
                    );
                    // Fail open: a classifier error counts as speech.
                    let is_speech = classifier.is_speech_or_open(&classifier_frame);
                    buffer.extend_from_slice(&frame.samples);
                    if let GateDecision::Stop {
                        speech_detected: detected,
                    } = gate.push(is_speech)
                    {
                        speech_detected = detected;
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(VoiceError::AudioDevice(
                        "capture stalled: no frames for 1s".to_string(),
                    ));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(VoiceError::AudioDevice(
                        "capture stream disconnected".to_string(),
                    ));
                }
            }
            // Wall-clock backstop: never block past max + one frame period.
            if started.elapsed() >= resolved.max_duration + frame_period {
                speech_detected = gate.state() != RecordingState::WaitingForSpeech;
                break;
            }
        }
        drop(stream);

        let elapsed = gate.elapsed();
        info!(
            "recording stopped: {:?}, speech_detected={}, {} samples",
            elapsed,
            speech_detected,
            buffer.len()
        );
        Ok(RecordingResult {
            samples: buffer,
            sample_rate: self.settings.capture_rate,
            speech_detected,
            elapsed,
        })
    }

    /// Last-resort capture with no silence gating. Conservatively assumes
    /// content may be present.
    fn capture_fixed(&self, resolved: &ResolvedRecording) -> VoiceResult<RecordingResult> {
        let (stream, rx) = self.open_capture()?;
        let started = Instant::now();
        let mut buffer: Vec<i16> = Vec::new();
        while started.elapsed() < resolved.max_duration {
            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(frame) => buffer.extend_from_slice(&frame.samples),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(VoiceError::AudioDevice(
                        "capture stalled during fixed-duration fallback".to_string(),
                    ));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(VoiceError::AudioDevice(
                        "capture stream disconnected".to_string(),
                    ));
                }
            }
        }
        drop(stream);
        Ok(RecordingResult {
            samples: buffer,
            sample_rate: self.settings.capture_rate,
            speech_detected: true,
            elapsed: started.elapsed(),
        })
    }
}
