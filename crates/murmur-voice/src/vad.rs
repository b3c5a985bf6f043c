//! Frame classifier adapter over WebRTC VAD.
//!
//! The classifier takes one fixed-duration i16 frame at one of the rates the
//! VAD supports and answers "is speech". A classifier failure degrades to
//! "treat as speech": over-recording beats silently truncating the user.

use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, warn};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for the frame classifier.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz).
    pub sample_rate: u32,
    /// Aggressiveness 0-3; 3 filters the most non-speech.
    pub aggressiveness: u8,
    /// Frame period in ms: 10, 20, or 30.
    pub frame_ms: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            aggressiveness: 2,
            frame_ms: 30,
        }
    }
}

fn vad_mode(aggressiveness: u8) -> VadMode {
    match aggressiveness {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

fn vad_rate(sample_rate: u32) -> VoiceResult<SampleRate> {
    match sample_rate {
        8000 => Ok(SampleRate::Rate8kHz),
        16000 => Ok(SampleRate::Rate16kHz),
        32000 => Ok(SampleRate::Rate32kHz),
        48000 => Ok(SampleRate::Rate48kHz),
        other => Err(VoiceError::Config(format!(
            "VAD supports 8000, 16000, 32000, or 48000 Hz, got {}",
            other
        ))),
    }
}

/// Voice activity classifier for fixed-size PCM frames.
pub struct FrameClassifier {
    vad: Vad,
    config: ClassifierConfig,
    frame_size: usize,
}

impl FrameClassifier {
    pub fn new(config: ClassifierConfig) -> VoiceResult<Self> {
        if config.aggressiveness > 3 {
            return Err(VoiceError::Config(format!(
                "VAD aggressiveness must be 0-3, got {}",
                config.aggressiveness
            )));
        }
        if !matches!(config.frame_ms, 10 | 20 | 30) {
            return Err(VoiceError::Config(format!(
                "VAD frame period must be 10, 20 or 30 ms, got {}",
                config.frame_ms
            )));
        }
        let rate = vad_rate(config.sample_rate)?;

        let mut vad = Vad::new();
        vad.set_mode(vad_mode(config.aggressiveness));
        vad.set_sample_rate(rate);

        let frame_size = (config.sample_rate / 1000 * config.frame_ms) as usize;
        debug!(
            "FrameClassifier ready ({}Hz, mode {}, {} samples/frame)",
            config.sample_rate, config.aggressiveness, frame_size
        );
        Ok(Self {
            vad,
            config,
            frame_size,
        })
    }

    /// Expected samples per frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Classify one frame. Errors on a frame of the wrong length.
    pub fn is_speech(&mut self, frame: &[i16]) -> VoiceResult<bool> {
        if frame.len() != self.frame_size {
            return Err(VoiceError::Vad(format!(
                "expected {} samples, got {}",
                self.frame_size,
                frame.len()
            )));
        }
        self.vad
            .is_voice_segment(frame)
            .map_err(|e| VoiceError::Vad(format!("classification failed: {:?}", e)))
    }

    /// Classify, failing open: any classifier error is logged and the frame
    /// is treated as speech.
    pub fn is_speech_or_open(&mut self, frame: &[i16]) -> bool {
        match self.is_speech(frame) {
            Ok(speech) => speech,
            Err(e) => {
                warn!("classifier error, treating frame as speech: {}", e);
                true
            }
        }
    }

    /// Reset session state. WebRTC VAD has no explicit reset, so recreate.
    pub fn reset(&mut self) -> VoiceResult<()> {
        let rate = vad_rate(self.config.sample_rate)?;
        self.vad = Vad::new();
        self.vad.set_mode(vad_mode(self.config.aggressiveness));
        self.vad.set_sample_rate(rate);
        Ok(())
    }
}

/// Linear-interpolation resample of mono i16 PCM. Used to produce the
/// classifier-rate copy of a capture-rate frame; the original samples are
/// what end up in the recording buffer.
pub fn resample_i16(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    let step = from_rate as f64 / to_rate as f64;
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = input[idx.min(input.len() - 1)] as f64;
        let b = input[(idx + 1).min(input.len() - 1)] as f64;
        out.push((a + (b - a) * frac).round() as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_initializes_with_expected_frame_size() {
        let classifier = FrameClassifier::new(ClassifierConfig::default()).unwrap();
        assert_eq!(classifier.frame_size(), 480); // 30ms at 16kHz
    }

    #[test]
    fn rejects_unsupported_rate() {
        let config = ClassifierConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(FrameClassifier::new(config).is_err());
    }

    #[test]
    fn rejects_wrong_frame_length() {
        let mut classifier = FrameClassifier::new(ClassifierConfig::default()).unwrap();
        assert!(classifier.is_speech(&[0i16; 100]).is_err());
    }

    #[test]
    fn silence_frame_is_not_speech() {
        let mut classifier = FrameClassifier::new(ClassifierConfig::default()).unwrap();
        let silence = vec![0i16; 480];
        assert!(!classifier.is_speech(&silence).unwrap());
    }

    #[test]
    fn fail_open_treats_bad_frame_as_speech() {
        let mut classifier = FrameClassifier::new(ClassifierConfig::default()).unwrap();
        // wrong length is a classifier error; fail open says speech
        assert!(classifier.is_speech_or_open(&[0i16; 7]));
    }

    #[test]
    fn resample_halves_and_preserves_rate_identity() {
        let input: Vec<i16> = (0..720).map(|i| (i % 100) as i16).collect();
        let out = resample_i16(&input, 24000, 16000);
        assert_eq!(out.len(), 480);
        let same = resample_i16(&input, 24000, 24000);
        assert_eq!(same, input);
    }
}
