//! Typed configuration: endpoints, provider kinds, recorder and playback
//! tunables, and the voice remap table used when failing over between
//! providers with different voice catalogs.
//!
//! Endpoint lists are ordered; the orchestrator attempts them strictly in
//! this order. Everything here is read-only once built.

use crate::error::{VoiceError, VoiceResult};
use serde::Serialize;
use std::time::Duration;

/// Provider kind. Local endpoints accept a placeholder credential and fail
/// instantly on connection errors; cloud endpoints require a real API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    Cloud,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Local => f.write_str("local"),
            ProviderKind::Cloud => f.write_str("cloud"),
        }
    }
}

/// One TTS- or STT-capable service base URL.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Base URL without trailing slash (e.g. `http://127.0.0.1:8880/v1`).
    pub base_url: String,
    pub provider: ProviderKind,
    pub supports_tts: bool,
    pub supports_stt: bool,
    /// Bearer key. Required for cloud; local works with the placeholder.
    pub api_key: Option<String>,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            base_url: base_url.into(),
            provider,
            supports_tts: true,
            supports_stt: true,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Credential to send. Local providers accept any non-empty placeholder;
    /// a cloud endpoint without a key returns None (skip pre-flight).
    pub fn credential(&self) -> Option<&str> {
        match (&self.api_key, self.provider) {
            (Some(key), _) if !key.is_empty() => Some(key),
            (_, ProviderKind::Local) => Some("not-needed"),
            (_, ProviderKind::Cloud) => None,
        }
    }
}

/// Wire format requested from the TTS endpoint, which also selects the
/// streaming decode strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Pcm,
    Opus,
    Mp3,
    Wav,
    Flac,
    Aac,
}

impl ResponseFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseFormat::Pcm => "pcm",
            ResponseFormat::Opus => "opus",
            ResponseFormat::Mp3 => "mp3",
            ResponseFormat::Wav => "wav",
            ResponseFormat::Flac => "flac",
            ResponseFormat::Aac => "aac",
        }
    }

    pub fn parse(s: &str) -> VoiceResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pcm" => Ok(ResponseFormat::Pcm),
            "opus" => Ok(ResponseFormat::Opus),
            "mp3" => Ok(ResponseFormat::Mp3),
            "wav" => Ok(ResponseFormat::Wav),
            "flac" => Ok(ResponseFormat::Flac),
            "aac" => Ok(ResponseFormat::Aac),
            other => Err(VoiceError::Config(format!(
                "unknown response format: {}",
                other
            ))),
        }
    }
}

/// Silence-gated recorder tunables.
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    /// Hard ceiling on one recording (default 30s).
    pub max_duration: Duration,
    /// Global floor for minimum recording duration (default 2s). A per-call
    /// override never goes below this.
    pub min_duration: Duration,
    /// Contiguous post-speech silence required to stop (default 1000ms).
    pub silence_threshold: Duration,
    /// Initial window in which "no speech yet" is not a timeout (default 4s).
    pub grace_period: Duration,
    /// VAD aggressiveness 0-3 (default 2).
    pub aggressiveness: u8,
    /// Capture rate; the buffer keeps these samples untouched (default 24000).
    pub capture_rate: u32,
    /// Classifier rate; frames are resampled to this for VAD only (default 16000).
    pub classifier_rate: u32,
    /// Frame period in ms: 10, 20 or 30 (default 30).
    pub frame_ms: u32,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(30),
            min_duration: Duration::from_secs(2),
            silence_threshold: Duration::from_millis(1000),
            grace_period: Duration::from_secs(4),
            aggressiveness: 2,
            capture_rate: 24000,
            classifier_rate: 16000,
            frame_ms: 30,
        }
    }
}

/// Streaming playback tunables.
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    /// Output device rate; matches the PCM rate TTS endpoints emit (default 24000).
    pub sample_rate: u32,
    /// Bound on the output ring; writes past this drop the oldest samples (default 10s).
    pub max_buffer: Duration,
    /// Bytes accumulated before attempting a container decode (default 32 KiB).
    pub container_threshold: usize,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            max_buffer: Duration::from_secs(10),
            container_threshold: 32 * 1024,
        }
    }
}

/// Full configuration for a conversation session. Read-only at call time.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Ordered TTS failover chain.
    pub tts_endpoints: Vec<Endpoint>,
    /// Ordered STT failover chain.
    pub stt_endpoints: Vec<Endpoint>,
    /// Preference-ordered voices; the first is requested, remapped per provider.
    pub voices: Vec<String>,
    /// Preference-ordered TTS models.
    pub tts_models: Vec<String>,
    /// Preference-ordered STT models.
    pub stt_models: Vec<String>,
    pub response_format: ResponseFormat,
    /// Per-endpoint request timeout (default 10s).
    pub request_timeout: Duration,
    pub recorder: RecorderSettings,
    pub playback: PlaybackSettings,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            tts_endpoints: Vec::new(),
            stt_endpoints: Vec::new(),
            voices: vec!["af_sky".to_string()],
            tts_models: vec!["tts-1".to_string()],
            stt_models: vec!["whisper-1".to_string()],
            response_format: ResponseFormat::Pcm,
            request_timeout: Duration::from_secs(10),
            recorder: RecorderSettings::default(),
            playback: PlaybackSettings::default(),
        }
    }
}

impl VoiceConfig {
    /// Build from environment. Reads `MURMUR_TTS_URLS` / `MURMUR_STT_URLS`
    /// (comma-separated, ordered) with `TTS_API_URL` / `STT_API_URL` as
    /// single-endpoint fallbacks, `TTS_API_KEY` / `STT_API_KEY` /
    /// `OPENAI_API_KEY` for credentials, and the recorder/playback knobs.
    pub fn from_env() -> VoiceResult<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        let tts_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();
        let stt_key = std::env::var("STT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();

        let tts_urls = std::env::var("MURMUR_TTS_URLS")
            .or_else(|_| std::env::var("TTS_API_URL"))
            .unwrap_or_default();
        let stt_urls = std::env::var("MURMUR_STT_URLS")
            .or_else(|_| std::env::var("STT_API_URL"))
            .unwrap_or_default();

        config.tts_endpoints = parse_endpoint_list(&tts_urls, tts_key.as_deref());
        config.stt_endpoints = parse_endpoint_list(&stt_urls, stt_key.as_deref());

        if let Ok(voices) = std::env::var("MURMUR_VOICES") {
            config.voices = split_list(&voices);
        }
        if let Ok(models) = std::env::var("TTS_MODEL") {
            config.tts_models = split_list(&models);
        }
        if let Ok(models) = std::env::var("STT_MODEL") {
            config.stt_models = split_list(&models);
        }
        if let Ok(fmt) = std::env::var("MURMUR_RESPONSE_FORMAT") {
            config.response_format = ResponseFormat::parse(&fmt)?;
        }
        if let Ok(mode) = std::env::var("MURMUR_VAD_MODE") {
            config.recorder.aggressiveness = mode
                .trim()
                .parse()
                .map_err(|_| VoiceError::Config(format!("bad MURMUR_VAD_MODE: {}", mode)))?;
        }
        if let Some(ms) = env_u64("MURMUR_SILENCE_MS")? {
            config.recorder.silence_threshold = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("MURMUR_MIN_RECORD_SECS")? {
            config.recorder.min_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("MURMUR_MAX_RECORD_SECS")? {
            config.recorder.max_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("MURMUR_GRACE_SECS")? {
            config.recorder.grace_period = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate once at load; the rest of the crate assumes these hold.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.recorder.aggressiveness > 3 {
            return Err(VoiceError::Config(format!(
                "VAD aggressiveness must be 0-3, got {}",
                self.recorder.aggressiveness
            )));
        }
        if !matches!(self.recorder.frame_ms, 10 | 20 | 30) {
            return Err(VoiceError::Config(format!(
                "frame period must be 10, 20 or 30 ms, got {}",
                self.recorder.frame_ms
            )));
        }
        if !matches!(self.recorder.classifier_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoiceError::Config(format!(
                "classifier rate must be 8/16/32/48 kHz, got {}",
                self.recorder.classifier_rate
            )));
        }
        if self.recorder.max_duration < self.recorder.min_duration {
            return Err(VoiceError::Config(
                "max recording duration is below the minimum duration".to_string(),
            ));
        }
        for ep in self.tts_endpoints.iter().chain(&self.stt_endpoints) {
            if ep.base_url.trim().is_empty() {
                return Err(VoiceError::Config("empty endpoint base URL".to_string()));
            }
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> VoiceResult<Option<u64>> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| VoiceError::Config(format!("bad {}: {}", name, v))),
        Err(_) => Ok(None),
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn parse_endpoint_list(urls: &str, api_key: Option<&str>) -> Vec<Endpoint> {
    split_list(urls)
        .into_iter()
        .map(|url| {
            let provider = if is_local_url(&url) {
                ProviderKind::Local
            } else {
                ProviderKind::Cloud
            };
            let mut ep = Endpoint::new(url, provider);
            if let Some(key) = api_key {
                ep = ep.with_api_key(key);
            }
            ep
        })
        .collect()
}

/// Loopback and private-host URLs are local providers.
pub fn is_local_url(url: &str) -> bool {
    url.contains("localhost")
        || url.contains("127.0.0.1")
        || url.contains("0.0.0.0")
        || url.contains("[::1]")
}

// Local (Kokoro-style) voice names paired with the nearest cloud voice, so a
// failover does not change speaker identity jarringly.
const VOICE_EQUIVALENTS: &[(&str, &str)] = &[
    ("af_sky", "nova"),
    ("af_bella", "shimmer"),
    ("af_nicole", "alloy"),
    ("af_sarah", "coral"),
    ("am_adam", "onyx"),
    ("am_michael", "echo"),
    ("bf_emma", "fable"),
    ("bm_george", "ash"),
    ("bm_lewis", "sage"),
];

const CLOUD_VOICES: &[&str] = &[
    "alloy", "ash", "coral", "echo", "fable", "nova", "onyx", "sage", "shimmer", "verse",
];

/// Remap a requested voice to one native to the target provider's catalog.
/// Already-native names pass through; unknown names on a local provider pass
/// through too (local servers accept arbitrary voice ids).
pub fn remap_voice(voice: &str, target: ProviderKind) -> String {
    match target {
        ProviderKind::Cloud => {
            if CLOUD_VOICES.contains(&voice) {
                return voice.to_string();
            }
            VOICE_EQUIVALENTS
                .iter()
                .find(|(local, _)| *local == voice)
                .map(|(_, cloud)| cloud.to_string())
                .unwrap_or_else(|| "alloy".to_string())
        }
        ProviderKind::Local => {
            if let Some((local, _)) = VOICE_EQUIVALENTS.iter().find(|(_, cloud)| *cloud == voice) {
                return local.to_string();
            }
            voice.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_list_parses_in_order() {
        let eps = parse_endpoint_list(
            "http://localhost:8880/v1, https://api.openai.com/v1",
            Some("sk-test"),
        );
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[0].provider, ProviderKind::Local);
        assert_eq!(eps[1].provider, ProviderKind::Cloud);
        assert_eq!(eps[1].base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn cloud_without_key_has_no_credential() {
        let ep = Endpoint::new("https://api.openai.com/v1", ProviderKind::Cloud);
        assert!(ep.credential().is_none());
        let local = Endpoint::new("http://localhost:8880/v1", ProviderKind::Local);
        assert_eq!(local.credential(), Some("not-needed"));
    }

    #[test]
    fn voice_remap_round_trips_known_pairs() {
        assert_eq!(remap_voice("af_sky", ProviderKind::Cloud), "nova");
        assert_eq!(remap_voice("nova", ProviderKind::Local), "af_sky");
        assert_eq!(remap_voice("nova", ProviderKind::Cloud), "nova");
        // unknown local names pass through on local, default on cloud
        assert_eq!(remap_voice("custom_voice", ProviderKind::Local), "custom_voice");
        assert_eq!(remap_voice("custom_voice", ProviderKind::Cloud), "alloy");
    }

    #[test]
    fn validation_rejects_bad_aggressiveness() {
        let mut config = VoiceConfig::default();
        config.recorder.aggressiveness = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn response_format_parses() {
        assert_eq!(ResponseFormat::parse("PCM").unwrap(), ResponseFormat::Pcm);
        assert!(ResponseFormat::parse("ogg").is_err());
    }
}
