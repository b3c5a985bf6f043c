//! Stateless multi-endpoint failover for TTS and STT.
//!
//! Endpoints are attempted strictly in configured order; no reordering and
//! no health-based skipping (local endpoints fail instantly, so probing
//! ahead buys nothing and risks staleness). First success wins. Exhaustion
//! yields a [`FailureReport`] itemizing every attempt, never a bare error.

use crate::config::{remap_voice, Endpoint, ProviderKind, ResponseFormat};
use crate::error::{remediation, ErrorKind, ProviderFailure, VoiceError, VoiceResult};
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Streamed TTS response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderFailure>> + Send>>;

/// One TTS request, already normalized for a specific provider.
#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub text: String,
    pub voice: String,
    pub model: String,
    pub format: ResponseFormat,
    pub speed: Option<f32>,
    pub instructions: Option<String>,
}

/// One STT request: encoded audio plus the model to use.
#[derive(Debug, Clone)]
pub struct SttRequest {
    pub wav: Vec<u8>,
    pub model: String,
}

/// Wire access to one speech endpoint. The orchestrator is generic over
/// this, so tests drive it with scripted transports.
pub trait SpeechTransport: Send + Sync {
    fn speech(
        &self,
        endpoint: &Endpoint,
        req: &TtsRequest,
    ) -> impl std::future::Future<Output = Result<ByteStream, ProviderFailure>> + Send;

    /// Returns the transcript text; empty string means the service was
    /// reachable but heard nothing.
    fn transcription(
        &self,
        endpoint: &Endpoint,
        req: &SttRequest,
    ) -> impl std::future::Future<Output = Result<String, ProviderFailure>> + Send;
}

/// One failed endpoint attempt, classified.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub endpoint: String,
    pub provider: ProviderKind,
    pub voice: Option<String>,
    pub model: Option<String>,
    #[serde(rename = "error_type")]
    pub kind: ErrorKind,
    pub detail: String,
}

/// Every endpoint failed. Carries the full ordered attempt list plus a
/// human-readable remediation suggestion.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub attempts: Vec<AttemptRecord>,
    pub suggestion: String,
}

impl FailureReport {
    fn new(attempts: Vec<AttemptRecord>) -> Self {
        let lead = attempts
            .iter()
            .find(|a| a.kind != ErrorKind::Unknown)
            .or_else(|| attempts.first());
        let suggestion = match lead {
            Some(a) => format!(
                "{}; or try a different backend",
                remediation(a.kind, a.provider)
            ),
            None => "no endpoints configured".to_string(),
        };
        Self {
            attempts,
            suggestion,
        }
    }
}

impl std::fmt::Display for FailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "all {} endpoint(s) failed:", self.attempts.len())?;
        for a in &self.attempts {
            writeln!(
                f,
                "  - {} ({}): {} — {}",
                a.endpoint, a.provider, a.kind, a.detail
            )?;
        }
        write!(f, "suggestion: {}", self.suggestion)
    }
}

/// Successful synthesis: the response byte stream plus the configuration
/// that won the failover.
pub struct TtsStream {
    pub stream: ByteStream,
    pub endpoint: String,
    pub provider: ProviderKind,
    pub voice: String,
    pub model: String,
    pub format: ResponseFormat,
    /// Failed attempts that preceded this success, in order.
    pub attempts: Vec<AttemptRecord>,
}

impl std::fmt::Debug for TtsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtsStream")
            .field("endpoint", &self.endpoint)
            .field("provider", &self.provider)
            .field("voice", &self.voice)
            .field("model", &self.model)
            .field("format", &self.format)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

/// Outcome of a transcription failover call.
#[derive(Debug, Clone)]
pub enum SttOutcome {
    Transcript {
        text: String,
        endpoint: String,
        provider: ProviderKind,
        /// Failed attempts that preceded this success, in order.
        attempts: Vec<AttemptRecord>,
    },
    /// The service connected and answered, there was simply nothing to
    /// transcribe. Takes precedence over earlier connection failures.
    NoSpeech {
        endpoint: String,
        provider: ProviderKind,
        attempts: Vec<AttemptRecord>,
    },
    Failed(FailureReport),
}

/// Advisory endpoint-health tags. Read-mostly, updated optimistically;
/// orchestration never consults it for ordering or skipping.
#[derive(Default)]
pub struct HealthRegistry {
    entries: Mutex<HashMap<String, bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, endpoint: &str, healthy: bool) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(endpoint.to_string(), healthy);
        }
    }

    /// Hint only; `None` means never observed.
    pub fn is_healthy(&self, endpoint: &str) -> Option<bool> {
        self.entries.lock().ok()?.get(endpoint).copied()
    }
}

/// Tries candidate endpoints in order and returns the first success or an
/// enumerable failure report.
pub struct FailoverOrchestrator<T: SpeechTransport> {
    transport: T,
    registry: HealthRegistry,
    /// Attempts per cloud endpoint (local is always 1: a refused connection
    /// stays refused).
    cloud_attempts: u32,
}

impl<T: SpeechTransport> FailoverOrchestrator<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            registry: HealthRegistry::new(),
            cloud_attempts: 2,
        }
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn attempts_for(&self, provider: ProviderKind) -> u32 {
        match provider {
            ProviderKind::Local => 1,
            ProviderKind::Cloud => self.cloud_attempts,
        }
    }

    /// Synthesize `text`, failing over across `endpoints` in order. The
    /// requested voice is remapped per provider so a failover does not
    /// change speaker identity jarringly.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        model: &str,
        format: ResponseFormat,
        endpoints: &[Endpoint],
    ) -> Result<TtsStream, FailureReport> {
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for endpoint in endpoints {
            if !endpoint.supports_tts {
                continue;
            }
            let mapped_voice = remap_voice(voice, endpoint.provider);
            let Some(_credential) = endpoint.credential() else {
                // Pre-flight: a cloud endpoint with no key would fail with an
                // auth error anyway; don't spend a request on it.
                warn!("skipping {} (no API key configured)", endpoint.base_url);
                attempts.push(AttemptRecord {
                    endpoint: endpoint.base_url.clone(),
                    provider: endpoint.provider,
                    voice: Some(mapped_voice),
                    model: Some(model.to_string()),
                    kind: ErrorKind::AuthFailed,
                    detail: "no API key configured for cloud endpoint".to_string(),
                });
                continue;
            };

            let req = TtsRequest {
                text: text.to_string(),
                voice: mapped_voice.clone(),
                model: model.to_string(),
                format,
                speed: None,
                instructions: None,
            };

            let mut last_failure: Option<ProviderFailure> = None;
            for attempt in 1..=self.attempts_for(endpoint.provider) {
                debug!(
                    "TTS attempt {} against {} (voice {})",
                    attempt, endpoint.base_url, mapped_voice
                );
                match self.transport.speech(endpoint, &req).await {
                    Ok(stream) => {
                        info!("TTS succeeded on {} ({})", endpoint.base_url, endpoint.provider);
                        self.registry.mark(&endpoint.base_url, true);
                        return Ok(TtsStream {
                            stream,
                            endpoint: endpoint.base_url.clone(),
                            provider: endpoint.provider,
                            voice: mapped_voice,
                            model: model.to_string(),
                            format,
                            attempts,
                        });
                    }
                    Err(failure) => {
                        let transient = failure.connect;
                        warn!(
                            "TTS attempt {} on {} failed: {} ({})",
                            attempt,
                            endpoint.base_url,
                            failure,
                            failure.kind()
                        );
                        last_failure = Some(failure);
                        if !transient {
                            break;
                        }
                    }
                }
            }
            let Some(failure) = last_failure else {
                continue;
            };
            self.registry.mark(&endpoint.base_url, false);
            attempts.push(AttemptRecord {
                endpoint: endpoint.base_url.clone(),
                provider: endpoint.provider,
                voice: Some(mapped_voice),
                model: Some(model.to_string()),
                kind: failure.kind(),
                detail: failure.to_string(),
            });
        }

        Err(FailureReport::new(attempts))
    }

    /// Transcribe encoded audio, failing over across `endpoints` in order.
    /// An empty-but-successful response returns [`SttOutcome::NoSpeech`]
    /// immediately: a confirmed "reachable, nothing to transcribe" is more
    /// informative than a preceding transient connection error.
    pub async fn transcribe(
        &self,
        wav: Vec<u8>,
        model: &str,
        endpoints: &[Endpoint],
    ) -> SttOutcome {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let req = SttRequest {
            wav,
            model: model.to_string(),
        };

        for endpoint in endpoints {
            if !endpoint.supports_stt {
                continue;
            }
            if endpoint.credential().is_none() {
                warn!("skipping {} (no API key configured)", endpoint.base_url);
                attempts.push(AttemptRecord {
                    endpoint: endpoint.base_url.clone(),
                    provider: endpoint.provider,
                    voice: None,
                    model: Some(model.to_string()),
                    kind: ErrorKind::AuthFailed,
                    detail: "no API key configured for cloud endpoint".to_string(),
                });
                continue;
            }

            let mut last_failure: Option<ProviderFailure> = None;
            for attempt in 1..=self.attempts_for(endpoint.provider) {
                debug!("STT attempt {} against {}", attempt, endpoint.base_url);
                match self.transport.transcription(endpoint, &req).await {
                    Ok(text) => {
                        self.registry.mark(&endpoint.base_url, true);
                        let text = text.trim().to_string();
                        if text.is_empty() {
                            info!("STT on {}: reachable but no speech", endpoint.base_url);
                            return SttOutcome::NoSpeech {
                                endpoint: endpoint.base_url.clone(),
                                provider: endpoint.provider,
                                attempts,
                            };
                        }
                        info!(
                            "STT succeeded on {} ({} chars)",
                            endpoint.base_url,
                            text.len()
                        );
                        return SttOutcome::Transcript {
                            text,
                            endpoint: endpoint.base_url.clone(),
                            provider: endpoint.provider,
                            attempts,
                        };
                    }
                    Err(failure) => {
                        let transient = failure.connect;
                        warn!(
                            "STT attempt {} on {} failed: {} ({})",
                            attempt,
                            endpoint.base_url,
                            failure,
                            failure.kind()
                        );
                        last_failure = Some(failure);
                        if !transient {
                            break;
                        }
                    }
                }
            }
            let Some(failure) = last_failure else {
                continue;
            };
            self.registry.mark(&endpoint.base_url, false);
            attempts.push(AttemptRecord {
                endpoint: endpoint.base_url.clone(),
                provider: endpoint.provider,
                voice: None,
                model: Some(model.to_string()),
                kind: failure.kind(),
                detail: failure.to_string(),
            });
        }

        SttOutcome::Failed(FailureReport::new(attempts))
    }
}

/// Encode mono i16 PCM to 16-bit WAV bytes for the multipart upload.
pub fn pcm_i16_to_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = samples.len() * 2;
    let file_len = 44u32 + data_len as u32;

    let mut buf = Vec::with_capacity(44 + data_len);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(file_len - 8).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    buf
}

/// Production transport: OpenAI-compatible `/audio/speech` and
/// `/audio/transcriptions` over reqwest with a per-request timeout.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self { client })
    }
}

impl SpeechTransport for HttpTransport {
    async fn speech(
        &self,
        endpoint: &Endpoint,
        req: &TtsRequest,
    ) -> Result<ByteStream, ProviderFailure> {
        let url = format!("{}/audio/speech", endpoint.base_url.trim_end_matches('/'));
        let credential = endpoint
            .credential()
            .ok_or_else(|| ProviderFailure::connect("no credential"))?;

        let mut body = serde_json::json!({
            "model": req.model,
            "voice": req.voice,
            "input": req.text,
            "response_format": req.format.as_str(),
        });
        if let Some(speed) = req.speed {
            body["speed"] = serde_json::json!(speed);
        }
        if let Some(ref instructions) = req.instructions {
            body["instructions"] = serde_json::json!(instructions);
        }

        let res = self
            .client
            .post(&url)
            .bearer_auth(credential)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderFailure::connect(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(ProviderFailure::http(status.as_u16(), body));
        }

        let stream = res
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ProviderFailure::connect(e.to_string())));
        Ok(Box::pin(stream))
    }

    async fn transcription(
        &self,
        endpoint: &Endpoint,
        req: &SttRequest,
    ) -> Result<String, ProviderFailure> {
        let url = format!(
            "{}/audio/transcriptions",
            endpoint.base_url.trim_end_matches('/')
        );
        let credential = endpoint
            .credential()
            .ok_or_else(|| ProviderFailure::connect("no credential"))?;

        let part = reqwest::multipart::Part::bytes(req.wav.clone())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderFailure::connect(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", req.model.clone())
            .text("response_format", "text");

        let res = self
            .client
            .post(&url)
            .bearer_auth(credential)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderFailure::connect(e.to_string()))?;

        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ProviderFailure::http(status.as_u16(), body));
        }

        // Some providers answer JSON even when plain text was requested.
        if body.trim_start().starts_with('{') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
                if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
                    return Ok(text.trim().to_string());
                }
            }
        }
        Ok(body.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_is_well_formed() {
        let wav = pcm_i16_to_wav(&[0i16; 480], 24000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 960);
        // sample rate little-endian at offset 24
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 24000);
    }

    #[test]
    fn failure_report_display_itemizes_attempts() {
        let report = FailureReport::new(vec![AttemptRecord {
            endpoint: "http://localhost:8880/v1".to_string(),
            provider: ProviderKind::Local,
            voice: Some("af_sky".to_string()),
            model: Some("tts-1".to_string()),
            kind: ErrorKind::ConnectionFailed,
            detail: "connection refused".to_string(),
        }]);
        let rendered = report.to_string();
        assert!(rendered.contains("localhost:8880"));
        assert!(rendered.contains("connection_failed"));
        assert!(rendered.contains("check the local speech service is running"));
    }

    #[test]
    fn registry_is_advisory_only() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.is_healthy("http://x"), None);
        registry.mark("http://x", false);
        assert_eq!(registry.is_healthy("http://x"), Some(false));
        registry.mark("http://x", true);
        assert_eq!(registry.is_healthy("http://x"), Some(true));
    }
}
