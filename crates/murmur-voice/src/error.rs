//! Error types and the provider-failure taxonomy.
//!
//! `VoiceError` covers crate-level failures (devices, streams, decode).
//! `ErrorKind` is the closed taxonomy the failover orchestrator records per
//! endpoint attempt; `ProviderFailure::kind` maps a raw provider error onto
//! it by inspecting, in order: HTTP status, provider error-code field, then
//! free text.

use crate::config::ProviderKind;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice conversation core
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

/// Closed taxonomy of per-endpoint failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionFailed,
    AuthFailed,
    QuotaExceeded,
    RateLimited,
    BillingLimitReached,
    AccessTerminated,
    InvalidRequest,
    #[serde(rename = "no_speech")]
    NoSpeechDetected,
    DeviceError,
    DecodeError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::BillingLimitReached => "billing_limit_reached",
            ErrorKind::AccessTerminated => "access_terminated",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NoSpeechDetected => "no_speech",
            ErrorKind::DeviceError => "device_error",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw failure from one provider request, before classification.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    /// HTTP status, when a response was received.
    pub status: Option<u16>,
    /// Provider error-code field (e.g. OpenAI `error.code`), when present.
    pub code: Option<String>,
    /// Raw error message or response body.
    pub message: String,
    /// True when the request never reached the service (refused, DNS, timeout).
    pub connect: bool,
}

impl ProviderFailure {
    /// A transport-level failure: the endpoint was never reached.
    pub fn connect(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            connect: true,
        }
    }

    /// A non-success HTTP response. The error code is extracted from the
    /// body's `error.code` / `error.type` fields when the body is JSON.
    pub fn http(status: u16, body: String) -> Self {
        let code = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                let err = v.get("error")?;
                err.get("code")
                    .or_else(|| err.get("type"))
                    .and_then(|c| c.as_str())
                    .map(String::from)
            });
        Self {
            status: Some(status),
            code,
            message: body,
            connect: false,
        }
    }

    /// Classify onto the closed taxonomy. Inspection order: HTTP status,
    /// provider error code, free text.
    pub fn kind(&self) -> ErrorKind {
        if self.connect {
            return ErrorKind::ConnectionFailed;
        }
        if let Some(status) = self.status {
            let kind = classify_status(status, &self.message);
            if kind != ErrorKind::Unknown {
                return kind;
            }
        }
        if let Some(ref code) = self.code {
            if let Some(kind) = classify_code(code) {
                return kind;
            }
        }
        classify_message(&self.message)
    }
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Map an HTTP status (plus response body text for disambiguation) to a kind.
pub fn classify_status(status: u16, body: &str) -> ErrorKind {
    let lower = body.to_ascii_lowercase();
    match status {
        401 => ErrorKind::AuthFailed,
        402 => ErrorKind::BillingLimitReached,
        403 => {
            if lower.contains("terminat") || lower.contains("suspend") || lower.contains("deactivat")
            {
                ErrorKind::AccessTerminated
            } else {
                ErrorKind::AuthFailed
            }
        }
        429 => {
            if lower.contains("billing") || lower.contains("hard limit") {
                ErrorKind::BillingLimitReached
            } else if lower.contains("quota") || lower.contains("insufficient") {
                ErrorKind::QuotaExceeded
            } else {
                ErrorKind::RateLimited
            }
        }
        400 | 404 | 413 | 415 | 422 => ErrorKind::InvalidRequest,
        _ => ErrorKind::Unknown,
    }
}

/// Map a provider error-code field to a kind, when it is one we recognize.
pub fn classify_code(code: &str) -> Option<ErrorKind> {
    match code {
        "insufficient_quota" => Some(ErrorKind::QuotaExceeded),
        "rate_limit_exceeded" => Some(ErrorKind::RateLimited),
        "billing_hard_limit_reached" => Some(ErrorKind::BillingLimitReached),
        "invalid_api_key" | "invalid_authentication" => Some(ErrorKind::AuthFailed),
        "account_deactivated" | "access_terminated" => Some(ErrorKind::AccessTerminated),
        "invalid_request_error" => Some(ErrorKind::InvalidRequest),
        _ => None,
    }
}

/// Free-text classification, the last resort for non-HTTP failures.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("connection refused")
        || lower.contains("connect error")
        || lower.contains("timed out")
        || lower.contains("dns error")
        || lower.contains("unreachable")
    {
        ErrorKind::ConnectionFailed
    } else if lower.contains("api key") || lower.contains("unauthorized") {
        ErrorKind::AuthFailed
    } else if lower.contains("quota") {
        ErrorKind::QuotaExceeded
    } else if lower.contains("rate limit") {
        ErrorKind::RateLimited
    } else if lower.contains("billing") {
        ErrorKind::BillingLimitReached
    } else if lower.contains("decode") {
        ErrorKind::DecodeError
    } else if lower.contains("device") {
        ErrorKind::DeviceError
    } else {
        ErrorKind::Unknown
    }
}

/// Human-readable remediation text for a failure kind.
pub fn remediation(kind: ErrorKind, provider: ProviderKind) -> &'static str {
    match kind {
        ErrorKind::ConnectionFailed => match provider {
            ProviderKind::Local => "check the local speech service is running",
            ProviderKind::Cloud => "check network connectivity to the provider",
        },
        ErrorKind::AuthFailed => "set an API key for this endpoint",
        ErrorKind::QuotaExceeded => "quota exhausted; raise the limit or wait for reset",
        ErrorKind::RateLimited => "slow down request rate or upgrade the plan",
        ErrorKind::BillingLimitReached => "billing limit reached; check the provider account",
        ErrorKind::AccessTerminated => "account access terminated; contact the provider",
        ErrorKind::InvalidRequest => "check voice/model parameters against the provider catalog",
        ErrorKind::NoSpeechDetected => "the service was reachable but heard nothing",
        ErrorKind::DeviceError => "check the audio device is connected",
        ErrorKind::DecodeError => "try a different response format",
        ErrorKind::Unknown => "try a different backend",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_401_is_auth() {
        assert_eq!(classify_status(401, ""), ErrorKind::AuthFailed);
    }

    #[test]
    fn status_429_disambiguated_by_body() {
        assert_eq!(
            classify_status(429, "You exceeded your current quota"),
            ErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify_status(429, "billing hard limit has been reached"),
            ErrorKind::BillingLimitReached
        );
        assert_eq!(
            classify_status(429, "Too many requests, slow down"),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn status_403_terminated_vs_auth() {
        assert_eq!(
            classify_status(403, "account terminated"),
            ErrorKind::AccessTerminated
        );
        assert_eq!(classify_status(403, "forbidden"), ErrorKind::AuthFailed);
    }

    #[test]
    fn connect_failure_wins() {
        let f = ProviderFailure::connect("connection refused (os error 111)");
        assert_eq!(f.kind(), ErrorKind::ConnectionFailed);
    }

    #[test]
    fn error_code_extracted_from_json_body() {
        let body = r#"{"error":{"message":"whatever","code":"insufficient_quota"}}"#.to_string();
        let f = ProviderFailure::http(500, body);
        assert_eq!(f.code.as_deref(), Some("insufficient_quota"));
        assert_eq!(f.kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn free_text_fallback() {
        assert_eq!(
            classify_message("error sending request: connection refused"),
            ErrorKind::ConnectionFailed
        );
        assert_eq!(classify_message("missing api key"), ErrorKind::AuthFailed);
        assert_eq!(classify_message("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn no_speech_serializes_as_expected() {
        assert_eq!(ErrorKind::NoSpeechDetected.as_str(), "no_speech");
        let json = serde_json::to_string(&ErrorKind::NoSpeechDetected).unwrap();
        assert_eq!(json, "\"no_speech\"");
    }
}
