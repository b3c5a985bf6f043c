//! End-to-end synthesis pipeline without devices or network: a scripted
//! transport streams audio bytes, the playback engine decodes them into an
//! in-memory sink, and metrics reflect what actually happened.

use bytes::Bytes;
use futures::stream;
use murmur_voice::config::{Endpoint, ProviderKind, ResponseFormat};
use murmur_voice::error::ProviderFailure;
use murmur_voice::failover::{
    pcm_i16_to_wav, ByteStream, FailoverOrchestrator, SpeechTransport, SttRequest, TtsRequest,
};
use murmur_voice::playback::play_streaming;
use murmur_voice::BufferSink;

const THRESHOLD: usize = 32 * 1024;

/// Transport that streams a fixed byte payload in small chunks, in whatever
/// format the request asked for.
struct CannedAudio {
    pcm: Vec<i16>,
    chunk_size: usize,
}

impl CannedAudio {
    fn payload(&self, format: ResponseFormat) -> Vec<u8> {
        match format {
            ResponseFormat::Pcm => self.pcm.iter().flat_map(|s| s.to_le_bytes()).collect(),
            _ => pcm_i16_to_wav(&self.pcm, 24000),
        }
    }
}

impl SpeechTransport for CannedAudio {
    async fn speech(
        &self,
        _endpoint: &Endpoint,
        req: &TtsRequest,
    ) -> Result<ByteStream, ProviderFailure> {
        let chunks: Vec<Result<Bytes, ProviderFailure>> = self
            .payload(req.format)
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn transcription(
        &self,
        _endpoint: &Endpoint,
        _req: &SttRequest,
    ) -> Result<String, ProviderFailure> {
        Ok(String::new())
    }
}

fn tone(len: usize) -> Vec<i16> {
    (0..len).map(|i| ((i % 240) * 100) as i16 - 12000).collect()
}

async fn synthesize_into_sink(format: ResponseFormat, pcm: Vec<i16>) -> (Vec<i16>, u64, u64) {
    let orch = FailoverOrchestrator::new(CannedAudio {
        pcm,
        chunk_size: 1024,
    });
    let endpoints = [Endpoint::new(
        "http://localhost:8880/v1",
        ProviderKind::Local,
    )];
    let tts = orch
        .synthesize("hello there", "af_sky", "tts-1", format, &endpoints)
        .await
        .expect("local endpoint succeeds");

    let sink = BufferSink::new();
    let metrics = play_streaming(tts.stream, tts.format, &sink, THRESHOLD)
        .await
        .expect("playback succeeds");
    (sink.take(), metrics.chunks_received, metrics.chunks_played)
}

#[tokio::test]
async fn pcm_pipeline_is_lossless() {
    let pcm = tone(4800);
    let (out, received, played) = synthesize_into_sink(ResponseFormat::Pcm, pcm.clone()).await;
    assert_eq!(out, pcm);
    assert!(received > 1, "payload should arrive in multiple chunks");
    // Raw PCM needs no header, so every chunk becomes audio immediately.
    assert_eq!(played, received);
}

#[tokio::test]
async fn wav_pipeline_decodes_every_sample() {
    let pcm = tone(4800);
    let (out, _, _) = synthesize_into_sink(ResponseFormat::Wav, pcm.clone()).await;
    assert_eq!(out, pcm);
}

#[tokio::test]
async fn long_wav_response_plays_in_full() {
    // Two seconds at 24kHz is roughly 96 KiB on the wire, far past any
    // buffering threshold, delivered in 1 KiB chunks.
    let pcm = tone(48_000);
    let (out, received, played) = synthesize_into_sink(ResponseFormat::Wav, pcm.clone()).await;
    assert_eq!(out, pcm);
    assert!(received > 90, "payload should arrive in many chunks");
    assert!(played <= received);
    // Audio must flow while chunks arrive, not only at the final flush.
    assert!(played > 1);
}

#[tokio::test]
async fn midstream_transport_error_aborts_playback() {
    let sink = BufferSink::new();
    let chunks: Vec<Result<Bytes, ProviderFailure>> = vec![
        Ok(Bytes::from_static(&[0u8; 64])),
        Err(ProviderFailure::connect("connection reset by peer")),
    ];
    let err = play_streaming(
        Box::pin(stream::iter(chunks)) as ByteStream,
        ResponseFormat::Pcm,
        &sink,
        THRESHOLD,
    )
    .await
    .expect_err("stream error should surface");
    assert!(err.to_string().contains("connection reset"));
}
