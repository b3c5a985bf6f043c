//! Low-latency streaming playback.
//!
//! Consumes a synthesis response incrementally and queues decoded samples
//! into a [`SampleSink`] while recording timing metrics. Three strategies,
//! selected by wire codec:
//!
//! 1. raw PCM passthrough (sample-aligned; a dangling byte is carried),
//! 2. frame-based Opus via a stateful decoder (a decode failure on short
//!    data means "wait for more bytes", not an error),
//! 3. buffered container decode (mp3/flac/aac): accumulate to a threshold,
//!    re-decode the growing payload from its header, queue only the samples
//!    not heard yet, flush the remainder when the stream ends.
//!
//! WAV is a degenerate container: behind its RIFF header the payload is raw
//! PCM, so it rides strategy 1 once a small header scan locates the `data`
//! chunk. That keeps arbitrarily long responses streaming instead of
//! buffering.
//!
//! `ttfa` is uniformly request-start to first queued sample, so the
//! strategies stay comparable.

use crate::audio::SampleSink;
use crate::config::ResponseFormat;
use crate::error::{ProviderFailure, VoiceError, VoiceResult};
use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Timing and accounting for one streaming session.
#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    /// Request start to first queued sample. None when no audio arrived.
    pub ttfa: Option<Duration>,
    /// Request start to last network chunk.
    pub generation_time: Duration,
    /// First queued sample to queue drained.
    pub playback_time: Duration,
    pub chunks_received: u64,
    /// Chunks that produced queued samples; never exceeds `chunks_received`.
    pub chunks_played: u64,
    pub buffer_underruns: u64,
}

/// Raw PCM: chunks are already interleaved i16. Keeps the dangling byte of
/// an odd-length chunk and prefixes it to the next.
struct PcmPassthrough {
    carry: Option<u8>,
}

impl PcmPassthrough {
    fn new() -> Self {
        Self { carry: None }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<i16> {
        let mut data: Vec<u8>;
        let bytes: &[u8] = match self.carry.take() {
            Some(b) => {
                data = Vec::with_capacity(chunk.len() + 1);
                data.push(b);
                data.extend_from_slice(chunk);
                &data
            }
            None => chunk,
        };
        let pairs = bytes.len() / 2;
        if bytes.len() % 2 != 0 {
            self.carry = Some(bytes[bytes.len() - 1]);
        }
        bytes[..pairs * 2]
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    fn finish(&mut self) -> VoiceResult<Vec<i16>> {
        if self.carry.take().is_some() {
            warn!("PCM stream ended on a half sample, dropping final byte");
        }
        Ok(Vec::new())
    }
}

/// Frame-based Opus. Accumulated bytes are handed to a stateful decoder;
/// an undecodable buffer is retained and prefixed to the next chunk.
struct OpusStreamDecoder {
    decoder: opus::Decoder,
    pending: Vec<u8>,
    /// Scratch sized for the longest Opus frame (120ms at 48kHz).
    scratch: Vec<i16>,
}

impl OpusStreamDecoder {
    fn new() -> VoiceResult<Self> {
        let decoder = opus::Decoder::new(48000, opus::Channels::Mono)
            .map_err(|e| VoiceError::Decode(format!("opus init: {}", e)))?;
        Ok(Self {
            decoder,
            pending: Vec::new(),
            scratch: vec![0i16; 5760],
        })
    }

    fn decode_pending(&mut self) -> Option<Vec<i16>> {
        match self.decoder.decode(&self.pending, &mut self.scratch, false) {
            Ok(n) => {
                self.pending.clear();
                Some(self.scratch[..n].to_vec())
            }
            // Expected on too-little data: wait for more bytes.
            Err(_) => None,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<i16> {
        self.pending.extend_from_slice(chunk);
        self.decode_pending().unwrap_or_default()
    }

    fn finish(&mut self) -> VoiceResult<Vec<i16>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        match self.decode_pending() {
            Some(samples) => Ok(samples),
            None => Err(VoiceError::Decode(format!(
                "{} undecodable opus bytes at end of stream",
                self.pending.len()
            ))),
        }
    }
}

/// RIFF is a chunked container; find where the `data` payload starts and
/// validate the fmt chunk on the way. `Ok(None)` means the header is still
/// incomplete, keep accumulating.
fn locate_wav_data(buf: &[u8]) -> Result<Option<usize>, String> {
    if buf.len() < 12 {
        return Ok(None);
    }
    if &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return Err("stream is not RIFF/WAVE".to_string());
    }
    let mut pos = 12;
    while buf.len() >= pos + 8 {
        let id = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
        let size =
            u32::from_le_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]) as usize;
        let body = pos + 8;
        if &id == b"data" {
            // Streaming servers put a placeholder length here; ignore it and
            // treat everything that follows as samples.
            return Ok(Some(body));
        }
        if buf.len() < body + size {
            return Ok(None);
        }
        if &id == b"fmt " && size >= 16 {
            let format = u16::from_le_bytes([buf[body], buf[body + 1]]);
            let bits = u16::from_le_bytes([buf[body + 14], buf[body + 15]]);
            if format != 1 || bits != 16 {
                return Err(format!(
                    "unsupported wav encoding (format {}, {} bits)",
                    format, bits
                ));
            }
        }
        pos = body + size + (size & 1);
    }
    Ok(None)
}

/// WAV: raw PCM behind a chunked RIFF header. Once the `data` chunk is
/// located the stream degrades to sample-aligned passthrough.
struct WavStreamDecoder {
    header: Vec<u8>,
    pcm: PcmPassthrough,
    streaming: bool,
    invalid: Option<String>,
}

impl WavStreamDecoder {
    fn new() -> Self {
        Self {
            header: Vec::new(),
            pcm: PcmPassthrough::new(),
            streaming: false,
            invalid: None,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<i16> {
        if self.streaming {
            return self.pcm.push(chunk);
        }
        if self.invalid.is_some() {
            return Vec::new();
        }
        self.header.extend_from_slice(chunk);
        match locate_wav_data(&self.header) {
            Ok(Some(data_start)) => {
                self.streaming = true;
                let tail = self.header.split_off(data_start);
                self.header = Vec::new();
                self.pcm.push(&tail)
            }
            Ok(None) => Vec::new(),
            // Reported at the final flush, like any other payload that
            // never becomes decodable.
            Err(reason) => {
                self.invalid = Some(reason);
                Vec::new()
            }
        }
    }

    fn finish(&mut self) -> VoiceResult<Vec<i16>> {
        if let Some(ref reason) = self.invalid {
            return Err(VoiceError::Decode(reason.clone()));
        }
        if self.streaming {
            return self.pcm.finish();
        }
        if self.header.is_empty() {
            Ok(Vec::new())
        } else {
            Err(VoiceError::Decode(format!(
                "wav stream ended inside the header ({} bytes)",
                self.header.len()
            )))
        }
    }
}

/// Container codec without a streaming decoder. The payload is never
/// discarded: each round re-decodes the growing buffer from its header
/// (threshold chosen empirically to contain at least one complete frame)
/// and queues only the samples past what earlier rounds already emitted.
/// The frame-based backends stop at a truncated final frame, so a later
/// round picks those samples up once the rest of the frame arrives.
struct BufferedContainer {
    pending: Vec<u8>,
    threshold: usize,
    /// Payload size at which the next decode round runs.
    next_attempt: usize,
    /// Samples emitted by previous rounds.
    emitted: usize,
}

impl BufferedContainer {
    fn new(threshold: usize) -> Self {
        Self {
            pending: Vec::new(),
            threshold,
            next_attempt: threshold,
            emitted: 0,
        }
    }

    fn decode_all(&self) -> Option<Vec<i16>> {
        match rodio::Decoder::new(Cursor::new(self.pending.clone())) {
            Ok(decoder) => Some(decoder.collect()),
            Err(_) => None,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<i16> {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() < self.next_attempt {
            return Vec::new();
        }
        self.next_attempt = self.pending.len() + self.threshold;
        match self.decode_all() {
            Some(samples) if samples.len() > self.emitted => {
                let fresh = samples[self.emitted..].to_vec();
                self.emitted = samples.len();
                fresh
            }
            // Header incomplete or no whole new frame yet; keep accumulating.
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> VoiceResult<Vec<i16>> {
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }
        match self.decode_all() {
            Some(samples) => Ok(samples.get(self.emitted..).unwrap_or_default().to_vec()),
            None => Err(VoiceError::Decode(format!(
                "{} undecodable bytes at end of stream",
                self.pending.len()
            ))),
        }
    }
}

enum ChunkDecoder {
    Pcm(PcmPassthrough),
    Opus(OpusStreamDecoder),
    Wav(WavStreamDecoder),
    Buffered(BufferedContainer),
}

impl ChunkDecoder {
    fn for_format(format: ResponseFormat, container_threshold: usize) -> VoiceResult<Self> {
        Ok(match format {
            ResponseFormat::Pcm => ChunkDecoder::Pcm(PcmPassthrough::new()),
            ResponseFormat::Opus => ChunkDecoder::Opus(OpusStreamDecoder::new()?),
            ResponseFormat::Wav => ChunkDecoder::Wav(WavStreamDecoder::new()),
            ResponseFormat::Mp3 | ResponseFormat::Flac | ResponseFormat::Aac => {
                ChunkDecoder::Buffered(BufferedContainer::new(container_threshold))
            }
        })
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<i16> {
        match self {
            ChunkDecoder::Pcm(d) => d.push(chunk),
            ChunkDecoder::Opus(d) => d.push(chunk),
            ChunkDecoder::Wav(d) => d.push(chunk),
            ChunkDecoder::Buffered(d) => d.push(chunk),
        }
    }

    fn finish(&mut self) -> VoiceResult<Vec<i16>> {
        match self {
            ChunkDecoder::Pcm(d) => d.finish(),
            ChunkDecoder::Opus(d) => d.finish(),
            ChunkDecoder::Wav(d) => d.finish(),
            ChunkDecoder::Buffered(d) => d.finish(),
        }
    }
}

/// Drive one synthesis response through progressive decode into `sink`.
/// Samples are enqueued in arrival order and played in enqueue order.
pub async fn play_streaming<S>(
    mut chunks: S,
    format: ResponseFormat,
    sink: &dyn SampleSink,
    container_threshold: usize,
) -> VoiceResult<StreamMetrics>
where
    S: Stream<Item = Result<Bytes, ProviderFailure>> + Unpin,
{
    let started = Instant::now();
    let mut decoder = ChunkDecoder::for_format(format, container_threshold)?;
    let mut metrics = StreamMetrics::default();
    let underruns_before = sink.underruns();
    let mut first_audio: Option<Instant> = None;
    sink.set_active(true);

    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(failure) => {
                sink.set_active(false);
                return Err(VoiceError::Playback(format!(
                    "response stream failed: {}",
                    failure
                )));
            }
        };
        metrics.chunks_received += 1;
        metrics.generation_time = started.elapsed();
        if chunk.is_empty() {
            continue;
        }
        let samples = decoder.push(&chunk);
        if !samples.is_empty() {
            sink.enqueue(&samples);
            metrics.chunks_played += 1;
            if first_audio.is_none() {
                let ttfa = started.elapsed();
                first_audio = Some(Instant::now());
                metrics.ttfa = Some(ttfa);
                debug!("first audio queued after {:?}", ttfa);
            }
        }
    }

    // Final flush; only a failure here is reported.
    match decoder.finish() {
        Ok(samples) if !samples.is_empty() => {
            sink.enqueue(&samples);
            if first_audio.is_none() {
                first_audio = Some(Instant::now());
                metrics.ttfa = Some(started.elapsed());
            }
        }
        Ok(_) => {}
        Err(e) => {
            sink.set_active(false);
            return Err(e);
        }
    }

    // Wait for the device to drain what we queued; underrun silence keeps
    // the callback running, so this terminates once the queue empties.
    let drain_deadline = Instant::now() + Duration::from_secs(120);
    while sink.queued() > 0 && Instant::now() < drain_deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    sink.set_active(false);

    if let Some(first) = first_audio {
        metrics.playback_time = first.elapsed();
    }
    metrics.buffer_underruns = sink.underruns().saturating_sub(underruns_before);
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::BufferSink;
    use crate::failover::pcm_i16_to_wav;
    use futures::stream;

    fn ok_chunks(parts: Vec<Vec<u8>>) -> impl Stream<Item = Result<Bytes, ProviderFailure>> + Unpin {
        stream::iter(
            parts
                .into_iter()
                .map(|p| Ok(Bytes::from(p)))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn pcm_passthrough_queues_every_chunk() {
        let sink = BufferSink::new();
        let samples: Vec<i16> = (0..960).collect();
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let chunks = ok_chunks(bytes.chunks(256).map(|c| c.to_vec()).collect());

        let metrics = play_streaming(chunks, ResponseFormat::Pcm, &sink, 32 * 1024)
            .await
            .unwrap();
        assert_eq!(sink.take(), samples);
        assert!(metrics.ttfa.is_some());
        assert!(metrics.chunks_played <= metrics.chunks_received);
        assert_eq!(metrics.buffer_underruns, 0);
    }

    #[tokio::test]
    async fn pcm_carries_dangling_byte_across_chunks() {
        let sink = BufferSink::new();
        let samples: Vec<i16> = vec![100, -200, 300, -400];
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        // Split on an odd boundary.
        let chunks = ok_chunks(vec![bytes[..3].to_vec(), bytes[3..].to_vec()]);

        play_streaming(chunks, ResponseFormat::Pcm, &sink, 32 * 1024)
            .await
            .unwrap();
        assert_eq!(sink.take(), samples);
    }

    #[tokio::test]
    async fn wav_streams_losslessly_after_the_header() {
        let sink = BufferSink::new();
        let pcm: Vec<i16> = (0..2400).map(|i| ((i % 100) * 50) as i16).collect();
        let wav = pcm_i16_to_wav(&pcm, 24000);
        let chunks = ok_chunks(wav.chunks(1024).map(|c| c.to_vec()).collect());

        let metrics = play_streaming(chunks, ResponseFormat::Wav, &sink, 32 * 1024)
            .await
            .unwrap();
        assert_eq!(sink.take(), pcm);
        assert!(metrics.ttfa.is_some());
        // Audio flows chunk by chunk, not only at the final flush.
        assert!(metrics.chunks_played > 1);
    }

    #[tokio::test]
    async fn wav_header_split_across_chunks_still_decodes() {
        let sink = BufferSink::new();
        let pcm: Vec<i16> = vec![100, -200, 300, -400, 500, -600];
        let wav = pcm_i16_to_wav(&pcm, 24000);
        // Split mid-header and then on an odd byte boundary inside the data.
        let chunks = ok_chunks(vec![
            wav[..3].to_vec(),
            wav[3..49].to_vec(),
            wav[49..].to_vec(),
        ]);

        play_streaming(chunks, ResponseFormat::Wav, &sink, 32 * 1024)
            .await
            .unwrap();
        assert_eq!(sink.take(), pcm);
    }

    #[tokio::test]
    async fn wav_that_never_completes_its_header_fails_at_flush() {
        let sink = BufferSink::new();
        let wav = pcm_i16_to_wav(&[0i16; 16], 24000);
        let chunks = ok_chunks(vec![wav[..20].to_vec()]);
        let err = play_streaming(chunks, ResponseFormat::Wav, &sink, 32 * 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn non_pcm_wav_is_rejected_at_flush() {
        let sink = BufferSink::new();
        let mut wav = pcm_i16_to_wav(&[0i16; 16], 24000);
        // Claim 24 bits per sample.
        wav[34] = 24;
        let chunks = ok_chunks(vec![wav]);
        let err = play_streaming(chunks, ResponseFormat::Wav, &sink, 32 * 1024)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported wav encoding"));
        assert!(sink.is_empty());
    }

    #[test]
    fn container_rounds_never_replay_samples() {
        // The decode rounds keep the whole payload (header included) and
        // only emit what earlier rounds have not.
        let pcm: Vec<i16> = (0..2400).map(|i| (i % 512) as i16).collect();
        let wav = pcm_i16_to_wav(&pcm, 24000);
        let mut dec = BufferedContainer::new(wav.len());

        assert!(dec.push(&wav[..1000]).is_empty());
        let first = dec.push(&wav[1000..]);
        assert_eq!(first.len(), pcm.len());

        let rest = dec.finish().unwrap();
        assert!(rest.is_empty(), "flush re-decode must not replay audio");
    }

    #[tokio::test]
    async fn buffered_garbage_fails_only_on_final_flush() {
        let sink = BufferSink::new();
        // Below threshold, so no mid-stream decode is even attempted.
        let chunks = ok_chunks(vec![vec![0xDE; 512], vec![0xAD; 512]]);
        let err = play_streaming(chunks, ResponseFormat::Mp3, &sink, 32 * 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn opus_short_data_waits_rather_than_erroring_midstream() {
        let sink = BufferSink::new();
        let mut decoder = OpusStreamDecoder::new().unwrap();
        // A fragment no decoder can act on yet: retained, not an error.
        let out = decoder.push(&[0x01]);
        assert!(out.is_empty());
        assert!(!decoder.pending.is_empty());
        drop(sink);
    }

    #[tokio::test]
    async fn chunks_played_never_exceeds_received() {
        let sink = BufferSink::new();
        let pcm: Vec<i16> = (0..240).collect();
        let wav = pcm_i16_to_wav(&pcm, 24000);
        let chunks = ok_chunks(wav.chunks(64).map(|c| c.to_vec()).collect());
        let metrics = play_streaming(chunks, ResponseFormat::Wav, &sink, 32 * 1024)
            .await
            .unwrap();
        assert!(metrics.chunks_played <= metrics.chunks_received);
        assert_eq!(sink.take(), pcm);
    }

    #[tokio::test]
    async fn empty_stream_yields_no_ttfa() {
        let sink = BufferSink::new();
        let chunks = ok_chunks(vec![]);
        let metrics = play_streaming(chunks, ResponseFormat::Pcm, &sink, 32 * 1024)
            .await
            .unwrap();
        assert!(metrics.ttfa.is_none());
        assert_eq!(metrics.chunks_received, 0);
    }
}
