//! Audio device I/O on bare metal via CPAL.
//!
//! Capture chunks the input callback into fixed-duration frames and hands
//! them to the recorder over a bounded channel. Playback runs a realtime
//! output callback that only reads from a bounded sample ring: a write that
//! would overflow drops the oldest samples, an underrun fills silence and
//! bumps a counter. The callbacks never touch network or disk.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// One fixed-duration frame of captured PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Signed 16-bit samples at `sample_rate`.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Monotonic frame index within one capture stream.
    pub seq: u64,
}

/// Capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per emitted frame (e.g. 720 = 30ms at 24kHz).
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
            frame_size: 720,
        }
    }
}

/// Microphone capture; frames go out over a bounded channel.
pub struct AudioCapture {
    config: CaptureConfig,
    device: Device,
    stream_config: StreamConfig,
}

impl AudioCapture {
    pub fn new(config: CaptureConfig) -> VoiceResult<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("no input device available".to_string()))?;
        info!(
            "capture device: {} ({}Hz, {} ch)",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            config.sample_rate,
            config.channels
        );

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.frame_size as u32),
        };

        Ok(Self {
            config,
            device,
            stream_config,
        })
    }

    /// Start capturing. The callback accumulates device buffers into
    /// `frame_size` frames; a full channel drops the frame rather than
    /// blocking the audio thread.
    pub fn start(self, frame_tx: SyncSender<AudioFrame>) -> VoiceResult<Stream> {
        let frame_size = self.config.frame_size;
        let sample_rate = self.config.sample_rate;
        let channels = self.config.channels;
        let mut pending: Vec<i16> = Vec::with_capacity(frame_size);
        let mut seq: u64 = 0;

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(sample);
                    if pending.len() >= frame_size {
                        let frame = AudioFrame {
                            samples: std::mem::replace(
                                &mut pending,
                                Vec::with_capacity(frame_size),
                            ),
                            sample_rate,
                            channels,
                            seq,
                        };
                        seq += 1;
                        match frame_tx.try_send(frame) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!("capture channel full, dropping frame");
                            }
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }
                }
            },
            move |err| {
                warn!("capture stream error: {}", err);
            },
            None,
        )?;

        stream.play()?;
        Ok(stream)
    }

    /// List available input devices.
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        for device in host.input_devices()? {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

/// Where decoded samples go. The realtime device ring implements this; tests
/// and offline synthesis use [`BufferSink`].
pub trait SampleSink: Send + Sync {
    /// Queue samples for playback.
    fn enqueue(&self, samples: &[i16]);
    /// Samples currently queued and not yet consumed.
    fn queued(&self) -> usize;
    /// Underruns observed while a stream session was active.
    fn underruns(&self) -> u64;
    /// Mark a stream session active/inactive; underruns only count while active.
    fn set_active(&self, active: bool);
}

/// Bounded sample ring shared between the writer and the output callback.
pub struct PlaybackQueue {
    samples: Mutex<VecDeque<i16>>,
    capacity: usize,
    underruns: AtomicU64,
    dropped: AtomicU64,
    active: AtomicBool,
}

impl PlaybackQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            // Preallocated in full: neither side ever allocates while
            // holding the lock.
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            underruns: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }
    }

    /// Samples dropped from the front due to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Pop up to `out.len()` samples into `out`, zero-filling the rest.
    /// Called from the realtime output callback only; the critical section
    /// is two bounded memcpys and a head advance.
    fn fill(&self, out: &mut [i16]) {
        let mut queue = match self.samples.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        let available = queue.len().min(out.len());
        let (front, back) = queue.as_slices();
        let split = front.len().min(available);
        out[..split].copy_from_slice(&front[..split]);
        out[split..available].copy_from_slice(&back[..available - split]);
        queue.drain(..available);
        drop(queue);

        if available < out.len() {
            for slot in out.iter_mut().skip(available) {
                *slot = 0;
            }
            if self.active.load(Ordering::Relaxed) {
                self.underruns.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl SampleSink for PlaybackQueue {
    fn enqueue(&self, samples: &[i16]) {
        let mut queue = match self.samples.lock() {
            Ok(q) => q,
            Err(poisoned) => poisoned.into_inner(),
        };
        let incoming = samples.len().min(self.capacity);
        if incoming < samples.len() {
            self.dropped
                .fetch_add((samples.len() - incoming) as u64, Ordering::Relaxed);
        }
        let total = queue.len() + incoming;
        if total > self.capacity {
            // Bounded backpressure: freshness over completeness.
            let excess = total - self.capacity;
            let drain_to = excess.min(queue.len());
            queue.drain(..drain_to);
            self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
        }
        queue.extend(samples.iter().skip(samples.len() - incoming).copied());
    }

    fn queued(&self) -> usize {
        match self.samples.lock() {
            Ok(q) => q.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }
}

/// Sink that collects samples in memory. Reports zero queued so callers
/// never wait on a device drain.
#[derive(Default)]
pub struct BufferSink {
    samples: Mutex<Vec<i16>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<i16> {
        match self.samples.lock() {
            Ok(mut s) => std::mem::take(&mut *s),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        match self.samples.lock() {
            Ok(s) => s.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleSink for BufferSink {
    fn enqueue(&self, samples: &[i16]) {
        match self.samples.lock() {
            Ok(mut s) => s.extend_from_slice(samples),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(samples),
        }
    }

    fn queued(&self) -> usize {
        0
    }

    fn underruns(&self) -> u64 {
        0
    }

    fn set_active(&self, _active: bool) {}
}

/// Realtime output stream over a [`PlaybackQueue`].
pub struct PlaybackStream {
    queue: Arc<PlaybackQueue>,
    _stream: Stream,
}

impl PlaybackStream {
    /// Open the default output device at `sample_rate`, mono, with a ring
    /// bounded to `max_buffer` worth of samples.
    pub fn open(sample_rate: u32, max_buffer: Duration) -> VoiceResult<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| VoiceError::AudioDevice("no output device available".to_string()))?;
        info!(
            "playback device: {} ({}Hz)",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate
        );

        let capacity = (sample_rate as u128 * max_buffer.as_millis() / 1000) as usize;
        let queue = Arc::new(PlaybackQueue::new(capacity.max(1)));
        let callback_queue = Arc::clone(&queue);

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                callback_queue.fill(data);
            },
            move |err| {
                warn!("playback stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;

        Ok(Self {
            queue,
            _stream: stream,
        })
    }

    pub fn queue(&self) -> Arc<PlaybackQueue> {
        Arc::clone(&self.queue)
    }
}

/// Short synthesized tone ("pip") queued before recording starts, as
/// non-verbal "listening" feedback. 880 Hz, 120ms, gentle fade.
pub fn listening_pip(sample_rate: u32) -> Vec<i16> {
    let len = (sample_rate as usize * 120) / 1000;
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let t = i as f32 / sample_rate as f32;
        let envelope = 1.0 - (i as f32 / len as f32);
        let value = (t * 880.0 * std::f32::consts::TAU).sin() * envelope * 0.2;
        out.push((value * i16::MAX as f32) as i16);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let queue = PlaybackQueue::new(4);
        queue.enqueue(&[1, 2, 3, 4]);
        queue.enqueue(&[5, 6]);
        assert_eq!(queue.queued(), 4);
        assert_eq!(queue.dropped(), 2);
        let mut out = [0i16; 4];
        queue.fill(&mut out);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn underruns_only_count_while_active() {
        let queue = PlaybackQueue::new(8);
        let mut out = [0i16; 4];
        queue.fill(&mut out);
        assert_eq!(queue.underruns(), 0);

        queue.set_active(true);
        queue.enqueue(&[7, 7]);
        queue.fill(&mut out);
        assert_eq!(out[..2], [7, 7]);
        assert_eq!(out[2..], [0, 0]);
        assert_eq!(queue.underruns(), 1);
    }

    #[test]
    fn oversized_write_keeps_newest_samples() {
        let queue = PlaybackQueue::new(3);
        queue.enqueue(&[1, 2, 3, 4, 5]);
        let mut out = [0i16; 3];
        queue.fill(&mut out);
        assert_eq!(out, [3, 4, 5]);
    }

    #[test]
    fn fill_preserves_order_across_ring_wraparound() {
        let queue = PlaybackQueue::new(8);
        queue.enqueue(&[1, 2, 3, 4, 5, 6]);
        let mut out = [0i16; 4];
        queue.fill(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);

        // Head is now mid-ring, so this write wraps the backing buffer.
        queue.enqueue(&[7, 8, 9, 10, 11, 12]);
        assert_eq!(queue.dropped(), 0);
        let mut out = [0i16; 8];
        queue.fill(&mut out);
        assert_eq!(out, [5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn pip_is_nonempty_and_bounded() {
        let pip = listening_pip(24000);
        assert_eq!(pip.len(), 2880);
        assert!(pip.iter().all(|&s| s.abs() <= (0.25 * i16::MAX as f32) as i16));
    }

    #[test]
    fn list_devices_does_not_panic() {
        // May legitimately be empty in CI.
        let _ = AudioCapture::list_input_devices();
    }
}
