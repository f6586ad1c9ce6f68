//! # Frame Processor
//!
//! Turns an arbitrary stream of inbound byte chunks into fixed-duration PCM frames for the AI
//! pipeline. Network packets arrive in whatever sizes the peer chooses; the pipeline wants every
//! frame to be exactly `frame_size_bytes` long.
//!
//! ## Key Functions:
//! - **Chunk validation**: inbound chunks must be non-empty; odd lengths are fine because a sample may
//!   straddle two packets
//! - **Framing**: `next_frame()` hands out exact frames, keeping any remainder buffered
//! - **Streaming**: `frame_stream()` gives a pull-based sequence that ends on `stop()`
//! - **Load reporting**: `buffer_usage()` exposes how close the buffer is to overflowing

use crate::audio::buffer::BoundedByteBuffer;
use crate::config::AudioConfig;
use crate::error::StreamError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use futures_util::stream::{self, Stream};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

/// Fixed-size framing on top of a [`BoundedByteBuffer`].
#[derive(Debug)]
pub struct FrameProcessor {
    buffer: BoundedByteBuffer,
    frame_size_bytes: usize,
    poll_interval: Duration,
}

impl FrameProcessor {
    /// Create a processor sized from the inbound audio settings.
    ///
    /// ## Example:
    /// 16 kHz, mono, 20 ms frames → 320 samples → 640 bytes per frame.
    pub fn new(config: &AudioConfig) -> Self {
        Self::with_frame_size(
            config.frame_size_bytes(),
            config.buffer_capacity_bytes,
            config.poll_interval(),
        )
    }

    pub fn with_frame_size(frame_size_bytes: usize, capacity_bytes: usize, poll_interval: Duration) -> Self {
        Self {
            buffer: BoundedByteBuffer::new(capacity_bytes),
            frame_size_bytes,
            poll_interval,
        }
    }

    /// Forward an inbound chunk to the buffer. `false` once stopped.
    pub fn add_frame(&self, bytes: Vec<u8>) -> bool {
        self.buffer.add(bytes)
    }

    /// Take one complete frame if enough bytes are buffered.
    pub fn next_frame(&self) -> Option<Vec<u8>> {
        self.buffer.take(self.frame_size_bytes)
    }

    /// Start a new lazy sequence of frames.
    ///
    /// Each call creates an independent cursor over the same buffer; every stream ends once
    /// [`FrameProcessor::stop`] has been called.
    pub fn frame_stream(self: &Arc<Self>) -> FrameStream {
        FrameStream {
            processor: Arc::clone(self),
        }
    }

    /// Stop the processor and release its buffer. Idempotent.
    pub fn stop(&self) {
        self.buffer.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.buffer.is_stopped()
    }

    /// Buffer fill level as a percentage of capacity (0.0 to 100.0).
    pub fn buffer_usage(&self) -> f64 {
        if self.buffer.capacity() == 0 || self.buffer.is_empty() {
            return 0.0;
        }
        self.buffer.len() as f64 / self.buffer.capacity() as f64 * 100.0
    }

    pub fn frame_size_bytes(&self) -> usize {
        self.frame_size_bytes
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// Pull-based frame sequence.
///
/// ## Usage:
/// - `try_next()` never waits, which lets tests step the sequence deterministically
/// - `next().await` suspends for the poll interval between attempts and returns `None` after stop
/// - `into_stream()` adapts it into a `futures::Stream`
#[derive(Debug)]
pub struct FrameStream {
    processor: Arc<FrameProcessor>,
}

impl FrameStream {
    pub fn try_next(&mut self) -> Option<Vec<u8>> {
        if self.processor.is_stopped() {
            return None;
        }
        self.processor.next_frame()
    }

    pub async fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.processor.is_stopped() {
                return None;
            }
            if let Some(frame) = self.try_next() {
                return Some(frame);
            }
            tokio::time::sleep(self.processor.poll_interval).await;
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Vec<u8>> + Send + 'static {
        stream::unfold(self, |mut frames| async move {
            let frame = frames.next().await?;
            Some((frame, frames))
        })
    }
}

/// Reject chunks that carry no audio.
///
/// Odd lengths are accepted: the buffer reassembles samples split across chunks.
pub fn validate_chunk(data: &[u8]) -> Result<(), StreamError> {
    if data.is_empty() {
        return Err(StreamError::audio("Audio chunk is empty"));
    }
    Ok(())
}

/// Decode little-endian 16-bit PCM bytes into samples. A trailing odd byte is ignored.
pub fn pcm_bytes_to_samples(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Encode samples as little-endian 16-bit PCM bytes.
pub fn samples_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Zeroed 16-bit mono PCM covering `duration` at `sample_rate`.
pub fn silence(sample_rate: u32, duration: Duration) -> Vec<u8> {
    let samples = (sample_rate as u128 * duration.as_millis() / 1000) as usize;
    vec![0u8; samples * 2]
}

/// A sine tone as 16-bit mono PCM, with short linear fades so it starts and ends without a click.
pub fn tone(sample_rate: u32, frequency_hz: f64, duration: Duration) -> Vec<u8> {
    let total = (sample_rate as u128 * duration.as_millis() / 1000) as usize;
    let fade = (sample_rate as usize / 200).min(total / 2).max(1);
    let amplitude = i16::MAX as f64 * 0.25;

    let samples: Vec<i16> = (0..total)
        .map(|n| {
            let envelope = (n.min(total - 1 - n) as f64 / fade as f64).min(1.0);
            let phase = 2.0 * std::f64::consts::PI * frequency_hz * n as f64 / sample_rate as f64;
            (phase.sin() * amplitude * envelope) as i16
        })
        .collect();
    samples_to_pcm_bytes(&samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(frame: usize, capacity: usize) -> Arc<FrameProcessor> {
        Arc::new(FrameProcessor::with_frame_size(frame, capacity, Duration::from_millis(1)))
    }

    #[test]
    fn test_frame_size_from_config() {
        let config = crate::config::AppConfig::default();
        let processor = FrameProcessor::new(&config.audio);
        assert_eq!(processor.frame_size_bytes(), 640);
    }

    #[test]
    fn test_small_increments_yield_exact_frames() {
        let processor = processor(640, 64 * 1024);
        let frames_wanted = 7;
        let total = frames_wanted * 640;

        // feed in awkward 3-byte increments
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        for piece in data.chunks(3) {
            assert!(processor.add_frame(piece.to_vec()));
        }

        let mut stream = processor.frame_stream();
        let mut frames = Vec::new();
        while let Some(frame) = stream.try_next() {
            assert_eq!(frame.len(), 640);
            frames.push(frame);
        }
        assert_eq!(frames.len(), frames_wanted);
        assert_eq!(frames.concat(), data);
    }

    #[test]
    fn test_partial_remainder_stays_buffered() {
        let processor = processor(4, 64);
        processor.add_frame(vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(processor.next_frame(), Some(vec![1, 2, 3, 4]));
        assert_eq!(processor.next_frame(), None);
        assert_eq!(processor.buffered_bytes(), 2);

        processor.add_frame(vec![7, 8]);
        assert_eq!(processor.next_frame(), Some(vec![5, 6, 7, 8]));
    }

    #[test]
    fn test_buffer_usage_percentage() {
        let processor = processor(4, 200);
        processor.add_frame(vec![0; 50]);
        assert!((processor.buffer_usage() - 25.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_waits_for_data_then_ends_on_stop() {
        let processor = processor(4, 64);
        let mut stream = processor.frame_stream();

        let feeder = {
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                processor.add_frame(vec![1, 2]);
                tokio::time::sleep(Duration::from_millis(10)).await;
                processor.add_frame(vec![3, 4]);
            })
        };

        assert_eq!(stream.next().await, Some(vec![1, 2, 3, 4]));
        feeder.await.unwrap();

        processor.stop();
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.try_next(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_frame_stream_call_is_a_fresh_cursor() {
        use futures_util::StreamExt;

        let processor = processor(2, 64);
        processor.add_frame(vec![1, 2, 3, 4]);

        let mut first = processor.frame_stream();
        assert_eq!(first.try_next(), Some(vec![1, 2]));
        drop(first);

        let mut second = Box::pin(processor.frame_stream().into_stream());
        assert_eq!(second.next().await, Some(vec![3, 4]));
        processor.stop();
        assert_eq!(second.next().await, None);
    }

    #[test]
    fn test_chunk_validation() {
        assert!(validate_chunk(&[0, 1, 2, 3]).is_ok());
        assert!(validate_chunk(&[]).is_err());
        assert!(validate_chunk(&[0, 1, 2]).is_ok());
        assert!(validate_chunk(&[7]).is_ok());
    }

    #[test]
    fn test_pcm_sample_conversion() {
        let samples = vec![0i16, 16384, -16384, 32767, -32768];
        let bytes = samples_to_pcm_bytes(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[2..4], &16384i16.to_le_bytes());
        assert_eq!(pcm_bytes_to_samples(&bytes), samples);
    }

    #[test]
    fn test_tone_length_and_fades() {
        let pcm = tone(24000, 440.0, Duration::from_millis(100));
        assert_eq!(pcm.len(), 4800);

        let samples = pcm_bytes_to_samples(&pcm);
        assert_eq!(samples[0], 0);
        assert_eq!(*samples.last().unwrap(), 0);
        assert!(samples.iter().any(|&s| s > 4000));
    }

    #[test]
    fn test_silence_duration() {
        let frame = silence(24000, Duration::from_millis(20));
        assert_eq!(frame.len(), 960);
        assert!(frame.iter().all(|&b| b == 0));
    }
}
