//! # Playback Track (Outbound Pacer)
//!
//! Synthesized speech arrives from the AI pipeline in bursts: sometimes several chunks at once,
//! sometimes nothing for seconds. The peer connection, on the other hand, needs one frame every
//! `frame_duration_ms`, forever. The playback track reconciles the two:
//!
//! - `send()` never blocks the producer; a full queue drops its *oldest* chunk
//! - `play()` splits a long clip into frames and waits for room instead of evicting its own start
//! - `recv_frame()` paces emission on wall-clock time and fills gaps with silence
//! - `stop()` drains everything and makes further reads fail with [`PlaybackError::Stopped`]

use crate::audio::processor::{samples_to_pcm_bytes, silence};
use crate::config::PlaybackConfig;
use std::collections::VecDeque;
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Mimetype of pipeline parts that carry playable audio.
pub const AUDIO_WAV_MIMETYPE: &str = "audio/wav";

/// Terminal condition of a stopped track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackError {
    Stopped,
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackError::Stopped => write!(f, "Playback track is stopped"),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// One frame handed to the peer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    /// Sample offset since the track emitted its first frame
    pub pts: u64,
    pub sample_rate: u32,
    /// True when no real audio was queued and the frame was synthesized
    pub silence: bool,
}

/// Bounded FIFO of outbound chunks, capacity counted in chunks.
#[derive(Debug)]
pub struct PlaybackQueue {
    items: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl PlaybackQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue without waiting. Returns the evicted chunk, if the queue was full.
    pub fn push(&self, chunk: Vec<u8>) -> Option<Vec<u8>> {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(chunk);
            evicted
        };
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.lock().pop_front()
    }

    /// Wait until a chunk is available.
    async fn pop(&self) -> Vec<u8> {
        loop {
            let notified = self.notify.notified();
            if let Some(chunk) = self.try_pop() {
                return chunk;
            }
            notified.await;
        }
    }

    /// Remove everything. Returns how many chunks were discarded.
    pub fn drain(&self) -> usize {
        let mut items = self.lock();
        let count = items.len();
        items.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct PacerClock {
    last_frame_time: Option<Instant>,
    samples_emitted: u64,
}

/// Real-time pacer in front of a [`PlaybackQueue`].
#[derive(Debug)]
pub struct PlaybackTrack {
    queue: PlaybackQueue,
    sample_rate: u32,
    frame_duration: Duration,
    recv_timeout: Duration,
    clock: tokio::sync::Mutex<PacerClock>,
    active: AtomicBool,
    stop_notify: Notify,
}

impl PlaybackTrack {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self::with_settings(
            config.playback_queue_capacity,
            config.sample_rate,
            config.frame_duration(),
            config.recv_timeout(),
        )
    }

    pub fn with_settings(capacity: usize, sample_rate: u32, frame_duration: Duration, recv_timeout: Duration) -> Self {
        Self {
            queue: PlaybackQueue::new(capacity),
            sample_rate,
            frame_duration,
            recv_timeout,
            clock: tokio::sync::Mutex::new(PacerClock::default()),
            active: AtomicBool::new(true),
            stop_notify: Notify::new(),
        }
    }

    /// Queue a chunk for playback without ever blocking the caller.
    ///
    /// ## Returns:
    /// - `false` if the track is stopped
    /// - `true` otherwise, even if the oldest queued chunk had to be dropped to make room
    pub fn send(&self, chunk: Vec<u8>) -> bool {
        if !self.is_active() {
            return false;
        }
        if chunk.is_empty() {
            return true;
        }
        if let Some(evicted) = self.queue.push(chunk) {
            warn!(
                evicted_bytes = evicted.len(),
                capacity = self.queue.capacity(),
                "Playback queue full, dropped oldest chunk"
            );
        }
        true
    }

    /// Queue a whole clip one frame at a time, waiting whenever the queue is full.
    ///
    /// Returns `false` if the track stopped before the clip was fully queued.
    pub async fn play(&self, pcm: &[u8]) -> bool {
        let frame_bytes = (silence(self.sample_rate, self.frame_duration).len()).max(2);
        for frame in pcm.chunks(frame_bytes) {
            while self.is_active() && self.queue.len() >= self.queue.capacity() {
                tokio::time::sleep(self.frame_duration).await;
            }
            if !self.send(frame.to_vec()) {
                return false;
            }
        }
        true
    }

    /// Produce the next frame for the transport.
    ///
    /// ## Algorithm:
    /// 1. Wait up to `recv_timeout` for queued audio
    /// 2. If audio arrived, sleep whatever remains of the frame interval since the previous
    ///    emitted frame, so emission follows wall-clock cadence instead of queue-drain speed
    /// 3. If the wait timed out, return a silence frame of one frame duration
    pub async fn recv_frame(&self) -> Result<AudioFrame, PlaybackError> {
        if !self.is_active() {
            return Err(PlaybackError::Stopped);
        }

        // serializes concurrent readers so pacing stays monotonic
        let mut clock = self.clock.lock().await;

        let received = tokio::select! {
            biased;
            _ = self.stopped() => return Err(PlaybackError::Stopped),
            chunk = tokio::time::timeout(self.recv_timeout, self.queue.pop()) => chunk.ok(),
        };

        let (data, is_silence) = match received {
            Some(chunk) => {
                if let Some(last) = clock.last_frame_time {
                    let elapsed = last.elapsed();
                    if elapsed < self.frame_duration {
                        tokio::time::sleep(self.frame_duration - elapsed).await;
                    }
                }
                (chunk, false)
            }
            None => {
                debug!("Playback queue empty, emitting silence");
                (silence(self.sample_rate, self.frame_duration), true)
            }
        };

        clock.last_frame_time = Some(Instant::now());
        let pts = clock.samples_emitted;
        clock.samples_emitted += (data.len() / 2) as u64;

        Ok(AudioFrame {
            data,
            pts,
            sample_rate: self.sample_rate,
            silence: is_silence,
        })
    }

    /// Resolves once `stop()` has been called.
    async fn stopped(&self) {
        loop {
            let notified = self.stop_notify.notified();
            if !self.is_active() {
                return;
            }
            notified.await;
        }
    }

    /// Drain the queue and mark the track inactive. Idempotent.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let drained = self.queue.drain();
            debug!(drained_chunks = drained, "Playback track stopped");
        }
        self.stop_notify.notify_waiters();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.queue.dropped_chunks()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Turn an `audio/wav` pipeline payload into raw 16-bit PCM.
///
/// Payloads that start with a RIFF header are decoded; anything else is assumed to already be
/// raw PCM and is passed through.
// wav 1.0 marks its free read/write functions deprecated
#[allow(deprecated)]
pub fn decode_wav_payload(payload: Vec<u8>) -> Result<Vec<u8>, String> {
    if !payload.starts_with(b"RIFF") {
        return Ok(payload);
    }

    let mut reader = Cursor::new(payload);
    let (header, data) = wav::read(&mut reader).map_err(|e| format!("Invalid WAV payload: {}", e))?;
    if header.channel_count != 1 {
        return Err(format!("Expected mono WAV, got {} channels", header.channel_count));
    }

    match data {
        wav::BitDepth::Sixteen(samples) => Ok(samples_to_pcm_bytes(&samples)),
        wav::BitDepth::Empty => Ok(Vec::new()),
        _ => Err(format!("Unsupported WAV bit depth: {} bits", header.bits_per_sample)),
    }
}
