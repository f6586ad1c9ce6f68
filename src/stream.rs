//! # Stream Session
//!
//! Wires one admitted connection to its AI pipeline. Four tasks run per connection:
//!
//! 1. **Ingestion**: inbound media chunks → validation → frame processor
//! 2. **Feed**: frame stream → circuit breaker → `AiPipeline::feed`
//! 3. **Output**: pipeline parts tagged `audio/wav` → decode → playback track
//! 4. **Pump**: paced playback frames → transport
//!
//! ## Failure handling:
//! - Empty chunks are dropped and counted against the `audio` budget; once it is exhausted audio
//!   processing is marked degraded
//! - Pipeline failures are retried under the `pipeline:feed` budget; when it is exhausted the
//!   breaker trips and the pipeline is marked degraded
//! - Undecodable pipeline audio is dropped and counted under `pipeline:tts`
//! - Failed sends are retried under the `connection:<id>` budget; when it is exhausted the
//!   connection is removed from the registry
//!
//! While any service is degraded the peer gets the fallback apology, once per outage: the text as
//! a control message and the audio through the playback track.

use crate::audio::playback::{decode_wav_payload, PlaybackTrack};
use crate::audio::processor::{validate_chunk, FrameProcessor};
use crate::config::AppConfig;
use crate::connection::{ConnectionEvent, ConnectionRegistry, TransportHandle};
use crate::error::{Severity, StreamError};
use crate::pipeline::{AiPipeline, PipelineFactory, PipelineHandle, PipelinePart, FEED_STAGE, TTS_STAGE};
use crate::resilience::{
    BreakerError, CircuitBreaker, ErrorBudget, ErrorCategory, GracefulDegradation, RetryDecision, Service,
};
use crate::websocket::WebSocketMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, trace, warn};

/// Minimum spacing between two activity reports to the registry.
const ACTIVITY_EVENT_INTERVAL: Duration = Duration::from_secs(1);

/// Shared collaborators every session needs.
#[derive(Clone)]
pub struct StreamServices {
    pub registry: Arc<ConnectionRegistry>,
    pub budget: Arc<ErrorBudget>,
    pub breaker: Arc<CircuitBreaker>,
    pub degradation: Arc<GracefulDegradation>,
    pub pipelines: Arc<dyn PipelineFactory>,
}

/// Inbound media from the peer, as a channel-backed track.
pub struct InboundTrack {
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl InboundTrack {
    /// Create a track and the sender the transport pushes chunks into.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { receiver: rx })
    }

    /// Next inbound chunk, or `None` once the transport has gone away.
    pub async fn recv_track_frame(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

pub struct StreamSession {
    connection_id: String,
    transport: Arc<dyn TransportHandle>,
    processor: Arc<FrameProcessor>,
    track: Arc<PlaybackTrack>,
    services: StreamServices,
    buffer_warn_percent: f64,
    /// Set once the apology went out for the current outage
    apology_sent: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamSession {
    /// Build the per-connection audio path and spawn its tasks.
    pub fn start(
        connection_id: String,
        transport: Arc<dyn TransportHandle>,
        inbound: InboundTrack,
        services: StreamServices,
        config: &AppConfig,
    ) -> Arc<Self> {
        let PipelineHandle { pipeline, output } = services.pipelines.create(&connection_id);

        let session = Arc::new(Self {
            connection_id,
            transport,
            processor: Arc::new(FrameProcessor::new(&config.audio)),
            track: Arc::new(PlaybackTrack::new(&config.playback)),
            services,
            buffer_warn_percent: config.audio.buffer_warn_percent,
            apology_sent: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        let handles = vec![
            tokio::spawn(Arc::clone(&session).run_ingestion(inbound)),
            tokio::spawn(Arc::clone(&session).run_feed(pipeline)),
            tokio::spawn(Arc::clone(&session).run_output(output)),
            tokio::spawn(Arc::clone(&session).run_pump()),
        ];
        *session.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = handles;

        info!(
            connection_id = %session.connection_id,
            frame_size_bytes = session.processor.frame_size_bytes(),
            playback_rate = session.track.sample_rate(),
            "Stream session started"
        );
        session
    }

    async fn run_ingestion(self: Arc<Self>, mut inbound: InboundTrack) {
        let events = self.services.registry.events();
        let mut last_activity: Option<Instant> = None;
        let mut overloaded = false;

        while let Some(chunk) = inbound.recv_track_frame().await {
            if let Err(err) = validate_chunk(&chunk) {
                self.on_audio_error(err);
                continue;
            }

            let activity_due = match last_activity {
                Some(at) => at.elapsed() >= ACTIVITY_EVENT_INTERVAL,
                None => true,
            };
            if activity_due {
                let event = ConnectionEvent::Activity {
                    id: self.connection_id.clone(),
                };
                // a full event channel only postpones the refresh to a later chunk
                if events.try_send(event).is_ok() {
                    last_activity = Some(Instant::now());
                }
            }

            if !self.processor.add_frame(chunk) {
                break;
            }
            self.services.budget.record_success(&ErrorCategory::Audio);
            self.mark_healthy(Service::AudioProcessing);

            let usage = self.processor.buffer_usage();
            if usage > self.buffer_warn_percent {
                if !overloaded {
                    warn!(
                        connection_id = %self.connection_id,
                        usage_percent = usage,
                        buffered_bytes = self.processor.buffered_bytes(),
                        "Inbound audio buffer near capacity, pipeline is falling behind"
                    );
                    overloaded = true;
                }
            } else {
                overloaded = false;
            }
        }

        debug!(connection_id = %self.connection_id, "Inbound track ended");
    }

    /// The chunk is already gone, so the failure is only counted.
    fn on_audio_error(&self, err: StreamError) {
        match self.services.budget.record_failure(&ErrorCategory::Audio, &err) {
            RetryDecision::Retry { .. } => {
                debug!(connection_id = %self.connection_id, error = %err, "Dropped invalid audio chunk");
            }
            RetryDecision::GiveUp { .. } => self.mark_degraded(Service::AudioProcessing),
        }
    }

    async fn run_feed(self: Arc<Self>, pipeline: Arc<dyn AiPipeline>) {
        let mut frames = Box::pin(self.processor.frame_stream().into_stream());
        while let Some(frame) = frames.next().await {
            self.feed_frame(pipeline.as_ref(), frame).await;
        }
        debug!(connection_id = %self.connection_id, "Frame stream ended");
    }

    /// Deliver one frame, retrying the same frame while the budget allows.
    ///
    /// While degraded the apology goes out first; the breaker then decides whether the pipeline
    /// is called at all.
    async fn feed_frame(&self, pipeline: &dyn AiPipeline, frame: Vec<u8>) {
        let category = ErrorCategory::Pipeline(FEED_STAGE.to_string());

        if self.services.degradation.should_use_fallback() {
            self.engage_fallback();
        }

        loop {
            let attempt = frame.clone();
            match self.services.breaker.call(|| pipeline.feed(attempt)).await {
                Ok(()) => {
                    self.services.budget.record_success(&category);
                    self.mark_healthy(Service::AiPipeline);
                    return;
                }
                Err(BreakerError::Open) => {
                    // frame dropped while the pipeline is cut off
                    self.mark_degraded(Service::AiPipeline);
                    return;
                }
                Err(BreakerError::Inner(err)) => {
                    match self.services.budget.record_and_maybe_retry(&category, &err).await {
                        RetryDecision::Retry { .. } => continue,
                        RetryDecision::GiveUp { .. } => {
                            error!(
                                connection_id = %self.connection_id,
                                pipeline = pipeline.name(),
                                breaker = self.services.breaker.name(),
                                error = %err,
                                "Pipeline failing, tripping circuit breaker"
                            );
                            self.services.breaker.trip();
                            self.mark_degraded(Service::AiPipeline);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn mark_degraded(&self, service: Service) {
        self.services.degradation.set_service_status(service, false);
        self.engage_fallback();
    }

    /// Restore a service and re-arm the apology once nothing is degraded any more.
    fn mark_healthy(&self, service: Service) {
        let degradation = &self.services.degradation;
        if !degradation.check_service_health(service) {
            degradation.set_service_status(service, true);
        }
        if !degradation.should_use_fallback() {
            self.apology_sent.store(false, Ordering::SeqCst);
        }
    }

    /// Send the apology, once per outage.
    fn engage_fallback(&self) {
        if self.apology_sent.swap(true, Ordering::SeqCst) {
            return;
        }

        let fallback = self.services.degradation.fallback_response();
        warn!(
            connection_id = %self.connection_id,
            services = ?self.services.degradation.services(),
            "Sending fallback response to peer"
        );

        let message = WebSocketMessage::Fallback {
            message: fallback.message,
        };
        if let Some(json) = message.to_json() {
            self.transport.send_text(json);
        }
        if let Some(audio) = fallback.audio {
            let track = Arc::clone(&self.track);
            tokio::spawn(async move {
                track.play(&audio).await;
            });
        }
    }

    async fn run_output(self: Arc<Self>, output: mpsc::Receiver<PipelinePart>) {
        let category = ErrorCategory::Pipeline(TTS_STAGE.to_string());
        let mut parts = ReceiverStream::new(output).filter(PipelinePart::is_audio);

        while let Some(part) = parts.next().await {
            match decode_wav_payload(part.data) {
                Ok(pcm) if pcm.is_empty() => {}
                Ok(pcm) => {
                    self.services.budget.record_success(&category);
                    self.mark_healthy(Service::Tts);
                    if !self.track.send(pcm) {
                        break;
                    }
                }
                Err(err) => {
                    warn!(connection_id = %self.connection_id, error = %err, "Dropping undecodable pipeline audio");
                    let err = StreamError::pipeline(err);
                    if let RetryDecision::GiveUp { .. } = self.services.budget.record_failure(&category, &err) {
                        self.mark_degraded(Service::Tts);
                    }
                }
            }
        }
        debug!(connection_id = %self.connection_id, "Pipeline output ended");
    }

    async fn run_pump(self: Arc<Self>) {
        let category = ErrorCategory::Connection(self.connection_id.clone());

        while let Ok(frame) = self.track.recv_frame().await {
            let delivered = self
                .services
                .budget
                .run_with_retry(&category, || {
                    let sent = self.transport.send_frame(frame.data.clone());
                    async move {
                        if sent {
                            Ok(())
                        } else {
                            Err(StreamError::connection("Failed to deliver audio frame to peer"))
                        }
                    }
                })
                .await;

            if let Err(err) = delivered {
                let err = StreamError {
                    severity: Severity::Critical,
                    ..err
                };
                error!(
                    connection_id = %self.connection_id,
                    severity = err.severity.as_str(),
                    failed_at = %err.timestamp,
                    error = %err,
                    "Peer unreachable, closing connection"
                );
                self.services.registry.remove(&self.connection_id);
                return;
            }
            trace!(
                connection_id = %self.connection_id,
                pts = frame.pts,
                sample_rate = frame.sample_rate,
                silence = frame.silence,
                "Audio frame delivered"
            );
        }
        debug!(connection_id = %self.connection_id, "Playback track stopped");
    }

    /// Tear the session down. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        let pending_chunks = self.track.len();
        self.processor.stop();
        self.track.stop();
        self.services.registry.remove(&self.connection_id);
        self.services
            .budget
            .forget(&ErrorCategory::Connection(self.connection_id.clone()));

        info!(
            connection_id = %self.connection_id,
            pending_chunks,
            dropped_chunks = self.track.dropped_chunks(),
            "Stream session stopped"
        );
    }
}
