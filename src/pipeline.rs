//! # AI Pipeline Seam
//!
//! The transport does not know what the AI pipeline does with audio. It hands it fixed-size PCM
//! frames through [`AiPipeline::feed`] and reads synthesized parts back from a per-connection
//! output channel, each tagged with a mimetype.
//!
//! ## Implementations:
//! - **EchoPipeline**: loops inbound speech back as `audio/wav` parts, resampled to the playback
//!   rate. Used for loopback testing of the transport when no external pipeline is attached.

use crate::audio::playback::AUDIO_WAV_MIMETYPE;
use crate::audio::processor::{pcm_bytes_to_samples, samples_to_pcm_bytes};
use crate::config::AppConfig;
use crate::error::StreamError;
use anyhow::{anyhow, Result};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Stage names used in error budgets and logs.
pub const FEED_STAGE: &str = "feed";
pub const TTS_STAGE: &str = "tts";

/// One piece of pipeline output.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePart {
    pub mimetype: String,
    pub data: Vec<u8>,
}

impl PipelinePart {
    pub fn audio(data: Vec<u8>) -> Self {
        Self {
            mimetype: AUDIO_WAV_MIMETYPE.to_string(),
            data,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.mimetype == AUDIO_WAV_MIMETYPE
    }
}

/// Consumer of inbound frames.
///
/// `feed` returns a boxed future so the pipeline can be called through the circuit breaker and
/// retried with a fresh copy of the frame.
pub trait AiPipeline: Send + Sync {
    fn feed(&self, frame: Vec<u8>) -> BoxFuture<'static, Result<(), StreamError>>;

    fn name(&self) -> &str;
}

/// A pipeline wired to one connection, plus the channel its output arrives on.
pub struct PipelineHandle {
    pub pipeline: Arc<dyn AiPipeline>,
    pub output: mpsc::Receiver<PipelinePart>,
}

/// Creates one pipeline per connection.
pub trait PipelineFactory: Send + Sync {
    fn create(&self, connection_id: &str) -> PipelineHandle;
}

/// Sends every inbound frame straight back as synthesized audio.
pub struct EchoPipeline {
    output: mpsc::Sender<PipelinePart>,
    input_rate: u32,
    output_rate: u32,
}

impl EchoPipeline {
    pub fn new(output: mpsc::Sender<PipelinePart>, input_rate: u32, output_rate: u32) -> Self {
        Self {
            output,
            input_rate,
            output_rate,
        }
    }
}

impl AiPipeline for EchoPipeline {
    fn feed(&self, frame: Vec<u8>) -> BoxFuture<'static, Result<(), StreamError>> {
        let output = self.output.clone();
        let pcm = if self.input_rate == self.output_rate {
            frame
        } else {
            let samples = pcm_bytes_to_samples(&frame);
            samples_to_pcm_bytes(&resample_linear(&samples, self.input_rate, self.output_rate))
        };

        Box::pin(async move {
            output
                .send(PipelinePart::audio(pcm))
                .await
                .map_err(|_| StreamError::pipeline("Echo pipeline output channel closed"))
        })
    }

    fn name(&self) -> &str {
        "echo"
    }
}

pub struct EchoPipelineFactory {
    input_rate: u32,
    output_rate: u32,
    channel_capacity: usize,
}

impl EchoPipelineFactory {
    pub fn new(input_rate: u32, output_rate: u32, channel_capacity: usize) -> Self {
        Self {
            input_rate,
            output_rate,
            channel_capacity: channel_capacity.max(1),
        }
    }
}

impl PipelineFactory for EchoPipelineFactory {
    fn create(&self, connection_id: &str) -> PipelineHandle {
        debug!(connection_id = %connection_id, "Creating echo pipeline");
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        PipelineHandle {
            pipeline: Arc::new(EchoPipeline::new(tx, self.input_rate, self.output_rate)),
            output: rx,
        }
    }
}

/// Pick the pipeline factory named by `pipeline.mode`.
pub fn factory_from_config(config: &AppConfig) -> Result<Arc<dyn PipelineFactory>> {
    match config.pipeline.mode.as_str() {
        "echo" => Ok(Arc::new(EchoPipelineFactory::new(
            config.audio.sample_rate,
            config.playback.sample_rate,
            config.pipeline.output_channel_capacity,
        ))),
        other => Err(anyhow!("Unknown pipeline mode: {}", other)),
    }
}

/// Linear-interpolation resampling of mono 16-bit samples.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 || from_rate == to_rate {
        return samples.to_vec();
    }

    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return samples[last];
            }
            let frac = pos - idx as f64;
            let a = samples[idx] as f64;
            let b = samples[idx + 1] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_16k_to_24k_frame_length() {
        // one 20 ms frame at 16 kHz becomes one 20 ms frame at 24 kHz
        let input = vec![0i16; 320];
        assert_eq!(resample_linear(&input, 16000, 24000).len(), 480);
    }

    #[test]
    fn test_resample_interpolates_between_samples() {
        let output = resample_linear(&[0, 300], 2, 4);
        assert_eq!(output, vec![0, 150, 300, 300]);
    }

    #[tokio::test]
    async fn test_echo_pipeline_emits_audio_parts() {
        let factory = EchoPipelineFactory::new(16000, 16000, 4);
        let PipelineHandle { pipeline, mut output } = factory.create("conn");

        pipeline.feed(vec![1, 0, 2, 0]).await.unwrap();
        let part = output.recv().await.unwrap();
        assert!(part.is_audio());
        assert_eq!(part.data, vec![1, 0, 2, 0]);
        assert_eq!(pipeline.name(), "echo");
    }

    #[tokio::test]
    async fn test_echo_pipeline_resamples_to_playback_rate() {
        let factory = EchoPipelineFactory::new(16000, 24000, 4);
        let PipelineHandle { pipeline, mut output } = factory.create("conn");

        pipeline.feed(vec![0u8; 640]).await.unwrap();
        assert_eq!(output.recv().await.unwrap().data.len(), 960);
    }

    #[tokio::test]
    async fn test_feed_fails_once_output_is_gone() {
        let factory = EchoPipelineFactory::new(16000, 16000, 1);
        let PipelineHandle { pipeline, output } = factory.create("conn");
        drop(output);
        assert!(pipeline.feed(vec![0, 0]).await.is_err());
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let mut config = AppConfig::default();
        assert!(factory_from_config(&config).is_ok());
        config.pipeline.mode = "llm".to_string();
        assert!(factory_from_config(&config).is_err());
    }
}
