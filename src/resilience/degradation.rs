//! Per-service health flags and the fallback response served while any of them is down.

use crate::audio::playback::decode_wav_payload;
use crate::audio::processor::{silence, tone};
use crate::config::AppConfig;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Service {
    AudioProcessing,
    AiPipeline,
    Tts,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::AudioProcessing, Service::AiPipeline, Service::Tts];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::AudioProcessing => "audio_processing",
            Service::AiPipeline => "ai_pipeline",
            Service::Tts => "tts",
        }
    }
}

/// What the user gets instead of a real answer while degraded.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackResponse {
    pub message: String,
    /// Raw 16-bit PCM at the playback rate
    #[serde(skip)]
    pub audio: Option<Arc<Vec<u8>>>,
}

impl FallbackResponse {
    /// Build the response from settings.
    ///
    /// The configured recording is loaded if there is one; otherwise a short two-note chime at the
    /// playback rate stands in, so the apology always has something to play.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let resilience = &config.resilience;
        let audio = if resilience.fallback_audio_path.is_empty() {
            fallback_chime(config.playback.sample_rate)
        } else {
            let bytes = std::fs::read(&resilience.fallback_audio_path)
                .with_context(|| format!("Failed to read fallback audio {}", resilience.fallback_audio_path))?;
            let pcm = decode_wav_payload(bytes).map_err(|e| anyhow!(e))?;
            info!(
                path = %resilience.fallback_audio_path,
                bytes = pcm.len(),
                "Loaded fallback audio"
            );
            pcm
        };

        Ok(Self {
            message: resilience.fallback_message.clone(),
            audio: Some(Arc::new(audio)),
        })
    }
}

fn fallback_chime(sample_rate: u32) -> Vec<u8> {
    let mut pcm = tone(sample_rate, 660.0, Duration::from_millis(150));
    pcm.extend(silence(sample_rate, Duration::from_millis(80)));
    pcm.extend(tone(sample_rate, 440.0, Duration::from_millis(200)));
    pcm
}

#[derive(Debug)]
pub struct GracefulDegradation {
    services: RwLock<BTreeMap<Service, bool>>,
    fallback: RwLock<FallbackResponse>,
}

impl GracefulDegradation {
    pub fn new(message: impl Into<String>, audio: Option<Vec<u8>>) -> Self {
        let services = Service::ALL.iter().map(|service| (*service, true)).collect();
        Self {
            services: RwLock::new(services),
            fallback: RwLock::new(FallbackResponse {
                message: message.into(),
                audio: audio.map(Arc::new),
            }),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let fallback = FallbackResponse::from_config(config)?;
        let services = Service::ALL.iter().map(|service| (*service, true)).collect();
        Ok(Self {
            services: RwLock::new(services),
            fallback: RwLock::new(fallback),
        })
    }

    /// Set a service's health flag and return the previous value.
    pub fn set_service_status(&self, service: Service, healthy: bool) -> bool {
        let mut services = self.services.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = services.insert(service, healthy).unwrap_or(true);
        if previous != healthy {
            if healthy {
                info!(service = service.as_str(), "Service recovered");
            } else {
                warn!(service = service.as_str(), "Service degraded, fallback mode engaged");
            }
        }
        previous
    }

    pub fn check_service_health(&self, service: Service) -> bool {
        let services = self.services.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        services.get(&service).copied().unwrap_or(true)
    }

    /// True while any service is unhealthy.
    pub fn should_use_fallback(&self) -> bool {
        let services = self.services.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        services.values().any(|healthy| !healthy)
    }

    pub fn fallback_response(&self) -> FallbackResponse {
        self.fallback
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the apology served from now on.
    pub fn set_fallback(&self, fallback: FallbackResponse) {
        *self.fallback.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = fallback;
    }

    /// Health of every service by name, for the status endpoint.
    pub fn services(&self) -> BTreeMap<&'static str, bool> {
        let services = self.services.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        services.iter().map(|(service, healthy)| (service.as_str(), *healthy)).collect()
    }
}
