//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - Every handler runs on some actix worker thread; `Arc` lets them all hold the same registry,
//!   budget, breaker and degradation objects
//! - Cloning an `AppState` only bumps reference counts
//!
//! ### RwLock for configuration
//! - Many readers (each new connection reads the audio settings), rare writers (`PUT /config`)
//! - `get_config()` clones so no lock is held while a handler works
//! - The pipeline factory sits behind its own lock so a config update can swap it
//!
//! ## Owned collaborators instead of globals:
//! The connection registry, error budget, circuit breaker and degradation flags are explicit
//! objects created once in `main` and passed around here. Tests build isolated instances.

use crate::config::AppConfig;
use crate::connection::ConnectionRegistry;
use crate::error::AppError;
use crate::pipeline::{self, PipelineFactory};
use crate::resilience::degradation::FallbackResponse;
use crate::resilience::{CircuitBreaker, ErrorBudget, GracefulDegradation, Service};
use crate::stream::StreamServices;
use anyhow::Result;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// When the server started
    pub start_time: Instant,

    pub registry: Arc<ConnectionRegistry>,

    /// Retry accounting for every error category
    pub budget: Arc<ErrorBudget>,

    /// Guards the AI pipeline feed path
    pub breaker: Arc<CircuitBreaker>,

    pub degradation: Arc<GracefulDegradation>,

    /// Creates the AI pipeline of each new connection
    pub pipelines: Arc<RwLock<Arc<dyn PipelineFactory>>>,
}

impl AppState {
    /// Build every shared collaborator from the configuration.
    ///
    /// ## Errors:
    /// Fails if the pipeline mode is unknown or the fallback recording cannot be loaded.
    pub fn new(config: AppConfig) -> Result<Self> {
        let registry = Arc::new(ConnectionRegistry::from_config(&config.connections));
        let budget = Arc::new(ErrorBudget::new(
            config.resilience.max_retries,
            config.resilience.retry_delay(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            Service::AiPipeline.as_str(),
            config.resilience.circuit_failure_threshold,
            config.resilience.recovery_timeout(),
        ));
        let degradation = Arc::new(GracefulDegradation::from_config(&config)?);
        let pipelines = pipeline::factory_from_config(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            start_time: Instant::now(),
            registry,
            budget,
            breaker,
            degradation,
            pipelines: Arc::new(RwLock::new(pipelines)),
        })
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// ## Runtime effect:
    /// - Registry limits and timeouts, the retry policy, the breaker threshold and recovery
    ///   timeout and the fallback response change immediately
    /// - Audio, playback and pipeline settings apply to connections opened afterwards
    /// - The listen address, sweep interval and event channel size need a restart; changing them
    ///   here is rejected
    ///
    /// Nothing is applied unless the whole update is accepted.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), AppError> {
        new_config
            .validate()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;

        let restart_only = restart_only_changes(&self.get_config(), &new_config);
        if !restart_only.is_empty() {
            return Err(AppError::ValidationError(format!(
                "{} can only be changed by restarting the server",
                restart_only.join(", ")
            )));
        }

        let fallback = FallbackResponse::from_config(&new_config)
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        let pipelines = pipeline::factory_from_config(&new_config)
            .map_err(|e| AppError::ValidationError(e.to_string()))?;

        let resilience = &new_config.resilience;
        self.registry.update_settings(&new_config.connections);
        self.budget
            .reconfigure(resilience.max_retries, resilience.retry_delay());
        self.breaker.reconfigure(
            resilience.circuit_failure_threshold,
            resilience.recovery_timeout(),
        );
        self.degradation.set_fallback(fallback);
        *self
            .pipelines
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = pipelines;

        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
        info!("Configuration updated");
        Ok(())
    }

    /// Collaborators a new stream session is wired to.
    pub fn stream_services(&self) -> StreamServices {
        StreamServices {
            registry: Arc::clone(&self.registry),
            budget: Arc::clone(&self.budget),
            breaker: Arc::clone(&self.breaker),
            degradation: Arc::clone(&self.degradation),
            pipelines: Arc::clone(
                &self
                    .pipelines
                    .read()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            ),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Names of settings that differ between `current` and `new` but are only read at startup.
fn restart_only_changes(current: &AppConfig, new: &AppConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if current.server.host != new.server.host {
        changed.push("server.host");
    }
    if current.server.port != new.server.port {
        changed.push("server.port");
    }
    if current.connections.sweep_interval_seconds != new.connections.sweep_interval_seconds {
        changed.push("connections.sweep_interval_seconds");
    }
    if current.connections.event_channel_capacity != new.connections.event_channel_capacity {
        changed.push("connections.event_channel_capacity");
    }
    changed
}
