//! # Connection Registry
//!
//! Owns every live peer connection record and enforces the connection limits.
//!
//! ## Responsibilities:
//! - **Admission**: new connections beyond `max_connections` evict the oldest one
//! - **State tracking**: transitions arrive as [`ConnectionEvent`]s on a channel and are applied
//!   under one lock
//! - **Cleanup**: terminal states are removed after a grace delay, idle connections by a periodic
//!   sweep, and repeated ICE failures force removal
//!
//! ## Thread Safety:
//! The record map sits behind a single `Mutex`. Records leave the map under the lock and their
//! transports are closed after it is released, so whoever takes a record out is the only one to
//! close it.

use super::{ConnectionEvent, ConnectionMetadata, ConnectionState, TransportHandle};
use crate::config::ConnectionsConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Limits and timers used by the registry.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub terminal_grace: Duration,
    pub ice_failure_threshold: u32,
    pub event_channel_capacity: usize,
}

impl RegistrySettings {
    pub fn from_config(config: &ConnectionsConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            idle_timeout: config.idle_timeout(),
            sweep_interval: config.sweep_interval(),
            terminal_grace: config.terminal_grace(),
            ice_failure_threshold: config.ice_failure_threshold,
            event_channel_capacity: config.event_channel_capacity,
        }
    }
}

struct ConnectionRecord {
    id: String,
    state: ConnectionState,
    /// Admission order, breaks ties between equal `created_at`
    seq: u64,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    last_activity: Instant,
    error_count: u32,
    metadata: ConnectionMetadata,
    transport: Arc<dyn TransportHandle>,
}

impl ConnectionRecord {
    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            state: self.state,
            created_at: self.created_wall,
            idle_seconds: self.last_activity.elapsed().as_secs_f64(),
            error_count: self.error_count,
            metadata: self.metadata.clone(),
        }
    }
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub idle_seconds: f64,
    pub error_count: u32,
    #[serde(flatten)]
    pub metadata: ConnectionMetadata,
}

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, ConnectionRecord>>,
    max_connections: AtomicUsize,
    next_seq: AtomicU64,
    settings: RwLock<RegistrySettings>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        let (events_tx, events_rx) = mpsc::channel(settings.event_channel_capacity.max(1));
        Self {
            connections: Mutex::new(HashMap::new()),
            max_connections: AtomicUsize::new(settings.max_connections),
            next_seq: AtomicU64::new(0),
            settings: RwLock::new(settings),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &ConnectionsConfig) -> Self {
        Self::new(RegistrySettings::from_config(config))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ConnectionRecord>> {
        self.connections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_settings(&self) -> RegistrySettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sender transports use to report state changes, ICE failures and activity.
    pub fn events(&self) -> mpsc::Sender<ConnectionEvent> {
        self.events_tx.clone()
    }

    /// Register a new connection and return its id.
    ///
    /// ## Admission:
    /// While the registry is at or above `max_connections`, the oldest connection (by creation
    /// time) is evicted and its transport closed. Normally that is exactly one; after the limit
    /// was lowered at runtime it may be several.
    pub fn admit(&self, transport: Arc<dyn TransportHandle>, metadata: ConnectionMetadata) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        let peer = transport.peer();
        let record = ConnectionRecord {
            id: id.clone(),
            state: ConnectionState::Connecting,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            created_at: now,
            created_wall: Utc::now(),
            last_activity: now,
            error_count: 0,
            metadata,
            transport,
        };

        let (evicted, total) = {
            let mut connections = self.lock();
            let max = self.max_connections.load(Ordering::SeqCst);
            let mut evicted = Vec::new();
            while !connections.is_empty() && connections.len() >= max {
                let oldest = connections
                    .values()
                    .min_by_key(|record| (record.created_at, record.seq))
                    .map(|record| record.id.clone());
                match oldest.and_then(|oldest| connections.remove(&oldest)) {
                    Some(record) => evicted.push(record),
                    None => break,
                }
            }
            connections.insert(id.clone(), record);
            (evicted, connections.len())
        };

        for record in evicted {
            warn!(
                connection_id = %record.id,
                max_connections = self.max_connections(),
                "Connection limit reached, evicting oldest connection"
            );
            record.transport.close();
        }

        info!(connection_id = %id, peer = ?peer, total_connections = total, "Connection admitted");
        id
    }

    /// Apply a state change. Returns `false` for unknown ids.
    ///
    /// Entering a terminal state schedules removal after the grace delay.
    pub fn transition(self: &Arc<Self>, id: &str, new_state: ConnectionState) -> bool {
        let previous = {
            let mut connections = self.lock();
            let Some(record) = connections.get_mut(id) else {
                debug!(connection_id = %id, state = %new_state, "State change for unknown connection");
                return false;
            };
            let previous = record.state;
            record.state = new_state;
            record.last_activity = Instant::now();
            previous
        };

        info!(connection_id = %id, from = %previous, to = %new_state, "Connection state changed");

        if new_state.is_terminal() && !previous.is_terminal() {
            self.schedule_removal(id.to_string());
        }
        true
    }

    fn schedule_removal(self: &Arc<Self>, id: String) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let grace = self.current_settings().terminal_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = registry.upgrade() {
                registry.remove_if_terminal(&id);
            }
        });
    }

    fn remove_if_terminal(&self, id: &str) -> bool {
        let record = {
            let mut connections = self.lock();
            match connections.get(id) {
                Some(record) if record.state.is_terminal() => connections.remove(id),
                _ => None,
            }
        };
        match record {
            Some(record) => {
                record.transport.close();
                info!(connection_id = %id, state = %record.state, "Removed connection after terminal state");
                true
            }
            None => false,
        }
    }

    /// Apply one transport event.
    pub fn handle_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { id, state } => {
                self.transition(&id, state);
            }
            ConnectionEvent::IceFailed { id } => {
                self.record_ice_failure(&id);
            }
            ConnectionEvent::Activity { id } => {
                self.touch(&id);
            }
        }
    }

    /// Count an ICE-layer failure. Returns `true` if it forced the connection out.
    pub fn record_ice_failure(&self, id: &str) -> bool {
        let threshold = self.current_settings().ice_failure_threshold;
        let error_count = {
            let mut connections = self.lock();
            let Some(record) = connections.get_mut(id) else {
                return false;
            };
            record.error_count += 1;
            record.error_count
        };

        warn!(
            connection_id = %id,
            error_count,
            threshold,
            "ICE failure on connection"
        );

        if error_count >= threshold {
            warn!(connection_id = %id, "Too many ICE failures, removing connection");
            return self.remove(id);
        }
        false
    }

    /// Refresh `last_activity` without changing state.
    pub fn touch(&self, id: &str) -> bool {
        match self.lock().get_mut(id) {
            Some(record) => {
                record.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Close and forget a connection. Idempotent: only the first call returns `true`.
    pub fn remove(&self, id: &str) -> bool {
        let record = self.lock().remove(id);
        match record {
            Some(record) => {
                record.transport.close();
                info!(connection_id = %id, state = %record.state, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Remove every connection idle for longer than the timeout. Returns how many were reaped.
    pub fn sweep_idle(&self) -> usize {
        let timeout = self.current_settings().idle_timeout;
        let stale: Vec<ConnectionRecord> = {
            let mut connections = self.lock();
            let ids: Vec<String> = connections
                .values()
                .filter(|record| record.last_activity.elapsed() > timeout)
                .map(|record| record.id.clone())
                .collect();
            ids.iter().filter_map(|id| connections.remove(id)).collect()
        };

        for record in &stale {
            info!(
                connection_id = %record.id,
                idle_seconds = record.last_activity.elapsed().as_secs(),
                "Reaping idle connection"
            );
            record.transport.close();
        }
        stale.len()
    }

    pub fn get(&self, id: &str) -> Option<ConnectionInfo> {
        self.lock().get(id).map(ConnectionRecord::info)
    }

    /// Connections currently in the `Connected` state, oldest first.
    pub fn active_connections(&self) -> Vec<ConnectionInfo> {
        let connections = self.lock();
        let mut active: Vec<&ConnectionRecord> = connections
            .values()
            .filter(|record| record.state == ConnectionState::Connected)
            .collect();
        active.sort_by_key(|record| (record.created_at, record.seq));
        active.into_iter().map(ConnectionRecord::info).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    pub fn active_connection_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|record| record.state == ConnectionState::Connected)
            .count()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::SeqCst)
    }

    /// Change the admission ceiling. Existing connections are only evicted by later admissions.
    pub fn set_max_connections(&self, max_connections: usize) {
        let previous = self.max_connections.swap(max_connections, Ordering::SeqCst);
        if previous != max_connections {
            info!(from = previous, to = max_connections, "Max connections updated");
        }
    }

    /// Apply new limits to a running registry.
    ///
    /// The idle timeout, terminal grace and ICE threshold are read on every use, so they apply
    /// to the next sweep, removal or failure. The sweep interval and event channel are fixed once
    /// the registry is started.
    pub fn update_settings(&self, config: &ConnectionsConfig) {
        {
            let mut settings = self.settings.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            settings.idle_timeout = config.idle_timeout();
            settings.terminal_grace = config.terminal_grace();
            settings.ice_failure_threshold = config.ice_failure_threshold;
        }
        self.set_max_connections(config.max_connections);
    }

    /// Spawn the idle sweep and the event loop. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !tasks.is_empty() {
            return;
        }

        let settings = self.current_settings();
        let period = settings.sweep_interval.max(Duration::from_millis(1));
        let registry = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let reaped = registry.sweep_idle();
                if reaped > 0 {
                    info!(reaped, remaining = registry.connection_count(), "Idle sweep finished");
                }
            }
        }));

        let receiver = self
            .events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut receiver) = receiver {
            let registry = Arc::downgrade(self);
            tasks.push(tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    registry.handle_event(event);
                }
            }));
        }

        info!(
            max_connections = self.max_connections(),
            idle_timeout_secs = settings.idle_timeout.as_secs(),
            "Connection registry started"
        );
    }

    /// Cancel background tasks and close every connection.
    pub fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }

        let records: Vec<ConnectionRecord> = self.lock().drain().map(|(_, record)| record).collect();
        for record in &records {
            record.transport.close();
        }
        info!(closed = records.len(), "Connection registry stopped");
    }
}
