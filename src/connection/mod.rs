//! # Peer Connections
//!
//! Types shared by the connection registry and the transports that feed it.
//!
//! ## Connection Lifecycle:
//! 1. **Connecting**: admitted, transport not yet established
//! 2. **Connected**: media may flow
//! 3. **Disconnected**: the peer went away cleanly
//! 4. **Error**: the transport failed
//!
//! The last two are terminal; the registry removes such records after a short grace period.

pub mod registry;

use serde::Serialize;
use std::fmt;

pub use registry::{ConnectionRegistry, RegistrySettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outbound half of a peer connection.
///
/// ## Contract:
/// - Methods never block; `false` means the peer can no longer take data
/// - `close()` may be called more than once and must tolerate an already-closed peer
pub trait TransportHandle: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>) -> bool;

    /// Send a control message (JSON text) to the peer.
    fn send_text(&self, text: String) -> bool;

    fn close(&self);

    /// Human-readable peer identity for logs.
    fn peer(&self) -> Option<String> {
        None
    }
}

/// Descriptive data captured when a connection is admitted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionMetadata {
    pub user_agent: Option<String>,
    pub peer_addr: Option<String>,
}

/// Signals a transport reports to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged { id: String, state: ConnectionState },
    /// One ICE-layer (or liveness) failure
    IceFailed { id: String },
    /// Inbound media arrived
    Activity { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Error.is_terminal());
        assert_eq!(serde_json::to_value(ConnectionState::Connected).unwrap(), "connected");
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::TransportHandle;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records everything sent to the peer.
    #[derive(Default)]
    pub struct MockTransport {
        pub frames: Mutex<Vec<Vec<u8>>>,
        pub texts: Mutex<Vec<String>>,
        pub closes: AtomicUsize,
        pub fail_sends: AtomicBool,
    }

    impl MockTransport {
        pub fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub fn frame_count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }

        pub fn texts(&self) -> Vec<String> {
            self.texts.lock().unwrap().clone()
        }
    }

    impl TransportHandle for MockTransport {
        fn send_frame(&self, frame: Vec<u8>) -> bool {
            if self.fail_sends.load(Ordering::SeqCst) || self.closes.load(Ordering::SeqCst) > 0 {
                return false;
            }
            self.frames.lock().unwrap().push(frame);
            true
        }

        fn send_text(&self, text: String) -> bool {
            if self.closes.load(Ordering::SeqCst) > 0 {
                return false;
            }
            self.texts.lock().unwrap().push(text);
            true
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn peer(&self) -> Option<String> {
            Some("mock".to_string())
        }
    }
}
