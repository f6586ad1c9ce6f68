//! # Audio Transport
//!
//! Moves PCM audio between the peer connection and the AI pipeline.
//!
//! ## Key Components:
//! - **Buffer**: bounded FIFO of inbound bytes with oldest-drop eviction
//! - **Processor**: slices buffered bytes into fixed-size frames for the pipeline
//! - **Playback**: paces synthesized audio back to the peer, filling gaps with silence
//!
//! ## Audio Format:
//! - **Inbound**: 16-bit little-endian PCM, 16 kHz mono by default, 20 ms frames
//! - **Outbound**: 16-bit little-endian PCM, 24 kHz mono by default, 20 ms cadence

pub mod buffer;
pub mod playback;
pub mod processor;
