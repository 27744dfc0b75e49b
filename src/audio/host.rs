//! Host audio environment
//!
//! The session manager only talks to these traits. `audio::capture` and
//! `audio::playback` implement them on top of cpal; tests use fakes.

use crate::audio::codec::PcmBuffer;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Microphone unavailable: {0}")]
    PermissionDenied(String),
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Playback error: {0}")]
    Playback(String),
    #[error("Audio resource already closed")]
    Closed,
}

/// Identifier of one scheduled output buffer
pub type PlaybackId = u64;

/// Receives each fixed-size block of mono samples at the capture rate
pub type BlockSink = Arc<dyn Fn(Vec<f32>) + Send + Sync>;

/// Notified when a scheduled buffer finishes playing on its own
pub type EndedSink = Arc<dyn Fn(PlaybackId) + Send + Sync>;

/// An acquired microphone. Nothing is captured until a graph is built on it.
pub trait Microphone: Send {
    /// Human-readable device name
    fn name(&self) -> String;

    /// Release the capture device. Safe to call more than once.
    fn stop(&mut self);

    /// Lets implementations recover their concrete type in `build_capture`
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Microphone → block processor chain, including its input clock
pub trait CaptureGraph: Send {
    /// Stop delivering blocks
    fn disconnect(&mut self);

    /// Close the input clock
    fn close(&mut self) -> Result<(), AudioError>;
}

/// Output audio clock with sample-accurate buffer scheduling
pub trait OutputClock: Send {
    /// Seconds since the clock started
    fn current_time(&self) -> f64;

    /// Start `buffer` exactly at `start_at` seconds on this clock
    fn schedule(&mut self, buffer: PcmBuffer, start_at: f64) -> Result<PlaybackId, AudioError>;

    /// Stop and discard a scheduled buffer. Unknown ids are ignored.
    fn stop(&mut self, id: PlaybackId);

    fn close(&mut self) -> Result<(), AudioError>;
}

/// Factory for every hardware resource a session acquires
#[async_trait]
pub trait AudioHost: Send + Sync {
    /// May wait on the user or the OS before resolving
    async fn request_microphone(&self) -> Result<Box<dyn Microphone>, AudioError>;

    fn build_capture(
        &self,
        microphone: &dyn Microphone,
        block_size: usize,
        sample_rate: u32,
        sink: BlockSink,
    ) -> Result<Box<dyn CaptureGraph>, AudioError>;

    fn open_output(
        &self,
        sample_rate: u32,
        channels: u16,
        ended: EndedSink,
    ) -> Result<Box<dyn OutputClock>, AudioError>;
}
