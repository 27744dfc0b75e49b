//! Audio module for capture, playback and PCM conversion
//!
//! Handles the microphone and speaker side of live sessions

pub mod capture;
pub mod codec;
pub mod host;
pub mod playback;
pub mod queue;
pub mod resample;

pub use host::{AudioError, AudioHost, CaptureGraph, Microphone, OutputClock};
pub use queue::PlaybackQueue;

use async_trait::async_trait;
use capture::{CpalCaptureGraph, CpalMicrophone};
use host::{BlockSink, EndedSink};
use playback::CpalOutputClock;
use tokio::runtime::RuntimeFlavor;

/// Run `f`, which waits on a device thread, without stalling the other
/// tasks of a multi-thread runtime. Elsewhere it simply runs inline.
pub(crate) fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// The machine's default input and output devices
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

#[async_trait]
impl AudioHost for CpalHost {
    async fn request_microphone(&self) -> Result<Box<dyn Microphone>, AudioError> {
        let mic = tokio::task::spawn_blocking(CpalMicrophone::open_default)
            .await
            .map_err(|e| AudioError::Device(e.to_string()))??;
        Ok(Box::new(mic))
    }

    fn build_capture(
        &self,
        microphone: &dyn Microphone,
        block_size: usize,
        sample_rate: u32,
        sink: BlockSink,
    ) -> Result<Box<dyn CaptureGraph>, AudioError> {
        let mic = microphone
            .as_any()
            .downcast_ref::<CpalMicrophone>()
            .ok_or_else(|| AudioError::Device("microphone was not opened by this host".to_string()))?;
        let graph = blocking(|| CpalCaptureGraph::start(mic, block_size, sample_rate, sink))?;
        Ok(Box::new(graph))
    }

    fn open_output(
        &self,
        _sample_rate: u32,
        _channels: u16,
        ended: EndedSink,
    ) -> Result<Box<dyn OutputClock>, AudioError> {
        // The mixer resamples and downmixes every buffer to the device format.
        Ok(Box::new(blocking(|| CpalOutputClock::open(ended))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_outside_runtime() {
        assert_eq!(blocking(|| 7), 7);
    }

    #[tokio::test]
    async fn test_blocking_on_current_thread_runtime() {
        assert_eq!(blocking(|| "inline"), "inline");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_on_multi_thread_runtime() {
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            tx.send(42).unwrap();
        });
        assert_eq!(blocking(|| rx.recv().unwrap()), 42);
        waiter.join().unwrap();
    }
}
