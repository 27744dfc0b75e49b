//! Microphone capture with cpal
//!
//! Opens the default input device, downmixes and resamples what it hears and
//! hands fixed-size blocks to a sink.

use crate::audio::host::{AudioError, BlockSink, CaptureGraph, Microphone};
use crate::audio::resample::{downmix, Resampler};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default input device plus the stream format it offered
pub struct CpalMicrophone {
    device: Option<cpal::Device>,
    name: String,
    config: StreamConfig,
    sample_format: SampleFormat,
}

impl CpalMicrophone {
    /// Locate the default input device. Blocks on host enumeration.
    pub fn open_default() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| AudioError::PermissionDenied("no input device available".to_string()))?;
        let name = device.name().unwrap_or_else(|_| "default input".to_string());
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::PermissionDenied(e.to_string()))?;

        info!(
            "Microphone '{}' at {} Hz, {} channel(s), {:?}",
            name,
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format()
        );

        Ok(Self {
            device: Some(device),
            name,
            sample_format: supported.sample_format(),
            config: supported.into(),
        })
    }
}

impl Microphone for CpalMicrophone {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn stop(&mut self) {
        if self.device.take().is_some() {
            debug!("Released microphone '{}'", self.name);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Turns arbitrary device callbacks into fixed-size mono blocks
pub struct BlockAssembler {
    channels: usize,
    block_size: usize,
    resampler: Resampler,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(device_rate: u32, channels: u16, target_rate: u32, block_size: usize) -> Self {
        Self {
            channels: channels.max(1) as usize,
            block_size: block_size.max(1),
            resampler: Resampler::new(device_rate, target_rate),
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Feed interleaved device samples, returning every completed block
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<Vec<f32>> {
        let mono = downmix(interleaved, self.channels);
        self.resampler.process(&mono, &mut self.pending);

        let mut blocks = Vec::new();
        while self.pending.len() >= self.block_size {
            let rest = self.pending.split_off(self.block_size);
            blocks.push(std::mem::replace(&mut self.pending, rest));
        }
        blocks
    }
}

/// Running capture stream. The cpal stream lives on its own thread.
pub struct CpalCaptureGraph {
    active: Arc<AtomicBool>,
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalCaptureGraph {
    pub fn start(
        microphone: &CpalMicrophone,
        block_size: usize,
        sample_rate: u32,
        sink: BlockSink,
    ) -> Result<Self, AudioError> {
        let device = microphone.device.clone().ok_or(AudioError::Closed)?;
        let config = microphone.config.clone();
        let sample_format = microphone.sample_format;
        let active = Arc::new(AtomicBool::new(true));
        let assembler = Arc::new(Mutex::new(BlockAssembler::new(
            config.sample_rate.0,
            config.channels,
            sample_rate,
            block_size,
        )));

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let thread_active = active.clone();

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match sample_format {
                    SampleFormat::F32 => build_input::<f32>(&device, &config, assembler, sink, thread_active),
                    SampleFormat::I16 => build_input::<i16>(&device, &config, assembler, sink, thread_active),
                    SampleFormat::U16 => build_input::<u16>(&device, &config, assembler, sink, thread_active),
                    other => Err(AudioError::Device(format!("unsupported sample format {:?}", other))),
                };
                let stream = match stream.and_then(|s| {
                    s.play().map_err(|e| AudioError::Stream(e.to_string()))?;
                    Ok(s)
                }) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Park until the graph is closed; the stream drops with this frame.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Capture stream dropped");
            })
            .map_err(|e| AudioError::Device(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                active,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::Stream("capture thread exited during setup".to_string())),
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    assembler: Arc<Mutex<BlockAssembler>>,
    sink: BlockSink,
    active: Arc<AtomicBool>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !active.load(Ordering::Acquire) {
                    return;
                }
                let samples: Vec<f32> = data.iter().map(|s| s.to_sample::<f32>()).collect();
                let blocks = assembler.lock().push(&samples);
                for block in blocks {
                    sink(block);
                }
            },
            |e| error!("Capture stream error: {}", e),
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))
}

impl CaptureGraph for CpalCaptureGraph {
    fn disconnect(&mut self) {
        self.active.store(false, Ordering::Release);
    }

    fn close(&mut self) -> Result<(), AudioError> {
        self.active.store(false, Ordering::Release);
        let Some(shutdown) = self.shutdown.take() else {
            return Ok(());
        };
        drop(shutdown);
        if let Some(thread) = self.thread.take() {
            if super::blocking(|| thread.join()).is_err() {
                warn!("Capture thread panicked");
                return Err(AudioError::Stream("capture thread panicked".to_string()));
            }
        }
        Ok(())
    }
}

impl Drop for CpalCaptureGraph {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_fixed_size() {
        let mut assembler = BlockAssembler::new(16000, 1, 16000, 4);
        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());
        let blocks = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(blocks[1], vec![0.5, 0.6, 0.7, 0.8]);
    }

    #[test]
    fn test_stereo_48k_becomes_mono_16k() {
        let mut assembler = BlockAssembler::new(48000, 2, 16000, 1600);
        let mut produced = 0;
        for _ in 0..100 {
            // 10ms of stereo audio
            let frame = vec![0.5f32; 480 * 2];
            for block in assembler.push(&frame) {
                assert_eq!(block.len(), 1600);
                assert!(block.iter().all(|s| (*s - 0.5).abs() < 1e-6));
                produced += 1;
            }
        }
        // one second of audio at 16kHz
        assert_eq!(produced, 10);
    }
}
