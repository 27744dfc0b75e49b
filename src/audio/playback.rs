//! Scheduled playback with cpal
//!
//! The output clock counts rendered frames. Buffers are placed on that
//! timeline and mixed in by the device callback.

use crate::audio::codec::PcmBuffer;
use crate::audio::host::{AudioError, EndedSink, OutputClock, PlaybackId};
use crate::audio::resample::{downmix_planar, fit_length, resample};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use parking_lot::Mutex;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

struct Voice {
    id: PlaybackId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Frame-counting mixer shared with the device callback
pub struct Mixer {
    device_rate: u32,
    frames_rendered: u64,
    next_id: PlaybackId,
    voices: Vec<Voice>,
}

impl Mixer {
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate: device_rate.max(1),
            frames_rendered: 0,
            next_id: 1,
            voices: Vec::new(),
        }
    }

    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.device_rate as f64
    }

    /// Place a buffer on the timeline. A start time already in the past
    /// plays immediately.
    ///
    /// A voice spans exactly `duration * device_rate` frames, and a start
    /// within one frame of the latest voice's end is snapped onto it, so
    /// buffers queued back to back leave no silent frame between them.
    pub fn schedule(&mut self, buffer: &PcmBuffer, start_at: f64) -> PlaybackId {
        let mono = downmix_planar(&buffer.channels);
        let frames = (buffer.duration() * self.device_rate as f64).round() as usize;
        let samples = fit_length(resample(&mono, buffer.sample_rate, self.device_rate), frames);

        let mut start_frame = ((start_at.max(0.0) * self.device_rate as f64).round() as u64).max(self.frames_rendered);
        if let Some(tail) = self.voices.iter().map(Voice::end_frame).max() {
            if start_frame.abs_diff(tail) <= 1 {
                start_frame = tail;
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
        id
    }

    pub fn stop(&mut self, id: PlaybackId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        before != self.voices.len()
    }

    pub fn active(&self) -> usize {
        self.voices.len()
    }

    /// Mix `frames` mono frames into `out`, advance the clock and return the
    /// ids of buffers that finished.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<PlaybackId> {
        out.fill(0.0);
        let block_start = self.frames_rendered;
        let block_end = block_start + out.len() as u64;

        for voice in &self.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for frame in from..to {
                out[(frame - block_start) as usize] += voice.samples[(frame - voice.start_frame) as usize];
            }
        }

        self.frames_rendered = block_end;
        let mut finished = Vec::new();
        self.voices.retain(|v| {
            if v.end_frame() <= block_end {
                finished.push(v.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

/// Default output device driven by a `Mixer`
pub struct CpalOutputClock {
    mixer: Arc<Mutex<Mixer>>,
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutputClock {
    pub fn open(ended: EndedSink) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::Device("no output device available".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::Device(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        info!(
            "Output '{}' at {} Hz, {} channel(s)",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels
        );

        let mixer = Arc::new(Mutex::new(Mixer::new(config.sample_rate.0)));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let thread_mixer = mixer.clone();

        let thread = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match sample_format {
                    SampleFormat::F32 => build_output::<f32>(&device, &config, thread_mixer, ended),
                    SampleFormat::I16 => build_output::<i16>(&device, &config, thread_mixer, ended),
                    SampleFormat::U16 => build_output::<u16>(&device, &config, thread_mixer, ended),
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
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Output stream dropped");
            })
            .map_err(|e| AudioError::Device(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                mixer,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(AudioError::Stream("output thread exited during setup".to_string())),
        }
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    ended: EndedSink,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len() / channels, 0.0);
                let finished = mixer.lock().render(&mut scratch);
                for (frame, value) in data.chunks_mut(channels).zip(&scratch) {
                    let sample = T::from_sample(value.clamp(-1.0, 1.0));
                    frame.fill(sample);
                }
                for id in finished {
                    ended(id);
                }
            },
            |e| error!("Output stream error: {}", e),
            None,
        )
        .map_err(|e| AudioError::Stream(e.to_string()))
}

impl OutputClock for CpalOutputClock {
    fn current_time(&self) -> f64 {
        self.mixer.lock().current_time()
    }

    fn schedule(&mut self, buffer: PcmBuffer, start_at: f64) -> Result<PlaybackId, AudioError> {
        if self.shutdown.is_none() {
            return Err(AudioError::Closed);
        }
        if buffer.frames() == 0 {
            return Err(AudioError::Playback("empty buffer".to_string()));
        }
        Ok(self.mixer.lock().schedule(&buffer, start_at))
    }

    fn stop(&mut self, id: PlaybackId) {
        self.mixer.lock().stop(id);
    }

    fn close(&mut self) -> Result<(), AudioError> {
        let Some(shutdown) = self.shutdown.take() else {
            return Ok(());
        };
        drop(shutdown);
        if let Some(thread) = self.thread.take() {
            if super::blocking(|| thread.join()).is_err() {
                warn!("Output thread panicked");
                return Err(AudioError::Stream("output thread panicked".to_string()));
            }
        }
        Ok(())
    }
}

impl Drop for CpalOutputClock {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
