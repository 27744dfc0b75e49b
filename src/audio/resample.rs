//! Linear resampling and channel downmix

/// Streaming linear resampler. Holds back the last input sample so
/// consecutive chunks join without a discontinuity.
#[derive(Debug, Clone)]
pub struct Resampler {
    step: f64,
    pos: f64,
    tail: Option<f32>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate.max(1) as f64,
            pos: 0.0,
            tail: None,
        }
    }

    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        let mut buf = Vec::with_capacity(input.len() + 1);
        buf.extend(self.tail);
        buf.extend_from_slice(input);

        if buf.len() < 2 {
            self.tail = buf.last().copied();
            return;
        }

        let last = (buf.len() - 1) as f64;
        while self.pos < last {
            let i = self.pos.floor() as usize;
            let frac = (self.pos - i as f64) as f32;
            out.push(buf[i] * (1.0 - frac) + buf[i + 1] * frac);
            self.pos += self.step;
        }
        self.pos -= last;
        self.tail = buf.last().copied();
    }
}

/// Resample a complete signal in one go
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let mut out = Vec::with_capacity(samples.len() * to_rate as usize / from_rate.max(1) as usize + 1);
    let mut resampler = Resampler::new(from_rate, to_rate);
    resampler.process(samples, &mut out);
    // flush the held-back sample
    if let Some(tail) = resampler.tail {
        out.push(tail);
    }
    out
}

/// Pad (holding the last sample) or truncate to exactly `frames` samples
pub fn fit_length(mut samples: Vec<f32>, frames: usize) -> Vec<f32> {
    let hold = samples.last().copied().unwrap_or(0.0);
    samples.resize(frames, hold);
    samples
}

/// Average interleaved frames down to mono
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Average planar channels down to mono
pub fn downmix_planar(channels: &[Vec<f32>]) -> Vec<f32> {
    match channels {
        [] => Vec::new(),
        [mono] => mono.clone(),
        _ => {
            let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
            (0..frames)
                .map(|i| channels.iter().map(|c| c[i]).sum::<f32>() / channels.len() as f32)
                .collect()
        }
    }
}
