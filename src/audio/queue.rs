//! Playback Queue
//!
//! Keeps inbound speech back-to-back on the output clock no matter how
//! irregularly chunks arrive.

use crate::audio::codec::PcmBuffer;
use crate::audio::host::{AudioError, OutputClock, PlaybackId};
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct PlaybackQueue {
    /// Start time of the next buffer, never behind the clock when used
    cursor: f64,
    scheduled: HashSet<PlaybackId>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Schedule `buffer` right after everything already queued.
    /// Returns the start time it was given.
    pub fn enqueue(&mut self, clock: &mut dyn OutputClock, buffer: PcmBuffer) -> Result<f64, AudioError> {
        let start = self.cursor.max(clock.current_time());
        let duration = buffer.duration();
        let id = clock.schedule(buffer, start)?;
        self.cursor = start + duration;
        self.scheduled.insert(id);
        Ok(start)
    }

    /// A buffer finished on its own
    pub fn finished(&mut self, id: PlaybackId) -> bool {
        self.scheduled.remove(&id)
    }

    /// Stop every scheduled buffer and rewind the cursor
    pub fn clear(&mut self, clock: Option<&mut (dyn OutputClock + '_)>) {
        if let Some(clock) = clock {
            for id in self.scheduled.drain() {
                clock.stop(id);
            }
        }
        self.scheduled.clear();
        self.cursor = 0.0;
    }
}
