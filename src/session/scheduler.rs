use tracing::debug;

use crate::audio::{OutputContext, PcmBuffer, SourceHandle};

/// A buffer started on the output clock and not yet finished or stopped
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub handle: SourceHandle,
    pub start: f64,
    pub end: f64,
}

/// Gapless playback of streamed reply audio
///
/// Each buffer starts exactly where the previous one ends on the output
/// clock. The scheduler is the only owner of the start cursor and of the
/// in-flight registry; an interruption cuts everything and starts a fresh
/// timeline.
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    next_start_time: f64,
    in_flight: Vec<ScheduledBuffer>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `buffer` right after everything already scheduled.
    pub fn schedule(&mut self, output: &mut dyn OutputContext, buffer: &PcmBuffer) -> ScheduledBuffer {
        let now = output.current_time();
        self.reap(now);

        // A stalled pipeline must not schedule into the past.
        self.next_start_time = self.next_start_time.max(now);

        let start = self.next_start_time;
        let handle = output.start_at(buffer, start);
        self.next_start_time += buffer.duration();

        let scheduled = ScheduledBuffer {
            handle,
            start,
            end: self.next_start_time,
        };
        self.in_flight.push(scheduled);

        debug!(
            "Scheduled {:?}: {:.3}s -> {:.3}s ({} in flight)",
            handle,
            start,
            scheduled.end,
            self.in_flight.len()
        );

        scheduled
    }

    /// Barge-in: hard-stop every registered buffer and rewind the cursor.
    pub fn interrupt(&mut self, output: &mut dyn OutputContext) -> usize {
        let stopped = self.in_flight.len();
        for scheduled in self.in_flight.drain(..) {
            output.stop(scheduled.handle);
        }
        self.next_start_time = 0.0;

        debug!("Interrupted playback, {} buffers stopped", stopped);
        stopped
    }

    /// Deregister buffers that finished playing by `now`.
    pub fn reap(&mut self, now: f64) {
        self.in_flight.retain(|scheduled| scheduled.end > now);
    }

    /// Forget every registration without touching the output
    pub fn clear(&mut self) {
        self.in_flight.clear();
        self.next_start_time = 0.0;
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn in_flight(&self) -> &[ScheduledBuffer] {
        &self.in_flight
    }
}
